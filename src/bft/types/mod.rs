//! Value types exchanged between the sub-protocols of the engine.

use std::fmt::{self, Debug, Formatter};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::bft::crypto::hash::{Context, Digest};

/// The id of a participant of the consensus protocol.
///
/// Ids are stable across the lifetime of the cluster, and the leader of
/// view `v` is the participant with the id at position `v mod n` of the
/// ordered participant set.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> NodeId {
        NodeId(id)
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ID({})", self.0)
    }
}

/// The view id and the sequence of the most recently decided proposal
/// in that view. Carried inside every `Proposal`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMetadata {
    pub view_id: u64,
    pub latest_sequence: u64,
}

/// A proposal to be agreed upon by the cluster.
///
/// The `payload` is the serialized request batch, the `header` is an
/// application opaque blob used as hash chaining input, and the
/// `verification_sequence` tags the configuration epoch the verifier must
/// check the batch against. Proposals are content addressed by `digest()`.
#[derive(Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    payload: Vec<u8>,
    header: Vec<u8>,
    metadata: ViewMetadata,
    verification_sequence: u64,
}

impl Proposal {
    pub fn new(
        payload: Vec<u8>,
        header: Vec<u8>,
        metadata: ViewMetadata,
        verification_sequence: u64,
    ) -> Self {
        Self {
            payload,
            header,
            metadata,
            verification_sequence,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn metadata(&self) -> ViewMetadata {
        self.metadata
    }

    pub fn verification_sequence(&self) -> u64 {
        self.verification_sequence
    }

    /// A proposal with no payload; only produced when a leader misbehaves.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty() && self.header.is_empty()
    }

    /// Deterministic content address over all four fields.
    pub fn digest(&self) -> Digest {
        let mut ctx = Context::new();
        ctx.update(&(self.payload.len() as u64).to_le_bytes());
        ctx.update(&self.payload);
        ctx.update(&(self.header.len() as u64).to_le_bytes());
        ctx.update(&self.header);
        ctx.update(&self.metadata.view_id.to_le_bytes());
        ctx.update(&self.metadata.latest_sequence.to_le_bytes());
        ctx.update(&self.verification_sequence.to_le_bytes());
        ctx.finish()
    }
}

impl Debug for Proposal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proposal {{ view {}, seq {}, payload {}b, digest {:?} }}",
            self.metadata.view_id,
            self.metadata.latest_sequence,
            self.payload.len(),
            self.digest(),
        )
    }
}

/// A consenter signature over a proposal.
///
/// `msg` carries additional auxiliary bytes bound to the signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    signer: NodeId,
    value: Vec<u8>,
    msg: Vec<u8>,
}

impl Signature {
    pub fn new(signer: NodeId, value: Vec<u8>, msg: Vec<u8>) -> Self {
        Self { signer, value, msg }
    }

    pub fn signer(&self) -> NodeId {
        self.signer
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn msg(&self) -> &[u8] {
        &self.msg
    }
}

/// Identifies a single client request inside the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub client_id: String,
    pub id: String,
}

impl RequestInfo {
    pub fn new(client_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            id: id.into(),
        }
    }

    /// The pool deduplication key of this request.
    pub fn key(&self) -> String {
        format!("{}:{}", self.client_id, self.id)
    }
}

/// A decided proposal together with its commit quorum certificate.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    proposal: Proposal,
    signatures: Vec<Signature>,
}

impl Decision {
    pub fn new(proposal: Proposal, signatures: Vec<Signature>) -> Self {
        Self {
            proposal,
            signatures,
        }
    }

    pub fn proposal(&self) -> &Proposal {
        &self.proposal
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    pub fn into_inner(self) -> (Proposal, Vec<Signature>) {
        (self.proposal, self.signatures)
    }
}

/// Holds the most recently decided proposal and its signatures.
///
/// Written only by the controller on decide; readable from any task.
#[derive(Default)]
pub struct Checkpoint {
    inner: RwLock<Decision>,
}

impl Checkpoint {
    pub fn new(proposal: Proposal, signatures: Vec<Signature>) -> Self {
        Self {
            inner: RwLock::new(Decision::new(proposal, signatures)),
        }
    }

    pub fn get(&self) -> Decision {
        self.inner.read().clone()
    }

    pub fn set(&self, proposal: Proposal, signatures: Vec<Signature>) {
        *self.inner.write() = Decision::new(proposal, signatures);
    }

    /// Metadata of the most recently decided proposal.
    pub fn metadata(&self) -> ViewMetadata {
        self.inner.read().proposal.metadata()
    }
}
