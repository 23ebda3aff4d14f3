//! This module contains types associated with messages traded
//! between the participants of the protocol.

use serde::{Deserialize, Serialize};

use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::types::{NodeId, Proposal, Signature, ViewMetadata};

/// The `Message` type encompasses every message traded between
/// participants, routed by the controller to the interested sub-protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Three phase agreement traffic, handled by the active view.
    Consensus(ConsensusMessage),
    /// Leader rotation traffic, handled by the view changer.
    ViewChange(ViewChangeMessage),
    /// Leader liveness traffic, handled by the heartbeat monitor.
    Heartbeat(HeartbeatMessage),
    /// State gossip, handled by the state collector.
    StateTransfer(StateTransferMessage),
}

/// Represents a message from the three phase agreement sub-protocol.
///
/// Messages carry the view and sequence they pertain to; the different
/// stages are represented in the `ConsensusMessageKind` type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusMessage {
    view: u64,
    seq: u64,
    kind: ConsensusMessageKind,
}

/// Represents one of the three agreement stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConsensusMessageKind {
    /// The leader proposes a batch for the sequence.
    PrePrepare(Proposal),
    /// A participant acknowledges the proposal with the given digest.
    Prepare(Digest),
    /// A participant commits to the proposal with the given digest,
    /// attaching its signature over the proposal.
    Commit(Digest, Signature),
}

impl ConsensusMessage {
    /// Creates a new `ConsensusMessage` for `(view, seq)` of the kind `kind`.
    pub fn new(view: u64, seq: u64, kind: ConsensusMessageKind) -> Self {
        Self { view, seq, kind }
    }

    /// Returns the view this message pertains to.
    pub fn view(&self) -> u64 {
        self.view
    }

    /// Returns the sequence number of this consensus message.
    pub fn sequence_number(&self) -> u64 {
        self.seq
    }

    /// Returns a reference to the consensus message kind.
    pub fn kind(&self) -> &ConsensusMessageKind {
        &self.kind
    }

    pub fn into_kind(self) -> ConsensusMessageKind {
        self.kind
    }
}

/// Represents a message from the leader rotation sub-protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewChangeMessage {
    next_view: u64,
    kind: ViewChangeMessageKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ViewChangeMessageKind {
    /// A participant asks to move the cluster to `next_view`.
    ViewChange,
    /// A participant reports its agreement state to the next leader.
    ViewData(SignedViewData),
    /// The next leader presents a quorum of view data as evidence
    /// that the new view may start.
    NewView(Vec<SignedViewData>),
}

impl ViewChangeMessage {
    pub fn new(next_view: u64, kind: ViewChangeMessageKind) -> Self {
        Self { next_view, kind }
    }

    pub fn next_view(&self) -> u64 {
        self.next_view
    }

    pub fn kind(&self) -> &ViewChangeMessageKind {
        &self.kind
    }

    pub fn into_kind(self) -> ViewChangeMessageKind {
        self.kind
    }
}

/// The agreement state a participant reports to the next leader during
/// a view change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewData {
    /// The view this report supports.
    pub next_view: u64,
    /// Metadata of the most recently decided proposal.
    pub last_decided: ViewMetadata,
    /// The proposal this participant has in flight, if any.
    pub in_flight: Option<Proposal>,
    /// The voters of the prepare quorum backing the in flight proposal,
    /// when one formed here.
    pub prepare_quorum: Option<Vec<NodeId>>,
}

impl ViewData {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).wrapped(ErrorKind::Serialization)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        bincode::deserialize(raw).wrapped(ErrorKind::Serialization)
    }
}

/// A `ViewData` report signed by its sender.
///
/// The raw encoded bytes are carried alongside the signature so that
/// verification covers exactly what was signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedViewData {
    raw: Vec<u8>,
    signer: NodeId,
    signature: Vec<u8>,
}

impl SignedViewData {
    pub fn new(raw: Vec<u8>, signer: NodeId, signature: Vec<u8>) -> Self {
        Self {
            raw,
            signer,
            signature,
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn signer(&self) -> NodeId {
        self.signer
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn view_data(&self) -> Result<ViewData> {
        ViewData::decode(&self.raw)
    }
}

/// Leader liveness messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HeartbeatMessage {
    /// Sent by the leader of `view` while it makes progress up to `seq`.
    Heartbeat { view: u64, seq: u64 },
    /// Sent back by followers so the leader can tell it is still
    /// connected to the cluster.
    HeartbeatResponse { view: u64 },
}

/// State gossip used to recover laggards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StateTransferMessage {
    /// Asks a peer where it currently is.
    StateRequest,
    /// Reports the sender's current view and latest decided sequence.
    StateResponse { view: u64, seq: u64 },
}
