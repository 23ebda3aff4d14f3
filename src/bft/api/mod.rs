//! Abstractions over the external collaborators of the engine, plus the
//! internal seams the sub-protocols use to call back into each other.
//!
//! The engine never assumes shared state between collaborators; each is a
//! capability handed in at construction time.

use std::sync::Arc;

use crate::bft::controller::Role;
use crate::bft::error::*;
use crate::bft::message::{HeartbeatMessage, Message};
use crate::bft::types::{Decision, NodeId, Proposal, RequestInfo, Signature, ViewMetadata};
use crate::bft::view::View;

/// The communication layer of a participant.
pub trait Comm: Send + Sync {
    /// The fixed ordered set of participants, self included.
    fn nodes(&self) -> Vec<NodeId>;

    /// Sends a consensus message to a single participant.
    fn send_consensus(&self, to: NodeId, msg: Message);

    /// Forwards a raw client request to another participant.
    fn send_transaction(&self, to: NodeId, request: Vec<u8>);

    /// Broadcasts a consensus message to every other participant.
    fn broadcast_consensus(&self, msg: Message);
}

/// Validates requests, proposals and signatures on behalf of the
/// application.
pub trait Verifier: Send + Sync {
    fn verify_request(&self, raw: &[u8]) -> Result<RequestInfo>;

    /// Verifies a proposal against the header of the previously decided
    /// proposal, returning the requests contained in its batch.
    fn verify_proposal(&self, proposal: &Proposal, prev_header: &[u8]) -> Result<Vec<RequestInfo>>;

    /// Verifies a commit signature of another consenter over a proposal.
    fn verify_consenter_sig(&self, signature: &Signature, proposal: &Proposal) -> Result<()>;

    /// Verifies a detached signature over arbitrary bytes.
    fn verify_signature(&self, signer: NodeId, data: &[u8], signature: &[u8]) -> Result<()>;

    /// The configuration epoch proposals must currently be tagged with.
    fn verification_sequence(&self) -> u64;
}

/// Produces signatures under this participant's identity.
pub trait Signer: Send + Sync {
    fn sign(&self, data: &[u8]) -> Vec<u8>;

    fn sign_proposal(&self, proposal: &Proposal) -> Signature;
}

/// Assembles a request batch into a proposal.
pub trait Assembler: Send + Sync {
    /// Returns the assembled proposal and the requests that did not fit.
    fn assemble_proposal(
        &self,
        metadata: ViewMetadata,
        requests: Vec<Vec<u8>>,
    ) -> (Proposal, Vec<Vec<u8>>);
}

/// The replicated application decided proposals are delivered to.
pub trait Application: Send + Sync {
    fn deliver(&self, proposal: Proposal, signatures: Vec<Signature>);
}

/// Fetches decisions this participant missed from its peers.
pub trait Synchronizer: Send + Sync {
    fn sync(&self) -> Decision;
}

/// Derives the identifying info of a raw client request.
pub trait RequestInspector: Send + Sync {
    fn request_id(&self, raw: &[u8]) -> RequestInfo;
}

/// Append-only durable log. The implementation must persist records in
/// order and replay them in the same order on recovery.
pub trait WriteAheadLog: Send + Sync {
    fn append(&self, record: &[u8]) -> Result<()>;
}

/// Receives the decisions produced by a view.
pub trait Decider: Send + Sync {
    /// Called exactly once per decided sequence. `requests` are the infos
    /// the verifier produced for the batch, used to prune the pool.
    fn decide(&self, proposal: Proposal, signatures: Vec<Signature>, requests: Vec<RequestInfo>);
}

/// Receives complaints about the current leader.
pub trait FailureDetector: Send + Sync {
    fn complain(&self);
}

/// Lets a view ask its owner to synchronize state with the cluster.
pub trait Syncer: Send + Sync {
    fn sync_if_needed(&self);
}

/// The controller surface the view changer drives.
pub trait ViewController: Send + Sync {
    /// Aborts the current view, reinstalls the role, and starts a fresh
    /// view at `(view, seq)`.
    fn view_changed(&self, view: u64, seq: u64);

    /// Aborts the view `view` if it is the current one. Idempotent.
    fn abort_view(&self, view: u64);

    /// Hands the controller a prepared proposal the new leader must
    /// re-propose at the start of the new view.
    fn set_reproposal(&self, proposal: Proposal);
}

/// Instantiates views wired back to their owner.
pub trait ProposerBuilder: Send + Sync {
    fn new_proposer(
        &self,
        leader: NodeId,
        proposal_sequence: u64,
        view_num: u64,
        quorum: usize,
    ) -> Arc<View>;
}

/// The bounded FIFO of pending client requests.
pub trait RequestPool: Send + Sync {
    /// Enqueues a request, rejecting duplicates and overflow.
    fn submit(&self, request: Vec<u8>) -> Result<()>;

    /// Returns up to `n` requests from the head of the pool, without
    /// removing them. Requests leave the pool only through `prune`.
    fn next_requests(&self, n: usize) -> Vec<Vec<u8>>;

    /// Removes the given requests, typically after they were delivered.
    fn prune(&self, requests: &[RequestInfo]);

    fn size(&self) -> usize;

    fn close(&self);
}

/// Pauses request timeouts across view changes so they do not fire
/// during the transition.
pub trait RequestsTimer: Send + Sync {
    fn stop_timers(&self);

    fn restart_timers(&self);
}

/// Receives the pool's timeout escalations.
pub trait PoolTimeoutHandler: Send + Sync {
    /// A request sat in the pool for longer than the request timeout;
    /// it should be forwarded to the current leader.
    fn on_request_timeout(&self, request: Vec<u8>, info: &RequestInfo);

    /// A forwarded request still was not ordered; the leader is
    /// presumed faulty.
    fn on_leader_fwd_timeout(&self);
}

/// Builds batches out of the request pool.
pub trait Batcher: Send + Sync {
    /// Blocks until `batch_size` requests accumulate or the batch
    /// timeout elapses; may return an empty batch on timeout, and always
    /// returns empty once closed.
    fn next_batch(&self) -> Vec<Vec<u8>>;

    /// Returns requests to the front of the queue.
    fn batch_remainder(&self, remainder: Vec<Vec<u8>>);

    fn pop_remainder(&self) -> Vec<Vec<u8>>;

    /// Forgets any remainder; used across view changes.
    fn reset(&self);

    fn close(&self);

    fn closed(&self) -> bool;
}

/// The leader liveness monitor surface the controller drives.
pub trait LeaderMonitor: Send + Sync {
    fn change_role(&self, role: Role, view: u64, leader: NodeId);

    fn process_msg(&self, sender: NodeId, msg: HeartbeatMessage);

    fn close(&self);
}

/// Receives heartbeat absence escalations.
pub trait HeartbeatEventHandler: Send + Sync {
    fn on_heartbeat_timeout(&self, view: u64);
}
