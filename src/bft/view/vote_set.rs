use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};

use crate::bft::collections::{self, HashSet};
use crate::bft::message::ConsensusMessage;
use crate::bft::types::NodeId;

/// A vote registered by the message processing task, consumed by the
/// agreement task.
#[derive(Debug, Clone)]
pub(super) struct Vote {
    pub sender: NodeId,
    pub message: ConsensusMessage,
}

/// Deduplicated accumulation of prepare or commit votes for one
/// sequence.
///
/// The `valid_vote` predicate guards the message kind; the voted map
/// enforces the at-most-one-vote-per-voter rule; the bounded buffer
/// hands votes over to the agreement task.
pub(super) struct VoteSet {
    valid_vote: fn(&ConsensusMessage) -> bool,
    voted: HashSet<NodeId>,
    votes_tx: Sender<Vote>,
    votes_rx: Receiver<Vote>,
}

impl VoteSet {
    pub fn new(valid_vote: fn(&ConsensusMessage) -> bool, capacity: usize) -> Self {
        let (votes_tx, votes_rx) = bounded(capacity);
        Self {
            valid_vote,
            voted: collections::hash_set(),
            votes_tx,
            votes_rx,
        }
    }

    /// Registers a vote, silently dropping double votes and votes of
    /// the wrong kind.
    pub fn register_vote(&mut self, voter: NodeId, message: ConsensusMessage) {
        if !(self.valid_vote)(&message) {
            return;
        }

        if self.voted.contains(&voter) {
            debug!("Dropping double vote from {:?}", voter);
            return;
        }

        self.voted.insert(voter);
        if self.votes_tx.try_send(Vote { sender: voter, message }).is_err() {
            warn!("Vote buffer is full, dropping vote from {:?}", voter);
        }
    }

    /// The consuming end of the vote buffer.
    pub fn receiver(&self) -> Receiver<Vote> {
        self.votes_rx.clone()
    }

    /// Drops buffered votes and forgets who voted; called on every
    /// sequence boundary.
    pub fn clear(&mut self) {
        while self.votes_rx.try_recv().is_ok() {}
        self.voted.clear();
    }
}
