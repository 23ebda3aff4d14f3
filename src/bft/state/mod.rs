//! Durable agreement state.
//!
//! Every step of the protocol that must survive a crash is appended to the
//! write ahead log before the step takes effect: a proposal is not
//! considered prepared until its prepare record is durable, and not decided
//! until its commit quorum is. Recovery replays the log tail to reconstruct
//! the most recent `(view, sequence)` and, if present, the in-flight
//! proposal, so a restarted participant resumes mid-agreement.

use std::sync::Arc;

use log::error;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::bft::api::WriteAheadLog;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::types::{NodeId, Proposal, Signature};

/// A single record of the write ahead log.
///
/// Framing, length prefixes and per-record checksums are the concern of
/// the log implementation; records reach it already encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord {
    /// A proposal was accepted for `(view, seq)`. Carries the full
    /// proposal so recovery can resume the agreement.
    PrePrepared {
        view: u64,
        seq: u64,
        proposal: Proposal,
    },
    /// The proposal with `digest` reached a prepare quorum at
    /// `(view, seq)`. Prepare votes carry no signatures on the wire, so
    /// the distinct voter set is the whole certificate.
    Prepared {
        view: u64,
        seq: u64,
        digest: Digest,
        prepare_quorum: Vec<NodeId>,
    },
    /// The proposal reached a commit quorum and was decided.
    Decided {
        view: u64,
        seq: u64,
        proposal: Proposal,
        signatures: Vec<Signature>,
    },
    /// A new view was installed.
    ViewChange { view: u64 },
}

impl WalRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).wrapped(ErrorKind::Serialization)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        bincode::deserialize(raw).wrapped(ErrorKind::Serialization)
    }
}

/// The most recent proposal that reached a prepare quorum but was not
/// yet decided at this participant, together with the quorum that
/// backs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub proposal: Proposal,
    pub prepare_quorum: Option<Vec<NodeId>>,
}

impl InFlight {
    pub fn prepared(&self) -> bool {
        self.prepare_quorum.is_some()
    }
}

/// In-memory handoff of the in-flight proposal between the view that
/// produced it and the view changer that must preserve it.
#[derive(Default)]
pub struct InFlightData {
    inner: Mutex<Option<InFlight>>,
}

impl InFlightData {
    /// Records the proposal currently being agreed upon.
    pub fn store_proposal(&self, proposal: Proposal) {
        *self.inner.lock() = Some(InFlight {
            proposal,
            prepare_quorum: None,
        });
    }

    /// Marks the stored proposal as having reached a prepare quorum.
    pub fn store_prepared(&self, proposal: Proposal, prepare_quorum: Vec<NodeId>) {
        *self.inner.lock() = Some(InFlight {
            proposal,
            prepare_quorum: Some(prepare_quorum),
        });
    }

    pub fn load(&self) -> Option<InFlight> {
        self.inner.lock().clone()
    }

    /// Forgets the in-flight proposal once it (or a later sequence)
    /// decided.
    pub fn clear(&self, decided_seq: u64) {
        let mut guard = self.inner.lock();
        if let Some(in_flight) = guard.as_ref() {
            if in_flight.proposal.metadata().latest_sequence <= decided_seq {
                *guard = None;
            }
        }
    }
}

/// Durable log appends plus the in-flight handoff, shared by the view
/// and the view changer. Agreement records are appended only from the
/// view task, view change records only from the view changer task.
pub struct PersistedState {
    in_flight: Arc<InFlightData>,
    wal: Arc<dyn WriteAheadLog>,
}

impl PersistedState {
    pub fn new(in_flight: Arc<InFlightData>, wal: Arc<dyn WriteAheadLog>) -> Self {
        Self { in_flight, wal }
    }

    pub fn in_flight(&self) -> &Arc<InFlightData> {
        &self.in_flight
    }

    pub fn save_pre_prepared(&self, view: u64, seq: u64, proposal: &Proposal) {
        self.append(WalRecord::PrePrepared {
            view,
            seq,
            proposal: proposal.clone(),
        });
        self.in_flight.store_proposal(proposal.clone());
    }

    pub fn save_prepared(
        &self,
        view: u64,
        seq: u64,
        digest: Digest,
        proposal: &Proposal,
        prepare_quorum: &[NodeId],
    ) {
        self.append(WalRecord::Prepared {
            view,
            seq,
            digest,
            prepare_quorum: prepare_quorum.to_vec(),
        });
        self.in_flight
            .store_prepared(proposal.clone(), prepare_quorum.to_vec());
    }

    pub fn save_decided(&self, view: u64, seq: u64, proposal: &Proposal, signatures: &[Signature]) {
        self.append(WalRecord::Decided {
            view,
            seq,
            proposal: proposal.clone(),
            signatures: signatures.to_vec(),
        });
        self.in_flight.clear(seq);
    }

    pub fn save_view_change(&self, view: u64) {
        self.append(WalRecord::ViewChange { view });
    }

    // Durability is a hard precondition for the safety invariants, so a
    // failed append halts the participant.
    fn append(&self, record: WalRecord) {
        let encoded = match record.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode write ahead log record: {:?}", e);
                panic!("failed to encode write ahead log record");
            }
        };
        if let Err(e) = self.wal.append(&encoded) {
            error!("Failed to append to the write ahead log: {:?}", e);
            panic!("failed to append to the write ahead log");
        }
    }
}

/// The agreement state reconstructed from a write ahead log replay.
#[derive(Debug, Default)]
pub struct RecoveredState {
    /// The most recent view any record was written in.
    pub view: u64,
    /// The most recent decision, if any.
    pub checkpoint: Option<(u64, Proposal, Vec<Signature>)>,
    /// The proposal that was mid-agreement when the participant stopped.
    pub in_flight: Option<InFlight>,
}

impl RecoveredState {
    /// Replays encoded records in append order.
    pub fn recover(entries: &[Vec<u8>]) -> Result<Self> {
        let mut state = RecoveredState::default();
        let mut pending: Option<(u64, Proposal, Option<Vec<NodeId>>)> = None;

        for entry in entries {
            match WalRecord::decode(entry)? {
                WalRecord::PrePrepared {
                    view,
                    seq,
                    proposal,
                } => {
                    state.view = state.view.max(view);
                    pending = Some((seq, proposal, None));
                }
                WalRecord::Prepared {
                    view,
                    seq,
                    digest,
                    prepare_quorum,
                } => {
                    state.view = state.view.max(view);
                    match pending.take() {
                        Some((pending_seq, proposal, _))
                            if pending_seq == seq && proposal.digest() == digest =>
                        {
                            pending = Some((seq, proposal, Some(prepare_quorum)));
                        }
                        other => {
                            // A prepare record must follow its pre-prepare.
                            if other.is_some() {
                                return Err(Error::simple(ErrorKind::Recovery));
                            }
                        }
                    }
                }
                WalRecord::Decided {
                    view,
                    seq,
                    proposal,
                    signatures,
                } => {
                    state.view = state.view.max(view);
                    if let Some((pending_seq, _, _)) = pending {
                        if pending_seq <= seq {
                            pending = None;
                        }
                    }
                    state.checkpoint = Some((seq, proposal, signatures));
                }
                WalRecord::ViewChange { view } => {
                    state.view = state.view.max(view);
                }
            }
        }

        state.in_flight = pending.map(|(_, proposal, prepare_quorum)| InFlight {
            proposal,
            prepare_quorum,
        });
        Ok(state)
    }
}
