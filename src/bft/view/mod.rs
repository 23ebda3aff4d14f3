//! The three phase agreement state machine.
//!
//! A `View` executes BFT agreement for one protocol epoch. Within a view
//! the sequence advances monotonically, and each sequence runs the full
//! pre-prepare, prepare, commit exchange before the next one starts:
//!
//! ```text
//! Idle -> AwaitingPrePrepare -> Prepared -> Committed -> Decided
//!                                 ^            ^
//!                    (prepare quorum)    (commit quorum)
//! ```
//!
//! Two tasks drive a view: the message processing task routes inbound
//! votes into the per-sequence vote sets, and the agreement task consumes
//! them, persisting each phase transition before acting on it. Both
//! observe a shared one-shot abort signal, so `abort` is safe to call any
//! number of times from any task.

mod maker;
mod vote_set;

pub use maker::ProposalMaker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::bft::api::{Comm, Decider, FailureDetector, Signer, Syncer, Verifier};
use crate::bft::crypto::hash::Digest;
use crate::bft::message::{ConsensusMessage, ConsensusMessageKind, Message};
use crate::bft::state::PersistedState;
use crate::bft::types::{NodeId, Proposal, RequestInfo, Signature};

use self::vote_set::VoteSet;

fn accept_prepares(message: &ConsensusMessage) -> bool {
    matches!(message.kind(), ConsensusMessageKind::Prepare(_))
}

fn accept_commits(message: &ConsensusMessage) -> bool {
    matches!(message.kind(), ConsensusMessageKind::Commit(..))
}

/// Everything needed to instantiate a `View`.
pub struct ViewConfig {
    pub n: u64,
    pub quorum: usize,
    pub leader_id: NodeId,
    pub self_id: NodeId,
    pub number: u64,
    pub proposal_sequence: u64,
    pub prev_header: Vec<u8>,
    pub in_msg_q_size: usize,
    pub decider: Arc<dyn Decider>,
    pub failure_detector: Arc<dyn FailureDetector>,
    pub syncer: Arc<dyn Syncer>,
    pub comm: Arc<dyn Comm>,
    pub verifier: Arc<dyn Verifier>,
    pub signer: Arc<dyn Signer>,
    pub state: Arc<PersistedState>,
}

pub struct View {
    n: u64,
    quorum: usize,
    leader_id: NodeId,
    self_id: NodeId,
    number: u64,

    decider: Arc<dyn Decider>,
    failure_detector: Arc<dyn FailureDetector>,
    syncer: Arc<dyn Syncer>,
    comm: Arc<dyn Comm>,
    verifier: Arc<dyn Verifier>,
    signer: Arc<dyn Signer>,
    state: Arc<PersistedState>,

    proposal_sequence: AtomicU64,
    prev_header: Mutex<Vec<u8>>,

    inc_tx: Sender<(NodeId, ConsensusMessage)>,
    inc_rx: Receiver<(NodeId, ConsensusMessage)>,
    // At most one outstanding proposal from the leader.
    proposals_tx: Sender<Proposal>,
    proposals_rx: Receiver<Proposal>,

    prepares: Mutex<VoteSet>,
    commits: Mutex<VoteSet>,
    // Votes that arrived one sequence ahead.
    next_prepares: Mutex<VoteSet>,
    next_commits: Mutex<VoteSet>,

    abort_rx: Receiver<()>,
    abort_tx: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl View {
    pub fn new(config: ViewConfig) -> Arc<Self> {
        let (inc_tx, inc_rx) = bounded(config.in_msg_q_size);
        let (proposals_tx, proposals_rx) = bounded(1);
        let (abort_tx, abort_rx) = bounded(1);

        Arc::new(Self {
            n: config.n,
            quorum: config.quorum,
            leader_id: config.leader_id,
            self_id: config.self_id,
            number: config.number,
            decider: config.decider,
            failure_detector: config.failure_detector,
            syncer: config.syncer,
            comm: config.comm,
            verifier: config.verifier,
            signer: config.signer,
            state: config.state,
            proposal_sequence: AtomicU64::new(config.proposal_sequence),
            prev_header: Mutex::new(config.prev_header),
            inc_tx,
            inc_rx,
            proposals_tx,
            proposals_rx,
            prepares: Mutex::new(VoteSet::new(accept_prepares, config.in_msg_q_size)),
            commits: Mutex::new(VoteSet::new(accept_commits, config.in_msg_q_size)),
            next_prepares: Mutex::new(VoteSet::new(accept_prepares, config.in_msg_q_size)),
            next_commits: Mutex::new(VoteSet::new(accept_commits, config.in_msg_q_size)),
            abort_rx,
            abort_tx: Mutex::new(Some(abort_tx)),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// The view number of this view.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// The sequence currently being agreed upon.
    pub fn current_sequence(&self) -> u64 {
        self.proposal_sequence.load(Ordering::Acquire)
    }

    /// Spawns the message processing and agreement tasks.
    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock();

        let view = Arc::clone(self);
        threads.push(
            std::thread::Builder::new()
                .name(format!("view-{}-msgs", self.number))
                .spawn(move || view.process_messages())
                .unwrap(),
        );

        let view = Arc::clone(self);
        threads.push(
            std::thread::Builder::new()
                .name(format!("view-{}-run", self.number))
                .spawn(move || view.run())
                .unwrap(),
        );
    }

    /// Hands an inbound consensus message to this view. Never blocks on
    /// agreement progress: when the inbound queue overflows, the oldest
    /// queued message is dropped.
    pub fn handle_message(&self, sender: NodeId, message: ConsensusMessage) {
        if self.aborted() {
            return;
        }
        if let Err(TrySendError::Full(msg)) = self.inc_tx.try_send((sender, message)) {
            let _ = self.inc_rx.try_recv();
            debug!(
                "{:?} // Inbound view queue overflow, dropped the oldest message",
                self.self_id
            );
            let _ = self.inc_tx.try_send(msg);
        }
    }

    /// Leader only: starts agreement on `proposal` at the current
    /// sequence. Persists the pre-prepare record, broadcasts it, and
    /// feeds the proposal to this view's own pre-prepare step.
    pub fn propose(&self, proposal: Proposal) {
        if self.aborted() {
            return;
        }

        let seq = self.current_sequence();
        self.state.save_pre_prepared(self.number, seq, &proposal);

        self.comm.broadcast_consensus(Message::Consensus(ConsensusMessage::new(
            self.number,
            seq,
            ConsensusMessageKind::PrePrepare(proposal.clone()),
        )));

        if self.proposals_tx.try_send(proposal).is_err() {
            warn!(
                "{:?} // Got a proposal for sequence {} but the previous one was not consumed yet",
                self.self_id, seq
            );
        }
    }

    /// Idempotent. All waits inside the view observe the signal and exit
    /// promptly; aborted views never decide.
    pub fn abort(&self) {
        let _ = self.abort_tx.lock().take();
    }

    /// Aborts the view and joins its tasks. Must not be called from the
    /// view's own tasks.
    pub fn stop(&self) {
        self.abort();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
    }

    fn aborted(&self) -> bool {
        self.abort_tx.lock().is_none()
    }

    fn process_messages(&self) {
        loop {
            select! {
                recv(self.abort_rx) -> _ => return,
                recv(self.inc_rx) -> msg => match msg {
                    Ok((sender, message)) => self.process_msg(sender, message),
                    Err(_) => return,
                },
            }
        }
    }

    fn process_msg(&self, sender: NodeId, m: ConsensusMessage) {
        let current = self.current_sequence();
        let seq = m.sequence_number();

        // This message is either for this sequence or the next one
        // (the sender might be ahead of us).
        if seq != current && seq != current + 1 {
            warn!(
                "{:?} // Got message from {:?} with sequence {} but our sequence is {}",
                self.self_id, sender, seq, current
            );
            return;
        }
        let for_next_sequence = seq == current + 1;

        if m.view() != self.number {
            warn!(
                "{:?} // Got message from {:?} of view {}, expected view {}",
                self.self_id,
                sender,
                m.view(),
                self.number
            );
            if sender == self.leader_id {
                // A leader sending traffic for the wrong view is
                // misbehaving.
                self.failure_detector.complain();
            }
            return;
        }

        match m.kind() {
            ConsensusMessageKind::PrePrepare(_) => self.handle_pre_prepare(sender, m),
            ConsensusMessageKind::Prepare(_) => {
                let set = if for_next_sequence {
                    &self.next_prepares
                } else {
                    &self.prepares
                };
                set.lock().register_vote(sender, m);
            }
            ConsensusMessageKind::Commit(..) => {
                let set = if for_next_sequence {
                    &self.next_commits
                } else {
                    &self.commits
                };
                set.lock().register_vote(sender, m);
            }
        }
    }

    fn handle_pre_prepare(&self, sender: NodeId, m: ConsensusMessage) {
        if sender != self.leader_id {
            warn!(
                "{:?} // Got pre-prepare from {:?} but the leader is {:?}",
                self.self_id, sender, self.leader_id
            );
            return;
        }

        let seq = m.sequence_number();
        let proposal = match m.into_kind() {
            ConsensusMessageKind::PrePrepare(proposal) => proposal,
            _ => return,
        };

        if proposal.is_empty() {
            warn!(
                "{:?} // Got pre-prepare with an empty proposal from {:?}",
                self.self_id, sender
            );
            return;
        }

        if self.proposals_tx.try_send(proposal).is_err() {
            // A proposal is still being handled; a correct leader never
            // has more than one outstanding.
            warn!(
                "{:?} // Got proposal {} but still processing proposal {}",
                self.self_id,
                seq,
                self.current_sequence()
            );
        }
    }

    fn run(&self) {
        loop {
            let seq = self.current_sequence();

            let (proposal, requests) = match self.process_pre_prepare(seq) {
                Some(accepted) => accepted,
                None => return,
            };
            let digest = proposal.digest();

            let prepare_quorum = match self.process_prepares(&digest) {
                Some(prepare_quorum) => prepare_quorum,
                None => return,
            };
            let own_signature = self.become_prepared(seq, digest, &proposal, &prepare_quorum);

            let signatures = match self.process_commits(&proposal, digest, own_signature) {
                Some(signatures) => signatures,
                None => return,
            };

            self.maybe_decide(seq, proposal, signatures, requests);
        }
    }

    /// Awaits the proposal for `seq`, verifies it against the previous
    /// header, and acknowledges it with a prepare broadcast.
    fn process_pre_prepare(&self, seq: u64) -> Option<(Proposal, Vec<RequestInfo>)> {
        let proposal = select! {
            recv(self.abort_rx) -> _ => return None,
            recv(self.proposals_rx) -> proposal => match proposal {
                Ok(proposal) => proposal,
                Err(_) => return None,
            },
        };

        let expected_epoch = self.verifier.verification_sequence();
        if proposal.verification_sequence() != expected_epoch {
            warn!(
                "{:?} // Got proposal tagged with verification sequence {} but expected {}",
                self.self_id,
                proposal.verification_sequence(),
                expected_epoch
            );
            self.failure_detector.complain();
            self.syncer.sync_if_needed();
            self.abort();
            return None;
        }

        let prev_header = self.prev_header.lock().clone();
        let requests = match self.verifier.verify_proposal(&proposal, &prev_header) {
            Ok(requests) => requests,
            Err(e) => {
                warn!(
                    "{:?} // Received bad proposal from {:?}: {:?}",
                    self.self_id, self.leader_id, e
                );
                self.failure_detector.complain();
                self.syncer.sync_if_needed();
                self.abort();
                return None;
            }
        };

        let digest = proposal.digest();
        if self.self_id != self.leader_id {
            // The leader already persisted the proposal in propose().
            self.state.save_pre_prepared(self.number, seq, &proposal);
        }

        self.comm.broadcast_consensus(Message::Consensus(ConsensusMessage::new(
            self.number,
            seq,
            ConsensusMessageKind::Prepare(digest),
        )));

        Some((proposal, requests))
    }

    /// Collects prepare votes until, combined with this node's own
    /// implicit vote, a quorum acknowledged the proposal. Returns the
    /// voters the quorum is made of.
    fn process_prepares(&self, expected: &Digest) -> Option<Vec<NodeId>> {
        let votes = self.prepares.lock().receiver();
        let mut voters = vec![self.self_id];

        while voters.len() < self.quorum {
            let vote = select! {
                recv(self.abort_rx) -> _ => return None,
                recv(votes) -> vote => match vote {
                    Ok(vote) => vote,
                    Err(_) => return None,
                },
            };
            match vote.message.kind() {
                ConsensusMessageKind::Prepare(digest) if digest == expected => {
                    if !voters.contains(&vote.sender) {
                        voters.push(vote.sender);
                    }
                }
                _ => {
                    warn!(
                        "{:?} // Got prepare from {:?} for a different proposal",
                        self.self_id, vote.sender
                    );
                }
            }
        }
        Some(voters)
    }

    /// Persists the prepare quorum, hands the proposal to the in-flight
    /// store, and broadcasts this node's signed commit.
    fn become_prepared(
        &self,
        seq: u64,
        digest: Digest,
        proposal: &Proposal,
        prepare_quorum: &[NodeId],
    ) -> Signature {
        self.state
            .save_prepared(self.number, seq, digest, proposal, prepare_quorum);

        let signature = self.signer.sign_proposal(proposal);
        self.comm.broadcast_consensus(Message::Consensus(ConsensusMessage::new(
            self.number,
            seq,
            ConsensusMessageKind::Commit(digest, signature.clone()),
        )));
        signature
    }

    /// Collects commit votes carrying valid consenter signatures until a
    /// quorum, including this node's own signature, is assembled.
    fn process_commits(
        &self,
        proposal: &Proposal,
        expected: Digest,
        own_signature: Signature,
    ) -> Option<Vec<Signature>> {
        let votes = self.commits.lock().receiver();
        let mut signers = crate::bft::collections::hash_set();
        signers.insert(own_signature.signer());
        let mut signatures = vec![own_signature];

        while signatures.len() < self.quorum {
            let vote = select! {
                recv(self.abort_rx) -> _ => return None,
                recv(votes) -> vote => match vote {
                    Ok(vote) => vote,
                    Err(_) => return None,
                },
            };
            let (digest, signature) = match vote.message.into_kind() {
                ConsensusMessageKind::Commit(digest, signature) => (digest, signature),
                _ => continue,
            };
            if digest != expected {
                warn!(
                    "{:?} // Got commit from {:?} for a different proposal",
                    self.self_id, vote.sender
                );
                continue;
            }
            if signers.contains(&signature.signer()) {
                continue;
            }
            if let Err(e) = self.verifier.verify_consenter_sig(&signature, proposal) {
                warn!(
                    "{:?} // Got commit from {:?} with an invalid signature: {:?}",
                    self.self_id, vote.sender, e
                );
                continue;
            }
            signers.insert(signature.signer());
            signatures.push(signature);
        }
        Some(signatures)
    }

    /// Persists the commit quorum, advances to the next sequence within
    /// this view, and reports the decision.
    fn maybe_decide(
        &self,
        seq: u64,
        proposal: Proposal,
        signatures: Vec<Signature>,
        requests: Vec<RequestInfo>,
    ) {
        self.state.save_decided(self.number, seq, &proposal, &signatures);

        info!(
            "{:?} // Decided sequence {} in view {}",
            self.self_id, seq, self.number
        );

        self.advance(&proposal);
        self.decider.decide(proposal, signatures, requests);
    }

    /// Rolls the one-ahead vote buckets into the current ones and moves
    /// the sequence forward; the view number never changes.
    fn advance(&self, decided: &Proposal) {
        *self.prev_header.lock() = decided.header().to_vec();

        {
            let mut current = self.prepares.lock();
            let mut next = self.next_prepares.lock();
            current.clear();
            std::mem::swap(&mut *current, &mut *next);
        }
        {
            let mut current = self.commits.lock();
            let mut next = self.next_commits.lock();
            current.clear();
            std::mem::swap(&mut *current, &mut *next);
        }

        self.proposal_sequence.fetch_add(1, Ordering::AcqRel);
    }

    /// The number of participants this view was configured with.
    pub fn cluster_size(&self) -> u64 {
        self.n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::api::WriteAheadLog;
    use crate::bft::error::Result;
    use crate::bft::state::InFlightData;
    use crate::bft::types::ViewMetadata;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDecider {
        decisions: Mutex<Vec<(Proposal, Vec<Signature>)>>,
    }

    impl Decider for RecordingDecider {
        fn decide(&self, proposal: Proposal, signatures: Vec<Signature>, _: Vec<RequestInfo>) {
            self.decisions.lock().push((proposal, signatures));
        }
    }

    #[derive(Default)]
    struct CountingDetector {
        complaints: AtomicUsize,
    }

    impl FailureDetector for CountingDetector {
        fn complain(&self) {
            self.complaints.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct NopSyncer;

    impl Syncer for NopSyncer {
        fn sync_if_needed(&self) {}
    }

    #[derive(Default)]
    struct RecordingComm {
        broadcasts: Mutex<Vec<Message>>,
    }

    impl Comm for RecordingComm {
        fn nodes(&self) -> Vec<NodeId> {
            (0..4).map(NodeId).collect()
        }

        fn send_consensus(&self, _: NodeId, msg: Message) {
            self.broadcasts.lock().push(msg);
        }

        fn send_transaction(&self, _: NodeId, _: Vec<u8>) {}

        fn broadcast_consensus(&self, msg: Message) {
            self.broadcasts.lock().push(msg);
        }
    }

    struct LenientVerifier;

    impl Verifier for LenientVerifier {
        fn verify_request(&self, _: &[u8]) -> Result<RequestInfo> {
            Ok(RequestInfo::new("client", "request"))
        }

        fn verify_proposal(&self, _: &Proposal, _: &[u8]) -> Result<Vec<RequestInfo>> {
            Ok(vec![])
        }

        fn verify_consenter_sig(&self, _: &Signature, _: &Proposal) -> Result<()> {
            Ok(())
        }

        fn verify_signature(&self, _: NodeId, _: &[u8], _: &[u8]) -> Result<()> {
            Ok(())
        }

        fn verification_sequence(&self) -> u64 {
            0
        }
    }

    struct IdSigner(NodeId);

    impl Signer for IdSigner {
        fn sign(&self, _: &[u8]) -> Vec<u8> {
            vec![self.0.id() as u8]
        }

        fn sign_proposal(&self, proposal: &Proposal) -> Signature {
            Signature::new(self.0, proposal.digest().as_ref().to_vec(), vec![])
        }
    }

    #[derive(Default)]
    struct MemoryWal {
        records: Mutex<Vec<Vec<u8>>>,
    }

    impl WriteAheadLog for MemoryWal {
        fn append(&self, record: &[u8]) -> Result<()> {
            self.records.lock().push(record.to_vec());
            Ok(())
        }
    }

    struct Fixture {
        view: Arc<View>,
        decider: Arc<RecordingDecider>,
        detector: Arc<CountingDetector>,
        comm: Arc<RecordingComm>,
    }

    fn fixture(self_id: u64, leader: u64) -> Fixture {
        let decider = Arc::new(RecordingDecider::default());
        let detector = Arc::new(CountingDetector::default());
        let comm = Arc::new(RecordingComm::default());
        let state = Arc::new(PersistedState::new(
            Arc::new(InFlightData::default()),
            Arc::new(MemoryWal::default()),
        ));

        let view = View::new(ViewConfig {
            n: 4,
            quorum: 3,
            leader_id: NodeId(leader),
            self_id: NodeId(self_id),
            number: 0,
            proposal_sequence: 1,
            prev_header: vec![],
            in_msg_q_size: 40,
            decider: decider.clone(),
            failure_detector: detector.clone(),
            syncer: Arc::new(NopSyncer),
            comm: comm.clone(),
            verifier: Arc::new(LenientVerifier),
            signer: Arc::new(IdSigner(NodeId(self_id))),
            state,
        });

        Fixture {
            view,
            decider,
            detector,
            comm,
        }
    }

    fn proposal_for(seq: u64) -> Proposal {
        Proposal::new(
            b"batch".to_vec(),
            b"header".to_vec(),
            ViewMetadata {
                view_id: 0,
                latest_sequence: seq,
            },
            0,
        )
    }

    fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !predicate() {
            if std::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_follower_decides_with_quorum() {
        let f = fixture(3, 0);
        f.view.start();

        let proposal = proposal_for(1);
        let digest = proposal.digest();
        f.view.handle_message(
            NodeId(0),
            ConsensusMessage::new(0, 1, ConsensusMessageKind::PrePrepare(proposal.clone())),
        );

        for id in [0u64, 1] {
            f.view.handle_message(
                NodeId(id),
                ConsensusMessage::new(0, 1, ConsensusMessageKind::Prepare(digest)),
            );
        }
        for id in [0u64, 1] {
            let sig = Signature::new(NodeId(id), digest.as_ref().to_vec(), vec![]);
            f.view.handle_message(
                NodeId(id),
                ConsensusMessage::new(0, 1, ConsensusMessageKind::Commit(digest, sig)),
            );
        }

        wait_for("decision", || !f.decider.decisions.lock().is_empty());
        let decisions = f.decider.decisions.lock();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].0, proposal);
        assert_eq!(decisions[0].1.len(), 3);
        drop(decisions);

        assert_eq!(f.view.current_sequence(), 2);
        f.view.stop();
    }

    #[test]
    fn test_equivocating_prepare_counts_once() {
        let f = fixture(3, 0);
        f.view.start();

        let proposal = proposal_for(1);
        let digest = proposal.digest();
        f.view.handle_message(
            NodeId(0),
            ConsensusMessage::new(0, 1, ConsensusMessageKind::PrePrepare(proposal)),
        );

        // Node 1 votes twice with different digests; only the first may
        // count, so the prepare quorum is never reached.
        f.view.handle_message(
            NodeId(1),
            ConsensusMessage::new(0, 1, ConsensusMessageKind::Prepare(digest)),
        );
        let other = proposal_for(9).digest();
        f.view.handle_message(
            NodeId(1),
            ConsensusMessage::new(0, 1, ConsensusMessageKind::Prepare(other)),
        );

        std::thread::sleep(Duration::from_millis(100));
        // Prepare broadcast happened, commit broadcast did not.
        let broadcasts = f.comm.broadcasts.lock();
        assert!(broadcasts.iter().all(|m| !matches!(
            m,
            Message::Consensus(c) if matches!(c.kind(), ConsensusMessageKind::Commit(..))
        )));
        drop(broadcasts);
        assert!(f.decider.decisions.lock().is_empty());

        f.view.stop();
    }

    #[test]
    fn test_pre_prepare_from_non_leader_rejected() {
        let f = fixture(3, 0);
        f.view.start();

        f.view.handle_message(
            NodeId(2),
            ConsensusMessage::new(0, 1, ConsensusMessageKind::PrePrepare(proposal_for(1))),
        );

        std::thread::sleep(Duration::from_millis(50));
        assert!(f.comm.broadcasts.lock().is_empty());
        f.view.stop();
    }

    #[test]
    fn test_wrong_view_from_leader_complains() {
        let f = fixture(3, 0);
        f.view.start();

        f.view.handle_message(
            NodeId(0),
            ConsensusMessage::new(7, 1, ConsensusMessageKind::Prepare(proposal_for(1).digest())),
        );
        wait_for("complaint", || {
            f.detector.complaints.load(Ordering::SeqCst) == 1
        });

        // The same wrong-view message from a non leader is dropped
        // without a complaint.
        f.view.handle_message(
            NodeId(2),
            ConsensusMessage::new(7, 1, ConsensusMessageKind::Prepare(proposal_for(1).digest())),
        );
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(f.detector.complaints.load(Ordering::SeqCst), 1);

        f.view.stop();
    }

    #[test]
    fn test_bad_proposal_aborts_and_complains() {
        let f = fixture(3, 0);
        f.view.start();

        // Tagged with a configuration epoch the verifier does not expect.
        let bad = Proposal::new(
            b"batch".to_vec(),
            b"header".to_vec(),
            ViewMetadata {
                view_id: 0,
                latest_sequence: 1,
            },
            5,
        );
        f.view.handle_message(
            NodeId(0),
            ConsensusMessage::new(0, 1, ConsensusMessageKind::PrePrepare(bad)),
        );

        wait_for("complaint", || {
            f.detector.complaints.load(Ordering::SeqCst) == 1
        });
        assert!(f.decider.decisions.lock().is_empty());
        f.view.stop();
    }

    #[test]
    fn test_abort_is_idempotent() {
        let f = fixture(3, 0);
        f.view.start();

        f.view.abort();
        f.view.abort();
        f.view.stop();
        f.view.stop();

        assert!(f.decider.decisions.lock().is_empty());
    }

    #[test]
    fn test_out_of_range_sequence_dropped() {
        let f = fixture(3, 0);
        f.view.start();

        f.view.handle_message(
            NodeId(0),
            ConsensusMessage::new(0, 5, ConsensusMessageKind::Prepare(proposal_for(5).digest())),
        );
        std::thread::sleep(Duration::from_millis(50));
        assert!(f.comm.broadcasts.lock().is_empty());
        f.view.stop();
    }
}
