//! The leader rotation protocol.
//!
//! When the current view stops making progress, participants coordinate
//! the move to the next view with three messages: `ViewChange` asks for
//! the move, `ViewData` reports each participant's agreement state to the
//! next leader, and `NewView` presents a quorum of those reports as
//! evidence that the new view may start. A single long-lived task owns
//! all protocol state; the outside world talks to it through a bounded
//! queue and an externally supplied ticker.
//!
//! Safety across views rests on the view data: if any sequence decided
//! in a prior view, a quorum of reports contains at least one prepared
//! copy of that proposal, and the highest-prepared rule forces the next
//! leader to re-propose it at the same sequence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::bft::api::{
    Comm, FailureDetector, HeartbeatEventHandler, RequestsTimer, Signer, Verifier, ViewController,
};
use crate::bft::collections::{self, HashMap, HashSet};
use crate::bft::error::*;
use crate::bft::message::{
    Message, SignedViewData, ViewChangeMessage, ViewChangeMessageKind, ViewData,
};
use crate::bft::state::{InFlightData, PersistedState};
use crate::bft::types::{Checkpoint, NodeId, Proposal};

/// Size of the view changer's inbound queue.
const IN_MSG_Q_SIZE: usize = 100;

enum Event {
    Message(NodeId, ViewChangeMessage),
    Start { stop_view: bool },
    Inform { view: u64 },
}

/// Everything a view changer is built from. The controller back-pointer
/// and the requests timer are bound after construction.
pub struct ViewChangerConfig {
    pub self_id: NodeId,
    pub n: u64,
    pub quorum: usize,
    pub comm: Arc<dyn Comm>,
    pub signer: Arc<dyn Signer>,
    pub verifier: Arc<dyn Verifier>,
    pub checkpoint: Arc<Checkpoint>,
    pub in_flight: Arc<InFlightData>,
    pub state: Arc<PersistedState>,
    pub ticker: Receiver<Instant>,
    pub resend_timeout: Duration,
    pub timeout_view_change: Duration,
}

pub struct ViewChanger {
    self_id: NodeId,
    n: u64,
    quorum: usize,
    f: usize,
    nodes: Vec<NodeId>,

    comm: Arc<dyn Comm>,
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn Verifier>,
    checkpoint: Arc<Checkpoint>,
    in_flight: Arc<InFlightData>,
    state: Arc<PersistedState>,

    controller: OnceCell<Weak<dyn ViewController>>,
    requests_timer: OnceCell<Arc<dyn RequestsTimer>>,

    resend_timeout: Duration,
    timeout_view_change: Duration,
    ticker: Receiver<Instant>,

    curr_view: AtomicU64,
    inc_tx: Sender<Event>,
    inc_rx: Receiver<Event>,
    stop_rx: Receiver<()>,
    stop_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Protocol state owned exclusively by the view changer task.
struct ChangeState {
    in_change: bool,
    next_view: u64,
    started: Instant,
    last_resend: Instant,
    /// The view a `ViewData` report was already sent for.
    view_data_sent: Option<u64>,
    /// Distinct `ViewChange` senders per target view.
    votes: HashMap<u64, HashSet<NodeId>>,
    /// Reports collected by the next leader, keyed by signer.
    collected: HashMap<NodeId, SignedViewData>,
}

impl ChangeState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            in_change: false,
            next_view: 0,
            started: now,
            last_resend: now,
            view_data_sent: None,
            votes: collections::hash_map(),
            collected: collections::hash_map(),
        }
    }
}

impl ViewChanger {
    pub fn new(config: ViewChangerConfig) -> Arc<Self> {
        let mut nodes = config.comm.nodes();
        nodes.sort_unstable();
        let f = ((config.n - 1) / 3) as usize;
        let (inc_tx, inc_rx) = bounded(IN_MSG_Q_SIZE);
        let (stop_tx, stop_rx) = bounded(1);

        Arc::new(Self {
            self_id: config.self_id,
            n: config.n,
            quorum: config.quorum,
            f,
            nodes,
            comm: config.comm,
            signer: config.signer,
            verifier: config.verifier,
            checkpoint: config.checkpoint,
            in_flight: config.in_flight,
            state: config.state,
            controller: OnceCell::new(),
            requests_timer: OnceCell::new(),
            resend_timeout: config.resend_timeout,
            timeout_view_change: config.timeout_view_change,
            ticker: config.ticker,
            curr_view: AtomicU64::new(0),
            inc_tx,
            inc_rx,
            stop_rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(None),
        })
    }

    pub fn bind_controller(&self, controller: Weak<dyn ViewController>) {
        let _ = self.controller.set(controller);
    }

    pub fn bind_requests_timer(&self, timer: Arc<dyn RequestsTimer>) {
        let _ = self.requests_timer.set(timer);
    }

    pub fn current_view(&self) -> u64 {
        self.curr_view.load(Ordering::Acquire)
    }

    pub fn start(self: &Arc<Self>, view: u64) {
        self.curr_view.store(view, Ordering::Release);
        let changer = Arc::clone(self);
        *self.thread.lock() = Some(
            std::thread::Builder::new()
                .name("view-changer".into())
                .spawn(move || changer.run())
                .unwrap(),
        );
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.lock().take();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Requests the move to the next view. `stop_view` also aborts the
    /// current view so agreement halts while the change runs.
    pub fn start_view_change(&self, stop_view: bool) {
        if self.inc_tx.try_send(Event::Start { stop_view }).is_err() {
            warn!(
                "{:?} // View changer queue is full, dropping a start request",
                self.self_id
            );
        }
    }

    /// Tells the view changer the cluster was observed at `view`, e.g.
    /// after a state synchronization.
    pub fn inform_new_view(&self, view: u64, _seq: u64) {
        let _ = self.inc_tx.try_send(Event::Inform { view });
    }

    pub fn handle_message(&self, sender: NodeId, msg: ViewChangeMessage) {
        if self.inc_tx.try_send(Event::Message(sender, msg)).is_err() {
            warn!(
                "{:?} // View changer queue is full, dropping message from {:?}",
                self.self_id, sender
            );
        }
    }

    fn controller(&self) -> Option<Arc<dyn ViewController>> {
        self.controller.get().and_then(Weak::upgrade)
    }

    fn leader_of(&self, view: u64) -> NodeId {
        self.nodes[(view % self.n) as usize]
    }

    fn run(&self) {
        let mut st = ChangeState::new();
        loop {
            select! {
                recv(self.stop_rx) -> _ => return,
                recv(self.inc_rx) -> event => match event {
                    Ok(event) => self.handle_event(&mut st, event),
                    Err(_) => return,
                },
                recv(self.ticker) -> tick => match tick {
                    Ok(now) => self.tick(&mut st, now),
                    Err(_) => return,
                },
            }
        }
    }

    fn handle_event(&self, st: &mut ChangeState, event: Event) {
        match event {
            Event::Start { stop_view } => {
                let target = self.current_view() + 1;
                self.begin(st, target, stop_view);
            }
            Event::Inform { view } => {
                if view > self.current_view() {
                    info!(
                        "{:?} // Informed of view {}, catching up",
                        self.self_id, view
                    );
                    self.curr_view.store(view, Ordering::Release);
                    if st.in_change && st.next_view <= view {
                        st.in_change = false;
                        st.view_data_sent = None;
                        st.collected.clear();
                    }
                    st.votes.retain(|v, _| *v > view);
                }
            }
            Event::Message(sender, msg) => {
                let next_view = msg.next_view();
                match msg.into_kind() {
                    ViewChangeMessageKind::ViewChange => {
                        self.handle_view_change(st, sender, next_view)
                    }
                    ViewChangeMessageKind::ViewData(svd) => {
                        self.handle_view_data(st, sender, next_view, svd)
                    }
                    ViewChangeMessageKind::NewView(evidence) => {
                        self.handle_new_view(st, sender, next_view, evidence)
                    }
                }
            }
        }
    }

    fn begin(&self, st: &mut ChangeState, target: u64, stop_view: bool) {
        if st.in_change && st.next_view >= target {
            return;
        }
        info!(
            "{:?} // Starting view change to view {}",
            self.self_id, target
        );

        let now = Instant::now();
        st.in_change = true;
        st.next_view = target;
        st.started = now;
        st.last_resend = now;
        st.view_data_sent = None;
        st.collected.clear();
        st.votes
            .entry(target)
            .or_insert_with(collections::hash_set)
            .insert(self.self_id);

        self.comm
            .broadcast_consensus(Message::ViewChange(ViewChangeMessage::new(
                target,
                ViewChangeMessageKind::ViewChange,
            )));

        if stop_view {
            if let Some(controller) = self.controller() {
                controller.abort_view(self.current_view());
            }
            if let Some(timer) = self.requests_timer.get() {
                timer.stop_timers();
            }
        }

        self.maybe_send_view_data(st);
    }

    fn handle_view_change(&self, st: &mut ChangeState, sender: NodeId, next_view: u64) {
        if next_view <= self.current_view() {
            debug!(
                "{:?} // Dropping view change for old view {} from {:?}",
                self.self_id, next_view, sender
            );
            return;
        }

        st.votes
            .entry(next_view)
            .or_insert_with(collections::hash_set)
            .insert(sender);
        let supporters = st.votes.get(&next_view).map_or(0, HashSet::len);

        // f+1 asks cannot all come from faulty participants, so it is
        // safe to join even without a local complaint.
        let joining = (!st.in_change || next_view > st.next_view) && supporters > self.f;
        if joining {
            info!(
                "{:?} // Joining view change to view {} with {} supporters",
                self.self_id, next_view, supporters
            );
            self.begin(st, next_view, true);
            return;
        }

        self.maybe_send_view_data(st);
    }

    /// Once a quorum asks for the change, every participant reports its
    /// agreement state to the designated next leader.
    fn maybe_send_view_data(&self, st: &mut ChangeState) {
        if !st.in_change || st.view_data_sent == Some(st.next_view) {
            return;
        }
        let supporters = st.votes.get(&st.next_view).map_or(0, HashSet::len);
        if supporters < self.quorum {
            return;
        }

        let decision = self.checkpoint.get();
        let in_flight = self.in_flight.load();
        let view_data = ViewData {
            next_view: st.next_view,
            last_decided: decision.proposal().metadata(),
            in_flight: in_flight.as_ref().map(|f| f.proposal.clone()),
            prepare_quorum: in_flight.and_then(|f| f.prepare_quorum),
        };
        let raw = match view_data.encode() {
            Ok(raw) => raw,
            Err(e) => {
                warn!("{:?} // Failed to encode view data: {:?}", self.self_id, e);
                return;
            }
        };
        let signature = self.signer.sign(&raw);
        let signed = SignedViewData::new(raw, self.self_id, signature);

        st.view_data_sent = Some(st.next_view);
        let next_leader = self.leader_of(st.next_view);
        info!(
            "{:?} // Sending view data for view {} to {:?}",
            self.self_id, st.next_view, next_leader
        );
        if next_leader == self.self_id {
            self.accept_view_data(st, signed);
        } else {
            self.comm.send_consensus(
                next_leader,
                Message::ViewChange(ViewChangeMessage::new(
                    st.next_view,
                    ViewChangeMessageKind::ViewData(signed),
                )),
            );
        }
    }

    fn handle_view_data(
        &self,
        st: &mut ChangeState,
        sender: NodeId,
        next_view: u64,
        signed: SignedViewData,
    ) {
        if !st.in_change || next_view != st.next_view {
            debug!(
                "{:?} // Dropping view data for view {} from {:?}",
                self.self_id, next_view, sender
            );
            return;
        }
        if self.leader_of(next_view) != self.self_id {
            warn!(
                "{:?} // Got view data from {:?} but the leader of view {} is {:?}",
                self.self_id,
                sender,
                next_view,
                self.leader_of(next_view)
            );
            return;
        }
        self.accept_view_data(st, signed);
    }

    fn accept_view_data(&self, st: &mut ChangeState, signed: SignedViewData) {
        if let Err(e) =
            self.verifier
                .verify_signature(signed.signer(), signed.raw(), signed.signature())
        {
            warn!(
                "{:?} // Got view data with an invalid signature from {:?}: {:?}",
                self.self_id,
                signed.signer(),
                e
            );
            return;
        }
        match signed.view_data() {
            Ok(view_data) if view_data.next_view == st.next_view => {}
            _ => {
                warn!(
                    "{:?} // Got malformed view data from {:?}",
                    self.self_id,
                    signed.signer()
                );
                return;
            }
        }

        st.collected.insert(signed.signer(), signed);
        if st.collected.len() < self.quorum {
            return;
        }

        // The quorum of reports is the evidence the new view may start.
        let evidence: Vec<SignedViewData> = st.collected.values().cloned().collect();
        info!(
            "{:?} // Collected {} view data reports, broadcasting new view {}",
            self.self_id,
            evidence.len(),
            st.next_view
        );
        self.comm
            .broadcast_consensus(Message::ViewChange(ViewChangeMessage::new(
                st.next_view,
                ViewChangeMessageKind::NewView(evidence.clone()),
            )));

        let next_view = st.next_view;
        match self.evaluate_evidence(next_view, &evidence) {
            Ok((start_seq, reproposal)) => self.install(st, next_view, start_seq, reproposal),
            Err(e) => warn!(
                "{:?} // Own new view evidence did not validate: {:?}",
                self.self_id, e
            ),
        }
    }

    fn handle_new_view(
        &self,
        st: &mut ChangeState,
        sender: NodeId,
        next_view: u64,
        evidence: Vec<SignedViewData>,
    ) {
        if next_view <= self.current_view() {
            return;
        }
        if sender != self.leader_of(next_view) {
            warn!(
                "{:?} // Got new view {} from {:?} but its leader is {:?}",
                self.self_id,
                next_view,
                sender,
                self.leader_of(next_view)
            );
            return;
        }
        match self.evaluate_evidence(next_view, &evidence) {
            Ok((start_seq, reproposal)) => self.install(st, next_view, start_seq, reproposal),
            Err(e) => warn!(
                "{:?} // Got new view {} with invalid evidence from {:?}: {:?}",
                self.self_id, next_view, sender, e
            ),
        }
    }

    /// Validates a quorum of signed reports and derives the starting
    /// sequence plus the proposal the new leader must re-propose, if
    /// any: the highest `(view, sequence)` in-flight proposal supported
    /// by a prepare quorum.
    fn evaluate_evidence(
        &self,
        next_view: u64,
        evidence: &[SignedViewData],
    ) -> Result<(u64, Option<Proposal>)> {
        let mut signers = collections::hash_set();
        let mut max_decided = 0u64;
        let mut best: Option<Proposal> = None;

        for signed in evidence {
            self.verifier
                .verify_signature(signed.signer(), signed.raw(), signed.signature())?;
            let view_data = signed.view_data()?;
            if view_data.next_view != next_view {
                return Err(Error::simple(ErrorKind::Verification));
            }
            signers.insert(signed.signer());

            max_decided = max_decided.max(view_data.last_decided.latest_sequence);
            let quorum_voters = view_data
                .prepare_quorum
                .as_ref()
                .map_or(0, |voters| voters.iter().collect::<HashSet<_>>().len());
            if quorum_voters >= self.quorum {
                if let Some(proposal) = view_data.in_flight {
                    let key = (
                        proposal.metadata().view_id,
                        proposal.metadata().latest_sequence,
                    );
                    let better = best.as_ref().map_or(true, |b| {
                        key > (b.metadata().view_id, b.metadata().latest_sequence)
                    });
                    if better {
                        best = Some(proposal);
                    }
                }
            } else if view_data.in_flight.is_some() {
                debug!(
                    "{:?} // Ignoring an in-flight report from {:?} without a prepare quorum",
                    self.self_id,
                    signed.signer()
                );
            }
        }

        if signers.len() < self.quorum {
            return Err(Error::simple(ErrorKind::Verification));
        }

        let start_seq = max_decided + 1;
        let reproposal = best.filter(|p| p.metadata().latest_sequence == start_seq);
        Ok((start_seq, reproposal))
    }

    fn install(
        &self,
        st: &mut ChangeState,
        next_view: u64,
        start_seq: u64,
        reproposal: Option<Proposal>,
    ) {
        if next_view <= self.current_view() {
            return;
        }
        info!(
            "{:?} // Installing view {} starting at sequence {}",
            self.self_id, next_view, start_seq
        );

        self.state.save_view_change(next_view);
        self.curr_view.store(next_view, Ordering::Release);
        st.in_change = false;
        st.view_data_sent = None;
        st.collected.clear();
        st.votes.retain(|v, _| *v > next_view);

        if let Some(timer) = self.requests_timer.get() {
            timer.restart_timers();
        }
        if let Some(controller) = self.controller() {
            if let Some(proposal) = reproposal {
                controller.set_reproposal(proposal);
            }
            controller.view_changed(next_view, start_seq);
        }
    }

    fn tick(&self, st: &mut ChangeState, now: Instant) {
        if !st.in_change {
            return;
        }

        if now.duration_since(st.started) >= self.timeout_view_change {
            // The change itself stalled, most likely because the next
            // leader is also unreachable.
            let target = st.next_view + 1;
            warn!(
                "{:?} // View change to {} timed out, escalating to {}",
                self.self_id, st.next_view, target
            );
            st.in_change = false;
            self.begin(st, target, false);
            return;
        }

        if now.duration_since(st.last_resend) >= self.resend_timeout {
            st.last_resend = now;
            debug!(
                "{:?} // Resending view change for view {}",
                self.self_id, st.next_view
            );
            self.comm
                .broadcast_consensus(Message::ViewChange(ViewChangeMessage::new(
                    st.next_view,
                    ViewChangeMessageKind::ViewChange,
                )));
            if st.view_data_sent == Some(st.next_view) {
                st.view_data_sent = None;
                self.maybe_send_view_data(st);
            }
        }
    }
}

impl FailureDetector for ViewChanger {
    fn complain(&self) {
        self.start_view_change(true);
    }
}

impl HeartbeatEventHandler for ViewChanger {
    fn on_heartbeat_timeout(&self, view: u64) {
        if view < self.current_view() {
            return;
        }
        info!(
            "{:?} // Leader of view {} stopped sending heartbeats",
            self.self_id, view
        );
        self.start_view_change(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::api::WriteAheadLog;
    use crate::bft::types::{Signature, ViewMetadata};
    use crossbeam_channel::unbounded;

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

    #[derive(Default)]
    struct RecordingComm {
        sent: Mutex<Vec<(Option<NodeId>, Message)>>,
    }

    impl Comm for RecordingComm {
        fn nodes(&self) -> Vec<NodeId> {
            (0..4).map(NodeId).collect()
        }

        fn send_consensus(&self, to: NodeId, msg: Message) {
            self.sent.lock().push((Some(to), msg));
        }

        fn send_transaction(&self, _: NodeId, _: Vec<u8>) {}

        fn broadcast_consensus(&self, msg: Message) {
            self.sent.lock().push((None, msg));
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

    struct LenientVerifier;

    impl Verifier for LenientVerifier {
        fn verify_request(&self, _: &[u8]) -> Result<crate::bft::types::RequestInfo> {
            Ok(crate::bft::types::RequestInfo::new("client", "request"))
        }

        fn verify_proposal(
            &self,
            _: &Proposal,
            _: &[u8],
        ) -> Result<Vec<crate::bft::types::RequestInfo>> {
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

    #[derive(Default)]
    struct RecordingController {
        changes: Mutex<Vec<(u64, u64)>>,
        aborts: Mutex<Vec<u64>>,
        reproposals: Mutex<Vec<Proposal>>,
    }

    impl ViewController for RecordingController {
        fn view_changed(&self, view: u64, seq: u64) {
            self.changes.lock().push((view, seq));
        }

        fn abort_view(&self, view: u64) {
            self.aborts.lock().push(view);
        }

        fn set_reproposal(&self, proposal: Proposal) {
            self.reproposals.lock().push(proposal);
        }
    }

    struct NopTimer;

    impl RequestsTimer for NopTimer {
        fn stop_timers(&self) {}

        fn restart_timers(&self) {}
    }

    struct Fixture {
        changer: Arc<ViewChanger>,
        comm: Arc<RecordingComm>,
        controller: Arc<RecordingController>,
        // Keep the bound trait object and the ticker alive for the
        // changer's lifetime.
        _controller_obj: Arc<dyn ViewController>,
        _ticker_tx: Sender<Instant>,
    }

    fn fixture(self_id: u64) -> Fixture {
        let comm = Arc::new(RecordingComm::default());
        let controller = Arc::new(RecordingController::default());
        let (ticker_tx, ticker_rx) = unbounded();
        let in_flight = Arc::new(InFlightData::default());

        let changer = ViewChanger::new(ViewChangerConfig {
            self_id: NodeId(self_id),
            n: 4,
            quorum: 3,
            comm: comm.clone(),
            signer: Arc::new(IdSigner(NodeId(self_id))),
            verifier: Arc::new(LenientVerifier),
            checkpoint: Arc::new(Checkpoint::default()),
            in_flight: in_flight.clone(),
            state: Arc::new(PersistedState::new(in_flight, Arc::new(MemoryWal::default()))),
            ticker: ticker_rx,
            resend_timeout: Duration::from_millis(100),
            timeout_view_change: Duration::from_secs(5),
        });
        let controller_obj: Arc<dyn ViewController> = controller.clone();
        changer.bind_controller(Arc::downgrade(&controller_obj));
        changer.bind_requests_timer(Arc::new(NopTimer));

        Fixture {
            changer,
            comm,
            controller,
            _controller_obj: controller_obj,
            _ticker_tx: ticker_tx,
        }
    }

    fn signed_view_data(signer: u64, view_data: &ViewData) -> SignedViewData {
        let raw = view_data.encode().unwrap();
        SignedViewData::new(raw, NodeId(signer), vec![signer as u8])
    }

    fn prepared(view: u64, seq: u64) -> Proposal {
        Proposal::new(
            b"payload".to_vec(),
            b"header".to_vec(),
            ViewMetadata {
                view_id: view,
                latest_sequence: seq,
            },
            0,
        )
    }

    fn plain_view_data(next_view: u64, last_decided: u64) -> ViewData {
        ViewData {
            next_view,
            last_decided: ViewMetadata {
                view_id: 0,
                latest_sequence: last_decided,
            },
            in_flight: None,
            prepare_quorum: None,
        }
    }

    fn full_quorum() -> Option<Vec<NodeId>> {
        Some(vec![NodeId(0), NodeId(1), NodeId(2)])
    }

    #[test]
    fn test_evidence_picks_highest_prepared() {
        let f = fixture(0);
        let in_flight = prepared(0, 3);
        let evidence = vec![
            signed_view_data(1, &plain_view_data(1, 2)),
            signed_view_data(
                2,
                &ViewData {
                    in_flight: Some(in_flight.clone()),
                    prepare_quorum: full_quorum(),
                    ..plain_view_data(1, 2)
                },
            ),
            signed_view_data(3, &plain_view_data(1, 1)),
        ];

        let (start_seq, reproposal) = f.changer.evaluate_evidence(1, &evidence).unwrap();
        assert_eq!(start_seq, 3);
        assert_eq!(reproposal, Some(in_flight));
    }

    #[test]
    fn test_evidence_ignores_already_decided_in_flight() {
        let f = fixture(0);
        let evidence = vec![
            signed_view_data(1, &plain_view_data(1, 3)),
            signed_view_data(
                2,
                &ViewData {
                    in_flight: Some(prepared(0, 3)),
                    prepare_quorum: full_quorum(),
                    ..plain_view_data(1, 3)
                },
            ),
            signed_view_data(3, &plain_view_data(1, 2)),
        ];

        let (start_seq, reproposal) = f.changer.evaluate_evidence(1, &evidence).unwrap();
        assert_eq!(start_seq, 4);
        assert_eq!(reproposal, None);
    }

    #[test]
    fn test_evidence_ignores_short_prepare_quorum() {
        let f = fixture(0);
        let evidence = vec![
            signed_view_data(1, &plain_view_data(1, 2)),
            signed_view_data(
                2,
                &ViewData {
                    in_flight: Some(prepared(0, 3)),
                    // One voter claimed twice is not a quorum.
                    prepare_quorum: Some(vec![NodeId(2), NodeId(2)]),
                    ..plain_view_data(1, 2)
                },
            ),
            signed_view_data(3, &plain_view_data(1, 2)),
        ];

        let (start_seq, reproposal) = f.changer.evaluate_evidence(1, &evidence).unwrap();
        assert_eq!(start_seq, 3);
        assert_eq!(reproposal, None);
    }

    #[test]
    fn test_evidence_requires_quorum() {
        let f = fixture(0);
        let evidence = vec![
            signed_view_data(1, &plain_view_data(1, 0)),
            signed_view_data(2, &plain_view_data(1, 0)),
        ];

        assert!(f.changer.evaluate_evidence(1, &evidence).is_err());
    }

    #[test]
    fn test_evidence_rejects_duplicate_signers() {
        let f = fixture(0);
        let evidence = vec![
            signed_view_data(1, &plain_view_data(1, 0)),
            signed_view_data(1, &plain_view_data(1, 0)),
            signed_view_data(1, &plain_view_data(1, 0)),
        ];

        assert!(f.changer.evaluate_evidence(1, &evidence).is_err());
    }

    #[test]
    fn test_f_plus_one_join() {
        let f = fixture(3);
        let mut st = ChangeState::new();

        f.changer.handle_view_change(&mut st, NodeId(1), 1);
        assert!(!st.in_change);

        // A second distinct supporter is more than f, so the node joins
        // and the current view is stopped.
        f.changer.handle_view_change(&mut st, NodeId(2), 1);
        assert!(st.in_change);
        assert_eq!(st.next_view, 1);
        assert_eq!(f.controller.aborts.lock().as_slice(), &[0]);
        assert!(f.comm.sent.lock().iter().any(|(to, m)| {
            to.is_none()
                && matches!(
                    m,
                    Message::ViewChange(vc)
                        if vc.next_view() == 1
                            && matches!(vc.kind(), ViewChangeMessageKind::ViewChange)
                )
        }));
    }

    #[test]
    fn test_quorum_triggers_view_data_to_next_leader() {
        let f = fixture(3);
        let mut st = ChangeState::new();

        f.changer.handle_view_change(&mut st, NodeId(1), 1);
        f.changer.handle_view_change(&mut st, NodeId(2), 1);
        // Own vote joined above; a third peer completes the quorum.
        f.changer.handle_view_change(&mut st, NodeId(0), 1);

        assert_eq!(st.view_data_sent, Some(1));
        assert!(f.comm.sent.lock().iter().any(|(to, m)| {
            *to == Some(NodeId(1))
                && matches!(
                    m,
                    Message::ViewChange(vc)
                        if matches!(vc.kind(), ViewChangeMessageKind::ViewData(_))
                )
        }));
    }

    #[test]
    fn test_new_view_installs() {
        let f = fixture(3);
        let mut st = ChangeState::new();
        st.in_change = true;
        st.next_view = 1;

        let evidence = vec![
            signed_view_data(1, &plain_view_data(1, 0)),
            signed_view_data(2, &plain_view_data(1, 0)),
            signed_view_data(3, &plain_view_data(1, 0)),
        ];
        f.changer
            .handle_new_view(&mut st, NodeId(1), 1, evidence.clone());

        assert_eq!(f.changer.current_view(), 1);
        assert!(!st.in_change);
        assert_eq!(f.controller.changes.lock().as_slice(), &[(1, 1)]);

        // A replay of the same new view is a no-op.
        f.changer.handle_new_view(&mut st, NodeId(1), 1, evidence);
        assert_eq!(f.controller.changes.lock().len(), 1);
    }

    #[test]
    fn test_new_view_from_wrong_sender_rejected() {
        let f = fixture(3);
        let mut st = ChangeState::new();
        st.in_change = true;
        st.next_view = 1;

        let evidence = vec![
            signed_view_data(1, &plain_view_data(1, 0)),
            signed_view_data(2, &plain_view_data(1, 0)),
            signed_view_data(3, &plain_view_data(1, 0)),
        ];
        // View 1 is led by node 1, not node 2.
        f.changer.handle_new_view(&mut st, NodeId(2), 1, evidence);

        assert_eq!(f.changer.current_view(), 0);
        assert!(f.controller.changes.lock().is_empty());
    }
}
