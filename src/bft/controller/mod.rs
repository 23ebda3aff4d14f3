//! The per-node orchestrator.
//!
//! The controller owns the participant's role, routes every inbound
//! message to the sub-protocol interested in it, accepts client requests,
//! and drives proposal production while leading. Leader and follower are
//! not separate types; they are modes selected by `view mod n == self`,
//! re-evaluated every time a view is installed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::bft::api::{
    Application, Assembler, Batcher, Comm, Decider, LeaderMonitor, ProposerBuilder, RequestPool,
    Syncer, Synchronizer, Verifier, ViewController,
};
use crate::bft::error::*;
use crate::bft::message::{Message, StateTransferMessage};
use crate::bft::state_collector::StateCollector;
use crate::bft::types::{NodeId, Proposal, RequestInfo, Signature, ViewMetadata};
use crate::bft::view::View;
use crate::bft::view_change::ViewChanger;

/// The mode a controller operates in for the current view.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// Quorum size for a cluster of `n` participants, `⌈(2n+1)/3⌉`.
pub fn quorum_size(n: u64) -> usize {
    ((2 * n + 3) / 3) as usize
}

/// Everything a controller is built from. The view changer and the
/// proposer builder are bound after construction, because they point
/// back at the controller.
pub struct ControllerConfig {
    pub id: NodeId,
    pub n: u64,
    pub comm: Arc<dyn Comm>,
    pub verifier: Arc<dyn Verifier>,
    pub assembler: Arc<dyn Assembler>,
    pub application: Arc<dyn Application>,
    pub synchronizer: Arc<dyn Synchronizer>,
    pub checkpoint: Arc<crate::bft::types::Checkpoint>,
    pub pool: Arc<dyn RequestPool>,
    pub batcher: Arc<dyn Batcher>,
    pub leader_monitor: Arc<dyn LeaderMonitor>,
    pub collector: Arc<StateCollector>,
    /// Latest decided sequence, shared with the heartbeat monitor so
    /// heartbeats advertise progress.
    pub latest_seq: Arc<AtomicU64>,
}

pub struct Controller {
    id: NodeId,
    n: u64,
    quorum: usize,
    nodes: Vec<NodeId>,

    comm: Arc<dyn Comm>,
    verifier: Arc<dyn Verifier>,
    assembler: Arc<dyn Assembler>,
    application: Arc<dyn Application>,
    synchronizer: Arc<dyn Synchronizer>,
    checkpoint: Arc<crate::bft::types::Checkpoint>,
    pool: Arc<dyn RequestPool>,
    batcher: Arc<dyn Batcher>,
    leader_monitor: Arc<dyn LeaderMonitor>,
    collector: Arc<StateCollector>,

    view_changer: OnceCell<Arc<ViewChanger>>,
    proposer_builder: OnceCell<Arc<dyn ProposerBuilder>>,
    weak_self: OnceCell<std::sync::Weak<Controller>>,

    current_view: RwLock<Option<Arc<View>>>,
    view_number: AtomicU64,
    // Sequence of the most recent decision applied here.
    latest_seq: Arc<AtomicU64>,
    decided_seq: Mutex<u64>,
    decided_cond: Condvar,
    // A prepared proposal carried over a view change, re-proposed by the
    // new leader before any new batch.
    reproposal: Mutex<Option<Proposal>>,

    stopped: AtomicBool,
    proposer_stop: Mutex<Option<Arc<AtomicBool>>>,
    proposer_threads: Mutex<Vec<JoinHandle<()>>>,
    dead_views: Mutex<Vec<Arc<View>>>,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Arc<Self> {
        let mut nodes = config.comm.nodes();
        nodes.sort_unstable();

        let controller = Arc::new(Self {
            id: config.id,
            n: config.n,
            quorum: quorum_size(config.n),
            nodes,
            comm: config.comm,
            verifier: config.verifier,
            assembler: config.assembler,
            application: config.application,
            synchronizer: config.synchronizer,
            checkpoint: config.checkpoint,
            pool: config.pool,
            batcher: config.batcher,
            leader_monitor: config.leader_monitor,
            collector: config.collector,
            view_changer: OnceCell::new(),
            proposer_builder: OnceCell::new(),
            weak_self: OnceCell::new(),
            current_view: RwLock::new(None),
            view_number: AtomicU64::new(0),
            latest_seq: config.latest_seq,
            decided_seq: Mutex::new(0),
            decided_cond: Condvar::new(),
            reproposal: Mutex::new(None),
            stopped: AtomicBool::new(false),
            proposer_stop: Mutex::new(None),
            proposer_threads: Mutex::new(Vec::new()),
            dead_views: Mutex::new(Vec::new()),
        });
        let _ = controller.weak_self.set(Arc::downgrade(&controller));
        controller
    }

    pub fn bind_view_changer(&self, view_changer: Arc<ViewChanger>) {
        let _ = self.view_changer.set(view_changer);
    }

    pub fn bind_proposer_builder(&self, builder: Arc<dyn ProposerBuilder>) {
        let _ = self.proposer_builder.set(builder);
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The leader of `view` is the participant at position `view mod n`
    /// of the ordered participant set.
    pub fn leader_of(&self, view: u64) -> NodeId {
        self.nodes[(view % self.n) as usize]
    }

    pub fn role(&self) -> Role {
        if self.leader_of(self.view_number.load(Ordering::Acquire)) == self.id {
            Role::Leader
        } else {
            Role::Follower
        }
    }

    pub fn view_number(&self) -> u64 {
        self.view_number.load(Ordering::Acquire)
    }

    pub fn latest_sequence(&self) -> u64 {
        self.latest_seq.load(Ordering::Acquire)
    }

    /// Installs the role for `view_num` and starts agreement at
    /// `next_sequence`.
    pub fn start(&self, view_num: u64, next_sequence: u64) {
        info!(
            "{:?} // Starting at view {} and sequence {}",
            self.id, view_num, next_sequence
        );
        let latest = next_sequence.saturating_sub(1);
        self.latest_seq.store(latest, Ordering::Release);
        *self.decided_seq.lock() = latest;
        self.install_view(view_num, next_sequence);
    }

    /// Idempotent; drains the proposer loop and closes the batcher, the
    /// request pool and the leader monitor.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{:?} // Stopping controller", self.id);

        self.stop_proposer();
        self.batcher.close();
        self.pool.close();

        if let Some(view) = self.current_view.write().take() {
            view.stop();
        }
        for view in std::mem::take(&mut *self.dead_views.lock()) {
            view.stop();
        }
        self.leader_monitor.close();

        for handle in std::mem::take(&mut *self.proposer_threads.lock()) {
            let _ = handle.join();
        }
    }

    /// Routes an inbound message by kind: agreement traffic to the
    /// current view, view change traffic to the view changer, heartbeats
    /// to the leader monitor and state gossip to the collector.
    pub fn process_messages(&self, sender: NodeId, msg: Message) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        match msg {
            Message::Consensus(m) => {
                if let Some(view) = self.current_view.read().as_ref() {
                    view.handle_message(sender, m);
                }
            }
            Message::ViewChange(m) => {
                if let Some(view_changer) = self.view_changer.get() {
                    view_changer.handle_message(sender, m);
                }
            }
            Message::Heartbeat(m) => self.leader_monitor.process_msg(sender, m),
            Message::StateTransfer(m) => match m {
                StateTransferMessage::StateRequest => {
                    self.comm.send_consensus(
                        sender,
                        Message::StateTransfer(StateTransferMessage::StateResponse {
                            view: self.view_number(),
                            seq: self.latest_sequence(),
                        }),
                    );
                }
                StateTransferMessage::StateResponse { view, seq } => {
                    self.collector.handle_response(sender, view, seq);
                }
            },
        }
    }

    /// Request relayed from another participant. Only the leader
    /// verifies and enqueues it.
    pub fn handle_request(&self, sender: NodeId, request: Vec<u8>) {
        let view = self.view_number();
        let leader = self.leader_of(view);
        if leader != self.id {
            warn!(
                "{:?} // Got request from {:?} but the leader is {:?}, dropping request",
                self.id, sender, leader
            );
            return;
        }
        match self.verifier.verify_request(&request) {
            Err(e) => {
                warn!(
                    "{:?} // Got bad request from {:?}: {:?}",
                    self.id, sender, e
                );
            }
            Ok(info) => {
                debug!(
                    "{:?} // Got request {} from {:?}",
                    self.id,
                    info.key(),
                    sender
                );
                if let Err(e) = self.pool.submit(request) {
                    warn!(
                        "{:?} // Failed to submit request {} from {:?}: {:?}",
                        self.id,
                        info.key(),
                        sender,
                        e
                    );
                }
            }
        }
    }

    /// Client facing submission; forwarding to the leader is the pool's
    /// concern.
    pub fn submit_request(&self, request: Vec<u8>) -> Result<()> {
        self.pool.submit(request)
    }

    /// Invokes the synchronizer and applies whatever decision it
    /// returns. Older state is ignored; if the cluster moved on, the
    /// view changer is informed and the newer view installed.
    pub fn sync(&self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        let decision = self.synchronizer.sync();
        let (proposal, signatures) = decision.into_inner();
        let metadata = proposal.metadata();
        let view = self.view_number();
        let latest = self.latest_sequence();

        if metadata.latest_sequence <= latest && metadata.view_id <= view {
            info!(
                "{:?} // Synchronizer returned view {} and sequence {} but we are at view {} and sequence {}, ignoring",
                self.id, metadata.view_id, metadata.latest_sequence, view, latest
            );
            // Ask the cluster where it is; f+1 matching answers cannot
            // all come from faulty nodes.
            self.comm
                .broadcast_consensus(Message::StateTransfer(StateTransferMessage::StateRequest));
            let f = ((self.n - 1) / 3) as usize;
            if let Some((their_view, their_seq)) = self.collector.collect_responses(f + 1) {
                if their_view > view {
                    if let Some(view_changer) = self.view_changer.get() {
                        view_changer.inform_new_view(their_view, their_seq);
                    }
                }
            }
            return;
        }

        if metadata.latest_sequence > latest {
            self.checkpoint.set(proposal, signatures);
            self.latest_seq
                .store(metadata.latest_sequence, Ordering::Release);
            let mut decided = self.decided_seq.lock();
            *decided = metadata.latest_sequence;
            self.decided_cond.notify_all();
        }

        if let Some(view_changer) = self.view_changer.get() {
            view_changer.inform_new_view(metadata.view_id, metadata.latest_sequence);
        }
        if metadata.view_id >= view {
            self.view_changed(metadata.view_id, metadata.latest_sequence + 1);
        }
    }

    fn install_view(&self, view_num: u64, next_sequence: u64) {
        let leader = self.leader_of(view_num);
        self.view_number.store(view_num, Ordering::Release);

        let builder = self
            .proposer_builder
            .get()
            .expect("controller used before the proposer builder was bound");
        let view = builder.new_proposer(leader, next_sequence, view_num, self.quorum);
        view.start();

        if let Some(old) = self.current_view.write().replace(view.clone()) {
            old.abort();
            self.dead_views.lock().push(old);
        }

        let role = if leader == self.id {
            Role::Leader
        } else {
            Role::Follower
        };
        info!(
            "{:?} // Installed view {} at sequence {} with leader {:?} as {:?}",
            self.id, view_num, next_sequence, leader, role
        );
        self.leader_monitor.change_role(role, view_num, leader);

        if role == Role::Leader {
            self.start_proposer(view_num, view);
        }
    }

    fn teardown_current(&self) {
        self.stop_proposer();
        if let Some(view) = self.current_view.write().take() {
            view.abort();
            self.dead_views.lock().push(view);
        }
    }

    fn start_proposer(&self, view_num: u64, view: Arc<View>) {
        let stop = Arc::new(AtomicBool::new(false));
        *self.proposer_stop.lock() = Some(stop.clone());

        let controller = self
            .weak_self
            .get()
            .and_then(std::sync::Weak::upgrade)
            .expect("controller dropped while installing a view");

        let handle = std::thread::Builder::new()
            .name(format!("proposer-{}", view_num))
            .spawn(move || controller.run_proposer(view_num, view, stop))
            .unwrap();
        self.proposer_threads.lock().push(handle);
    }

    fn stop_proposer(&self) {
        if let Some(stop) = self.proposer_stop.lock().take() {
            stop.store(true, Ordering::SeqCst);
        }
        // Wake a proposer parked on the decision condvar.
        let _guard = self.decided_seq.lock();
        self.decided_cond.notify_all();
    }

    /// The leader proposal loop: batch, assemble, hand to the view, and
    /// wait for the decision or an abort.
    fn run_proposer(&self, view_num: u64, view: Arc<View>, stop: Arc<AtomicBool>) {
        loop {
            if stop.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire) {
                return;
            }

            let carried = self.reproposal.lock().take();
            let (proposal, target_seq) = match carried {
                Some(proposal) => {
                    let seq = proposal.metadata().latest_sequence;
                    if seq != self.latest_sequence() + 1 {
                        debug!(
                            "{:?} // Dropping a stale carried proposal for sequence {}",
                            self.id, seq
                        );
                        continue;
                    }
                    info!(
                        "{:?} // Re-proposing the in-flight proposal at sequence {}",
                        self.id, seq
                    );
                    (proposal, seq)
                }
                None => {
                    let batch = self.batcher.next_batch();
                    if stop.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire) {
                        return;
                    }
                    if batch.is_empty() {
                        continue;
                    }

                    let seq = self.latest_sequence() + 1;
                    let metadata = ViewMetadata {
                        view_id: view_num,
                        latest_sequence: seq,
                    };
                    let (proposal, remainder) = self.assembler.assemble_proposal(metadata, batch);
                    if !remainder.is_empty() {
                        self.batcher.batch_remainder(remainder);
                    }
                    if proposal.is_empty() {
                        continue;
                    }
                    (proposal, seq)
                }
            };

            debug!(
                "{:?} // Proposing sequence {} in view {}",
                self.id, target_seq, view_num
            );
            view.propose(proposal);

            let mut decided = self.decided_seq.lock();
            while *decided < target_seq
                && !stop.load(Ordering::Acquire)
                && !self.stopped.load(Ordering::Acquire)
            {
                self.decided_cond
                    .wait_for(&mut decided, Duration::from_millis(100));
            }
        }
    }
}

impl Decider for Controller {
    /// Called by the view when a sequence decides: deliver to the
    /// application, prune the delivered requests, advance the
    /// checkpoint and wake the proposal loop.
    fn decide(&self, proposal: Proposal, signatures: Vec<Signature>, requests: Vec<RequestInfo>) {
        let seq = proposal.metadata().latest_sequence;
        if seq <= self.latest_sequence() {
            warn!(
                "{:?} // Got a second decision for sequence {}, ignoring",
                self.id, seq
            );
            return;
        }

        self.application.deliver(proposal.clone(), signatures.clone());
        self.pool.prune(&requests);
        self.checkpoint.set(proposal, signatures);
        self.latest_seq.store(seq, Ordering::Release);

        let mut decided = self.decided_seq.lock();
        *decided = seq;
        self.decided_cond.notify_all();
    }
}

impl Syncer for Controller {
    fn sync_if_needed(&self) {
        self.sync();
    }
}

impl ViewController for Controller {
    fn view_changed(&self, view: u64, seq: u64) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        // Never step back behind a locally applied decision; laggards in
        // the evidence catch up through the synchronizer instead.
        let seq = seq.max(self.latest_sequence() + 1);
        info!(
            "{:?} // View changed to {} starting at sequence {}",
            self.id, view, seq
        );

        self.teardown_current();
        self.batcher.reset();

        let latest = seq.saturating_sub(1);
        if latest > self.latest_sequence() {
            self.latest_seq.store(latest, Ordering::Release);
            let mut decided = self.decided_seq.lock();
            *decided = latest;
            self.decided_cond.notify_all();
        }

        self.install_view(view, seq);
    }

    fn abort_view(&self, view: u64) {
        if let Some(current) = self.current_view.read().as_ref() {
            if current.number() == view {
                info!("{:?} // Aborting view {}", self.id, view);
                current.abort();
            }
        }
    }

    fn set_reproposal(&self, proposal: Proposal) {
        *self.reproposal.lock() = Some(proposal);
    }
}
