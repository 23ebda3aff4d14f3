//! Construction and wiring of a consensus participant.
//!
//! `Consensus` submits client requests to be total ordered and delivers
//! proposals to the application by invoking `deliver` on it. It owns the
//! controller, the view changer, the state collector and the request
//! pool, and resolves their cyclic references: all three core components
//! are built first and the back-pointers are bound afterwards, each one a
//! non-owning handle used only for callbacks.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use log::{debug, info};

use crate::bft::api::{
    Application, Assembler, Comm, PoolTimeoutHandler, RequestInspector, RequestPool, Signer,
    Synchronizer, Verifier, ViewController, WriteAheadLog,
};
use crate::bft::controller::{quorum_size, Controller, ControllerConfig};
use crate::bft::error::*;
use crate::bft::heartbeat::HeartbeatMonitor;
use crate::bft::message::Message;
use crate::bft::pool::{BatchBuilder, Pool, PoolOptions};
use crate::bft::state::{InFlightData, PersistedState, RecoveredState};
use crate::bft::state_collector::StateCollector;
use crate::bft::types::{Checkpoint, NodeId, Proposal, RequestInfo, Signature};
use crate::bft::view::ProposalMaker;
use crate::bft::view_change::{ViewChanger, ViewChangerConfig};

/// Tuning knobs of a participant. `wal_initial_content` and the last
/// decision restore a restarted participant to where it stopped.
#[derive(Clone)]
pub struct Config {
    pub self_id: NodeId,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub pool_options: PoolOptions,
    pub heartbeat_timeout: Duration,
    pub view_change_resend_timeout: Duration,
    pub view_change_timeout: Duration,
    pub collect_timeout: Duration,
    pub wal_initial_content: Vec<Vec<u8>>,
    pub last_proposal: Proposal,
    pub last_signatures: Vec<Signature>,
}

impl Config {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            batch_size: 100,
            batch_timeout: Duration::from_millis(500),
            pool_options: PoolOptions::default(),
            heartbeat_timeout: Duration::from_secs(5),
            view_change_resend_timeout: Duration::from_secs(1),
            view_change_timeout: Duration::from_secs(10),
            collect_timeout: Duration::from_millis(100),
            wal_initial_content: Vec::new(),
            last_proposal: Proposal::default(),
            last_signatures: Vec::new(),
        }
    }
}

/// Wraps the transport so broadcasts skip this participant; the engine
/// feeds its own messages to the sub-protocols directly.
struct CommBridge {
    self_id: NodeId,
    inner: Arc<dyn Comm>,
}

impl Comm for CommBridge {
    fn nodes(&self) -> Vec<NodeId> {
        self.inner.nodes()
    }

    fn send_consensus(&self, to: NodeId, msg: Message) {
        self.inner.send_consensus(to, msg);
    }

    fn send_transaction(&self, to: NodeId, request: Vec<u8>) {
        self.inner.send_transaction(to, request);
    }

    fn broadcast_consensus(&self, msg: Message) {
        for node in self.inner.nodes() {
            if node == self.self_id {
                continue;
            }
            self.inner.send_consensus(node, msg.clone());
        }
    }
}

/// The external collaborators a participant is wired to.
pub struct Collaborators {
    pub comm: Arc<dyn Comm>,
    pub application: Arc<dyn Application>,
    pub assembler: Arc<dyn Assembler>,
    pub wal: Arc<dyn WriteAheadLog>,
    pub signer: Arc<dyn Signer>,
    pub verifier: Arc<dyn Verifier>,
    pub request_inspector: Arc<dyn RequestInspector>,
    pub synchronizer: Arc<dyn Synchronizer>,
}

pub struct Consensus {
    self_id: NodeId,
    comm: Arc<dyn Comm>,
    controller: Arc<Controller>,
    view_changer: Arc<ViewChanger>,
    pool: Arc<Pool>,
    monitor: Arc<HeartbeatMonitor>,
    start_view: u64,
    start_sequence: u64,
}

impl Consensus {
    /// Builds a fully wired participant. `heartbeat_scheduler` and
    /// `view_changer_ticker` drive the time based behavior and are
    /// supplied from the outside for testability.
    pub fn new(
        config: Config,
        collaborators: Collaborators,
        heartbeat_scheduler: Receiver<Instant>,
        view_changer_ticker: Receiver<Instant>,
    ) -> Result<Arc<Self>> {
        let Collaborators {
            comm,
            application,
            assembler,
            wal,
            signer,
            verifier,
            request_inspector,
            synchronizer,
        } = collaborators;

        let self_id = config.self_id;
        let n = comm.nodes().len() as u64;
        let quorum = quorum_size(n);

        let recovered = RecoveredState::recover(&config.wal_initial_content)?;
        let checkpoint = Arc::new(match recovered.checkpoint {
            Some((_, proposal, signatures)) => Checkpoint::new(proposal, signatures),
            None => Checkpoint::new(config.last_proposal.clone(), config.last_signatures.clone()),
        });
        let metadata = checkpoint.metadata();
        let start_view = recovered.view.max(metadata.view_id);
        let start_sequence = metadata.latest_sequence + 1;

        let in_flight = Arc::new(InFlightData::default());
        if let Some(resumed) = recovered.in_flight {
            match resumed.prepare_quorum {
                Some(prepare_quorum) => {
                    in_flight.store_prepared(resumed.proposal, prepare_quorum)
                }
                None => in_flight.store_proposal(resumed.proposal),
            }
        }
        let state = Arc::new(PersistedState::new(in_flight.clone(), wal));

        let bridge: Arc<dyn Comm> = Arc::new(CommBridge {
            self_id,
            inner: comm.clone(),
        });

        let view_changer = ViewChanger::new(ViewChangerConfig {
            self_id,
            n,
            quorum,
            comm: bridge.clone(),
            signer: signer.clone(),
            verifier: verifier.clone(),
            checkpoint: checkpoint.clone(),
            in_flight,
            state: state.clone(),
            ticker: view_changer_ticker,
            resend_timeout: config.view_change_resend_timeout,
            timeout_view_change: config.view_change_timeout,
        });

        let pool = Pool::new(self_id, request_inspector, config.pool_options.clone());
        let batcher = Arc::new(BatchBuilder::new(
            pool.clone() as Arc<dyn RequestPool>,
            config.batch_size,
            config.batch_timeout,
        ));

        let latest_seq = Arc::new(AtomicU64::new(metadata.latest_sequence));
        let monitor = HeartbeatMonitor::new(
            self_id,
            config.heartbeat_timeout,
            bridge.clone(),
            latest_seq.clone(),
            heartbeat_scheduler,
        );
        monitor.bind_handler(view_changer.clone());

        let collector = Arc::new(StateCollector::new(self_id, config.collect_timeout));

        let controller = Controller::new(ControllerConfig {
            id: self_id,
            n,
            comm: bridge.clone(),
            verifier: verifier.clone(),
            assembler,
            application,
            synchronizer,
            checkpoint: checkpoint.clone(),
            pool: pool.clone(),
            batcher,
            leader_monitor: monitor.clone(),
            collector,
            latest_seq,
        });

        let maker = Arc::new(ProposalMaker::new(
            self_id,
            n,
            state,
            checkpoint,
            bridge,
            verifier,
            signer,
            view_changer.clone(),
        ));
        maker.bind_decider(controller.clone());
        maker.bind_syncer(controller.clone());
        controller.bind_proposer_builder(maker);
        controller.bind_view_changer(view_changer.clone());
        view_changer
            .bind_controller(Arc::downgrade(&(controller.clone() as Arc<dyn ViewController>)));
        view_changer.bind_requests_timer(pool.clone());

        let consensus = Arc::new(Self {
            self_id,
            comm,
            controller,
            view_changer,
            pool: pool.clone(),
            monitor,
            start_view,
            start_sequence,
        });
        pool.bind_timeout_handler(consensus.clone() as Arc<dyn PoolTimeoutHandler>);

        Ok(consensus)
    }

    /// Starts the participant at the recovered view, expecting the
    /// sequence after the most recently delivered one.
    pub fn start(&self) {
        info!(
            "{:?} // Starting consensus at view {} and sequence {}",
            self.self_id, self.start_view, self.start_sequence
        );
        self.pool.start();
        self.monitor.start();
        self.view_changer.start(self.start_view);
        self.controller.start(self.start_view, self.start_sequence);
    }

    pub fn stop(&self) {
        self.view_changer.stop();
        self.controller.stop();
    }

    pub fn handle_message(&self, sender: NodeId, msg: Message) {
        self.controller.process_messages(sender, msg);
    }

    pub fn handle_request(&self, sender: NodeId, request: Vec<u8>) {
        self.controller.handle_request(sender, request);
    }

    /// Client facing submission entry point.
    pub fn submit_request(&self, request: Vec<u8>) -> Result<()> {
        debug!("{:?} // Submit request", self.self_id);
        self.controller.submit_request(request)
    }

    pub fn view_number(&self) -> u64 {
        self.controller.view_number()
    }

    pub fn latest_sequence(&self) -> u64 {
        self.controller.latest_sequence()
    }

    pub fn pending_requests(&self) -> usize {
        self.pool.size()
    }
}

impl PoolTimeoutHandler for Consensus {
    fn on_request_timeout(&self, request: Vec<u8>, info: &RequestInfo) {
        let leader = self.controller.leader_of(self.controller.view_number());
        if leader == self.self_id {
            debug!(
                "{:?} // Request {} timed out but we are the leader",
                self.self_id,
                info.key()
            );
            return;
        }
        self.comm.send_transaction(leader, request);
    }

    fn on_leader_fwd_timeout(&self) {
        self.view_changer.start_view_change(true);
    }
}
