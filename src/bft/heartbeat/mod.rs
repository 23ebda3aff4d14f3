//! Leader liveness monitoring.
//!
//! Driven by an externally supplied tick channel so tests control time.
//! While leading, the monitor broadcasts a heartbeat on every tick; while
//! following, it tracks when the leader was last heard from and raises a
//! heartbeat timeout once the silence exceeds the configured bound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{debug, info};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::bft::api::{Comm, HeartbeatEventHandler, LeaderMonitor};
use crate::bft::controller::Role;
use crate::bft::message::{HeartbeatMessage, Message};
use crate::bft::types::NodeId;

struct MonitorState {
    role: Role,
    view: u64,
    leader: NodeId,
    last_heartbeat: Instant,
}

pub struct HeartbeatMonitor {
    self_id: NodeId,
    timeout: Duration,
    comm: Arc<dyn Comm>,
    handler: OnceCell<Arc<dyn HeartbeatEventHandler>>,
    // Latest decided sequence, shared with the controller so heartbeats
    // advertise progress.
    latest_seq: Arc<AtomicU64>,
    state: Mutex<MonitorState>,
    scheduler: Receiver<Instant>,
    stop_rx: Receiver<()>,
    stop_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn new(
        self_id: NodeId,
        timeout: Duration,
        comm: Arc<dyn Comm>,
        latest_seq: Arc<AtomicU64>,
        scheduler: Receiver<Instant>,
    ) -> Arc<Self> {
        let (stop_tx, stop_rx) = bounded(1);
        Arc::new(Self {
            self_id,
            timeout,
            comm,
            handler: OnceCell::new(),
            latest_seq,
            state: Mutex::new(MonitorState {
                role: Role::Follower,
                view: 0,
                leader: self_id,
                last_heartbeat: Instant::now(),
            }),
            scheduler,
            stop_rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(None),
        })
    }

    pub fn bind_handler(&self, handler: Arc<dyn HeartbeatEventHandler>) {
        let _ = self.handler.set(handler);
    }

    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        *self.thread.lock() = Some(
            std::thread::Builder::new()
                .name("heartbeat-monitor".into())
                .spawn(move || monitor.run())
                .unwrap(),
        );
    }

    fn run(&self) {
        loop {
            select! {
                recv(self.stop_rx) -> _ => return,
                recv(self.scheduler) -> tick => match tick {
                    Ok(now) => self.tick(now),
                    Err(_) => return,
                },
            }
        }
    }

    fn tick(&self, now: Instant) {
        let mut state = self.state.lock();
        match state.role {
            Role::Leader => {
                let view = state.view;
                let seq = self.latest_seq.load(Ordering::Acquire);
                drop(state);
                self.comm
                    .broadcast_consensus(Message::Heartbeat(HeartbeatMessage::Heartbeat {
                        view,
                        seq,
                    }));
            }
            Role::Follower => {
                if now.duration_since(state.last_heartbeat) < self.timeout {
                    return;
                }
                info!(
                    "{:?} // No heartbeat from leader {:?} of view {} within {:?}",
                    self.self_id, state.leader, state.view, self.timeout
                );
                // Rearm so the escalation fires once per silent period.
                state.last_heartbeat = now;
                let view = state.view;
                drop(state);
                if let Some(handler) = self.handler.get() {
                    handler.on_heartbeat_timeout(view);
                }
            }
        }
    }
}

impl LeaderMonitor for HeartbeatMonitor {
    fn change_role(&self, role: Role, view: u64, leader: NodeId) {
        debug!(
            "{:?} // Changing role to {:?} in view {} with leader {:?}",
            self.self_id, role, view, leader
        );
        let mut state = self.state.lock();
        state.role = role;
        state.view = view;
        state.leader = leader;
        state.last_heartbeat = Instant::now();
    }

    fn process_msg(&self, sender: NodeId, msg: HeartbeatMessage) {
        match msg {
            HeartbeatMessage::Heartbeat { view, seq: _ } => {
                let mut state = self.state.lock();
                if state.role != Role::Follower || sender != state.leader || view != state.view {
                    debug!(
                        "{:?} // Ignoring heartbeat from {:?} for view {}",
                        self.self_id, sender, view
                    );
                    return;
                }
                state.last_heartbeat = Instant::now();
                drop(state);
                self.comm.send_consensus(
                    sender,
                    Message::Heartbeat(HeartbeatMessage::HeartbeatResponse { view }),
                );
            }
            HeartbeatMessage::HeartbeatResponse { view } => {
                debug!(
                    "{:?} // Heartbeat response from {:?} for view {}",
                    self.self_id, sender, view
                );
            }
        }
    }

    fn close(&self) {
        let _ = self.stop_tx.lock().take();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingComm {
        sent: Mutex<Vec<Message>>,
    }

    impl Comm for RecordingComm {
        fn nodes(&self) -> Vec<NodeId> {
            (0..4).map(NodeId).collect()
        }

        fn send_consensus(&self, _: NodeId, msg: Message) {
            self.sent.lock().push(msg);
        }

        fn send_transaction(&self, _: NodeId, _: Vec<u8>) {}

        fn broadcast_consensus(&self, msg: Message) {
            self.sent.lock().push(msg);
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        timeouts: AtomicUsize,
    }

    impl HeartbeatEventHandler for CountingHandler {
        fn on_heartbeat_timeout(&self, _: u64) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn monitor(
        timeout: Duration,
    ) -> (
        Arc<HeartbeatMonitor>,
        Arc<RecordingComm>,
        Arc<CountingHandler>,
        Sender<Instant>,
    ) {
        let comm = Arc::new(RecordingComm::default());
        let handler = Arc::new(CountingHandler::default());
        let (tick_tx, tick_rx) = bounded(16);
        let monitor = HeartbeatMonitor::new(
            NodeId(1),
            timeout,
            comm.clone(),
            Arc::new(AtomicU64::new(0)),
            tick_rx,
        );
        monitor.bind_handler(handler.clone());
        monitor.start();
        (monitor, comm, handler, tick_tx)
    }

    #[test]
    fn test_leader_sends_heartbeats() {
        let (monitor, comm, _, tick_tx) = monitor(Duration::from_secs(10));
        monitor.change_role(Role::Leader, 1, NodeId(1));

        tick_tx.send(Instant::now()).unwrap();
        tick_tx.send(Instant::now()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while comm.sent.lock().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let sent = comm.sent.lock();
        assert!(sent
            .iter()
            .all(|m| matches!(m, Message::Heartbeat(HeartbeatMessage::Heartbeat { view: 1, .. }))));
        assert_eq!(sent.len(), 2);
        drop(sent);
        monitor.close();
    }

    #[test]
    fn test_follower_escalates_silence() {
        let (monitor, _, handler, tick_tx) = monitor(Duration::from_millis(10));
        monitor.change_role(Role::Follower, 0, NodeId(0));

        std::thread::sleep(Duration::from_millis(30));
        tick_tx.send(Instant::now()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handler.timeouts.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handler.timeouts.load(Ordering::SeqCst), 1);
        monitor.close();
    }

    #[test]
    fn test_heartbeat_rearms_follower() {
        let (monitor, comm, handler, tick_tx) = monitor(Duration::from_millis(50));
        monitor.change_role(Role::Follower, 0, NodeId(0));

        monitor.process_msg(NodeId(0), HeartbeatMessage::Heartbeat { view: 0, seq: 0 });
        tick_tx.send(Instant::now()).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(handler.timeouts.load(Ordering::SeqCst), 0);
        // The heartbeat was answered.
        assert!(matches!(
            comm.sent.lock().first(),
            Some(Message::Heartbeat(HeartbeatMessage::HeartbeatResponse { view: 0 }))
        ));
        monitor.close();
    }
}
