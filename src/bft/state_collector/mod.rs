//! Gossip based state discovery.
//!
//! A participant that suspects it fell behind broadcasts a state request;
//! peers answer with their current `(view, sequence)`. The collector
//! accumulates answers and reports a position only once enough distinct
//! peers agree on it that at least one of them must be correct.

use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::debug;

use crate::bft::collections;
use crate::bft::types::NodeId;

/// Size of the collector's inbound response queue.
const RESPONSE_Q_SIZE: usize = 100;

pub struct StateCollector {
    self_id: NodeId,
    collect_timeout: Duration,
    responses_tx: Sender<(NodeId, u64, u64)>,
    responses_rx: Receiver<(NodeId, u64, u64)>,
}

impl StateCollector {
    pub fn new(self_id: NodeId, collect_timeout: Duration) -> Self {
        let (responses_tx, responses_rx) = bounded(RESPONSE_Q_SIZE);
        Self {
            self_id,
            collect_timeout,
            responses_tx,
            responses_rx,
        }
    }

    /// Records a peer's answer; never blocks.
    pub fn handle_response(&self, sender: NodeId, view: u64, seq: u64) {
        if self.responses_tx.try_send((sender, view, seq)).is_err() {
            debug!(
                "{:?} // State response queue is full, dropping response from {:?}",
                self.self_id, sender
            );
        }
    }

    /// Drains responses for at most the collect timeout and returns the
    /// first `(view, sequence)` reported by `needed` distinct peers.
    pub fn collect_responses(&self, needed: usize) -> Option<(u64, u64)> {
        let deadline = Instant::now() + self.collect_timeout;
        let mut positions = collections::hash_map::<NodeId, (u64, u64)>();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (sender, view, seq) = match self.responses_rx.recv_timeout(remaining) {
                Ok(response) => response,
                Err(_) => return None,
            };
            if sender == self.self_id {
                continue;
            }
            positions.insert(sender, (view, seq));

            let position = (view, seq);
            let supporters = positions.values().filter(|p| **p == position).count();
            if supporters >= needed {
                debug!(
                    "{:?} // {} peers report view {} and sequence {}",
                    self.self_id, supporters, view, seq
                );
                return Some(position);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_with_enough_support() {
        let collector = StateCollector::new(NodeId(0), Duration::from_millis(100));
        collector.handle_response(NodeId(1), 2, 7);
        collector.handle_response(NodeId(2), 2, 7);

        assert_eq!(collector.collect_responses(2), Some((2, 7)));
    }

    #[test]
    fn test_single_report_times_out() {
        let collector = StateCollector::new(NodeId(0), Duration::from_millis(50));
        collector.handle_response(NodeId(1), 2, 7);

        assert_eq!(collector.collect_responses(2), None);
    }

    #[test]
    fn test_same_peer_counted_once() {
        let collector = StateCollector::new(NodeId(0), Duration::from_millis(50));
        collector.handle_response(NodeId(1), 2, 7);
        collector.handle_response(NodeId(1), 2, 7);

        assert_eq!(collector.collect_responses(2), None);
    }
}
