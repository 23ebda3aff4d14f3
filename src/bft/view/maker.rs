use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::bft::api::{
    Comm, Decider, FailureDetector, ProposerBuilder, Signer, Syncer, Verifier,
};
use crate::bft::state::PersistedState;
use crate::bft::types::{Checkpoint, NodeId};
use crate::bft::view::{View, ViewConfig};

/// Factory that instantiates views wired back to their controller.
///
/// The decider and syncer are the controller itself, which is built after
/// this factory; they are bound once during engine wiring.
pub struct ProposalMaker {
    self_id: NodeId,
    n: u64,
    state: Arc<PersistedState>,
    checkpoint: Arc<Checkpoint>,
    comm: Arc<dyn Comm>,
    verifier: Arc<dyn Verifier>,
    signer: Arc<dyn Signer>,
    failure_detector: Arc<dyn FailureDetector>,
    decider: OnceCell<Arc<dyn Decider>>,
    syncer: OnceCell<Arc<dyn Syncer>>,
}

impl ProposalMaker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: NodeId,
        n: u64,
        state: Arc<PersistedState>,
        checkpoint: Arc<Checkpoint>,
        comm: Arc<dyn Comm>,
        verifier: Arc<dyn Verifier>,
        signer: Arc<dyn Signer>,
        failure_detector: Arc<dyn FailureDetector>,
    ) -> Self {
        Self {
            self_id,
            n,
            state,
            checkpoint,
            comm,
            verifier,
            signer,
            failure_detector,
            decider: OnceCell::new(),
            syncer: OnceCell::new(),
        }
    }

    pub fn bind_decider(&self, decider: Arc<dyn Decider>) {
        let _ = self.decider.set(decider);
    }

    pub fn bind_syncer(&self, syncer: Arc<dyn Syncer>) {
        let _ = self.syncer.set(syncer);
    }
}

impl ProposerBuilder for ProposalMaker {
    fn new_proposer(
        &self,
        leader: NodeId,
        proposal_sequence: u64,
        view_num: u64,
        quorum: usize,
    ) -> Arc<View> {
        let decider = self
            .decider
            .get()
            .expect("proposal maker used before the decider was bound")
            .clone();
        let syncer = self
            .syncer
            .get()
            .expect("proposal maker used before the syncer was bound")
            .clone();

        // Proposals are hash chained onto the most recently decided one.
        let prev_header = self.checkpoint.get().proposal().header().to_vec();

        View::new(ViewConfig {
            n: self.n,
            quorum,
            leader_id: leader,
            self_id: self.self_id,
            number: view_num,
            proposal_sequence,
            prev_header,
            in_msg_q_size: (self.n as usize) * 10,
            decider,
            failure_detector: self.failure_detector.clone(),
            syncer,
            comm: self.comm.clone(),
            verifier: self.verifier.clone(),
            signer: self.signer.clone(),
            state: self.state.clone(),
        })
    }
}
