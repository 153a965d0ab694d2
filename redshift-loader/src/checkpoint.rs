use std::collections::{HashSet, VecDeque};

use crate::batch::BatchId;
use crate::protocol::StateMessage;

#[derive(Debug)]
struct PendingCheckpoint {
    state: StateMessage,
    outstanding: HashSet<BatchId>,
}

/// Holds STATE messages until every batch created before them has been merged.
///
/// Checkpoints are released strictly in arrival order. A checkpoint whose batches are done
/// still waits for every older checkpoint.
#[derive(Debug, Default)]
pub struct CheckpointEmitter {
    pending: VecDeque<PendingCheckpoint>,
}

impl CheckpointEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a checkpoint behind the batches in `outstanding` and returns the checkpoints
    /// that can be emitted now, oldest first.
    pub fn push(
        &mut self,
        state: StateMessage,
        outstanding: impl IntoIterator<Item = BatchId>,
    ) -> Vec<StateMessage> {
        self.pending.push_back(PendingCheckpoint {
            state,
            outstanding: outstanding.into_iter().collect(),
        });

        self.release()
    }

    /// Records a merged batch and returns the checkpoints it released, oldest first.
    pub fn complete(&mut self, batch_id: BatchId) -> Vec<StateMessage> {
        for pending in &mut self.pending {
            pending.outstanding.remove(&batch_id);
        }

        self.release()
    }

    /// Number of checkpoints still held back.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn release(&mut self) -> Vec<StateMessage> {
        let mut released = Vec::new();
        while self
            .pending
            .front()
            .is_some_and(|pending| pending.outstanding.is_empty())
        {
            if let Some(pending) = self.pending.pop_front() {
                released.push(pending.state);
            }
        }

        released
    }
}
