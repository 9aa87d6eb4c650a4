use crate::types::{OracleKey, QueueId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A named set of oracle operators authorized to sign for one network context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub id: QueueId,
    pub oracles: BTreeSet<OracleKey>,
    /// Quorum floor the queue imposes on every feed, on top of the
    /// consumer's own configuration.
    pub min_quorum: u32,
}

impl Queue {
    pub fn new(id: QueueId, oracles: impl IntoIterator<Item = OracleKey>, min_quorum: u32) -> Self {
        Self {
            id,
            oracles: oracles.into_iter().collect(),
            min_quorum,
        }
    }

    pub fn is_member(&self, oracle: &OracleKey) -> bool {
        self.oracles.contains(oracle)
    }

    pub fn len(&self) -> usize {
        self.oracles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oracles.is_empty()
    }
}

/// Source of current queue membership.
///
/// Administered outside this crate; implementations are trusted reads.
pub trait QueueRegistry {
    fn queue(&self, id: &QueueId) -> Option<Queue>;
}

/// Registry over a fixed set of queues, for services configured at startup
/// and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticQueueRegistry {
    queues: BTreeMap<QueueId, Queue>,
}

impl StaticQueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a queue.
    pub fn insert(&mut self, queue: Queue) -> Option<Queue> {
        self.queues.insert(queue.id, queue)
    }

    pub fn with_queue(mut self, queue: Queue) -> Self {
        self.insert(queue);
        self
    }
}

impl QueueRegistry for StaticQueueRegistry {
    fn queue(&self, id: &QueueId) -> Option<Queue> {
        self.queues.get(id).cloned()
    }
}
