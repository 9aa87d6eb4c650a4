use crate::types::{AggregateResult, FeedId, StoredState};
use std::collections::BTreeMap;

/// Last accepted aggregate per feed, owned by one consumer.
///
/// Callers provide the single-writer discipline: at most one `commit` per
/// feed is in flight at a time.
pub trait QuoteStore {
    fn get(&self, feed_id: &FeedId) -> Option<StoredState>;

    /// Overwrite the feed's state with an accepted aggregate.
    fn commit(&mut self, result: &AggregateResult) -> StoredState;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryQuoteStore {
    states: BTreeMap<FeedId, StoredState>,
}

impl MemoryQuoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a state read back from durable storage.
    pub fn load(&mut self, state: StoredState) {
        self.states.insert(state.feed_id, state);
    }

    /// All stored states, ordered by feed id.
    pub fn feeds(&self) -> impl Iterator<Item = &StoredState> {
        self.states.values()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl QuoteStore for MemoryQuoteStore {
    fn get(&self, feed_id: &FeedId) -> Option<StoredState> {
        self.states.get(feed_id).cloned()
    }

    fn commit(&mut self, result: &AggregateResult) -> StoredState {
        let update_count = self
            .states
            .get(&result.feed_id)
            .map_or(1, |s| s.update_count.saturating_add(1));

        let state = StoredState::from_result(result, update_count);
        self.states.insert(result.feed_id, state.clone());
        state
    }
}
