//! The actor's private, single-writer state.

use std::collections::{HashMap, HashSet};

use crate::request::{OnRebalance, PendingFetch};
use crate::types::{Chunk, CommittableMessage, TopicPartition};

/// A registered fetch, tagged with a per-actor-instance id so an
/// `ExpiringFetch`'s timer can remove exactly the entry it was scheduled
/// for, without disturbing any other caller's pending fetch on the same
/// partition.
pub struct FetchEntry<K, V> {
    pub id: u64,
    pub pending: PendingFetch<K, V>,
}

pub struct State<K, V> {
    /// Outstanding fetch awaiters per partition.
    pub fetches: HashMap<TopicPartition, Vec<FetchEntry<K, V>>>,
    /// Records received but not yet delivered to any fetcher.
    pub records: HashMap<TopicPartition, Chunk<CommittableMessage<K, V>>>,
    /// Whether a subscription exists.
    pub subscribed: bool,
    /// Whether any stream-mode fetch has been requested, i.e. polling has
    /// effectively begun (`Subscribed -> Polling` transition marker).
    pub streaming: bool,
    /// Installed by `Assignment` requests that carry a rebalance listener.
    pub rebalance_listeners: Vec<OnRebalance>,
    /// Assignment snapshot taken immediately before the most recent poll.
    pub last_assignment: HashSet<TopicPartition>,
    next_fetch_id: u64,
}

impl<K, V> Default for State<K, V> {
    fn default() -> Self {
        Self {
            fetches: HashMap::new(),
            records: HashMap::new(),
            subscribed: false,
            streaming: false,
            rebalance_listeners: Vec::new(),
            last_assignment: HashSet::new(),
            next_fetch_id: 0,
        }
    }
}

impl<K, V> State<K, V> {
    pub fn next_fetch_id(&mut self) -> u64 {
        self.next_fetch_id += 1;
        self.next_fetch_id
    }

    /// Registers a pending fetch for `tp`. Invariant: a `FetchRequest` is
    /// either here, unresolved, or has already been resolved and removed —
    /// never both.
    pub fn register_fetch(&mut self, tp: TopicPartition, id: u64, pending: PendingFetch<K, V>) {
        self.fetches
            .entry(tp)
            .or_default()
            .push(FetchEntry { id, pending });
    }

    /// Takes and clears every pending fetch registered for `tp` (fan-out:
    /// every caller waiting on `tp` is resolved together).
    pub fn take_fetches(&mut self, tp: &TopicPartition) -> Vec<PendingFetch<K, V>> {
        self.fetches
            .remove(tp)
            .unwrap_or_default()
            .into_iter()
            .map(|entry| entry.pending)
            .collect()
    }

    /// Removes exactly the fetch entry `id` for `tp`, if it is still
    /// pending. Used by an `ExpiringFetch`'s timer: if the entry is gone,
    /// a poll or revocation already won the race and this is a no-op.
    pub fn take_fetch_by_id(&mut self, tp: &TopicPartition, id: u64) -> Option<PendingFetch<K, V>> {
        let entries = self.fetches.get_mut(tp)?;
        let pos = entries.iter().position(|e| e.id == id)?;
        let entry = entries.remove(pos);
        if entries.is_empty() {
            self.fetches.remove(tp);
        }
        Some(entry.pending)
    }

    pub fn has_pending_fetch(&self, tp: &TopicPartition) -> bool {
        self.fetches.get(tp).is_some_and(|v| !v.is_empty())
    }

    /// Buffers a freshly polled chunk for `tp`. Only called when there is no
    /// pending fetcher for `tp`.
    pub fn buffer_records(&mut self, tp: TopicPartition, chunk: Chunk<CommittableMessage<K, V>>) {
        debug_assert!(!self.has_pending_fetch(&tp));
        self.records.insert(tp, chunk);
    }

    /// Takes and clears any buffered chunk for `tp`.
    pub fn take_buffered(&mut self, tp: &TopicPartition) -> Option<Chunk<CommittableMessage<K, V>>> {
        self.records.remove(tp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("orders", partition)
    }

    #[test]
    fn take_fetches_fans_out_every_registered_awaiter() {
        let mut state: State<(), ()> = State::default();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let id1 = state.next_fetch_id();
        state.register_fetch(tp(0), id1, PendingFetch::Fetch(tx1));
        let id2 = state.next_fetch_id();
        state.register_fetch(tp(0), id2, PendingFetch::Fetch(tx2));

        assert!(state.has_pending_fetch(&tp(0)));
        let taken = state.take_fetches(&tp(0));
        assert_eq!(taken.len(), 2);
        assert!(!state.has_pending_fetch(&tp(0)));
    }

    #[test]
    fn take_fetch_by_id_removes_only_the_targeted_entry() {
        let mut state: State<(), ()> = State::default();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let id1 = state.next_fetch_id();
        state.register_fetch(tp(0), id1, PendingFetch::ExpiringFetch(tx1));
        let id2 = state.next_fetch_id();
        state.register_fetch(tp(0), id2, PendingFetch::ExpiringFetch(tx2));

        assert!(state.take_fetch_by_id(&tp(0), id1).is_some());
        // id1 is gone, but id2 is still pending: the timer that raced and
        // lost must not disturb a co-located fetch on the same partition.
        assert!(state.has_pending_fetch(&tp(0)));
        assert!(state.take_fetch_by_id(&tp(0), id1).is_none());
        assert!(state.take_fetch_by_id(&tp(0), id2).is_some());
        assert!(!state.has_pending_fetch(&tp(0)));
    }

    #[test]
    fn buffer_and_take_round_trips() {
        let mut state: State<(), ()> = State::default();
        assert!(state.take_buffered(&tp(0)).is_none());
        state.buffer_records(tp(0), Vec::new());
        assert!(state.take_buffered(&tp(0)).is_some());
        assert!(state.take_buffered(&tp(0)).is_none());
    }
}
