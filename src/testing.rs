//! An in-memory fake [`KafkaClient`], so the rest of the crate (and callers
//! with their own test suites) can exercise subscription, polling, seeking,
//! and rebalances without a running broker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::KafkaClient;
use crate::config::ConsumerFactory;
use crate::error::Result;
use crate::types::{CommittableOffset, Header, RawMessage, TopicPartition};

#[derive(Default)]
struct FakeState {
    subscribed_topics: Vec<String>,
    assignment: HashSet<TopicPartition>,
    queue: VecDeque<RawMessage>,
    beginning_offsets: HashMap<TopicPartition, i64>,
    end_offsets: HashMap<TopicPartition, i64>,
    committed: Vec<CommittableOffset>,
    seeks: Vec<(TopicPartition, i64)>,
    closed: bool,
}

/// A handle test code uses to drive a [`FakeKafkaClient`] from outside the
/// dedicated client thread: enqueue messages, change the assignment, and
/// inspect what the actor committed.
#[derive(Clone, Default)]
pub struct FakeKafkaCluster {
    state: Arc<Mutex<FakeState>>,
}

impl FakeKafkaCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`ConsumerFactory`] that hands out clients backed by this cluster.
    /// Pass this to [`crate::config::ConsumerSettings::with_consumer_factory`].
    pub fn factory(&self) -> Arc<dyn ConsumerFactory> {
        Arc::new(FakeConsumerFactory {
            state: Arc::clone(&self.state),
        })
    }

    /// Sets the partitions the next `poll`/`assignment` call will report.
    /// Call this before the poll that should observe the change: the actor
    /// only notices an assignment change by diffing consecutive polls.
    pub fn set_assignment(&self, assignment: impl IntoIterator<Item = TopicPartition>) {
        self.state.lock().unwrap().assignment = assignment.into_iter().collect();
    }

    /// Queues a record for the next `poll` call to return. `key`/`value` of
    /// `None` exercise the "record dropped" path in the actor's poll
    /// handler.
    pub fn push_message(
        &self,
        tp: TopicPartition,
        offset: i64,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) {
        self.push_message_with_headers(tp, offset, key, value, Vec::new());
    }

    pub fn push_message_with_headers(
        &self,
        tp: TopicPartition,
        offset: i64,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        headers: Vec<Header>,
    ) {
        self.state.lock().unwrap().queue.push_back(RawMessage {
            topic: tp.topic,
            partition: tp.partition,
            offset,
            key,
            value,
            timestamp: None,
            headers,
        });
    }

    pub fn set_watermarks(&self, tp: TopicPartition, low: i64, high: i64) {
        let mut state = self.state.lock().unwrap();
        state.beginning_offsets.insert(tp.clone(), low);
        state.end_offsets.insert(tp, high);
    }

    /// Every offset committed through `commit_sync` so far, in call order.
    pub fn committed(&self) -> Vec<CommittableOffset> {
        self.state.lock().unwrap().committed.clone()
    }

    pub fn seeks(&self) -> Vec<(TopicPartition, i64)> {
        self.state.lock().unwrap().seeks.clone()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.state.lock().unwrap().subscribed_topics.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

struct FakeConsumerFactory {
    state: Arc<Mutex<FakeState>>,
}

impl ConsumerFactory for FakeConsumerFactory {
    fn create(&self, _properties: &HashMap<String, String>) -> Result<Box<dyn KafkaClient>> {
        Ok(Box::new(FakeKafkaClient {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeKafkaClient {
    state: Arc<Mutex<FakeState>>,
}

impl KafkaClient for FakeKafkaClient {
    fn subscribe(&mut self, topics: &[&str]) -> Result<()> {
        self.state.lock().unwrap().subscribed_topics =
            topics.iter().map(|t| t.to_string()).collect();
        Ok(())
    }

    fn unsubscribe(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.subscribed_topics.clear();
        state.assignment.clear();
    }

    fn assignment(&self) -> Result<HashSet<TopicPartition>> {
        Ok(self.state.lock().unwrap().assignment.clone())
    }

    fn seek(&self, tp: &TopicPartition, offset: i64, _timeout: Duration) -> Result<()> {
        self.state.lock().unwrap().seeks.push((tp.clone(), offset));
        Ok(())
    }

    fn poll(&self, _timeout: Duration) -> Result<Vec<RawMessage>> {
        let mut state = self.state.lock().unwrap();
        Ok(std::mem::take(&mut state.queue).into_iter().collect())
    }

    fn beginning_offset(&self, tp: &TopicPartition, _timeout: Duration) -> Result<i64> {
        Ok(self.state.lock().unwrap().beginning_offsets.get(tp).copied().unwrap_or(0))
    }

    fn end_offset(&self, tp: &TopicPartition, _timeout: Duration) -> Result<i64> {
        Ok(self.state.lock().unwrap().end_offsets.get(tp).copied().unwrap_or(0))
    }

    fn commit_sync(&self, offsets: &[CommittableOffset]) -> Result<()> {
        self.state.lock().unwrap().committed.extend_from_slice(offsets);
        Ok(())
    }

    fn close(&mut self, _timeout: Duration) {
        self.state.lock().unwrap().closed = true;
    }
}
