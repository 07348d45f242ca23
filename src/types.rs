//! Core value types shared by every layer of the consumer: the actor, the
//! facade, and the stream orchestration.

use std::cmp::Ordering;
use std::fmt;

/// A Kafka topic name paired with a partition number.
///
/// Hashable and totally ordered by `(topic, partition)` so it can key a
/// `HashMap` and be sorted for deterministic logging/testing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl PartialOrd for TopicPartition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TopicPartition {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.topic, self.partition).cmp(&(&other.topic, other.partition))
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A Kafka offset. Newtype over `i64` so it cannot be confused with a
/// partition id or a timestamp at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(pub i64);

impl From<i64> for Offset {
    fn from(value: i64) -> Self {
        Offset(value)
    }
}

impl From<Offset> for i64 {
    fn from(value: Offset) -> Self {
        value.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single Kafka message header.
pub type Header = (String, Option<Vec<u8>>);

/// A raw record as produced by the underlying client, before key/value
/// deserialization. This is the shape that crosses the synchronized client
/// boundary; the actor turns it into a [`Record`] once the deserializers run.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    pub headers: Vec<Header>,
}

/// A fully deserialized Kafka record, ready to hand to the user.
#[derive(Debug, Clone)]
pub struct Record<K, V> {
    pub topic: String,
    pub partition: i32,
    pub offset: Offset,
    pub key: K,
    pub value: V,
    pub timestamp: Option<i64>,
    pub headers: Vec<Header>,
}

impl<K, V> Record<K, V> {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// An opaque, per-record handle naming the offset one past the record it was
/// produced for. The core never commits on its own; callers exchange this for
/// an actual commit through [`crate::consumer::KafkaConsumer::commit_sync`] or
/// a downstream batching commit sink.
#[derive(Debug, Clone)]
pub struct CommittableOffset {
    pub topic: String,
    pub partition: i32,
    /// The offset to commit: the record's own offset plus one.
    pub offset: Offset,
    pub consumer_group_id: Option<String>,
}

impl CommittableOffset {
    pub fn for_record<K, V>(record: &Record<K, V>, group_id: Option<String>) -> Self {
        Self {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: Offset(record.offset.0 + 1),
            consumer_group_id: group_id,
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// A deserialized record paired with the offset handle a caller can use to
/// acknowledge having processed it.
#[derive(Debug, Clone)]
pub struct CommittableMessage<K, V> {
    pub record: Record<K, V>,
    pub offset: CommittableOffset,
}

/// A nonempty-or-empty ordered batch produced by a single poll. Kept as a type
/// alias rather than a newtype: it carries no behavior beyond what `Vec`
/// already provides.
pub type Chunk<T> = Vec<T>;

/// Coarse lifecycle phase of a consumer instance, for diagnostics and
/// logging only: nothing in the actor or facade branches on this value, the
/// channels and completion slots alone drive behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Constructed, no `subscribe*` call has succeeded yet.
    Init,
    /// A `subscribe*` call has succeeded; no fetch has been requested yet.
    Subscribed,
    /// At least one `Fetch`/`ExpiringFetch` has been requested.
    Polling,
    /// The actor or poll scheduler task has exited.
    Closed,
}

impl ConsumerState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ConsumerState::Init => 0,
            ConsumerState::Subscribed => 1,
            ConsumerState::Polling => 2,
            ConsumerState::Closed => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ConsumerState::Subscribed,
            2 => ConsumerState::Polling,
            3 => ConsumerState::Closed,
            _ => ConsumerState::Init,
        }
    }
}
