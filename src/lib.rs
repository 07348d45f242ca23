//! Concurrency-safe, backpressured, rebalance-aware streaming over a single
//! Kafka client.
//!
//! `rdkafka`'s `BaseConsumer` is not thread-safe and offers only
//! one-message-at-a-time polling. This crate wraps it in a dedicated-thread
//! actor (see [`client::SynchronizedClient`] and [`actor`]) that turns it
//! into something safe to share across async tasks, and exposes that actor
//! through a small facade ([`consumer::KafkaConsumer`]) and two `Stream`
//! constructors ([`stream::stream`], [`stream::partitioned_stream`]).
//!
//! Nothing here decides how to deserialize records or how to run the
//! underlying client: both are pluggable through [`deserializer::Deserializer`]
//! and [`config::ConsumerFactory`], so tests can swap in
//! [`testing::FakeKafkaCluster`] instead of a running broker.

pub mod actor;
pub mod client;
pub mod config;
pub mod consumer;
pub mod deserializer;
pub mod error;
pub mod fiber;
pub mod poll_scheduler;
pub mod request;
pub mod state;
pub mod stream;
pub mod testing;
pub mod types;

pub use config::{ConsumerFactory, ConsumerSettings, RdKafkaConsumerFactory};
pub use consumer::KafkaConsumer;
pub use deserializer::{BytesDeserializer, Deserializer, StringDeserializer};
pub use error::{Error, Result};
pub use fiber::ConsumerFiber;
pub use request::{ExpiringReason, FetchReason};
pub use stream::{partitioned_stream, stream, PartitionStream};
pub use types::{
    Chunk, CommittableMessage, CommittableOffset, ConsumerState, Header, Offset, RawMessage,
    Record, TopicPartition,
};
