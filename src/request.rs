//! Everything that crosses the `requests` / `polls` queues into the actor.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::Result;
use crate::types::{Chunk, CommittableMessage, Offset, TopicPartition};

/// Why a `Fetch` reply carries the chunk it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReason {
    /// The chunk contains real records delivered by a poll.
    Records,
    /// The partition was revoked before any records arrived; the chunk is
    /// empty.
    TopicPartitionRevoked,
}

/// [`FetchReason`] plus the one additional reason an `ExpiringFetch` can end
/// for: its timer fired before any records or revocation arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiringReason {
    Records,
    TopicPartitionRevoked,
    FetchExpired,
}

impl From<FetchReason> for ExpiringReason {
    fn from(reason: FetchReason) -> Self {
        match reason {
            FetchReason::Records => ExpiringReason::Records,
            FetchReason::TopicPartitionRevoked => ExpiringReason::TopicPartitionRevoked,
        }
    }
}

/// A pending awaiter registered against `state.fetches[tp]`, generic over
/// whether it expires.
pub enum PendingFetch<K, V> {
    Fetch(oneshot::Sender<(Chunk<CommittableMessage<K, V>>, FetchReason)>),
    ExpiringFetch(oneshot::Sender<(Chunk<CommittableMessage<K, V>>, ExpiringReason)>),
}

impl<K, V> PendingFetch<K, V> {
    /// Resolves the slot with a non-expiring-flavored reason, translating it
    /// for expiring fetches. Used when the actor completes both kinds of
    /// pending fetch uniformly (records delivered, revocation, shutdown).
    pub fn resolve(self, chunk: Chunk<CommittableMessage<K, V>>, reason: FetchReason) {
        match self {
            PendingFetch::Fetch(tx) => {
                let _ = tx.send((chunk, reason));
            }
            PendingFetch::ExpiringFetch(tx) => {
                let _ = tx.send((chunk, reason.into()));
            }
        }
    }
}

/// Callbacks installed alongside an `Assignment` request, invoked by the
/// actor from within the `Poll` handler once a rebalance has been detected.
pub struct OnRebalance {
    pub on_assigned: Box<dyn Fn(&HashSet<TopicPartition>) + Send>,
    pub on_revoked: Box<dyn Fn(&HashSet<TopicPartition>) + Send>,
}

/// The actor's full input alphabet.
pub enum Request<K, V> {
    Poll,
    Fetch {
        tp: TopicPartition,
        reply: oneshot::Sender<(Chunk<CommittableMessage<K, V>>, FetchReason)>,
    },
    ExpiringFetch {
        tp: TopicPartition,
        reply: oneshot::Sender<(Chunk<CommittableMessage<K, V>>, ExpiringReason)>,
    },
    Assignment {
        reply: oneshot::Sender<HashSet<TopicPartition>>,
        on_rebalance: Option<OnRebalance>,
    },
    SubscribeTopics {
        topics: Vec<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    SubscribePattern {
        pattern: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Seek {
        tp: TopicPartition,
        offset: Offset,
        reply: oneshot::Sender<Result<()>>,
    },
    BeginningOffsets {
        partitions: Vec<TopicPartition>,
        timeout: Duration,
        reply: oneshot::Sender<Result<std::collections::HashMap<TopicPartition, Offset>>>,
    },
    EndOffsets {
        partitions: Vec<TopicPartition>,
        timeout: Duration,
        reply: oneshot::Sender<Result<std::collections::HashMap<TopicPartition, Offset>>>,
    },
    CommitSync {
        offsets: Vec<crate::types::CommittableOffset>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Internal: posted by an `ExpiringFetch`'s timer task when `T_fetch`
    /// elapses. Never constructed by the facade.
    ExpireFetch { tp: TopicPartition, id: u64 },
}
