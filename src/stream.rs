//! The unified stream and the partitioned stream: both built on top of the
//! facade's `ExpiringFetch`, which lets a per-partition worker wake up
//! periodically even when its partition is idle, so it can notice a dropped
//! receiver or a consumer shutdown without blocking forever.

use std::collections::HashSet;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::consumer::KafkaConsumer;
use crate::error::{Error, Result};
use crate::request::{ExpiringReason, OnRebalance};
use crate::types::{CommittableMessage, TopicPartition};

/// Backpressure on the channel each partition worker forwards records
/// through: small enough that a slow consumer throttles the underlying
/// `ExpiringFetch` loop rather than buffering unboundedly in memory.
const RECORDS_CHANNEL_CAPACITY: usize = 64;

/// The per-partition half of [`partitioned_stream`]: yields records for one
/// topic-partition in offset order, and ends once that partition is revoked.
pub type PartitionStream<K, V> = ReceiverStream<Result<CommittableMessage<K, V>>>;

enum StreamEvent {
    Assigned(HashSet<TopicPartition>),
}

fn make_listener(events_tx: mpsc::UnboundedSender<StreamEvent>) -> OnRebalance {
    let assigned_tx = events_tx;
    OnRebalance {
        on_assigned: Box::new(move |assigned| {
            let _ = assigned_tx.send(StreamEvent::Assigned(assigned.clone()));
        }),
        // Revocation needs no forwarding here: the affected worker notices
        // it directly from its own next `ExpiringFetch` reply and tears
        // itself down.
        on_revoked: Box::new(|_revoked| {}),
    }
}

/// Runs one partition's fetch loop, pushing records into `tx` until the
/// partition is revoked, the receiver is dropped, or the consumer shuts
/// down (surfaced as `tx.send` failing once nobody is left to receive).
async fn run_partition_worker<K, V>(
    consumer: KafkaConsumer<K, V>,
    tp: TopicPartition,
    tx: mpsc::Sender<Result<CommittableMessage<K, V>>>,
) where
    K: Send + 'static,
    V: Send + 'static,
{
    loop {
        match consumer.expiring_fetch(tp.clone()).await {
            Ok((chunk, ExpiringReason::Records)) => {
                for message in chunk {
                    if tx.send(Ok(message)).await.is_err() {
                        return;
                    }
                }
            }
            Ok((_, ExpiringReason::FetchExpired)) => {
                if tx.is_closed() {
                    return;
                }
            }
            Ok((_, ExpiringReason::TopicPartitionRevoked)) => return,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

fn spawn_unified_worker<K, V>(
    consumer: &KafkaConsumer<K, V>,
    tp: TopicPartition,
    tx: mpsc::Sender<Result<CommittableMessage<K, V>>>,
) where
    K: Send + 'static,
    V: Send + 'static,
{
    tokio::spawn(run_partition_worker(consumer.clone(), tp, tx));
}

fn spawn_partition_stream<K, V>(consumer: &KafkaConsumer<K, V>, tp: TopicPartition) -> PartitionStream<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    let (tx, rx) = mpsc::channel(RECORDS_CHANNEL_CAPACITY);
    tokio::spawn(run_partition_worker(consumer.clone(), tp, tx));
    ReceiverStream::new(rx)
}

/// Merges every currently and newly assigned partition's records into a
/// single stream, in the order each worker happens to deliver them (no
/// global ordering is promised across partitions, only within one).
/// Yields `Err(NotSubscribed)` and ends immediately if no `subscribe*` call
/// has succeeded yet.
pub fn stream<K, V>(consumer: KafkaConsumer<K, V>) -> impl Stream<Item = Result<CommittableMessage<K, V>>>
where
    K: Send + 'static,
    V: Send + 'static,
{
    async_stream::stream! {
        if !consumer.is_subscribed() {
            yield Err(Error::NotSubscribed);
            return;
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (records_tx, mut records_rx) = mpsc::channel(RECORDS_CHANNEL_CAPACITY);
        let mut shutdown = consumer.shutdown_signal();

        let initial = match consumer.assignment_with_listener(Some(make_listener(events_tx.clone()))).await {
            Ok(assignment) => assignment,
            Err(e) => {
                yield Err(e);
                return;
            }
        };
        for tp in initial {
            spawn_unified_worker(&consumer, tp, records_tx.clone());
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                Some(StreamEvent::Assigned(assigned)) = events_rx.recv() => {
                    for tp in assigned {
                        spawn_unified_worker(&consumer, tp, records_tx.clone());
                    }
                }
                maybe_item = records_rx.recv() => {
                    match maybe_item {
                        Some(item) => yield item,
                        None => return,
                    }
                }
            }
        }
    }
}

/// Yields a fresh `(partition, PartitionStream)` pair each time a new
/// partition is assigned; each sub-stream ends on its own once that
/// partition is revoked. Yields `Err(NotSubscribed)` and ends immediately if
/// no `subscribe*` call has succeeded yet.
pub fn partitioned_stream<K, V>(
    consumer: KafkaConsumer<K, V>,
) -> impl Stream<Item = Result<(TopicPartition, PartitionStream<K, V>)>>
where
    K: Send + 'static,
    V: Send + 'static,
{
    async_stream::stream! {
        if !consumer.is_subscribed() {
            yield Err(Error::NotSubscribed);
            return;
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut shutdown = consumer.shutdown_signal();

        let initial = match consumer.assignment_with_listener(Some(make_listener(events_tx.clone()))).await {
            Ok(assignment) => assignment,
            Err(e) => {
                yield Err(e);
                return;
            }
        };
        for tp in initial {
            let partition_stream = spawn_partition_stream(&consumer, tp.clone());
            yield Ok((tp, partition_stream));
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                maybe_event = events_rx.recv() => {
                    match maybe_event {
                        Some(StreamEvent::Assigned(assigned)) => {
                            for tp in assigned {
                                let partition_stream = spawn_partition_stream(&consumer, tp.clone());
                                yield Ok((tp, partition_stream));
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }
}
