//! The consumer facade: the crate's public, user-facing surface.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::actor::{self, ActorContext};
use crate::client::SynchronizedClient;
use crate::config::ConsumerSettings;
use crate::deserializer::Deserializer;
use crate::error::{Error, Result};
use crate::fiber::ConsumerFiber;
use crate::poll_scheduler::run_poll_scheduler;
use crate::request::{ExpiringReason, FetchReason, OnRebalance, Request};
use crate::types::{
    Chunk, CommittableMessage, CommittableOffset, ConsumerState, Offset, TopicPartition,
};

/// The facade users interact with. Cheap to clone: it is a thin handle onto
/// the request queue and the shutdown signal, nothing more.
pub struct KafkaConsumer<K, V> {
    requests_tx: mpsc::UnboundedSender<Request<K, V>>,
    shutdown_rx: watch::Receiver<bool>,
    default_api_timeout: Duration,
    request_timeout: Duration,
    fetch_timeout: Duration,
    consumer_group_id: Option<String>,
    /// Local mirror of "has a subscribe* call succeeded", kept only so
    /// `stream`/`partitioned_stream` can fail fast with `NotSubscribed`
    /// without the facade reaching into the actor's exclusive state `S`.
    subscribed: Arc<AtomicBool>,
    /// Diagnostics-only lifecycle phase; the actor is the sole writer.
    lifecycle: Arc<AtomicU8>,
}

impl<K, V> Clone for KafkaConsumer<K, V> {
    fn clone(&self) -> Self {
        Self {
            requests_tx: self.requests_tx.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
            default_api_timeout: self.default_api_timeout,
            request_timeout: self.request_timeout,
            fetch_timeout: self.fetch_timeout,
            consumer_group_id: self.consumer_group_id.clone(),
            subscribed: Arc::clone(&self.subscribed),
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }
}

impl<K, V> KafkaConsumer<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    /// Builds the consumer's resources (client thread, actor, poll
    /// scheduler) and returns the facade alongside the lifecycle handle.
    /// The two should be torn down together: dropping the facade without
    /// ever calling [`ConsumerFiber::cancel`]/`join` leaves the background
    /// tasks running for the lifetime of the process, exactly as a bare
    /// `tokio::spawn` would.
    pub fn new(
        settings: ConsumerSettings,
        key_deserializer: Arc<dyn Deserializer<K>>,
        value_deserializer: Arc<dyn Deserializer<V>>,
    ) -> Result<(Self, ConsumerFiber)>
    where
        K: Clone,
        V: Clone,
    {
        let client = settings.consumer_factory.create(&settings.properties)?;
        let consumer_group_id = settings.properties.get("group.id").cloned();
        let synchronized = SynchronizedClient::spawn(client, settings.close_timeout);

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (polls_tx, polls_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let lifecycle = Arc::new(AtomicU8::new(ConsumerState::Init.as_u8()));

        let ctx = ActorContext {
            client: synchronized,
            key_deserializer,
            value_deserializer,
            consumer_group_id: consumer_group_id.clone(),
            poll_timeout: settings.poll_timeout,
            fetch_timeout: settings.fetch_timeout,
            request_timeout: settings.request_timeout,
            state: Default::default(),
            requests_tx: requests_tx.clone(),
            lifecycle: Arc::clone(&lifecycle),
        };

        let actor_handle = tokio::spawn(actor::run_actor(ctx, requests_rx, polls_rx, shutdown_tx));
        let scheduler_handle = tokio::spawn(run_poll_scheduler(polls_tx, settings.poll_interval));
        let fiber = ConsumerFiber::link(actor_handle, scheduler_handle, shutdown_rx.clone());

        let consumer = Self {
            requests_tx,
            shutdown_rx,
            default_api_timeout: settings.default_api_timeout,
            request_timeout: settings.request_timeout,
            fetch_timeout: settings.fetch_timeout,
            consumer_group_id,
            subscribed: Arc::new(AtomicBool::new(false)),
            lifecycle,
        };
        Ok((consumer, fiber))
    }

    /// Posts `make(reply)` to the request queue and races the reply against
    /// the consumer's shutdown signal, so a caller awaiting a reply that will
    /// never come because the actor already tore down still gets an error
    /// back instead of hanging forever.
    async fn call<T: Send + 'static>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request<K, V>,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.requests_tx.send(make(reply_tx)).is_err() {
            return Err(Error::ConsumerShutdown);
        }
        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            biased;
            result = reply_rx => result.map_err(|_| Error::ConsumerShutdown),
            _ = wait_for_shutdown(&mut shutdown) => Err(Error::ConsumerShutdown),
        }
    }

    /// Sugar for `subscribe([first, ...rest])`.
    pub async fn subscribe_to(
        &self,
        first: impl Into<String>,
        rest: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<()> {
        let mut topics = vec![first.into()];
        topics.extend(rest.into_iter().map(Into::into));
        self.subscribe(topics).await
    }

    /// Subscribes to a nonempty collection of topics.
    pub async fn subscribe(
        &self,
        topics: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<()> {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Err(Error::EmptyTopicSubscription);
        }
        self.call(|reply| Request::SubscribeTopics { topics, reply })
            .await??;
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Subscribes to every topic matching `pattern`, forwarded to the
    /// underlying client as-is (the core does not interpret regex syntax).
    pub async fn subscribe_pattern(&self, pattern: impl Into<String>) -> Result<()> {
        let pattern = pattern.into();
        self.call(|reply| Request::SubscribePattern { pattern, reply })
            .await??;
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn seek(&self, tp: TopicPartition, offset: Offset) -> Result<()> {
        self.call(|reply| Request::Seek { tp, offset, reply }).await?
    }

    pub async fn beginning_offsets(
        &self,
        partitions: impl IntoIterator<Item = TopicPartition>,
        timeout: Option<Duration>,
    ) -> Result<HashMap<TopicPartition, Offset>> {
        let partitions: Vec<_> = partitions.into_iter().collect();
        let timeout = timeout.unwrap_or(self.default_api_timeout);
        self.call(|reply| Request::BeginningOffsets {
            partitions,
            timeout,
            reply,
        })
        .await?
    }

    pub async fn end_offsets(
        &self,
        partitions: impl IntoIterator<Item = TopicPartition>,
        timeout: Option<Duration>,
    ) -> Result<HashMap<TopicPartition, Offset>> {
        let partitions: Vec<_> = partitions.into_iter().collect();
        let timeout = timeout.unwrap_or(self.request_timeout);
        self.call(|reply| Request::EndOffsets {
            partitions,
            timeout,
            reply,
        })
        .await?
    }

    /// Synchronously commits the given offsets. A thin passthrough kept for
    /// simple callers and tests; production batching commit sinks live
    /// outside this crate and are expected to post the same `CommitSync`
    /// request from their own code.
    pub async fn commit_sync(&self, offsets: Vec<CommittableOffset>) -> Result<()> {
        self.call(|reply| Request::CommitSync { offsets, reply }).await?
    }

    /// Whether a prior `subscribe*` call has succeeded. Used by `stream` and
    /// `partitioned_stream` to fail fast.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// The consumer's coarse lifecycle phase, for diagnostics and logging.
    /// Nothing in this crate branches on the returned value.
    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.lifecycle.load(Ordering::Relaxed))
    }

    pub(crate) async fn assignment_with_listener(
        &self,
        on_rebalance: Option<OnRebalance>,
    ) -> Result<HashSet<TopicPartition>> {
        self.call(|reply| Request::Assignment { reply, on_rebalance })
            .await
    }

    pub(crate) async fn fetch(
        &self,
        tp: TopicPartition,
    ) -> Result<(Chunk<CommittableMessage<K, V>>, FetchReason)> {
        self.call(|reply| Request::Fetch { tp, reply }).await
    }

    pub(crate) async fn expiring_fetch(
        &self,
        tp: TopicPartition,
    ) -> Result<(Chunk<CommittableMessage<K, V>>, ExpiringReason)> {
        self.call(|reply| Request::ExpiringFetch { tp, reply }).await
    }

    pub(crate) fn consumer_group_id(&self) -> Option<&str> {
        self.consumer_group_id.as_deref()
    }

    pub(crate) fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

impl CommittableOffset {
    /// Commits this offset synchronously through `consumer`. A convenience
    /// for simple callers and tests: production pipelines that need to
    /// batch commits across many messages should hold onto the
    /// `CommittableOffset`s themselves and drive `commit_sync` from their
    /// own batching sink instead of calling this once per message.
    pub async fn commit<K, V>(&self, consumer: &KafkaConsumer<K, V>) -> Result<()>
    where
        K: Send + 'static,
        V: Send + 'static,
    {
        consumer.commit_sync(vec![self.clone()]).await
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if *shutdown.borrow() {
        return;
    }
    let _ = shutdown.changed().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ExpiringReason;
    use crate::testing::FakeKafkaCluster;

    fn settings(cluster: &FakeKafkaCluster) -> ConsumerSettings {
        ConsumerSettings::new("localhost:9092", "test-group")
            .with_consumer_factory(cluster.factory())
            .with_poll_interval(Duration::from_millis(10))
    }

    fn new_consumer(
        settings: ConsumerSettings,
    ) -> (KafkaConsumer<String, String>, ConsumerFiber) {
        KafkaConsumer::new(
            settings,
            Arc::new(crate::deserializer::StringDeserializer),
            Arc::new(crate::deserializer::StringDeserializer),
        )
        .expect("consumer construction should not fail against a fake client")
    }

    #[tokio::test]
    async fn expiring_fetch_times_out_when_no_records_arrive() {
        let cluster = FakeKafkaCluster::new();
        let tp = TopicPartition::new("orders", 0);
        cluster.set_assignment([tp.clone()]);

        let settings = settings(&cluster).with_fetch_timeout(Duration::from_millis(200));
        let (consumer, fiber) = new_consumer(settings);
        consumer.subscribe(["orders"]).await.expect("subscribe");

        let started = tokio::time::Instant::now();
        let (chunk, reason) = tokio::time::timeout(Duration::from_secs(1), consumer.expiring_fetch(tp))
            .await
            .expect("expiring_fetch should resolve before the outer timeout")
            .expect("fetch channel should not drop");
        assert!(chunk.is_empty());
        assert_eq!(reason, ExpiringReason::FetchExpired);
        assert!(started.elapsed() >= Duration::from_millis(190));

        fiber.cancel();
    }

    #[tokio::test]
    async fn rebalance_revokes_a_pending_fetch() {
        let cluster = FakeKafkaCluster::new();
        let tp0 = TopicPartition::new("orders", 0);
        let tp1 = TopicPartition::new("orders", 1);
        cluster.set_assignment([tp0.clone()]);

        let (consumer, fiber) = new_consumer(settings(&cluster));
        consumer.subscribe(["orders"]).await.expect("subscribe");

        // Let a poll observe the initial assignment before registering the
        // long-lived fetch that the rebalance below should revoke.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fetch_task = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.fetch(tp0).await }
        });
        // Give the spawned task a chance to actually send its `Fetch`
        // request and register itself in `state.fetches` before the
        // assignment moves out from under it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cluster.set_assignment([tp1.clone()]);

        let (chunk, reason) = tokio::time::timeout(Duration::from_secs(1), fetch_task)
            .await
            .expect("revocation should resolve the pending fetch before the timeout")
            .expect("fetch task should not panic")
            .expect("fetch channel should not drop");
        assert!(chunk.is_empty());
        assert_eq!(reason, crate::request::FetchReason::TopicPartitionRevoked);

        fiber.cancel();
    }
}
