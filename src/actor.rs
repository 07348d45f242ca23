//! The consumer actor: the single task that owns `State` and the only task
//! that ever touches the synchronized client handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::client::SynchronizedClient;
use crate::deserializer::Deserializer;
use crate::error::Result;
use crate::request::{ExpiringReason, FetchReason, OnRebalance, PendingFetch, Request};
use crate::state::State;
use crate::types::{CommittableMessage, CommittableOffset, ConsumerState, Offset, Record, TopicPartition};

pub struct ActorContext<K, V> {
    pub client: SynchronizedClient,
    pub key_deserializer: Arc<dyn Deserializer<K>>,
    pub value_deserializer: Arc<dyn Deserializer<V>>,
    pub consumer_group_id: Option<String>,
    pub poll_timeout: Duration,
    pub fetch_timeout: Duration,
    /// Timeout applied to `seek` and other single-shot client requests that
    /// need one but are not the batch-oriented offset lookups (those carry
    /// their own timeout on the request itself).
    pub request_timeout: Duration,
    pub state: State<K, V>,
    pub requests_tx: mpsc::UnboundedSender<Request<K, V>>,
    /// Diagnostics-only lifecycle phase, readable from the facade.
    pub lifecycle: Arc<AtomicU8>,
}

impl<K, V> ActorContext<K, V> {
    fn advance_to(&self, state: ConsumerState) {
        self.lifecycle.store(state.as_u8(), Ordering::Relaxed);
    }
}

/// Flips the shutdown watch on drop, whether the actor returns normally or
/// unwinds from a panic. Mirrors the drop-order discipline the corpus uses
/// for its own background worker threads.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<bool>,
    lifecycle: Arc<AtomicU8>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.lifecycle.store(ConsumerState::Closed.as_u8(), Ordering::Relaxed);
        let _ = self.shutdown_tx.send(true);
    }
}

/// Runs the actor loop until both the `requests` and `polls` channels are
/// closed (ordinary teardown) or the task panics (caught by the caller's
/// `JoinHandle`).
pub async fn run_actor<K, V>(
    mut ctx: ActorContext<K, V>,
    mut requests_rx: mpsc::UnboundedReceiver<Request<K, V>>,
    mut polls_rx: mpsc::Receiver<()>,
    shutdown_tx: watch::Sender<bool>,
) where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    let _guard = ShutdownGuard {
        shutdown_tx,
        lifecycle: Arc::clone(&ctx.lifecycle),
    };
    // Once the poll scheduler is gone there is nothing useful left to select
    // on there; without this flag a closed `polls_rx` would resolve
    // immediately on every iteration and spin the loop hot while waiting for
    // the next real request.
    let mut polls_closed = false;
    loop {
        if polls_closed {
            match requests_rx.recv().await {
                Some(request) => handle_request(&mut ctx, request).await,
                None => {
                    info!("actor request queue closed, shutting down");
                    break;
                }
            }
        } else {
            tokio::select! {
                biased;
                maybe_request = requests_rx.recv() => {
                    match maybe_request {
                        Some(request) => handle_request(&mut ctx, request).await,
                        None => {
                            info!("actor request queue closed, shutting down");
                            break;
                        }
                    }
                }
                maybe_poll = polls_rx.recv() => {
                    match maybe_poll {
                        Some(()) => handle_request(&mut ctx, Request::Poll).await,
                        None => {
                            info!("poll scheduler gone, falling back to request-only priority");
                            polls_closed = true;
                        }
                    }
                }
            }
        }
        tokio::task::yield_now().await;
    }
}

async fn handle_request<K, V>(ctx: &mut ActorContext<K, V>, request: Request<K, V>)
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    match request {
        Request::Poll => handle_poll(ctx).await,
        Request::Fetch { tp, reply } => handle_fetch(ctx, tp, reply),
        Request::ExpiringFetch { tp, reply } => handle_expiring_fetch(ctx, tp, reply),
        Request::ExpireFetch { tp, id } => handle_expire_fetch(ctx, tp, id),
        Request::Assignment { reply, on_rebalance } => handle_assignment(ctx, reply, on_rebalance).await,
        Request::SubscribeTopics { topics, reply } => handle_subscribe_topics(ctx, topics, reply).await,
        Request::SubscribePattern { pattern, reply } => handle_subscribe_pattern(ctx, pattern, reply).await,
        Request::Seek { tp, offset, reply } => handle_seek(ctx, tp, offset, reply).await,
        Request::BeginningOffsets {
            partitions,
            timeout,
            reply,
        } => handle_offsets(ctx, partitions, timeout, reply, true).await,
        Request::EndOffsets {
            partitions,
            timeout,
            reply,
        } => handle_offsets(ctx, partitions, timeout, reply, false).await,
        Request::CommitSync { offsets, reply } => handle_commit_sync(ctx, offsets, reply).await,
    }
}

async fn handle_subscribe_topics<K, V>(
    ctx: &mut ActorContext<K, V>,
    topics: Vec<String>,
    reply: oneshot::Sender<Result<()>>,
) {
    let topics_for_client = topics.clone();
    let result = ctx
        .client
        .with_client(move |c| {
            let refs: Vec<&str> = topics_for_client.iter().map(String::as_str).collect();
            c.subscribe(&refs)
        })
        .await;
    let result = flatten(result);
    if result.is_ok() {
        ctx.state.subscribed = true;
        ctx.advance_to(ConsumerState::Subscribed);
        info!(topics = ?topics, "subscribed");
    }
    let _ = reply.send(result);
}

async fn handle_subscribe_pattern<K, V>(
    ctx: &mut ActorContext<K, V>,
    pattern: String,
    reply: oneshot::Sender<Result<()>>,
) {
    // librdkafka treats a topic string prefixed with `^` as a regular
    // expression subscription.
    let wire_pattern = format!("^{pattern}");
    let result = ctx
        .client
        .with_client(move |c| c.subscribe(&[&wire_pattern]))
        .await;
    let result = flatten(result);
    if result.is_ok() {
        ctx.state.subscribed = true;
        ctx.advance_to(ConsumerState::Subscribed);
        info!(pattern = %pattern, "subscribed to pattern");
    }
    let _ = reply.send(result);
}

async fn handle_seek<K, V>(
    ctx: &mut ActorContext<K, V>,
    tp: TopicPartition,
    offset: Offset,
    reply: oneshot::Sender<Result<()>>,
) {
    let timeout = ctx.request_timeout;
    let result = ctx
        .client
        .with_client(move |c| c.seek(&tp, offset.0, timeout))
        .await;
    let _ = reply.send(flatten(result));
}

async fn handle_offsets<K, V>(
    ctx: &mut ActorContext<K, V>,
    partitions: Vec<TopicPartition>,
    timeout: Duration,
    reply: oneshot::Sender<Result<HashMap<TopicPartition, Offset>>>,
    beginning: bool,
) {
    let result = ctx
        .client
        .with_client(move |c| {
            let mut out = HashMap::new();
            for tp in partitions {
                let offset = if beginning {
                    c.beginning_offset(&tp, timeout)
                } else {
                    c.end_offset(&tp, timeout)
                }?;
                out.insert(tp, Offset(offset));
            }
            Ok(out)
        })
        .await;
    let _ = reply.send(flatten(result));
}

async fn handle_commit_sync<K, V>(
    ctx: &mut ActorContext<K, V>,
    offsets: Vec<CommittableOffset>,
    reply: oneshot::Sender<Result<()>>,
) {
    let result = ctx.client.with_client(move |c| c.commit_sync(&offsets)).await;
    let _ = reply.send(flatten(result));
}

async fn handle_assignment<K, V>(
    ctx: &mut ActorContext<K, V>,
    reply: oneshot::Sender<std::collections::HashSet<TopicPartition>>,
    on_rebalance: Option<OnRebalance>,
) {
    if let Some(listener) = on_rebalance {
        ctx.state.rebalance_listeners.push(listener);
    }
    let result = ctx.client.with_client(|c| c.assignment()).await;
    let assignment = flatten(result).unwrap_or_else(|e| {
        warn!(error = %e, "failed to read assignment");
        Default::default()
    });
    // The caller is about to treat every partition in this snapshot as
    // already accounted for (e.g. spawning a worker per partition). Fold it
    // into the baseline a poll diffs against, or the next poll would see
    // these partitions as newly assigned all over again and report them to
    // `on_assigned` a second time.
    ctx.state.last_assignment.extend(assignment.iter().cloned());
    let _ = reply.send(assignment);
}

fn handle_fetch<K, V>(
    ctx: &mut ActorContext<K, V>,
    tp: TopicPartition,
    reply: oneshot::Sender<(Vec<CommittableMessage<K, V>>, FetchReason)>,
) {
    ctx.state.streaming = true;
    ctx.advance_to(ConsumerState::Polling);
    if let Some(chunk) = ctx.state.take_buffered(&tp) {
        let _ = reply.send((chunk, FetchReason::Records));
        return;
    }
    let id = ctx.state.next_fetch_id();
    ctx.state
        .register_fetch(tp, id, PendingFetch::Fetch(reply));
}

fn handle_expiring_fetch<K, V>(
    ctx: &mut ActorContext<K, V>,
    tp: TopicPartition,
    reply: oneshot::Sender<(Vec<CommittableMessage<K, V>>, ExpiringReason)>,
) where
    K: Send + 'static,
    V: Send + 'static,
{
    ctx.state.streaming = true;
    ctx.advance_to(ConsumerState::Polling);
    if let Some(chunk) = ctx.state.take_buffered(&tp) {
        let _ = reply.send((chunk, ExpiringReason::Records));
        return;
    }
    let id = ctx.state.next_fetch_id();
    ctx.state
        .register_fetch(tp.clone(), id, PendingFetch::ExpiringFetch(reply));

    let timer_tx = ctx.requests_tx.clone();
    let fetch_timeout = ctx.fetch_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(fetch_timeout).await;
        // If the actor (and thus its receiver) is already gone this quietly
        // does nothing; the fetch was already resolved as part of shutdown.
        let _ = timer_tx.send(Request::ExpireFetch { tp, id });
    });
}

fn handle_expire_fetch<K, V>(ctx: &mut ActorContext<K, V>, tp: TopicPartition, id: u64) {
    if let Some(PendingFetch::ExpiringFetch(reply)) = ctx.state.take_fetch_by_id(&tp, id) {
        let _ = reply.send((Vec::new(), ExpiringReason::FetchExpired));
    }
    // Anything else (entry missing, or somehow a plain `Fetch`) means a poll
    // or revocation already won the race; this is a no-op by design.
}

async fn handle_poll<K, V>(ctx: &mut ActorContext<K, V>)
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    if !ctx.state.subscribed {
        return;
    }

    let previous_assignment = ctx.state.last_assignment.clone();
    let poll_timeout = ctx.poll_timeout;
    let result = ctx
        .client
        .with_client(move |c| -> Result<_> {
            let messages = c.poll(poll_timeout)?;
            let assignment = c.assignment()?;
            Ok((messages, assignment))
        })
        .await;

    let (raw_messages, current_assignment) = match flatten(result) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "poll failed");
            return;
        }
    };
    ctx.state.last_assignment = current_assignment.clone();

    let mut by_partition: HashMap<TopicPartition, Vec<CommittableMessage<K, V>>> = HashMap::new();
    for raw in raw_messages {
        let tp = TopicPartition::new(raw.topic.clone(), raw.partition);
        let key = match raw.key.as_deref().map(|b| ctx.key_deserializer.deserialize(&raw.topic, b)) {
            Some(Ok(k)) => k,
            Some(Err(message)) => {
                warn!(%message, topic = %raw.topic, partition = raw.partition, offset = raw.offset, "dropping record: key deserialization failed");
                continue;
            }
            None => {
                warn!(topic = %raw.topic, partition = raw.partition, offset = raw.offset, "dropping record: missing key");
                continue;
            }
        };
        let value = match raw.value.as_deref().map(|b| ctx.value_deserializer.deserialize(&raw.topic, b)) {
            Some(Ok(v)) => v,
            Some(Err(message)) => {
                warn!(%message, topic = %raw.topic, partition = raw.partition, offset = raw.offset, "dropping record: value deserialization failed");
                continue;
            }
            None => {
                warn!(topic = %raw.topic, partition = raw.partition, offset = raw.offset, "dropping record: missing value");
                continue;
            }
        };
        let record = Record {
            topic: raw.topic,
            partition: raw.partition,
            offset: Offset(raw.offset),
            key,
            value,
            timestamp: raw.timestamp,
            headers: raw.headers,
        };
        let offset = CommittableOffset::for_record(&record, ctx.consumer_group_id.clone());
        by_partition
            .entry(tp)
            .or_default()
            .push(CommittableMessage { record, offset });
    }

    for (tp, chunk) in by_partition {
        if ctx.state.has_pending_fetch(&tp) {
            for pending in ctx.state.take_fetches(&tp) {
                pending.resolve(chunk.clone(), FetchReason::Records);
            }
        } else {
            ctx.state.buffer_records(tp, chunk);
        }
    }

    let revoked: Vec<TopicPartition> = previous_assignment
        .difference(&current_assignment)
        .cloned()
        .collect();
    let newly_assigned: std::collections::HashSet<TopicPartition> = current_assignment
        .difference(&previous_assignment)
        .cloned()
        .collect();

    for tp in &revoked {
        ctx.state.records.remove(tp);
        for pending in ctx.state.take_fetches(tp) {
            pending.resolve(Vec::new(), FetchReason::TopicPartitionRevoked);
        }
    }
    if !revoked.is_empty() {
        let revoked_set: std::collections::HashSet<TopicPartition> = revoked.into_iter().collect();
        info!(revoked = ?revoked_set, "partitions revoked");
        for listener in &ctx.state.rebalance_listeners {
            (listener.on_revoked)(&revoked_set);
        }
    }
    if !newly_assigned.is_empty() {
        info!(assigned = ?newly_assigned, "partitions assigned");
        for listener in &ctx.state.rebalance_listeners {
            (listener.on_assigned)(&newly_assigned);
        }
    }
}

/// Collapses the two layers of `Result` that come from asking the
/// synchronized client to run a closure that itself returns a `Result`:
/// the outer layer is `ConsumerShutdown` (the dedicated thread is gone),
/// the inner one is whatever the closure produced.
fn flatten<A>(result: Result<Result<A>>) -> Result<A> {
    result.and_then(|inner| inner)
}
