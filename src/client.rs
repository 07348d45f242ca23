//! The synchronized client handle: a dedicated OS thread that owns the one,
//! non-thread-safe Kafka client instance, fed by a FIFO queue of boxed
//! closures. Every other task reaches the client only through
//! [`SynchronizedClient::with_client`].

use std::collections::{HashMap, HashSet};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer as _};
use rdkafka::message::{Headers, Message as _};
use rdkafka::topic_partition_list::{Offset as RdOffset, TopicPartitionList};
use rdkafka::consumer::CommitMode;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{CommittableOffset, Header, RawMessage, TopicPartition};

/// The underlying, non-thread-safe Kafka client. Implementations are driven
/// exclusively from the dedicated client thread; the trait itself carries no
/// thread-safety requirements beyond `Send`, since an instance never leaves
/// that thread.
pub trait KafkaClient: Send {
    fn subscribe(&mut self, topics: &[&str]) -> Result<()>;
    fn unsubscribe(&mut self);
    fn assignment(&self) -> Result<HashSet<TopicPartition>>;
    fn seek(&self, tp: &TopicPartition, offset: i64, timeout: Duration) -> Result<()>;
    /// Polls once for up to `timeout`, then drains any already-buffered
    /// messages without waiting further. Turns librdkafka's one-message-at-
    /// a-time `poll` into the batch the actor expects.
    fn poll(&self, timeout: Duration) -> Result<Vec<RawMessage>>;
    fn beginning_offset(&self, tp: &TopicPartition, timeout: Duration) -> Result<i64>;
    fn end_offset(&self, tp: &TopicPartition, timeout: Duration) -> Result<i64>;
    fn commit_sync(&self, offsets: &[CommittableOffset]) -> Result<()>;
    fn close(&mut self, timeout: Duration);
}

/// Production [`KafkaClient`] backed by `rdkafka::consumer::BaseConsumer`.
pub struct RdKafkaClient {
    inner: BaseConsumer,
}

impl RdKafkaClient {
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let mut config = ClientConfig::new();
        for (key, value) in properties {
            config.set(key, value);
        }
        let inner: BaseConsumer = config.create()?;
        Ok(Self { inner })
    }
}

impl KafkaClient for RdKafkaClient {
    fn subscribe(&mut self, topics: &[&str]) -> Result<()> {
        self.inner.subscribe(topics).map_err(Error::from)
    }

    fn unsubscribe(&mut self) {
        self.inner.unsubscribe();
    }

    fn assignment(&self) -> Result<HashSet<TopicPartition>> {
        let tpl = self.inner.assignment()?;
        Ok(tpl
            .elements()
            .iter()
            .map(|el| TopicPartition::new(el.topic(), el.partition()))
            .collect())
    }

    fn seek(&self, tp: &TopicPartition, offset: i64, timeout: Duration) -> Result<()> {
        self.inner
            .seek(&tp.topic, tp.partition, RdOffset::Offset(offset), timeout)
            .map_err(Error::from)
    }

    fn poll(&self, timeout: Duration) -> Result<Vec<RawMessage>> {
        let mut out = Vec::new();
        match self.inner.poll(timeout) {
            Some(Ok(msg)) => out.push(to_raw_message(&msg)),
            Some(Err(e)) => return Err(Error::from(e)),
            None => return Ok(out),
        }
        // Drain anything else already sitting in the local queue without
        // waiting further; this is what turns rdkafka's one-at-a-time
        // `poll` into the batch semantics the actor expects.
        loop {
            match self.inner.poll(Duration::from_secs(0)) {
                Some(Ok(msg)) => out.push(to_raw_message(&msg)),
                Some(Err(e)) => {
                    warn!(error = %e, "kafka poll error while draining batch");
                    break;
                }
                None => break,
            }
        }
        Ok(out)
    }

    fn beginning_offset(&self, tp: &TopicPartition, timeout: Duration) -> Result<i64> {
        let (low, _high) = self
            .inner
            .fetch_watermarks(&tp.topic, tp.partition, timeout)?;
        Ok(low)
    }

    fn end_offset(&self, tp: &TopicPartition, timeout: Duration) -> Result<i64> {
        let (_low, high) = self
            .inner
            .fetch_watermarks(&tp.topic, tp.partition, timeout)?;
        Ok(high)
    }

    fn commit_sync(&self, offsets: &[CommittableOffset]) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for o in offsets {
            tpl.add_partition_offset(&o.topic, o.partition, RdOffset::Offset(o.offset.0))?;
        }
        self.inner.commit(&tpl, CommitMode::Sync).map_err(Error::from)
    }

    fn close(&mut self, _timeout: Duration) {
        self.inner.unsubscribe();
        debug!("kafka client closed");
    }
}

fn to_raw_message(msg: &rdkafka::message::BorrowedMessage<'_>) -> RawMessage {
    let headers: Vec<Header> = msg
        .headers()
        .map(|hs| {
            hs.iter()
                .map(|h| (h.key.to_string(), h.value.map(|v| v.to_vec())))
                .collect()
        })
        .unwrap_or_default();
    RawMessage {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(|k| k.to_vec()),
        value: msg.payload().map(|v| v.to_vec()),
        timestamp: msg.timestamp().to_millis(),
        headers,
    }
}

type Job = Box<dyn FnOnce(&mut dyn KafkaClient) + Send>;

/// The synchronized handle: one dedicated OS thread owning the client, and a
/// FIFO channel of jobs dispatched to it. `with_client` is the only way to
/// reach the client from the rest of the crate.
pub struct SynchronizedClient {
    jobs: std_mpsc::Sender<Job>,
    _thread: thread::JoinHandle<()>,
}

impl SynchronizedClient {
    pub fn spawn(mut client: Box<dyn KafkaClient>, close_timeout: Duration) -> Self {
        let (tx, rx) = std_mpsc::channel::<Job>();
        let thread = thread::Builder::new()
            .name("kafka-consumer-client".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job(client.as_mut());
                }
                client.close(close_timeout);
            })
            .expect("failed to spawn dedicated kafka client thread");
        Self {
            jobs: tx,
            _thread: thread,
        }
    }

    /// Takes an exclusive lease on the client for the duration of `action`,
    /// running it on the dedicated thread, and returns its result to the
    /// caller's task.
    /// `action` must not suspend for an unbounded time: it runs synchronously
    /// on the dedicated thread while every other lease waits in the job
    /// queue.
    ///
    /// Fails with `ConsumerShutdown` if the dedicated thread has already
    /// torn down (the job channel's receiver, or the reply itself, was
    /// dropped without ever running `action`).
    pub async fn with_client<F, A>(&self, action: F) -> Result<A>
    where
        F: FnOnce(&mut dyn KafkaClient) -> A + Send + 'static,
        A: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |client| {
            let result = action(client);
            let _ = reply_tx.send(result);
        });
        if self.jobs.send(job).is_err() {
            return Err(Error::ConsumerShutdown);
        }
        reply_rx.await.map_err(|_| Error::ConsumerShutdown)
    }
}
