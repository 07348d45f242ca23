use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{KafkaClient, RdKafkaClient};
use crate::error::Result;

/// Constructs the underlying [`KafkaClient`] from raw `librdkafka` style
/// properties. Pluggable so tests can swap in the fake client from
/// [`crate::testing`] without touching the rest of [`ConsumerSettings`].
pub trait ConsumerFactory: Send + Sync {
    fn create(&self, properties: &HashMap<String, String>) -> Result<Box<dyn KafkaClient>>;
}

/// Default factory, backed by `rdkafka::consumer::BaseConsumer`.
pub struct RdKafkaConsumerFactory;

impl ConsumerFactory for RdKafkaConsumerFactory {
    fn create(&self, properties: &HashMap<String, String>) -> Result<Box<dyn KafkaClient>> {
        Ok(Box::new(RdKafkaClient::from_properties(properties)?))
    }
}

/// Every timing knob and construction hook the core consumes directly.
/// Everything else (topic subscription, deserializers) is passed to the
/// individual facade operations rather than baked into settings, keeping
/// this struct limited to what the actor and poll scheduler actually read.
#[derive(Clone)]
pub struct ConsumerSettings {
    /// Raw `librdkafka` properties: `bootstrap.servers`, `group.id`, etc.
    pub properties: HashMap<String, String>,
    /// `T_poll`: interval between successive `Poll` requests.
    pub poll_interval: Duration,
    /// Argument to `client.poll`.
    pub poll_timeout: Duration,
    /// `T_fetch`: expiration for `ExpiringFetch` slots used by the unified
    /// stream.
    pub fetch_timeout: Duration,
    /// Argument to `client.close` during teardown.
    pub close_timeout: Duration,
    /// Default timeout for `beginning_offsets` when the caller does not
    /// supply one.
    pub default_api_timeout: Duration,
    /// Default timeout for `end_offsets` when the caller does not supply
    /// one.
    pub request_timeout: Duration,
    /// Constructs the underlying client; overridable for tests.
    pub consumer_factory: Arc<dyn ConsumerFactory>,
}

impl ConsumerSettings {
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>) -> Self {
        let mut properties = HashMap::new();
        properties.insert("bootstrap.servers".to_string(), brokers.into());
        properties.insert("group.id".to_string(), group_id.into());
        properties.insert("enable.auto.commit".to_string(), "false".to_string());
        Self {
            properties,
            ..Self::defaults()
        }
    }

    fn defaults() -> Self {
        Self {
            properties: HashMap::new(),
            poll_interval: Duration::from_millis(100),
            poll_timeout: Duration::from_millis(50),
            fetch_timeout: Duration::from_millis(500),
            close_timeout: Duration::from_secs(5),
            default_api_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            consumer_factory: Arc::new(RdKafkaConsumerFactory),
        }
    }

    /// Sets a raw `librdkafka` property, returning `self` for chaining.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_consumer_factory(mut self, factory: Arc<dyn ConsumerFactory>) -> Self {
        self.consumer_factory = factory;
        self
    }
}
