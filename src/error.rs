use thiserror::Error;

/// Every error this crate can return: user errors, transient client errors,
/// and fatal actor errors. Deserialization failures are not represented here;
/// they are logged and the offending record is dropped rather than failing a
/// poll outright. Variants are always freshly constructed; none are cached
/// and cloned out to multiple callers under different names.
#[derive(Error, Debug)]
pub enum Error {
    /// A stream was pulled before any `subscribe*` call succeeded.
    #[error("consumer is not subscribed to any topic")]
    NotSubscribed,

    /// A request was posted after the consumer's actor or poll scheduler
    /// has torn down.
    #[error("consumer has shut down")]
    ConsumerShutdown,

    /// `subscribe` was called with an empty topic collection.
    #[error("subscribe requires at least one topic")]
    EmptyTopicSubscription,

    /// The underlying client rejected a request.
    #[error("kafka client error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// The actor or poll scheduler task panicked or returned an unexpected
    /// error. Stored as a string because the original error may not be
    /// `Send + 'static` in a form we can keep around.
    #[error("consumer actor failed: {0}")]
    ActorPanicked(String),
}

pub type Result<T> = std::result::Result<T, Error>;
