use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

// Re-export ErrorKind and RetryMethod so callers can construct StreamError in tests
// and understand retry behavior
pub use redis::ErrorKind as RedisErrorKind;
pub use redis::RetryMethod;

#[derive(Error, Debug, Clone)]
pub enum StreamError {
    #[error("stream not found")]
    NotFound,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Timeout error")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("failed to acknowledge entries on stream {stream}: {source}")]
    AckFailed {
        stream: String,
        /// Streams whose entries were acknowledged before the failure.
        acknowledged: Vec<String>,
        source: Box<StreamError>,
    },
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for StreamError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StreamError::Timeout
        } else {
            StreamError::Redis(Arc::new(err))
        }
    }
}

impl StreamError {
    /// Create a Redis error from an ErrorKind (primarily for testing)
    pub fn from_redis_kind(kind: redis::ErrorKind, description: &'static str) -> Self {
        StreamError::Redis(Arc::new(redis::RedisError::from((kind, description))))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }

    /// Determine if this error is unrecoverable and should not be retried
    ///
    /// Returns `true` for configuration errors and failures the server will keep
    /// reporting, such as a missing consumer group.
    /// Returns `false` for timeouts, dropped connections (the client reconnects on the
    /// next command) and cancellation, which only reflects the caller giving up.
    pub fn is_unrecoverable_error(&self) -> bool {
        match self {
            StreamError::Timeout => false,
            StreamError::Cancelled => false,
            StreamError::InvalidConfiguration(_) => true,
            StreamError::ParseError(_) => true,
            StreamError::NotFound => true,
            StreamError::AckFailed { source, .. } => source.is_unrecoverable_error(),
            StreamError::Redis(err) => {
                Self::is_config_error(err) || matches!(err.retry_method(), RetryMethod::NoRetry)
            }
        }
    }

    /// Check if a Redis error is a configuration error that should never be retried
    fn is_config_error(err: &redis::RedisError) -> bool {
        matches!(
            err.kind(),
            redis::ErrorKind::InvalidClientConfig | redis::ErrorKind::AuthenticationFailed
        )
    }

    /// Determine the appropriate retry strategy for this error
    ///
    /// Nothing in this crate retries; this is advice for the caller.
    /// Delegates to redis crate's `retry_method()` for Redis errors.
    pub fn retry_method(&self) -> RetryMethod {
        match self {
            // Timeouts: wait before retrying to avoid hammering the service
            StreamError::Timeout => RetryMethod::WaitAndRetry,
            StreamError::Cancelled => RetryMethod::NoRetry,
            StreamError::InvalidConfiguration(_) => RetryMethod::NoRetry,
            StreamError::ParseError(_) => RetryMethod::NoRetry,
            StreamError::NotFound => RetryMethod::NoRetry,
            StreamError::AckFailed { source, .. } => source.retry_method(),
            StreamError::Redis(err) => {
                if Self::is_config_error(err) {
                    RetryMethod::NoRetry
                } else {
                    err.retry_method()
                }
            }
        }
    }
}

/// Where a group read starts in each stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPosition {
    /// Entries already delivered to this consumer and not yet acknowledged.
    Pending,
    /// Entries never delivered to any consumer of the group.
    New,
}

impl ReadPosition {
    pub fn as_id(&self) -> &'static str {
        match self {
            ReadPosition::Pending => "0",
            ReadPosition::New => ">",
        }
    }
}

/// The stream commands the producer and consumer are built on.
///
/// Group lifecycle commands (`xgroup_create`, `xgroup_destroy`, `del`) are only used by
/// setup tooling and tests.
#[async_trait]
pub trait StreamClient {
    /// Append one entry. Returns `None` when `no_mkstream` is set and the stream is missing.
    async fn xadd(
        &self,
        stream: String,
        id: String,
        values: Values,
        max_len: Option<MaxLen>,
        no_mkstream: bool,
    ) -> Result<Option<String>, StreamError>;

    /// Group read over several streams at once. Streams with nothing to return may be
    /// omitted from the result or returned with no entries.
    async fn xread_group(
        &self,
        group: String,
        consumer: String,
        streams: Vec<String>,
        position: ReadPosition,
        block: BlockPolicy,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntries>, StreamError>;

    async fn xack(
        &self,
        stream: String,
        group: String,
        ids: Vec<String>,
    ) -> Result<u64, StreamError>;

    async fn xgroup_create(
        &self,
        stream: String,
        group: String,
        start_id: String,
        mkstream: bool,
    ) -> Result<(), StreamError>;

    async fn xgroup_destroy(&self, stream: String, group: String) -> Result<bool, StreamError>;

    async fn del(&self, stream: String) -> Result<(), StreamError>;
}

// Module declarations
mod client;
mod consumer;
mod message;
mod mock;
mod producer;

// Re-export public APIs
pub use client::RedisStreamClient;
pub use consumer::{BlockPolicy, Consumer, ConsumerConfig};
pub use message::{Message, StreamEntries, StreamEntry, StreamValue, Values};
pub use mock::{MockStreamCall, MockStreamClient};
pub use producer::{MaxLen, Producer, ProducerConfig, WriteOptions};

#[cfg(test)]
mod tests {
    use super::*;

    fn io_error(kind: std::io::ErrorKind) -> StreamError {
        StreamError::from(redis::RedisError::from(std::io::Error::from(kind)))
    }

    mod error_transience {
        use super::*;

        #[test]
        fn test_timeout_is_recoverable() {
            let err = StreamError::Timeout;
            assert!(!err.is_unrecoverable_error());
        }

        #[test]
        fn test_cancelled_is_distinct_and_recoverable() {
            let err = StreamError::Cancelled;
            assert!(err.is_cancelled());
            assert!(!err.is_unrecoverable_error());
            assert!(!StreamError::Timeout.is_cancelled());
        }

        #[test]
        fn test_parse_error_is_unrecoverable() {
            let err = StreamError::ParseError("invalid data".to_string());
            assert!(err.is_unrecoverable_error());
        }

        #[test]
        fn test_not_found_is_unrecoverable() {
            assert!(StreamError::NotFound.is_unrecoverable_error());
        }

        #[test]
        fn test_ack_failed_follows_its_source() {
            let err = StreamError::AckFailed {
                stream: "stream-2".to_string(),
                acknowledged: vec!["stream-1".to_string()],
                source: Box::new(StreamError::Timeout),
            };
            assert!(!err.is_unrecoverable_error());
            assert!(matches!(err.retry_method(), RetryMethod::WaitAndRetry));
            assert!(err.to_string().contains("stream-2"));
        }

        #[test]
        fn test_dropped_connection_is_recoverable() {
            for kind in [
                std::io::ErrorKind::ConnectionReset,
                std::io::ErrorKind::BrokenPipe,
                std::io::ErrorKind::ConnectionRefused,
            ] {
                let err = io_error(kind);
                assert!(!err.is_unrecoverable_error(), "{kind:?} should be retried");
            }
        }

        #[test]
        fn test_server_error_is_unrecoverable() {
            let err = StreamError::from(redis::make_extension_error(
                "NOGROUP".to_string(),
                Some("No such key 's' or consumer group 'g'".to_string()),
            ));
            assert!(err.is_unrecoverable_error());
        }
    }

    mod retry_methods {
        use super::*;

        #[test]
        fn test_timeout_wait_and_retry() {
            assert!(matches!(
                StreamError::Timeout.retry_method(),
                RetryMethod::WaitAndRetry
            ));
        }

        #[test]
        fn test_permanent_errors_no_retry() {
            for err in [
                StreamError::Cancelled,
                StreamError::NotFound,
                StreamError::ParseError("bad reply".to_string()),
                StreamError::InvalidConfiguration("no streams".to_string()),
            ] {
                assert!(
                    matches!(err.retry_method(), RetryMethod::NoRetry),
                    "{err} should not be retried"
                );
            }
        }

        #[test]
        fn test_authentication_failed_is_unrecoverable() {
            let err = StreamError::from_redis_kind(
                redis::ErrorKind::AuthenticationFailed,
                "WRONGPASS invalid username-password pair",
            );

            assert!(err.is_unrecoverable_error());
            assert!(matches!(err.retry_method(), RetryMethod::NoRetry));
        }

        #[test]
        fn test_connection_reset_reconnects() {
            let err = io_error(std::io::ErrorKind::ConnectionReset);

            assert!(!err.is_unrecoverable_error());
            assert!(matches!(err.retry_method(), RetryMethod::Reconnect));
        }

        #[test]
        fn test_io_timeout_maps_to_timeout() {
            let err = io_error(std::io::ErrorKind::TimedOut);
            assert!(matches!(err, StreamError::Timeout));
        }
    }

    #[test]
    fn test_read_position_ids() {
        assert_eq!(ReadPosition::Pending.as_id(), "0");
        assert_eq!(ReadPosition::New.as_id(), ">");
    }
}
