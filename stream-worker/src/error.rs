use redis_streams::StreamError;
use thiserror::Error;

/// Enumeration of errors related to initialization and consumption of stream entries.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to connect to redis: {0}")]
    ConnectionError(StreamError),
    #[error("failed to create consumer group {group} on stream {stream}: {error}")]
    CreateGroupError {
        stream: String,
        group: String,
        error: StreamError,
    },
    #[error("an error occurred while consuming streams: {0}")]
    StreamError(#[from] StreamError),
}
