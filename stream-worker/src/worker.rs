use std::sync::Arc;
use std::time;

use redis_streams::{
    BlockPolicy, Consumer, ConsumerConfig, Message, RetryMethod, StreamClient, StreamError,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::WorkerError;

/// Create `group` on every stream, creating missing streams too. Groups that already
/// exist are left alone.
pub async fn ensure_groups<C>(
    client: &C,
    streams: &[String],
    group: &str,
) -> Result<(), WorkerError>
where
    C: StreamClient + ?Sized,
{
    for stream in streams {
        match client
            .xgroup_create(stream.clone(), group.to_owned(), "$".to_owned(), true)
            .await
        {
            Ok(()) => info!(stream = %stream, group = %group, "created consumer group"),
            Err(error) if is_busy_group(&error) => {}
            Err(error) => {
                return Err(WorkerError::CreateGroupError {
                    stream: stream.clone(),
                    group: group.to_owned(),
                    error,
                })
            }
        }
    }
    Ok(())
}

fn is_busy_group(error: &StreamError) -> bool {
    matches!(error, StreamError::Redis(err) if err.code() == Some("BUSYGROUP"))
}

/// Dropped connections are re-established by the client on the next command.
fn is_retryable(error: &StreamError) -> bool {
    matches!(
        error.retry_method(),
        RetryMethod::Reconnect
            | RetryMethod::ReconnectFromInitialConnections
            | RetryMethod::RetryImmediately
            | RetryMethod::WaitAndRetry
    )
}

fn was_cancelled(error: &StreamError) -> bool {
    match error {
        StreamError::Cancelled => true,
        StreamError::AckFailed { source, .. } => source.is_cancelled(),
        _ => false,
    }
}

/// Reads batches from the configured streams, processes them and acknowledges them.
pub struct StreamWorker {
    consumer: Consumer,
    /// Pause between empty polls and before retrying transient errors.
    poll_interval: time::Duration,
}

impl StreamWorker {
    pub fn new(
        client: Arc<dyn StreamClient + Send + Sync>,
        config: &Config,
    ) -> Result<Self, WorkerError> {
        let group = config.group_name.as_str();
        let consumer = config.consumer_name.as_str();
        let mut consumer_config = ConsumerConfig::new(group, consumer).block(config.block());
        for stream in &config.streams.0 {
            consumer_config = consumer_config.stream(stream.as_str());
        }
        if let Some(batch_size) = config.batch_size {
            consumer_config = consumer_config.count(batch_size);
        }

        Ok(Self {
            consumer: Consumer::new(client, consumer_config)?,
            poll_interval: config.poll_interval_ms.0,
        })
    }

    /// Process one batch. Returns how many messages were processed and acknowledged.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<usize, StreamError> {
        let messages = self.consumer.read(cancel).await?;
        for message in &messages {
            self.process(message);
        }
        self.consumer.ack(cancel, &messages).await?;
        Ok(messages.len())
    }

    fn process(&self, message: &Message) {
        let fields: Vec<String> = message
            .values
            .iter()
            .map(|(field, value)| format!("{field}={value}"))
            .collect();
        info!(
            stream = %message.stream,
            id = %message.id,
            fields = %fields.join(" "),
            "processed message"
        );
    }

    /// Run until `cancel` fires. Dropped connections, timeouts and other retryable
    /// errors are retried after the poll interval; anything else stops the worker.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        let poll_when_empty = self.consumer.config().block == BlockPolicy::NoBlock;

        loop {
            match self.run_once(cancel).await {
                Ok(0) if poll_when_empty => {}
                Ok(_) => continue,
                Err(error) if was_cancelled(&error) => return Ok(()),
                Err(error) if is_retryable(&error) => {
                    warn!(error = %error, "failed to consume streams, retrying")
                }
                Err(error) => return Err(error.into()),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envconfig::Envconfig;
    use redis_streams::{MockStreamClient, Producer, ProducerConfig, ReadPosition, WriteOptions};
    use std::collections::HashMap;

    fn config(block_ms: &str) -> Config {
        let env = HashMap::from([
            ("STREAMS".to_string(), "stream-1,stream-2".to_string()),
            ("GROUP_NAME".to_string(), "g".to_string()),
            ("BLOCK_MS".to_string(), block_ms.to_string()),
            ("POLL_INTERVAL_MS".to_string(), "10".to_string()),
        ]);
        Config::init_from_hashmap(&env).unwrap()
    }

    fn connection_reset() -> StreamError {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        StreamError::from(redis::RedisError::from(reset))
    }

    async fn append(client: &MockStreamClient, stream: &str) {
        Producer::new(Arc::new(client.clone()), ProducerConfig::new(stream))
            .unwrap()
            .write(
                &CancellationToken::new(),
                WriteOptions::new().field("key", "value"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ensure_groups_is_idempotent() {
        let client = MockStreamClient::new();
        let streams = vec!["stream-1".to_string(), "stream-2".to_string()];

        ensure_groups(&client, &streams, "g").await.unwrap();
        ensure_groups(&client, &streams, "g").await.unwrap();

        let creates = client
            .get_calls()
            .into_iter()
            .filter(|call| call.op == "xgroup_create")
            .count();
        assert_eq!(creates, 4);
    }

    #[tokio::test]
    async fn test_run_once_processes_and_acks() {
        let client = MockStreamClient::new();
        let config = config("-1");
        ensure_groups(&client, &config.streams.0, "g")
            .await
            .unwrap();
        append(&client, "stream-1").await;
        append(&client, "stream-2").await;

        let worker = StreamWorker::new(Arc::new(client.clone()), &config).unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(worker.run_once(&cancel).await.unwrap(), 2);
        assert_eq!(client.pending_len("stream-1", "g", None), 0);
        assert_eq!(client.pending_len("stream-2", "g", None), 0);
        assert_eq!(worker.run_once(&cancel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let client = MockStreamClient::new();
        let config = config("0");
        ensure_groups(&client, &config.streams.0, "g")
            .await
            .unwrap();
        append(&client, "stream-1").await;

        let worker = StreamWorker::new(Arc::new(client.clone()), &config).unwrap();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(time::Duration::from_millis(50)).await;
            token.cancel();
        });

        tokio::time::timeout(time::Duration::from_secs(5), worker.run(&cancel))
            .await
            .expect("worker should stop once cancelled")
            .unwrap();

        assert_eq!(client.pending_len("stream-1", "g", None), 0);
    }

    #[tokio::test]
    async fn test_run_fails_on_unrecoverable_error() {
        let client = MockStreamClient::new();
        let config = config("-1");

        // no groups were created, so every read fails with NOGROUP
        let worker = StreamWorker::new(Arc::new(client), &config).unwrap();
        let result = tokio::time::timeout(
            time::Duration::from_secs(5),
            worker.run(&CancellationToken::new()),
        )
        .await
        .expect("worker should give up on a missing group");

        assert!(matches!(result, Err(WorkerError::StreamError(_))));
    }

    #[tokio::test]
    async fn test_run_retries_dropped_connection() {
        let client = MockStreamClient::new();
        let config = config("-1");
        ensure_groups(&client, &config.streams.0, "g")
            .await
            .unwrap();
        let client = client
            .clone()
            .xread_group_error(ReadPosition::Pending, connection_reset());

        let worker = StreamWorker::new(Arc::new(client.clone()), &config).unwrap();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(time::Duration::from_millis(200)).await;
            token.cancel();
        });

        tokio::time::timeout(time::Duration::from_secs(5), worker.run(&cancel))
            .await
            .expect("worker should keep retrying until cancelled")
            .unwrap();

        let reads = client
            .get_calls()
            .into_iter()
            .filter(|call| call.op == "xread_group")
            .count();
        assert!(reads > 1, "expected repeated reads, got {reads}");
    }

    #[test]
    fn test_retry_classification() {
        assert!(is_retryable(&connection_reset()));
        assert!(is_retryable(&StreamError::Timeout));

        let nogroup = redis::make_extension_error("NOGROUP".to_string(), None);
        assert!(!is_retryable(&StreamError::from(nogroup)));
        assert!(!is_retryable(&StreamError::NotFound));
        assert!(!is_retryable(&StreamError::Cancelled));
    }

    #[test]
    fn test_cancelled_ack_stops_cleanly() {
        let error = StreamError::AckFailed {
            stream: "stream-2".to_string(),
            acknowledged: vec!["stream-1".to_string()],
            source: Box::new(StreamError::Cancelled),
        };
        assert!(was_cancelled(&error));

        let error = StreamError::AckFailed {
            stream: "stream-2".to_string(),
            acknowledged: Vec::new(),
            source: Box::new(connection_reset()),
        };
        assert!(!was_cancelled(&error));
        assert!(is_retryable(&error));
    }

    #[test]
    fn test_busy_group_is_matched_by_error_code() {
        let detail = "Consumer Group name already exists".to_string();
        let busy = redis::make_extension_error("BUSYGROUP".to_string(), Some(detail));
        assert!(is_busy_group(&StreamError::from(busy)));

        // only the code counts, not the message text
        let detail = "BUSYGROUP mentioned in passing".to_string();
        let other = redis::make_extension_error("NOGROUP".to_string(), Some(detail));
        assert!(!is_busy_group(&StreamError::from(other)));
    }

    #[test]
    fn test_invalid_consumer_config_is_rejected() {
        let mut config = config("-1");
        config.batch_size = Some(0);

        let result = StreamWorker::new(Arc::new(MockStreamClient::new()), &config);
        assert!(matches!(
            result,
            Err(WorkerError::StreamError(StreamError::InvalidConfiguration(_)))
        ));
    }
}
