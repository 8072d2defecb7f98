use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Message, ReadPosition, StreamClient, StreamEntries, StreamEntry, StreamError};

/// How long the new-entries pass of a read waits for data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockPolicy {
    /// Wait until at least one entry arrives or the read is cancelled.
    #[default]
    Forever,
    /// Wait up to this long, then return whatever is available.
    Timeout(Duration),
    /// Return immediately.
    NoBlock,
}

impl BlockPolicy {
    /// Map the conventional millisecond setting: 0 blocks forever, a positive value
    /// bounds the wait and a negative value disables blocking.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => BlockPolicy::Forever,
            ms if ms > 0 => BlockPolicy::Timeout(Duration::from_millis(ms.unsigned_abs())),
            _ => BlockPolicy::NoBlock,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group: String,
    pub consumer: String,
    /// Subscribed streams. Their order is the order messages are returned in.
    pub streams: Vec<String>,
    pub block: BlockPolicy,
    /// Maximum entries returned per stream and pass.
    pub count: Option<usize>,
}

impl ConsumerConfig {
    pub fn new(group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            streams: Vec::new(),
            block: BlockPolicy::default(),
            count: None,
        }
    }

    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.streams.push(stream.into());
        self
    }

    pub fn block(mut self, block: BlockPolicy) -> Self {
        self.block = block;
        self
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    fn validate(&self) -> Result<(), StreamError> {
        if self.group.is_empty() {
            return Err(StreamError::InvalidConfiguration(
                "consumer group name cannot be empty".to_string(),
            ));
        }
        if self.consumer.is_empty() {
            return Err(StreamError::InvalidConfiguration(
                "consumer name cannot be empty".to_string(),
            ));
        }
        if self.streams.is_empty() {
            return Err(StreamError::InvalidConfiguration(
                "consumer must subscribe to at least one stream".to_string(),
            ));
        }
        for (i, stream) in self.streams.iter().enumerate() {
            if stream.is_empty() {
                return Err(StreamError::InvalidConfiguration(
                    "stream name cannot be empty".to_string(),
                ));
            }
            if self.streams[..i].contains(stream) {
                return Err(StreamError::InvalidConfiguration(format!(
                    "stream {stream} is subscribed more than once"
                )));
            }
        }
        if self.count == Some(0) {
            return Err(StreamError::InvalidConfiguration(
                "read count must be positive".to_string(),
            ));
        }
        if self.block == BlockPolicy::Timeout(Duration::ZERO) {
            return Err(StreamError::InvalidConfiguration(
                "block timeout cannot be Duration::ZERO - use BlockPolicy::Forever or NoBlock"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Reads a set of streams as one member of a consumer group.
///
/// The consumer keeps no state between calls: everything it knows about delivery lives
/// in the group's pending entries list on the server. A fresh `Consumer` with the same
/// group and consumer name picks up exactly where a previous one left off.
pub struct Consumer {
    client: Arc<dyn StreamClient + Send + Sync>,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(
        client: Arc<dyn StreamClient + Send + Sync>,
        config: ConsumerConfig,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Read the next batch of messages.
    ///
    /// Entries already delivered to this consumer but never acknowledged come back
    /// first. Streams with nothing pending are then read for new entries, blocking
    /// according to the configured [`BlockPolicy`] only when nothing was pending at all.
    ///
    /// Messages are ordered by subscription order, then by entry id. Cancelling returns
    /// [`StreamError::Cancelled`] and drops anything already fetched.
    pub async fn read(&self, cancel: &CancellationToken) -> Result<Vec<Message>, StreamError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StreamError::Cancelled),
            result = self.read_batch() => result,
        }
    }

    async fn read_batch(&self) -> Result<Vec<Message>, StreamError> {
        let mut by_stream = self
            .read_pass(
                self.config.streams.clone(),
                ReadPosition::Pending,
                BlockPolicy::NoBlock,
            )
            .await?;

        let idle: Vec<String> = self
            .config
            .streams
            .iter()
            .filter(|stream| by_stream.get(*stream).is_none_or(|e| e.is_empty()))
            .cloned()
            .collect();
        let pending = self.config.streams.len() - idle.len();

        debug!(
            group = %self.config.group,
            consumer = %self.config.consumer,
            pending_streams = pending,
            "read pending entries"
        );

        if !idle.is_empty() {
            let block = if pending == 0 {
                self.config.block
            } else {
                BlockPolicy::NoBlock
            };
            let new_entries = self.read_pass(idle, ReadPosition::New, block).await?;
            by_stream.extend(new_entries);
        }

        let mut messages = Vec::new();
        for stream in &self.config.streams {
            if let Some(entries) = by_stream.remove(stream) {
                messages.extend(entries.into_iter().map(|entry| Message::new(stream, entry)));
            }
        }

        debug!(
            group = %self.config.group,
            consumer = %self.config.consumer,
            count = messages.len(),
            "read batch"
        );

        Ok(messages)
    }

    async fn read_pass(
        &self,
        streams: Vec<String>,
        position: ReadPosition,
        block: BlockPolicy,
    ) -> Result<HashMap<String, Vec<StreamEntry>>, StreamError> {
        let reply = self
            .client
            .xread_group(
                self.config.group.clone(),
                self.config.consumer.clone(),
                streams,
                position,
                block,
                self.config.count,
            )
            .await?;

        Ok(reply
            .into_iter()
            .map(|StreamEntries { stream, entries }| (stream, entries))
            .collect())
    }

    /// Acknowledge processed messages, one acknowledge per stream.
    ///
    /// If a stream fails, the error names it along with the streams already
    /// acknowledged; those stay acknowledged. Acknowledging an entry that is no longer
    /// pending is not an error.
    pub async fn ack(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
    ) -> Result<(), StreamError> {
        let mut acknowledged: Vec<String> = Vec::new();

        for (stream, ids) in group_by_stream(messages) {
            let xack = self
                .client
                .xack(stream.clone(), self.config.group.clone(), ids);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StreamError::Cancelled),
                result = xack => result,
            };

            match result {
                Ok(count) => {
                    debug!(
                        stream = %stream,
                        group = %self.config.group,
                        count,
                        "acknowledged entries"
                    );
                    acknowledged.push(stream);
                }
                Err(err) => {
                    return Err(StreamError::AckFailed {
                        stream,
                        acknowledged,
                        source: Box::new(err),
                    })
                }
            }
        }

        Ok(())
    }
}

/// Ids per stream, streams in order of first appearance.
fn group_by_stream(messages: &[Message]) -> Vec<(String, Vec<String>)> {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for msg in messages {
        let i = *index.entry(msg.stream.as_str()).or_insert_with(|| {
            groups.push((msg.stream.clone(), Vec::new()));
            groups.len() - 1
        });
        groups[i].1.push(msg.id.clone());
    }

    groups
}
