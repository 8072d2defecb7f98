use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{StreamClient, StreamError, StreamValue, Values};

/// Trimming policy applied on every append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLen {
    /// Trim to exactly this many entries.
    Exact(usize),
    /// Trim to roughly this many entries, letting the server pick an efficient cut.
    Approx(usize),
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub stream: String,
    pub max_len: Option<MaxLen>,
    /// Refuse to create the stream if it does not exist yet.
    pub no_mkstream: bool,
}

impl ProducerConfig {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            max_len: None,
            no_mkstream: false,
        }
    }

    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(MaxLen::Exact(max_len));
        self
    }

    pub fn max_len_approx(mut self, max_len: usize) -> Self {
        self.max_len = Some(MaxLen::Approx(max_len));
        self
    }

    pub fn no_mkstream(mut self) -> Self {
        self.no_mkstream = true;
        self
    }

    fn validate(&self) -> Result<(), StreamError> {
        if self.stream.is_empty() {
            return Err(StreamError::InvalidConfiguration(
                "producer stream name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options for a single write. Fields accumulate, and repeating a field or the id
/// keeps the last value.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    id: Option<String>,
    values: Values,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit entry id. An empty id or `*` lets the server generate one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn field(mut self, field: impl Into<String>, value: impl Into<StreamValue>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    fn effective_id(&self) -> String {
        match self.id.as_deref() {
            None | Some("") => "*".to_string(),
            Some(id) => id.to_string(),
        }
    }
}

/// Appends entries to a single stream.
pub struct Producer {
    client: Arc<dyn StreamClient + Send + Sync>,
    config: ProducerConfig,
}

impl Producer {
    pub fn new(
        client: Arc<dyn StreamClient + Send + Sync>,
        config: ProducerConfig,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        Ok(Self { client, config })
    }

    pub fn stream(&self) -> &str {
        &self.config.stream
    }

    /// Append one entry and return its id.
    ///
    /// Errors from the store are returned as is; nothing is retried or buffered. Use an
    /// explicit id if the write has to be idempotent across retries.
    pub async fn write(
        &self,
        cancel: &CancellationToken,
        options: WriteOptions,
    ) -> Result<String, StreamError> {
        let id = options.effective_id();
        let append = self.client.xadd(
            self.config.stream.clone(),
            id,
            options.values,
            self.config.max_len,
            self.config.no_mkstream,
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            result = append => result?,
        };

        match result {
            Some(id) => {
                debug!(stream = %self.config.stream, id = %id, "appended entry");
                Ok(id)
            }
            None => Err(StreamError::NotFound),
        }
    }
}
