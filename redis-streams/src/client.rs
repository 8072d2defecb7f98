use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::{
    BlockPolicy, MaxLen, ReadPosition, StreamClient, StreamEntries, StreamEntry, StreamError,
    StreamValue, Values,
};

pub struct RedisStreamClient {
    client: redis::Client,
    config: ConnectionManagerConfig,
    connection: ConnectionManager,
    /// Created on the first blocking read and reused after that.
    blocking: OnceCell<ConnectionManager>,
}

impl RedisStreamClient {
    /// Create a new RedisStreamClient with no timeouts
    pub async fn new(addr: String) -> Result<RedisStreamClient, StreamError> {
        Self::with_config(addr, None, None).await
    }

    /// Create a new RedisStreamClient with full configuration control
    ///
    /// Connections are managed: after a dropped connection the failing command returns
    /// an error and the next one runs on a fresh connection.
    ///
    /// # Arguments
    /// * `addr` - Redis connection string
    /// * `response_timeout` - Optional timeout for command responses. `None` means no timeout.
    ///   Blocking group reads are subject to it too, so it must be longer than any
    ///   bounded [`BlockPolicy`] used with this client, and `BlockPolicy::Forever` reads
    ///   will end with [`StreamError::Timeout`] once it elapses.
    /// * `connection_timeout` - Optional timeout for establishing connections. `None` means no timeout.
    ///
    /// # Errors
    /// Returns `StreamError::InvalidConfiguration` if `Some(Duration::ZERO)` is passed - use `None` for no timeout instead.
    ///
    /// # Examples
    /// ```no_run
    /// use redis_streams::RedisStreamClient;
    /// use std::time::Duration;
    ///
    /// # async fn example() {
    /// let client = RedisStreamClient::with_config(
    ///     "redis://localhost:6379".to_string(),
    ///     Some(Duration::from_secs(30)),
    ///     Some(Duration::from_millis(5000)),
    /// ).await.unwrap();
    /// # }
    /// ```
    pub async fn with_config(
        addr: String,
        response_timeout: Option<Duration>,
        connection_timeout: Option<Duration>,
    ) -> Result<RedisStreamClient, StreamError> {
        let client = redis::Client::open(addr)?;

        // Validate that Duration::ZERO is not passed - use None instead
        if let Some(timeout) = response_timeout {
            if timeout.is_zero() {
                return Err(StreamError::InvalidConfiguration(
                    "Redis response timeout cannot be Duration::ZERO - use None for no timeout"
                        .to_string(),
                ));
            }
        }
        if let Some(timeout) = connection_timeout {
            if timeout.is_zero() {
                return Err(StreamError::InvalidConfiguration(
                    "Redis connection timeout cannot be Duration::ZERO - use None for no timeout"
                        .to_string(),
                ));
            }
        }

        let mut config = ConnectionManagerConfig::new();

        if let Some(timeout) = response_timeout {
            config = config.set_response_timeout(timeout);
        }

        if let Some(timeout) = connection_timeout {
            config = config.set_connection_timeout(timeout);
        }

        let connection = ConnectionManager::new_with_config(client.clone(), config.clone()).await?;

        Ok(RedisStreamClient {
            client,
            config,
            connection,
            blocking: OnceCell::new(),
        })
    }

    /// A blocked XREADGROUP holds up every command queued behind it on a multiplexed
    /// connection, so blocking reads share a connection of their own.
    async fn read_connection(&self, block: BlockPolicy) -> Result<ConnectionManager, StreamError> {
        if block == BlockPolicy::NoBlock {
            return Ok(self.connection.clone());
        }
        let connection = self.blocking.get_or_try_init(|| self.connect()).await?;
        Ok(connection.clone())
    }

    async fn connect(&self) -> Result<ConnectionManager, redis::RedisError> {
        ConnectionManager::new_with_config(self.client.clone(), self.config.clone()).await
    }
}

fn xadd_cmd(
    stream: &str,
    id: &str,
    values: Values,
    max_len: Option<MaxLen>,
    no_mkstream: bool,
) -> redis::Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream);
    if no_mkstream {
        cmd.arg("NOMKSTREAM");
    }
    match max_len {
        Some(MaxLen::Exact(n)) => {
            cmd.arg("MAXLEN").arg(n);
        }
        Some(MaxLen::Approx(n)) => {
            cmd.arg("MAXLEN").arg("~").arg(n);
        }
        None => {}
    }
    cmd.arg(id);
    for (field, value) in values {
        cmd.arg(field).arg(value.to_wire_bytes());
    }
    cmd
}

fn xread_group_cmd(
    group: &str,
    consumer: &str,
    streams: &[String],
    position: ReadPosition,
    block: BlockPolicy,
    count: Option<usize>,
) -> redis::Cmd {
    let mut cmd = redis::cmd("XREADGROUP");
    cmd.arg("GROUP").arg(group).arg(consumer);
    if let Some(count) = count {
        cmd.arg("COUNT").arg(count);
    }
    // BLOCK only affects new entries; a pending read always returns at once
    if position == ReadPosition::New {
        match block {
            BlockPolicy::Forever => {
                cmd.arg("BLOCK").arg(0);
            }
            BlockPolicy::Timeout(timeout) => {
                cmd.arg("BLOCK").arg(timeout.as_millis().max(1) as u64);
            }
            BlockPolicy::NoBlock => {}
        }
    }
    cmd.arg("STREAMS");
    for stream in streams {
        cmd.arg(stream);
    }
    for _ in streams {
        cmd.arg(position.as_id());
    }
    cmd
}

/// Parse an XREADGROUP reply. A nil reply means the read timed out with nothing new.
/// Entries deleted from the stream while still pending come back without fields.
fn parse_read_reply(reply: redis::Value) -> Result<Vec<StreamEntries>, StreamError> {
    let streams = match reply {
        redis::Value::Nil => return Ok(Vec::new()),
        // RESP2: [[stream, entries], ...]
        redis::Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                redis::Value::Array(pair) if pair.len() == 2 => {
                    let mut pair = pair.into_iter();
                    match (pair.next(), pair.next()) {
                        (Some(name), Some(entries)) => Ok((name, entries)),
                        _ => Err(unexpected("stream reply", "missing name or entries")),
                    }
                }
                other => Err(unexpected("stream reply", other)),
            })
            .collect::<Result<Vec<_>, _>>()?,
        // RESP3: {stream: entries, ...}
        redis::Value::Map(pairs) => pairs,
        other => return Err(unexpected("XREADGROUP reply", other)),
    };

    streams
        .into_iter()
        .map(|(name, entries)| {
            Ok(StreamEntries {
                stream: parse_string(name)?,
                entries: parse_entries(entries)?,
            })
        })
        .collect()
}

fn parse_entries(value: redis::Value) -> Result<Vec<StreamEntry>, StreamError> {
    let items = match value {
        redis::Value::Nil => return Ok(Vec::new()),
        redis::Value::Array(items) => items,
        other => return Err(unexpected("stream entries", other)),
    };

    items
        .into_iter()
        .map(|item| {
            let redis::Value::Array(parts) = item else {
                return Err(unexpected("stream entry", item));
            };
            let mut parts = parts.into_iter();
            let id = match parts.next() {
                Some(id) => parse_string(id)?,
                None => return Err(unexpected("stream entry", "missing id")),
            };
            let values = match parts.next() {
                None | Some(redis::Value::Nil) => Values::new(),
                Some(fields) => parse_fields(fields)?,
            };
            Ok(StreamEntry { id, values })
        })
        .collect()
}

fn parse_fields(value: redis::Value) -> Result<Values, StreamError> {
    let pairs: Vec<(redis::Value, redis::Value)> = match value {
        redis::Value::Array(flat) => {
            if flat.len() % 2 != 0 {
                return Err(unexpected("entry fields", "odd number of items"));
            }
            let mut flat = flat.into_iter();
            let mut pairs = Vec::new();
            while let (Some(field), Some(value)) = (flat.next(), flat.next()) {
                pairs.push((field, value));
            }
            pairs
        }
        redis::Value::Map(pairs) => pairs,
        other => return Err(unexpected("entry fields", other)),
    };

    pairs
        .into_iter()
        .map(|(field, value)| Ok((parse_string(field)?, StreamValue::from_redis_value(value)?)))
        .collect()
}

fn parse_string(value: redis::Value) -> Result<String, StreamError> {
    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes)
            .map_err(|e| StreamError::ParseError(format!("invalid utf-8: {e}"))),
        redis::Value::SimpleString(s) => Ok(s),
        other => Err(unexpected("string", other)),
    }
}

fn unexpected(what: &str, got: impl std::fmt::Debug) -> StreamError {
    StreamError::ParseError(format!("unexpected {what}: {got:?}"))
}

#[async_trait]
impl StreamClient for RedisStreamClient {
    async fn xadd(
        &self,
        stream: String,
        id: String,
        values: Values,
        max_len: Option<MaxLen>,
        no_mkstream: bool,
    ) -> Result<Option<String>, StreamError> {
        let mut conn = self.connection.clone();
        let id: Option<String> = xadd_cmd(&stream, &id, values, max_len, no_mkstream)
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn xread_group(
        &self,
        group: String,
        consumer: String,
        streams: Vec<String>,
        position: ReadPosition,
        block: BlockPolicy,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntries>, StreamError> {
        let block = match position {
            ReadPosition::Pending => BlockPolicy::NoBlock,
            ReadPosition::New => block,
        };
        let mut conn = self.read_connection(block).await?;
        let reply: redis::Value =
            xread_group_cmd(&group, &consumer, &streams, position, block, count)
                .query_async(&mut conn)
                .await?;
        parse_read_reply(reply)
    }

    async fn xack(
        &self,
        stream: String,
        group: String,
        ids: Vec<String>,
    ) -> Result<u64, StreamError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let acked: u64 = redis::cmd("XACK")
            .arg(&stream)
            .arg(&group)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;
        Ok(acked)
    }

    async fn xgroup_create(
        &self,
        stream: String,
        group: String,
        start_id: String,
        mkstream: bool,
    ) -> Result<(), StreamError> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(&stream).arg(&group).arg(&start_id);
        if mkstream {
            cmd.arg("MKSTREAM");
        }
        let mut conn = self.connection.clone();
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn xgroup_destroy(&self, stream: String, group: String) -> Result<bool, StreamError> {
        let mut conn = self.connection.clone();
        let destroyed: u64 = redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(&stream)
            .arg(&group)
            .query_async(&mut conn)
            .await?;
        Ok(destroyed > 0)
    }

    async fn del(&self, stream: String) -> Result<(), StreamError> {
        let mut conn = self.connection.clone();
        redis::cmd("DEL")
            .arg(&stream)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}
