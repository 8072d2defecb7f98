use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use redis_streams::BlockPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "stream-worker")]
    pub group_name: NonEmptyString,

    #[envconfig(default = "worker")]
    pub consumer_name: NonEmptyString,

    /// Comma separated, in the order messages should be processed.
    pub streams: StreamList,

    /// 0 blocks until entries arrive, a positive value bounds the wait, a negative
    /// value polls without blocking.
    #[envconfig(default = "5000")]
    pub block_ms: i64,

    pub batch_size: Option<usize>,

    #[envconfig(default = "true")]
    pub create_groups: bool,

    pub response_timeout_ms: Option<EnvMsDuration>,

    #[envconfig(default = "5000")]
    pub connection_timeout_ms: EnvMsDuration,

    /// Pause between polls that found nothing, and before retrying after a transient error.
    #[envconfig(default = "100")]
    pub poll_interval_ms: EnvMsDuration,
}

impl Config {
    pub fn block(&self) -> BlockPolicy {
        BlockPolicy::from_millis(self.block_ms)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamList(pub Vec<String>);

impl FromStr for StreamList {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let streams: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|stream| !stream.is_empty())
            .map(str::to_owned)
            .collect();

        if streams.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(StreamList(streams))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_list_keeps_order() {
        let list: StreamList = "events, logs ,audit".parse().unwrap();
        assert_eq!(list.0, vec!["events", "logs", "audit"]);
    }

    #[test]
    fn test_stream_list_rejects_empty() {
        assert_eq!("".parse::<StreamList>(), Err(StringIsEmptyError));
        assert_eq!(" , ".parse::<StreamList>(), Err(StringIsEmptyError));
    }

    #[test]
    fn test_env_ms_duration() {
        let duration: EnvMsDuration = "250".parse().unwrap();
        assert_eq!(duration.0, time::Duration::from_millis(250));
        assert!("-1".parse::<EnvMsDuration>().is_err());
    }

    #[test]
    fn test_config_from_env_map() {
        let env = std::collections::HashMap::from([
            ("STREAMS".to_string(), "stream-1,stream-2".to_string()),
            ("BLOCK_MS".to_string(), "-1".to_string()),
            ("BATCH_SIZE".to_string(), "10".to_string()),
        ]);

        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.streams.0, vec!["stream-1", "stream-2"]);
        assert_eq!(config.block(), BlockPolicy::NoBlock);
        assert_eq!(config.batch_size, Some(10));
        assert_eq!(config.group_name.as_str(), "stream-worker");
        assert!(config.create_groups);
        assert!(config.response_timeout_ms.is_none());
    }
}
