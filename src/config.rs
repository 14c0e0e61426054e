use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

/// Seconds a newly sent message stays invisible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "i64")]
pub struct Delay(u32);

impl Delay {
    pub const ZERO: Self = Self(0);

    pub fn new(seconds: i64) -> Result<Self, Error> {
        u32::try_from(seconds).map(Self).map_err(|_| {
            Error::invalid_parameter("delay must be between 0 and 4294967295 seconds")
        })
    }

    pub fn seconds(&self) -> u32 {
        self.0
    }

    pub fn as_millis(&self) -> i64 {
        i64::from(self.0) * 1000
    }
}

impl TryFrom<i64> for Delay {
    type Error = Error;

    fn try_from(seconds: i64) -> Result<Self, Self::Error> {
        Self::new(seconds)
    }
}

/// Seconds a leased message stays hidden from other readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "i64")]
pub struct VisibilityTimeout(u32);

impl VisibilityTimeout {
    pub fn new(seconds: i64) -> Result<Self, Error> {
        u32::try_from(seconds).map(Self).map_err(|_| {
            Error::invalid_parameter("visibility timeout must be between 0 and 4294967295 seconds")
        })
    }

    pub fn seconds(&self) -> u32 {
        self.0
    }

    pub fn as_millis(&self) -> i64 {
        i64::from(self.0) * 1000
    }
}

impl Default for VisibilityTimeout {
    fn default() -> Self {
        Self(30)
    }
}

impl TryFrom<i64> for VisibilityTimeout {
    type Error = Error;

    fn try_from(seconds: i64) -> Result<Self, Self::Error> {
        Self::new(seconds)
    }
}

/// What the consumer does with a message whose payload does not decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeFailurePolicy {
    /// Log the failure and keep draining.
    #[default]
    Skip,
    /// End the tick with the decode error.
    Abort,
}

/// Defaults applied by the queue client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub delay: Delay,
    pub visibility_timeout: VisibilityTimeout,
    pub check_message: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            delay: Delay::ZERO,
            visibility_timeout: VisibilityTimeout::default(),
            check_message: true,
        }
    }
}

impl QueueConfig {
    pub fn set_delay(&mut self, seconds: i64) -> Result<(), Error> {
        self.delay = Delay::new(seconds)?;
        Ok(())
    }

    pub fn set_visibility_timeout(&mut self, seconds: i64) -> Result<(), Error> {
        self.visibility_timeout = VisibilityTimeout::new(seconds)?;
        Ok(())
    }

    pub fn set_check_message(&mut self, check_message: bool) {
        self.check_message = check_message;
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,

    #[serde(default)]
    pub delay_seconds: Delay,
    #[serde(default)]
    pub visibility_timeout_seconds: VisibilityTimeout,
    #[serde(default = "default_true")]
    pub check_message: bool,

    #[serde(default = "default_request_queue")]
    pub request_queue: String,
    #[serde(default = "default_response_queue")]
    pub response_queue: Option<String>,
    #[serde(default = "default_true")]
    pub provision_queues: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_sample_every")]
    pub sample_every: u64,
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
    #[serde(default = "default_dispatch_capacity")]
    pub dispatch_capacity: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub decode_failure: DecodeFailurePolicy,

    pub load_test: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_request_queue() -> String {
    "market_request".to_owned()
}

fn default_response_queue() -> Option<String> {
    Some("market_response".to_owned())
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_sample_every() -> u64 {
    1000
}

fn default_dispatch_workers() -> usize {
    10
}

fn default_dispatch_capacity() -> usize {
    1024
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("LEASEQ_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref().filter(|path| !path.is_empty())
    }

    /// Response queue, with an empty value meaning responses are not sent.
    pub fn response_queue(&self) -> Option<&str> {
        self.response_queue.as_deref().filter(|name| !name.is_empty())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            delay: self.delay_seconds,
            visibility_timeout: self.visibility_timeout_seconds,
            check_message: self.check_message,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            delay_seconds: Delay::ZERO,
            visibility_timeout_seconds: VisibilityTimeout::default(),
            check_message: true,
            request_queue: default_request_queue(),
            response_queue: default_response_queue(),
            provision_queues: true,
            poll_interval_ms: default_poll_interval_ms(),
            sample_every: default_sample_every(),
            dispatch_workers: default_dispatch_workers(),
            dispatch_capacity: default_dispatch_capacity(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            decode_failure: DecodeFailurePolicy::Skip,
            load_test: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Result<Config, envy::Error> {
        envy::prefixed("LEASEQ_").from_iter::<_, Config>(
            vars.iter()
                .map(|(k, v)| (format!("LEASEQ_{k}"), v.to_string())),
        )
    }

    #[test]
    fn test_default_delay() {
        let config = QueueConfig::default();
        assert_eq!(config.delay.seconds(), 0);
    }

    #[test]
    fn test_negative_delay() {
        let mut config = QueueConfig::default();
        let err = config.set_delay(-1).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(config.delay, Delay::ZERO);
    }

    #[test]
    fn test_non_negative_delay() {
        let mut config = QueueConfig::default();

        config.set_delay(0).unwrap();
        assert_eq!(config.delay.seconds(), 0);

        config.set_delay(10).unwrap();
        assert_eq!(config.delay.seconds(), 10);
        assert_eq!(config.delay.as_millis(), 10_000);
    }

    #[test]
    fn test_default_visibility_timeout() {
        let config = QueueConfig::default();
        assert_eq!(config.visibility_timeout.seconds(), 30);
        assert!(config.check_message);
    }

    #[test]
    fn test_negative_visibility_timeout() {
        let mut config = QueueConfig::default();
        assert!(config.set_visibility_timeout(-1).unwrap_err().is_validation());
        assert!(VisibilityTimeout::new(-30).is_err());
    }

    #[test]
    fn test_non_negative_visibility_timeout() {
        let mut config = QueueConfig::default();

        config.set_visibility_timeout(0).unwrap();
        assert_eq!(config.visibility_timeout.seconds(), 0);

        config.set_visibility_timeout(10).unwrap();
        assert_eq!(config.visibility_timeout.seconds(), 10);
    }

    #[test]
    fn test_env_defaults_match_default_impl() {
        let config = from_vars(&[]).unwrap();
        let default = Config::default();

        assert_eq!(config.queue_config(), default.queue_config());
        assert_eq!(config.request_queue, default.request_queue);
        assert_eq!(config.response_queue(), Some("market_response"));
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.sample_every, 1000);
        assert_eq!(config.dispatch_workers, 10);
        assert_eq!(config.decode_failure, DecodeFailurePolicy::Skip);
        assert_eq!(config.db_path(), None);
    }

    #[test]
    fn test_env_overrides() {
        let config = from_vars(&[
            ("DELAY_SECONDS", "5"),
            ("VISIBILITY_TIMEOUT_SECONDS", "60"),
            ("CHECK_MESSAGE", "false"),
            ("RESPONSE_QUEUE", ""),
            ("DECODE_FAILURE", "abort"),
            ("LOAD_TEST", "3"),
        ])
        .unwrap();

        assert_eq!(config.delay_seconds.seconds(), 5);
        assert_eq!(config.visibility_timeout_seconds.seconds(), 60);
        assert!(!config.check_message);
        assert_eq!(config.response_queue(), None);
        assert_eq!(config.decode_failure, DecodeFailurePolicy::Abort);
        assert_eq!(config.load_test, Some(3));
    }

    #[test]
    fn test_out_of_range_seconds() {
        let too_long = i64::from(u32::MAX) + 1;

        let err = Delay::new(too_long).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("between 0 and 4294967295 seconds"));

        let err = VisibilityTimeout::new(too_long).unwrap_err();
        assert!(err.to_string().contains("between 0 and 4294967295 seconds"));

        assert_eq!(Delay::new(i64::from(u32::MAX)).unwrap().seconds(), u32::MAX);
    }

    #[test]
    fn test_env_rejects_negative_delay() {
        assert!(from_vars(&[("DELAY_SECONDS", "-1")]).is_err());
        assert!(from_vars(&[("VISIBILITY_TIMEOUT_SECONDS", "-5")]).is_err());
    }
}
