use std::{collections::HashSet, sync::Arc, time::Duration};

use serde::Deserialize;

use crate::core::{retry::DEFAULT_RETRY_CODES, status::Code};

pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_TOTAL_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_INITIAL_RETRY_DELAY_MS: u64 = 10;
pub const DEFAULT_RETRY_DELAY_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 60_000;
pub const DEFAULT_REFRESH_AHEAD_MS: u64 = 1_000;

/// Retry and deadline policy for one query execution.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub total_timeout_ms: u64,
    pub initial_retry_delay_ms: u64,
    pub retry_delay_multiplier: f64,
    pub max_retry_delay_ms: u64,
    pub retry_codes: HashSet<Code>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            total_timeout_ms: DEFAULT_TOTAL_TIMEOUT_MS,
            initial_retry_delay_ms: DEFAULT_INITIAL_RETRY_DELAY_MS,
            retry_delay_multiplier: DEFAULT_RETRY_DELAY_MULTIPLIER,
            max_retry_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
            retry_codes: DEFAULT_RETRY_CODES.iter().copied().collect(),
        }
    }
}

impl RetryOptions {
    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_initial_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_retry_codes(mut self, codes: impl IntoIterator<Item = Code>) -> Self {
        self.retry_codes = codes.into_iter().collect();
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreparedStatementOptions {
    /// How long before `valid_until` a background refresh is started.
    pub refresh_ahead_ms: u64,
}

impl Default for PreparedStatementOptions {
    fn default() -> Self {
        Self {
            refresh_ahead_ms: DEFAULT_REFRESH_AHEAD_MS,
        }
    }
}

impl PreparedStatementOptions {
    pub fn refresh_ahead(&self) -> Duration {
        Duration::from_millis(self.refresh_ahead_ms)
    }
}

/// Validates a completed batch against the checksum the server sent for it.
pub type ChecksumValidator = Arc<dyn Fn(&[u8], u32) -> bool + Send + Sync>;

pub fn crc32c_validator() -> ChecksumValidator {
    Arc::new(|batch, expected| crc32c::crc32c(batch) == expected)
}

#[derive(Clone)]
pub struct ClientOptions {
    pub instance_name: String,
    pub app_profile_id: Option<String>,
    pub retry: RetryOptions,
    pub prepared_statement: PreparedStatementOptions,
    pub checksum_validator: ChecksumValidator,
}

impl ClientOptions {
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            app_profile_id: None,
            retry: RetryOptions::default(),
            prepared_statement: PreparedStatementOptions::default(),
            checksum_validator: crc32c_validator(),
        }
    }

    pub fn with_app_profile(mut self, app_profile_id: impl Into<String>) -> Self {
        self.app_profile_id = Some(app_profile_id.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_prepared_statement(mut self, options: PreparedStatementOptions) -> Self {
        self.prepared_statement = options;
        self
    }

    pub fn with_checksum_validator(mut self, validator: ChecksumValidator) -> Self {
        self.checksum_validator = validator;
        self
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("instance_name", &self.instance_name)
            .field("app_profile_id", &self.app_profile_id)
            .field("retry", &self.retry)
            .field("prepared_statement", &self.prepared_statement)
            .finish_non_exhaustive()
    }
}
