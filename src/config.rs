//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::runner::retry::BackoffPolicy;

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Identifies this runner process in logs.
    pub runner_id: String,
    /// How often the poller looks for claimable jobs.
    pub poll_interval: Duration,
    /// Maximum number of jobs fetched per tick.
    pub batch_size: usize,
    /// Lifetime of a freshly claimed or renewed lease.
    pub lease_duration: Duration,
    /// Delay schedule between task retry attempts.
    pub backoff: BackoffPolicy,
    /// Price of a single token, used to estimate job cost.
    pub cost_per_token: Decimal,
    /// Roles granted to the execution identity when the job names none.
    pub default_roles: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runner_id: format!("runner-{}", std::process::id()),
            poll_interval: Duration::from_secs(10),
            batch_size: 10,
            lease_duration: Duration::from_secs(120), // 2 minutes
            backoff: BackoffPolicy::default(),
            cost_per_token: dec!(0.000002),
            default_roles: vec!["automation".to_string()],
        }
    }
}

impl RunnerConfig {
    /// Build config from `AUTOMATION_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let runner_id = std::env::var("AUTOMATION_RUNNER_ID").unwrap_or(defaults.runner_id);
        let poll_interval = env_parse::<u64>("AUTOMATION_POLL_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval);
        let batch_size = env_parse::<usize>("AUTOMATION_BATCH_SIZE")?.unwrap_or(defaults.batch_size);
        let lease_duration = env_parse::<u64>("AUTOMATION_LEASE_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease_duration);
        let cost_per_token =
            env_parse::<Decimal>("AUTOMATION_COST_PER_TOKEN")?.unwrap_or(defaults.cost_per_token);

        let default_roles = match std::env::var("AUTOMATION_DEFAULT_ROLES") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => defaults.default_roles,
        };

        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AUTOMATION_BATCH_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if lease_duration.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "AUTOMATION_LEASE_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            runner_id,
            poll_interval,
            batch_size,
            lease_duration,
            backoff: defaults.backoff,
            cost_per_token,
            default_roles,
        })
    }
}

/// Configuration for the HTTP task executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Endpoint that receives task execution requests.
    pub endpoint: String,
    /// Optional bearer token sent with every request.
    pub api_key: Option<SecretString>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl ExecutorConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = std::env::var("AUTOMATION_EXECUTOR_URL")
            .map_err(|_| ConfigError::MissingEnvVar("AUTOMATION_EXECUTOR_URL".to_string()))?;
        let api_key = std::env::var("AUTOMATION_EXECUTOR_API_KEY")
            .ok()
            .map(SecretString::from);
        let timeout = env_parse::<u64>("AUTOMATION_EXECUTOR_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));

        Ok(Self {
            endpoint,
            api_key,
            timeout,
        })
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RunnerConfig::default();
        assert_eq!(config.lease_duration, Duration::from_secs(120));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.backoff.cap, Duration::from_secs(30));
    }

    #[test]
    fn env_parse_reports_key_on_error() {
        // SAFETY: test-local variable name, not read by any other test.
        unsafe { std::env::set_var("AUTOMATION_TEST_BAD_NUMBER", "abc") };
        let err = env_parse::<u64>("AUTOMATION_TEST_BAD_NUMBER").unwrap_err();
        assert!(err.to_string().contains("AUTOMATION_TEST_BAD_NUMBER"));
        unsafe { std::env::remove_var("AUTOMATION_TEST_BAD_NUMBER") };
    }

    #[test]
    fn env_parse_missing_is_none() {
        let value = env_parse::<u64>("AUTOMATION_TEST_DEFINITELY_UNSET").unwrap();
        assert!(value.is_none());
    }
}
