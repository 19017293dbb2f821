//! HTTP task executor.
//!
//! Posts each [`TaskRequest`] as JSON to a completion service and expects a
//! [`TaskOutcome`] back.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::ExecutorConfig;
use crate::error::ExecutorError;
use crate::executor::{TaskExecutor, TaskOutcome, TaskRequest};

pub struct HttpTaskExecutor {
    endpoint: String,
    api_key: Option<SecretString>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpTaskExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExecutorError::Http(format!("Failed to build client: {e}")))?;

        Ok(Self {
            endpoint: config.endpoint,
            api_key: config.api_key,
            timeout: config.timeout,
            client,
        })
    }
}

#[async_trait]
impl TaskExecutor for HttpTaskExecutor {
    async fn execute(&self, request: &TaskRequest) -> Result<TaskOutcome, ExecutorError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutorError::Timeout {
                    task_id: request.task_id,
                    timeout: self.timeout,
                }
            } else {
                ExecutorError::Http(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExecutorError::Failed {
                task_id: request.task_id,
                reason: format!("executor returned {status}: {body}"),
            });
        }

        let outcome = resp
            .json::<TaskOutcome>()
            .await
            .map_err(|e| ExecutorError::InvalidResponse(e.to_string()))?;

        tracing::debug!(
            task_id = %request.task_id,
            attempt = request.attempt,
            status = ?outcome.status,
            tokens = outcome.tokens_used,
            "Executor responded"
        );
        Ok(outcome)
    }
}
