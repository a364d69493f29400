//! Remote activities over HTTP.
//!
//! Endpoint: POST <url> with a JSON envelope, JSON response body.
//! Failure mapping:
//! - connect errors, timeouts, 5xx and 429 are transient (retried)
//! - other 4xx responses are business failures

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;

use crate::domain::{TaskFailure, TaskResult};

use super::{Activity, ActivityContext};

/// Activity backed by an HTTP endpoint
pub struct HttpActivity {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

/// Request body sent to the endpoint
#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    instance_id: &'a str,
    task_id: u64,
    activity: &'a str,
    attempt: u32,
    input: &'a Value,
}

impl HttpActivity {
    /// Create a new activity client
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            token: None,
            client,
        })
    }

    /// Send a bearer token with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Classify a non-success status
pub fn failure_for_status(status: StatusCode, body: &str) -> TaskFailure {
    let message = format!("Activity endpoint returned {}: {}", status, body);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        TaskFailure::transient(message)
    } else {
        TaskFailure::business(message)
    }
}

#[async_trait]
impl Activity for HttpActivity {
    async fn invoke(&self, ctx: &ActivityContext, input: Value) -> TaskResult {
        let body = InvokeRequest {
            instance_id: &ctx.instance_id,
            task_id: ctx.task_id,
            activity: &ctx.activity_name,
            attempt: ctx.attempt,
            input: &input,
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", &ctx.idempotency_key)
            .json(&body);
        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TaskFailure::timeout(format!("Request to {} timed out", self.endpoint))
            } else {
                TaskFailure::transient(format!("Request to {} failed: {}", self.endpoint, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(failure_for_status(status, &text));
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| TaskFailure::payload(format!("Invalid response body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(failure_for_status(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(failure_for_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!failure_for_status(StatusCode::BAD_REQUEST, "").is_retryable());
        assert!(!failure_for_status(StatusCode::UNPROCESSABLE_ENTITY, "").is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let activity = HttpActivity::new("http://127.0.0.1:9/activity", Duration::from_secs(2)).unwrap();
        let ctx = ActivityContext {
            instance_id: "i1".to_string(),
            task_id: 0,
            activity_name: "Remote".to_string(),
            attempt: 1,
            idempotency_key: "i1:0:abc".to_string(),
        };

        let failure = activity.invoke(&ctx, Value::Null).await.unwrap_err();
        assert!(failure.is_retryable());
    }
}
