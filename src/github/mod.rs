//! GitHub write surface consumed by the outbox.
//!
//! The trait is the seam: the outbox dispatches typed writes against it and
//! classifies failures for retry scheduling, while tests substitute scripted
//! writers. The octocrab implementation paces outbound calls with a direct
//! rate limiter.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Jitter, Quota, RateLimiter};
use octocrab::params::repos::Reference;
use octocrab::Octocrab;
use serde_json::Value;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Structured result handles for a created or updated GitHub resource.
#[derive(Debug, Clone, Default)]
pub struct WriteHandles {
    pub id: Option<String>,
    pub node_id: Option<String>,
    pub url: Option<String>,
    pub number: Option<i64>,
}

#[derive(Debug, Error)]
pub enum GitHubWriteError {
    #[error("github api error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("github rate limit exceeded")]
    RateLimited,

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl GitHubWriteError {
    /// Retryable: rate limits, server errors, network trouble. Permanent:
    /// auth/404/validation failures and reserved kinds.
    pub fn is_retryable(&self) -> bool {
        match self {
            GitHubWriteError::Api { status, .. } => *status == 429 || *status >= 500,
            GitHubWriteError::RateLimited | GitHubWriteError::Network(_) => true,
            GitHubWriteError::InvalidPayload(_) | GitHubWriteError::NotImplemented(_) => false,
        }
    }
}

/// Typed wrappers around the GitHub write endpoints the outbox dispatches
/// to. Results carry stable ids (node ids where GitHub provides them).
#[async_trait]
pub trait GitHubWriter: Send + Sync {
    async fn create_comment(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<WriteHandles, GitHubWriteError>;

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        head: &str,
        base: &str,
        body: Option<&str>,
    ) -> Result<WriteHandles, GitHubWriteError>;

    async fn create_check_run(
        &self,
        owner: &str,
        repo: &str,
        name: &str,
        head_sha: &str,
        status: Option<&str>,
        conclusion: Option<&str>,
    ) -> Result<WriteHandles, GitHubWriteError>;

    async fn update_check_run(
        &self,
        owner: &str,
        repo: &str,
        check_run_id: u64,
        status: Option<&str>,
        conclusion: Option<&str>,
    ) -> Result<WriteHandles, GitHubWriteError>;

    async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        from_sha: &str,
    ) -> Result<WriteHandles, GitHubWriteError>;
}

/// Octocrab-backed writer with governor pacing. GitHub allows 5000
/// authenticated requests per hour; one per second with a small burst stays
/// comfortably inside that while the backoff layer absorbs the rest.
pub struct OctocrabWriter {
    octocrab: Octocrab,
    limiter: DefaultDirectRateLimiter,
}

impl OctocrabWriter {
    pub fn new(token: String) -> Result<Self, octocrab::Error> {
        let quota = Quota::per_second(NonZeroU32::new(1).expect("nonzero"))
            .allow_burst(NonZeroU32::new(10).expect("nonzero"));
        let octocrab = Octocrab::builder().personal_token(token).build()?;
        Ok(Self {
            octocrab,
            limiter: RateLimiter::direct(quota),
        })
    }

    async fn throttle(&self) {
        self.limiter
            .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(100)))
            .await;
        debug!("dispatching GitHub write");
    }
}

fn map_octocrab_error(err: octocrab::Error) -> GitHubWriteError {
    match err {
        octocrab::Error::GitHub { source, .. } => {
            let status = source.status_code.as_u16();
            if status == 429 {
                GitHubWriteError::RateLimited
            } else {
                GitHubWriteError::Api {
                    status,
                    message: source.message,
                }
            }
        }
        other => GitHubWriteError::Network(other.to_string()),
    }
}

fn handles_from_value(value: &Value) -> WriteHandles {
    WriteHandles {
        id: value.get("id").map(|v| v.to_string()),
        node_id: value
            .get("node_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        url: value
            .get("html_url")
            .and_then(Value::as_str)
            .map(str::to_string),
        number: value.get("number").and_then(Value::as_i64),
    }
}

#[async_trait]
impl GitHubWriter for OctocrabWriter {
    async fn create_comment(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<WriteHandles, GitHubWriteError> {
        self.throttle().await;
        let comment = self
            .octocrab
            .issues(owner, repo)
            .create_comment(issue_number, body)
            .await
            .map_err(map_octocrab_error)?;
        Ok(WriteHandles {
            id: Some(comment.id.to_string()),
            node_id: Some(comment.node_id),
            url: Some(comment.html_url.to_string()),
            number: None,
        })
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        head: &str,
        base: &str,
        body: Option<&str>,
    ) -> Result<WriteHandles, GitHubWriteError> {
        self.throttle().await;
        let pr = self
            .octocrab
            .pulls(owner, repo)
            .create(title, head, base)
            .body(body.unwrap_or_default())
            .send()
            .await
            .map_err(map_octocrab_error)?;
        Ok(WriteHandles {
            id: Some(pr.id.to_string()),
            node_id: pr.node_id.clone(),
            url: pr.html_url.as_ref().map(|u| u.to_string()),
            number: Some(pr.number as i64),
        })
    }

    async fn create_check_run(
        &self,
        owner: &str,
        repo: &str,
        name: &str,
        head_sha: &str,
        status: Option<&str>,
        conclusion: Option<&str>,
    ) -> Result<WriteHandles, GitHubWriteError> {
        self.throttle().await;
        let mut body = serde_json::json!({ "name": name, "head_sha": head_sha });
        if let Some(status) = status {
            body["status"] = Value::String(status.to_string());
        }
        if let Some(conclusion) = conclusion {
            body["conclusion"] = Value::String(conclusion.to_string());
        }
        let created: Value = self
            .octocrab
            .post(format!("/repos/{owner}/{repo}/check-runs"), Some(&body))
            .await
            .map_err(map_octocrab_error)?;
        Ok(handles_from_value(&created))
    }

    async fn update_check_run(
        &self,
        owner: &str,
        repo: &str,
        check_run_id: u64,
        status: Option<&str>,
        conclusion: Option<&str>,
    ) -> Result<WriteHandles, GitHubWriteError> {
        self.throttle().await;
        let mut body = serde_json::json!({});
        if let Some(status) = status {
            body["status"] = Value::String(status.to_string());
        }
        if let Some(conclusion) = conclusion {
            body["conclusion"] = Value::String(conclusion.to_string());
        }
        let updated: Value = self
            .octocrab
            .patch(
                format!("/repos/{owner}/{repo}/check-runs/{check_run_id}"),
                Some(&body),
            )
            .await
            .map_err(map_octocrab_error)?;
        Ok(handles_from_value(&updated))
    }

    async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        from_sha: &str,
    ) -> Result<WriteHandles, GitHubWriteError> {
        self.throttle().await;
        let created = self
            .octocrab
            .repos(owner, repo)
            .create_ref(&Reference::Branch(branch.to_string()), from_sha)
            .await
            .map_err(map_octocrab_error)?;
        Ok(WriteHandles {
            id: None,
            node_id: Some(created.node_id),
            url: None,
            number: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert!(GitHubWriteError::Api {
            status: 500,
            message: "boom".into()
        }
        .is_retryable());
        assert!(GitHubWriteError::Api {
            status: 429,
            message: "slow down".into()
        }
        .is_retryable());
        assert!(GitHubWriteError::RateLimited.is_retryable());
        assert!(GitHubWriteError::Network("reset".into()).is_retryable());
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [401u16, 403, 404, 422] {
            assert!(!GitHubWriteError::Api {
                status,
                message: "no".into()
            }
            .is_retryable());
        }
        assert!(!GitHubWriteError::InvalidPayload("bad".into()).is_retryable());
        assert!(!GitHubWriteError::NotImplemented("label".into()).is_retryable());
    }
}
