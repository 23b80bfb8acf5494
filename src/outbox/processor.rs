use chrono::Utc;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{claim_write, mark_write_completed, mark_write_failed, GithubWrite, WRITE_BRANCH,
    WRITE_CHECK_RUN, WRITE_COMMENT, WRITE_PULL_REQUEST};
use crate::error::CoreResult;
use crate::github::{GitHubWriteError, GitHubWriter, WriteHandles};

const BACKOFF_CAP: Duration = Duration::from_secs(60);
const BACKOFF_JITTER: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub limit: i64,
    pub run_id: Option<String>,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            limit: 20,
            run_id: None,
            max_retries: 5,
            base_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Default)]
pub struct ProcessReport {
    pub fetched: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped_backoff: usize,
    pub skipped_claim: usize,
}

/// Exponential backoff with ±30% jitter: `base * 2^retry_count`, capped at
/// 60 seconds.
pub fn backoff_delay(retry_count: u32, base: Duration) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(retry_count)).min(BACKOFF_CAP);
    let jitter = rand::rng().random_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
    exp.mul_f64(1.0 + jitter).min(BACKOFF_CAP)
}

/// Drain eligible outbox rows: claim by CAS, dispatch to the GitHub writer,
/// settle as completed or failed. Failed rows inside their backoff window
/// are left for a later sweep.
pub async fn process_outbox(
    pool: &SqlitePool,
    writer: &dyn GitHubWriter,
    opts: &ProcessOptions,
) -> CoreResult<ProcessReport> {
    let candidates = fetch_candidates(pool, opts).await?;
    let mut report = ProcessReport {
        fetched: candidates.len(),
        ..ProcessReport::default()
    };

    for write in candidates {
        if write.status == super::WriteStatus::Failed {
            let delay = backoff_delay(write.retry_count as u32, opts.base_backoff);
            let eligible_at = write.updated_at
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            if Utc::now() < eligible_at {
                report.skipped_backoff += 1;
                continue;
            }
        }

        if !claim_write(pool, &write.github_write_id).await? {
            // Another worker won the CAS.
            report.skipped_claim += 1;
            continue;
        }

        match dispatch(writer, &write).await {
            Ok(handles) => {
                mark_write_completed(pool, &write.github_write_id, &handles).await?;
                info!(
                    github_write_id = %write.github_write_id,
                    kind = %write.kind,
                    "outbox write delivered"
                );
                report.completed += 1;
            }
            Err(err) => {
                let permanent = !err.is_retryable();
                if permanent {
                    warn!(
                        github_write_id = %write.github_write_id,
                        kind = %write.kind,
                        error = %err,
                        "outbox write failed permanently"
                    );
                } else {
                    debug!(
                        github_write_id = %write.github_write_id,
                        retry_count = write.retry_count + 1,
                        error = %err,
                        "outbox write failed, will retry"
                    );
                }
                mark_write_failed(
                    pool,
                    &write.github_write_id,
                    &err.to_string(),
                    permanent,
                    opts.max_retries,
                )
                .await?;
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

async fn fetch_candidates(
    pool: &SqlitePool,
    opts: &ProcessOptions,
) -> CoreResult<Vec<GithubWrite>> {
    let rows = sqlx::query_as::<_, GithubWrite>(&format!(
        r#"
        SELECT {columns} FROM github_writes
        WHERE status IN ('queued', 'failed')
          AND retry_count < ?1
          AND (?2 IS NULL OR run_id = ?2)
        ORDER BY created_at ASC
        LIMIT ?3
        "#,
        columns = super::WRITE_COLUMNS,
    ))
    .bind(opts.max_retries as i64)
    .bind(&opts.run_id)
    .bind(opts.limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    owner: String,
    repo: String,
    issue_number: u64,
    body: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    owner: String,
    repo: String,
    title: String,
    head: String,
    base: String,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckRunPayload {
    owner: String,
    repo: String,
    #[serde(default)]
    check_run_id: Option<u64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    head_sha: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BranchPayload {
    owner: String,
    repo: String,
    branch: String,
    from_sha: String,
}

fn parse_payload<T: DeserializeOwned>(write: &GithubWrite) -> Result<T, GitHubWriteError> {
    serde_json::from_str(&write.payload)
        .map_err(|e| GitHubWriteError::InvalidPayload(format!("{} payload: {e}", write.kind)))
}

/// Route a claimed write to the GitHub client by kind. Reserved kinds fail
/// cleanly as not-implemented so they never become retry loops.
async fn dispatch(
    writer: &dyn GitHubWriter,
    write: &GithubWrite,
) -> Result<WriteHandles, GitHubWriteError> {
    match write.kind.as_str() {
        WRITE_COMMENT => {
            let p: CommentPayload = parse_payload(write)?;
            writer
                .create_comment(&p.owner, &p.repo, p.issue_number, &p.body)
                .await
        }
        WRITE_PULL_REQUEST => {
            let p: PullRequestPayload = parse_payload(write)?;
            writer
                .create_pull_request(&p.owner, &p.repo, &p.title, &p.head, &p.base, p.body.as_deref())
                .await
        }
        WRITE_CHECK_RUN => {
            let p: CheckRunPayload = parse_payload(write)?;
            match p.check_run_id {
                Some(check_run_id) => {
                    writer
                        .update_check_run(
                            &p.owner,
                            &p.repo,
                            check_run_id,
                            p.status.as_deref(),
                            p.conclusion.as_deref(),
                        )
                        .await
                }
                None => {
                    let name = p.name.ok_or_else(|| {
                        GitHubWriteError::InvalidPayload("check_run payload missing name".into())
                    })?;
                    let head_sha = p.head_sha.ok_or_else(|| {
                        GitHubWriteError::InvalidPayload(
                            "check_run payload missing head_sha".into(),
                        )
                    })?;
                    writer
                        .create_check_run(
                            &p.owner,
                            &p.repo,
                            &name,
                            &head_sha,
                            p.status.as_deref(),
                            p.conclusion.as_deref(),
                        )
                        .await
                }
            }
        }
        WRITE_BRANCH => {
            let p: BranchPayload = parse_payload(write)?;
            writer
                .create_branch(&p.owner, &p.repo, &p.branch, &p.from_sha)
                .await
        }
        reserved @ (super::WRITE_LABEL | super::WRITE_REVIEW | super::WRITE_PROJECT_FIELD_UPDATE) => {
            Err(GitHubWriteError::NotImplemented(format!(
                "write kind {reserved} is reserved"
            )))
        }
        unknown => Err(GitHubWriteError::InvalidPayload(format!(
            "unknown write kind {unknown}"
        ))),
    }
}
