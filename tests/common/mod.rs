//! Shared harness for integration tests: in-memory database with the real
//! migrations, seeded runs, and a scripted GitHub writer.
#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::Mutex;

use conductor::github::{GitHubWriteError, GitHubWriter, WriteHandles};
use conductor::store::artifacts::{self, NewArtifact, ValidationStatus};
use conductor::store::runs::{self, NewRun, Run};
use conductor::store::tasks;

pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations apply");
    pool
}

/// Seed one task with one pending run.
pub async fn seed_run(pool: &SqlitePool) -> Run {
    seed_run_for_project(pool, "project-1", "repo-1").await
}

pub async fn seed_run_for_project(pool: &SqlitePool, project_id: &str, repo_id: &str) -> Run {
    let mut tx = pool.begin().await.unwrap();
    let task = tasks::create_task(&mut tx, project_id, repo_id, "Fix flaky retry handling")
        .await
        .unwrap();
    let run = runs::create_run(
        &mut tx,
        NewRun {
            task_id: task.task_id.clone(),
            project_id: project_id.to_string(),
            repo_id: repo_id.to_string(),
            base_branch: "main".to_string(),
            branch: None,
        },
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    run
}

/// Seed a second run on an existing task.
pub async fn seed_sibling_run(pool: &SqlitePool, sibling_of: &Run) -> Run {
    let mut tx = pool.begin().await.unwrap();
    let run = runs::create_run(
        &mut tx,
        NewRun {
            task_id: sibling_of.task_id.clone(),
            project_id: sibling_of.project_id.clone(),
            repo_id: sibling_of.repo_id.clone(),
            base_branch: "main".to_string(),
            branch: None,
        },
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    run
}

/// Store a validated artifact, the only kind gate evaluation can see.
pub async fn valid_artifact(
    pool: &SqlitePool,
    run_id: &str,
    artifact_type: &str,
    content: &str,
    source_tool_invocation_id: Option<&str>,
) -> conductor::store::Artifact {
    let mut tx = pool.begin().await.unwrap();
    let artifact = artifacts::create_artifact(
        &mut tx,
        NewArtifact {
            run_id: run_id.to_string(),
            artifact_type: artifact_type.to_string(),
            content_markdown: Some(content.to_string()),
            blob_ref: None,
            source_tool_invocation_id: source_tool_invocation_id.map(str::to_string),
            created_by: "agent".to_string(),
        },
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    artifacts::set_validation_status(pool, &artifact.artifact_id, ValidationStatus::Valid)
        .await
        .unwrap();
    artifact
}

/// GitHub writer with a scripted response queue, recording every dispatch.
#[derive(Default)]
pub struct MockWriter {
    responses: Mutex<VecDeque<Result<WriteHandles, GitHubWriteError>>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, handles: WriteHandles) {
        self.responses.lock().unwrap().push_back(Ok(handles));
    }

    pub fn push_err(&self, err: GitHubWriteError) {
        self.responses.lock().unwrap().push_back(Err(err));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next(&self, call: &str) -> Result<WriteHandles, GitHubWriteError> {
        self.calls.lock().unwrap().push(call.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(WriteHandles::default()))
    }
}

#[async_trait]
impl GitHubWriter for MockWriter {
    async fn create_comment(
        &self,
        _owner: &str,
        _repo: &str,
        issue_number: u64,
        _body: &str,
    ) -> Result<WriteHandles, GitHubWriteError> {
        self.next(&format!("comment:{issue_number}"))
    }

    async fn create_pull_request(
        &self,
        _owner: &str,
        _repo: &str,
        title: &str,
        _head: &str,
        _base: &str,
        _body: Option<&str>,
    ) -> Result<WriteHandles, GitHubWriteError> {
        self.next(&format!("pull_request:{title}"))
    }

    async fn create_check_run(
        &self,
        _owner: &str,
        _repo: &str,
        name: &str,
        _head_sha: &str,
        _status: Option<&str>,
        _conclusion: Option<&str>,
    ) -> Result<WriteHandles, GitHubWriteError> {
        self.next(&format!("check_run:{name}"))
    }

    async fn update_check_run(
        &self,
        _owner: &str,
        _repo: &str,
        check_run_id: u64,
        _status: Option<&str>,
        _conclusion: Option<&str>,
    ) -> Result<WriteHandles, GitHubWriteError> {
        self.next(&format!("update_check_run:{check_run_id}"))
    }

    async fn create_branch(
        &self,
        _owner: &str,
        _repo: &str,
        branch: &str,
        _from_sha: &str,
    ) -> Result<WriteHandles, GitHubWriteError> {
        self.next(&format!("branch:{branch}"))
    }
}
