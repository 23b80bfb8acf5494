//! Cancellation plane.
//!
//! In-process: a ref-counted registry of cancellation tokens keyed by run
//! id. Tokens are per-process, so a signal in one worker does not abort an
//! in-flight call on another; the cross-process fallback is the polled
//! phase read ([`run_cancelled_in_db`]) inside the agent executor.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CoreResult;
use crate::orchestrator::machine::Phase;

struct Entry {
    token: CancellationToken,
    ref_count: usize,
}

/// Process-local map of `run_id -> (token, ref_count)`.
#[derive(Default)]
pub struct CancellationRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a run. Returns the shared token, which may
    /// already be cancelled if a signal arrived before registration.
    pub fn register(&self, run_id: &str) -> CancellationToken {
        let mut entries = self.entries.lock().expect("cancellation registry poisoned");
        let entry = entries.entry(run_id.to_string()).or_insert_with(|| Entry {
            token: CancellationToken::new(),
            ref_count: 0,
        });
        entry.ref_count += 1;
        entry.token.clone()
    }

    /// Abort the run's token. Returns false when nothing is registered.
    pub fn signal(&self, run_id: &str) -> bool {
        let entries = self.entries.lock().expect("cancellation registry poisoned");
        match entries.get(run_id) {
            Some(entry) => {
                debug!(run_id, "cancellation signalled");
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop one registration; the entry disappears when the count hits
    /// zero.
    pub fn unregister(&self, run_id: &str) {
        let mut entries = self.entries.lock().expect("cancellation registry poisoned");
        if let Some(entry) = entries.get_mut(run_id) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                entries.remove(run_id);
            }
        }
    }

    pub fn is_cancelled(&self, run_id: &str) -> bool {
        let entries = self.entries.lock().expect("cancellation registry poisoned");
        entries
            .get(run_id)
            .map(|entry| entry.token.is_cancelled())
            .unwrap_or(false)
    }

    pub fn token(&self, run_id: &str) -> Option<CancellationToken> {
        let entries = self.entries.lock().expect("cancellation registry poisoned");
        entries.get(run_id).map(|entry| entry.token.clone())
    }
}

/// Cross-process cancellation check: has some other worker moved this run
/// to `cancelled`? Polled by the agent executor between iterations.
pub async fn run_cancelled_in_db(pool: &SqlitePool, run_id: &str) -> CoreResult<bool> {
    let phase: Option<Phase> = sqlx::query_scalar("SELECT phase FROM runs WHERE run_id = ?1")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    Ok(phase == Some(Phase::Cancelled))
}
