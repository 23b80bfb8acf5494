use anyhow::Result;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Install the global tracing subscriber.
///
/// Output is JSON lines so the log pipeline can key on run and correlation
/// fields without parsing free text. `RUST_LOG` narrows the filter when
/// set; `info` is the floor otherwise.
pub fn init_telemetry() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_span_list(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing subscriber already installed: {e}"))?;
    tracing::info!("telemetry online");
    Ok(())
}

/// Mint a correlation id that threads one webhook delivery through every
/// decision and outbox write it causes.
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping one orchestration operation on a run.
pub fn create_run_span(
    operation: &str,
    run_id: Option<&str>,
    correlation_id: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "run_orchestration",
        operation = operation,
        run.id = run_id,
        correlation.id = correlation_id,
    )
}

/// Shutdown hook. The fmt subscriber writes synchronously so there is
/// nothing to drain today; call sites keep the hook so a batching exporter
/// can slot in later without touching them.
pub fn shutdown_telemetry() {
    tracing::debug!("telemetry shutdown");
}
