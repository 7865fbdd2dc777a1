use anyhow::{Context, Result};
use tracing::Span;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the tracing subscriber and returns the root span carrying this
/// replica's pod identity. The caller instruments the runtime with the span
/// so request and cluster-watch events record which indexer pod emitted them.
/// Sqlx logs every statement at info level; the default filter caps it at
/// warn unless `RUST_LOG` overrides it.
pub fn init_logging(pod_name: &str, pod_namespace: &str) -> Result<Span> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_target(false))
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    Ok(tracing::info_span!(
        "indexer",
        pod = %pod_name,
        namespace = %pod_namespace
    ))
}
