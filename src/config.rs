use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;

pub const COMPONENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runtime configuration, read from the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "fleet-indexer", version)]
pub struct Config {
    /// Postgres host
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,
    /// Postgres port
    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    pub db_port: u16,
    /// Postgres database name
    #[arg(long, env = "DB_NAME")]
    pub db_name: String,
    /// Postgres user
    #[arg(long, env = "DB_USER")]
    pub db_user: String,
    /// Postgres password
    #[arg(long, env = "DB_PASS")]
    pub db_pass: String,
    /// Statements accumulated before a batch flush; also the bulk insert group size
    #[arg(long, env = "DB_BATCH_SIZE", default_value_t = 500)]
    pub db_batch_size: usize,
    /// Maximum database connections. Postgres defaults to 100 total; 20 leaves
    /// room to scale the indexer and the query API independently.
    #[arg(long, env = "DB_MAX_CONNS", default_value_t = 20)]
    pub db_max_conns: u32,
    /// Request timeout in milliseconds
    #[arg(long, env = "HTTP_TIMEOUT", default_value_t = 300_000)]
    pub http_timeout_ms: u64,
    /// Address to bind the HTTP server to
    #[arg(long, env = "AGGREGATOR_ADDRESS", default_value = "0.0.0.0:3010")]
    pub bind: String,
    /// Maximum backoff in milliseconds between database retries
    #[arg(long, env = "MAX_BACKOFF_MS", default_value_t = 300_000)]
    pub max_backoff_ms: u64,
    /// Maximum concurrent sync requests admitted across all clusters
    #[arg(long, env = "REQUEST_LIMIT", default_value_t = 50)]
    pub request_limit: usize,
    /// How often (ms) to probe whether watched control-plane resources are served
    #[arg(long, env = "REDISCOVER_RATE_MS", default_value_t = 300_000)]
    pub rediscover_rate_ms: u64,
    /// Pod identity, for logs
    #[arg(long, env = "POD_NAME", default_value = "local-dev")]
    pub pod_name: String,
    #[arg(long, env = "POD_NAMESPACE", default_value = "open-cluster-management")]
    pub pod_namespace: String,
    /// Kubeconfig path for out-of-cluster development; in-cluster config is
    /// used when unset.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,
    /// Drops and recreates the search schema at startup. Development only.
    #[arg(long, env = "DEVELOPMENT_MODE", default_value_t = false)]
    pub development_mode: bool,
}

impl Config {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn rediscover_rate(&self) -> Duration {
        Duration::from_millis(self.rediscover_rate_ms)
    }

    /// Log the resolved configuration with secrets redacted.
    pub fn log_summary(&self) {
        info!(
            version = COMPONENT_VERSION,
            db_host = %self.db_host,
            db_port = self.db_port,
            db_name = %self.db_name,
            db_user = %self.db_user,
            db_pass = "[REDACTED]",
            db_batch_size = self.db_batch_size,
            db_max_conns = self.db_max_conns,
            http_timeout_ms = self.http_timeout_ms,
            bind = %self.bind,
            max_backoff_ms = self.max_backoff_ms,
            request_limit = self.request_limit,
            rediscover_rate_ms = self.rediscover_rate_ms,
            pod_name = %self.pod_name,
            pod_namespace = %self.pod_namespace,
            development_mode = self.development_mode,
            "using configuration"
        );
    }
}
