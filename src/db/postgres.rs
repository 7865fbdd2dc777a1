use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{to_db_error, BatchItem, DbError, SqlValue, Store};
use crate::model::{cluster_node_uid, EdgeKey, INTER_CLUSTER_EDGE};

/// Postgres-backed store. Cheap to clone; all methods go through the shared
/// connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to Postgres, retrying with capped backoff until the database
    /// is reachable. The service must not crash-loop while the database is
    /// still coming up.
    pub async fn connect(config: &Config) -> Self {
        let options = PgConnectOptions::new()
            .host(&config.db_host)
            .port(config.db_port)
            .database(&config.db_name)
            .username(&config.db_user)
            .password(&config.db_pass);

        info!(
            host = %config.db_host,
            port = config.db_port,
            dbname = %config.db_name,
            user = %config.db_user,
            "connecting to postgres"
        );

        let mut attempt: u64 = 0;
        loop {
            match PgPoolOptions::new()
                .max_connections(config.db_max_conns)
                .connect_with(options.clone())
                .await
            {
                Ok(pool) => {
                    info!("successfully connected to database");
                    return Self::new(pool);
                }
                Err(err) => {
                    let wait =
                        Duration::from_millis((attempt * 500).min(config.max_backoff_ms / 10));
                    attempt += 1;
                    error!(error = %err, "unable to connect to database, will retry in {wait:?}");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Creates the search schema, tables, and indexes idempotently. With
    /// `development_mode` the schema is dropped first.
    pub async fn initialize_schema(&self, development_mode: bool) -> Result<(), DbError> {
        if development_mode {
            warn!("dropping search schema; this must never run in production");
            sqlx::query("DROP SCHEMA IF EXISTS search CASCADE")
                .execute(&self.pool)
                .await
                .map_err(to_db_error)?;
        }

        let statements = [
            "CREATE SCHEMA IF NOT EXISTS search",
            "CREATE TABLE IF NOT EXISTS search.resources (uid TEXT PRIMARY KEY, cluster TEXT, data JSONB)",
            "CREATE TABLE IF NOT EXISTS search.edges (sourceId TEXT, sourceKind TEXT, destId TEXT, \
             destKind TEXT, edgeType TEXT, cluster TEXT, PRIMARY KEY(sourceId, destId, edgeType))",
            "CREATE INDEX IF NOT EXISTS data_kind_idx ON search.resources USING GIN ((data -> 'kind'))",
            "CREATE INDEX IF NOT EXISTS data_namespace_idx ON search.resources USING GIN ((data -> 'namespace'))",
            "CREATE INDEX IF NOT EXISTS data_name_idx ON search.resources USING GIN ((data -> 'name'))",
            "CREATE INDEX IF NOT EXISTS data_cluster_idx ON search.resources USING btree (cluster)",
            "CREATE INDEX IF NOT EXISTS data_composite_idx ON search.resources USING GIN \
             ((data -> '_hubClusterResource'::text), (data -> 'namespace'::text), \
             (data -> 'apigroup'::text), (data -> 'kind_plural'::text))",
            "CREATE INDEX IF NOT EXISTS data_hubcluster_idx ON search.resources USING GIN \
             ((data -> '_hubClusterResource')) WHERE data ? '_hubClusterResource'",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(to_db_error)?;
        }

        info!("database schema initialized");
        Ok(())
    }
}

fn bind_values<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    args: &'q [SqlValue],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for arg in args {
        query = match arg {
            SqlValue::Text(value) => query.bind(value),
            SqlValue::TextArray(values) => query.bind(values),
            SqlValue::Json(value) => query.bind(value),
        };
    }
    query
}

#[async_trait]
impl Store for PgStore {
    async fn exec_batch(&self, items: &[BatchItem]) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await.map_err(to_db_error)?;
        for item in items {
            bind_values(sqlx::query(&item.query), &item.args)
                .execute(tx.as_mut())
                .await
                .map_err(to_db_error)?;
        }
        tx.commit().await.map_err(to_db_error)?;
        Ok(())
    }

    async fn resource_uids(&self, cluster: &str) -> Result<Vec<String>, DbError> {
        sqlx::query_scalar("SELECT uid FROM search.resources WHERE cluster = $1 AND uid != $2")
            .bind(cluster)
            .bind(cluster_node_uid(cluster))
            .fetch_all(&self.pool)
            .await
            .map_err(to_db_error)
    }

    async fn edge_keys(&self, cluster: &str) -> Result<Vec<EdgeKey>, DbError> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT sourceId, edgeType, destId FROM search.edges \
             WHERE cluster = $1 AND edgeType != $2",
        )
        .bind(cluster)
        .bind(INTER_CLUSTER_EDGE)
        .fetch_all(&self.pool)
        .await
        .map_err(to_db_error)?;

        Ok(rows
            .into_iter()
            .map(|(source_id, edge_type, dest_id)| EdgeKey {
                source_id,
                edge_type,
                dest_id,
            })
            .collect())
    }

    async fn resource_count(&self, cluster: &str) -> Result<i64, DbError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM search.resources WHERE cluster = $1")
            .bind(cluster)
            .fetch_one(&self.pool)
            .await
            .map_err(to_db_error)
    }

    async fn edge_count(&self, cluster: &str) -> Result<i64, DbError> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM search.edges WHERE cluster = $1 AND edgeType != $2",
        )
        .bind(cluster)
        .bind(INTER_CLUSTER_EDGE)
        .fetch_one(&self.pool)
        .await
        .map_err(to_db_error)
    }

    async fn cluster_node(&self, uid: &str) -> Result<Option<Value>, DbError> {
        sqlx::query_scalar("SELECT data FROM search.resources WHERE uid = $1")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_db_error)
    }

    async fn upsert_cluster_node(&self, uid: &str, properties: &Value) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO search.resources (uid, cluster, data) VALUES ($1, '', $2) \
             ON CONFLICT (uid) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(uid)
        .bind(properties)
        .execute(&self.pool)
        .await
        .map_err(to_db_error)?;
        Ok(())
    }

    async fn delete_cluster_resources(&self, cluster: &str) -> Result<(u64, u64), DbError> {
        // A failed statement aborts the whole transaction; the caller retries
        // the entire delete. Rollback happens when the transaction drops.
        let mut tx = self.pool.begin().await.map_err(to_db_error)?;

        let resources = sqlx::query("DELETE FROM search.resources WHERE cluster = $1")
            .bind(cluster)
            .execute(tx.as_mut())
            .await
            .map_err(to_db_error)?
            .rows_affected();

        let edges =
            sqlx::query("DELETE FROM search.edges WHERE cluster = $1 AND edgeType != $2")
                .bind(cluster)
                .bind(INTER_CLUSTER_EDGE)
                .execute(tx.as_mut())
                .await
                .map_err(to_db_error)?
                .rows_affected();

        tx.commit().await.map_err(to_db_error)?;
        Ok((resources, edges))
    }

    async fn delete_cluster_node(&self, uid: &str) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM search.resources WHERE uid = $1")
            .bind(uid)
            .execute(&self.pool)
            .await
            .map_err(to_db_error)?;
        Ok(result.rows_affected())
    }
}
