//! Relational store connector (PostgreSQL via sqlx).

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, PgConnection};
use tracing::{debug, warn};

use super::{Connector, ConnectorError, ConnectorResult};
use crate::artifact::InitArtifact;

const MAX_CONNECTIONS: u32 = 10;

/// Connector for the relational kind. Handles are connection pools.
pub struct RelationalConnector {
    timeout: Duration,
}

impl RelationalConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

fn query_err(e: sqlx::Error) -> ConnectorError {
    ConnectorError::Query(e.to_string())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Truncates every public table and resets every public sequence.
///
/// Runs on one connection so the replication-role switch covers all
/// statements.
async fn wipe(conn: &mut PgConnection) -> ConnectorResult<()> {
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT tablename::text FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(query_err)?;

    if !tables.is_empty() {
        let list = tables
            .iter()
            .map(|t| quote_ident(t))
            .collect::<Vec<_>>()
            .join(", ");
        debug!("Truncating {} tables", tables.len());
        (&mut *conn)
            .execute(sqlx::raw_sql(&format!("TRUNCATE TABLE {} CASCADE", list)))
            .await
            .map_err(query_err)?;
    }

    let sequences: Vec<String> = sqlx::query_scalar(
        "SELECT sequence_name::text FROM information_schema.sequences \
         WHERE sequence_schema = 'public'",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(query_err)?;

    for sequence in &sequences {
        (&mut *conn)
            .execute(sqlx::raw_sql(&format!("ALTER SEQUENCE {} RESTART WITH 1", quote_ident(sequence))))
            .await
            .map_err(query_err)?;
    }

    Ok(())
}

#[async_trait]
impl Connector for RelationalConnector {
    type Handle = PgPool;

    async fn connect(&self, address: &str) -> ConnectorResult<PgPool> {
        PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(self.timeout)
            .connect(address)
            .await
            .map_err(|e| ConnectorError::Connect(e.to_string()))
    }

    async fn probe(&self, handle: &PgPool) -> ConnectorResult<()> {
        sqlx::query("SELECT 1")
            .execute(handle)
            .await
            .map(|_| ())
            .map_err(|e| ConnectorError::Connect(e.to_string()))
    }

    async fn initialize(&self, handle: &PgPool, artifact: &InitArtifact) -> ConnectorResult<()> {
        let script = artifact.read().await?;
        debug!("Applying {}", artifact);
        sqlx::raw_sql(&script)
            .execute(handle)
            .await
            .map(|_| ())
            .map_err(query_err)
    }

    async fn clean(&self, handle: &PgPool) -> ConnectorResult<()> {
        let mut conn = handle
            .acquire()
            .await
            .map_err(|e| ConnectorError::Connect(e.to_string()))?;

        (&mut *conn)
            .execute(sqlx::raw_sql("SET session_replication_role = replica"))
            .await
            .map_err(query_err)?;

        let result = wipe(&mut conn).await;

        let reset = (&mut *conn)
            .execute(sqlx::raw_sql("SET session_replication_role = DEFAULT"))
            .await;
        if let Err(e) = reset {
            warn!("Failed to restore session_replication_role: {}", e);
            // Never hand a connection with FK checks disabled back to the pool.
            conn.detach();
        }

        result
    }

    async fn close(&self, handle: &PgPool) {
        handle.close().await;
    }

    fn name(&self) -> &'static str {
        "relational"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let connector = RelationalConnector::new(Duration::from_millis(200));
        let err = connector.connect("not a url").await.unwrap_err();
        assert!(matches!(err, ConnectorError::Connect(_)));
    }
}
