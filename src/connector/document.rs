//! Document store connector (MongoDB).
//!
//! Database names are stable across processes: seed documents inserted when
//! the instance was created stay visible to every process that reattaches
//! later. Concurrent processes keep apart through tenant scopes.

use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use serde_json::Value;
use tracing::debug;

use super::{Connector, ConnectorError, ConnectorResult};
use crate::artifact::InitArtifact;

const DEFAULT_DATABASE: &str = "testdb";

/// Client handle for the document store.
#[derive(Debug, Clone)]
pub struct DocumentHandle {
    client: Client,
    databases: Vec<String>,
}

impl DocumentHandle {
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The primary database. Artifacts are inserted here.
    pub fn database(&self) -> Database {
        self.client.database(&self.databases[0])
    }

    /// A database by its position in the configured list.
    pub fn database_at(&self, index: usize) -> Option<Database> {
        self.databases.get(index).map(|name| self.client.database(name))
    }

    pub fn database_names(&self) -> &[String] {
        &self.databases
    }
}

/// Connector for the document store kind.
pub struct DocumentConnector {
    databases: Vec<String>,
    timeout: Duration,
}

impl DocumentConnector {
    /// The first of `databases` is the primary database.
    /// An empty list falls back to `testdb`.
    pub fn new(databases: Vec<String>, timeout: Duration) -> Self {
        let databases = if databases.is_empty() {
            vec![DEFAULT_DATABASE.to_string()]
        } else {
            databases
        };
        Self { databases, timeout }
    }

    pub fn database_names(&self) -> &[String] {
        &self.databases
    }
}

#[async_trait]
impl Connector for DocumentConnector {
    type Handle = DocumentHandle;

    async fn connect(&self, address: &str) -> ConnectorResult<DocumentHandle> {
        let mut options = ClientOptions::parse(address)
            .await
            .map_err(|e| ConnectorError::Connect(e.to_string()))?;
        options.server_selection_timeout = Some(self.timeout);
        options.connect_timeout = Some(self.timeout);
        options.app_name = Some("testdeps".to_string());

        let client =
            Client::with_options(options).map_err(|e| ConnectorError::Connect(e.to_string()))?;
        Ok(DocumentHandle {
            client,
            databases: self.databases.clone(),
        })
    }

    async fn probe(&self, handle: &DocumentHandle) -> ConnectorResult<()> {
        handle
            .client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|e| ConnectorError::Connect(e.to_string()))
    }

    async fn initialize(
        &self,
        handle: &DocumentHandle,
        artifact: &InitArtifact,
    ) -> ConnectorResult<()> {
        let collection = artifact.stem();
        let parsed: Value = serde_json::from_str(&artifact.read().await?)
            .map_err(|e| ConnectorError::Artifact(format!("{}: {}", artifact, e)))?;
        let Value::Array(items) = parsed else {
            return Err(ConnectorError::Artifact(format!(
                "{}: expected a JSON array of documents",
                artifact
            )));
        };

        let documents = items
            .iter()
            .map(mongodb::bson::to_document)
            .collect::<Result<Vec<Document>, _>>()
            .map_err(|e| ConnectorError::Artifact(format!("{}: {}", artifact, e)))?;
        if documents.is_empty() {
            return Ok(());
        }

        debug!("Seeding {} documents into {}", documents.len(), collection);
        handle
            .database()
            .collection::<Document>(&collection)
            .insert_many(documents)
            .await
            .map(|_| ())
            .map_err(|e| ConnectorError::Query(e.to_string()))
    }

    async fn clean(&self, handle: &DocumentHandle) -> ConnectorResult<()> {
        for name in &handle.databases {
            let db = handle.client.database(name);
            let collections = db
                .list_collection_names()
                .await
                .map_err(|e| ConnectorError::Query(e.to_string()))?;
            for collection in collections.iter().filter(|c| !c.starts_with("system.")) {
                db.collection::<Document>(collection)
                    .drop()
                    .await
                    .map_err(|e| ConnectorError::Query(format!("drop {}: {}", collection, e)))?;
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "document"
    }
}
