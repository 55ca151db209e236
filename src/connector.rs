//! Connector trait for backing-service clients.
//!
//! A connector turns the address of a live instance into a client handle and
//! implements the few data-plane operations the broker needs. It knows the
//! wire protocol of one kind; the broker knows nothing about it.
//!
//! | Operation | Search | Document | Relational |
//! |-----------|--------|----------|------------|
//! | `probe` | cluster health | `ping` | `SELECT 1` |
//! | `initialize` | create index from JSON body | insert JSON array | run SQL script |
//! | `clean` | delete non-system indices | drop all collections | truncate public tables, reset sequences |
//! | `refresh` | `_refresh` | no-op | no-op |

pub mod document;
pub mod relational;
pub mod search;

use async_trait::async_trait;

use crate::artifact::InitArtifact;

pub use document::{DocumentConnector, DocumentHandle};
pub use relational::RelationalConnector;
pub use search::{SearchClient, SearchConnector, SearchResult};

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Errors raised by connectors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Could not build a client or reach the service.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The service rejected or failed a request.
    #[error("Query failed: {0}")]
    Query(String),

    /// An artifact file is malformed for this kind.
    #[error("Invalid artifact: {0}")]
    Artifact(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connector error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Client adapter for one resource kind.
///
/// `Handle` is what tests receive from an acquire. It must be cheap to clone
/// since every acquirer gets its own copy of the shared handle.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    /// Builds a client handle for `address`.
    async fn connect(&self, address: &str) -> ConnectorResult<Self::Handle>;

    /// Cheap liveness check on an existing handle.
    async fn probe(&self, handle: &Self::Handle) -> ConnectorResult<()>;

    /// Applies one initialization artifact.
    async fn initialize(&self, handle: &Self::Handle, artifact: &InitArtifact)
    -> ConnectorResult<()>;

    /// Removes all tenant-visible data, keeping schema where the kind has one.
    async fn clean(&self, handle: &Self::Handle) -> ConnectorResult<()>;

    /// Makes recent writes visible to reads.
    async fn refresh(&self, _handle: &Self::Handle) -> ConnectorResult<()> {
        Ok(())
    }

    /// Releases client resources. Best effort.
    async fn close(&self, _handle: &Self::Handle) {}

    /// Connector name (for logging).
    fn name(&self) -> &'static str;
}
