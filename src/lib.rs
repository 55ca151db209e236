//! testdeps: shared, reference-counted external dependencies for integration
//! tests.
//!
//! Starting a search engine, a document store or a database for every test is
//! slow. This crate starts each one at most once per test process, hands every
//! test a handle to the same instance, and keeps tests apart by tenant scope
//! instead of by instance.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Provisioners**: Start and stop backing instances (Docker, external endpoint)
//! - **Connectors**: Per-kind clients (search, document, relational)
//! - **Brokers**: One per kind; lifecycle, health and reference counting
//! - **Builder**: Acquire several brokers in parallel for one test run
//! - **Isolation**: Tenant scopes and data cleanup
//! - **Coordinator**: End-of-run teardown
//!
//! # Example
//!
//! ```no_run
//! use testdeps::builder::DependenciesBuilder;
//! use testdeps::isolation::TenantScope;
//!
//! async fn insert_product() -> anyhow::Result<()> {
//!     let deps = DependenciesBuilder::new().with_relational(["schema.sql"]);
//!     let bundle = deps.build().await?;
//!     let pool = bundle.relational().unwrap();
//!     let scope = TenantScope::mint();
//!
//!     sqlx::query("INSERT INTO products (id, tenant_id) VALUES ($1, $2)")
//!         .bind("id-1")
//!         .bind(scope.as_str())
//!         .execute(&pool)
//!         .await?;
//!
//!     bundle.cleanup().await;
//!     Ok(())
//! }
//! ```

pub mod artifact;
pub mod broker;
pub mod builder;
pub mod config;
pub mod connector;
pub mod coordinator;
pub mod isolation;
pub mod kind;
pub mod logging;
pub mod provisioner;
pub mod registry;

// Re-export commonly used types
pub use artifact::InitArtifact;
pub use broker::{Broker, BrokerError, BrokerState, SharedResource};
pub use builder::{BuildError, Bundle, DependenciesBuilder};
pub use config::{load_config, Config};
pub use isolation::{IsolationStrategy, TenantScope, TestContext};
pub use kind::ResourceKind;
