//! Process-wide broker singletons.
//!
//! The built-in brokers are created lazily on first use from the process
//! configuration ([`config::load_from_env`]). Custom brokers are added with
//! [`register`] so the coordinator can reach them at the end of the run.

use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, error};

use crate::broker::{Broker, SharedResource};
use crate::config::{self, Config};
use crate::connector::{DocumentConnector, RelationalConnector, SearchConnector};
use crate::kind::ResourceKind;

static CONFIG: OnceLock<Config> = OnceLock::new();
static SEARCH: OnceLock<Arc<Broker<SearchConnector>>> = OnceLock::new();
static DOCUMENT: OnceLock<Arc<Broker<DocumentConnector>>> = OnceLock::new();
static RELATIONAL: OnceLock<Arc<Broker<RelationalConnector>>> = OnceLock::new();
static CUSTOM: Mutex<Vec<Arc<dyn SharedResource>>> = Mutex::new(Vec::new());

/// Installs the process configuration before any broker is created.
///
/// Returns the rejected configuration if one was already installed.
pub fn configure(config: Config) -> Result<(), Config> {
    CONFIG.set(config)
}

/// The process configuration, loaded from file and environment on first use.
pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| match config::load_from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load testdeps configuration, using defaults: {:#}", e);
            let mut config = Config::default();
            config::apply_env(&mut config);
            config
        }
    })
}

/// The search engine broker.
pub fn search_engine() -> Arc<Broker<SearchConnector>> {
    SEARCH
        .get_or_init(|| {
            let config = config();
            let resource = config.resource(ResourceKind::SearchEngine);
            Arc::new(Broker::new(
                SearchConnector::new(config.settings.probe_timeout()),
                config.settings.clone(),
                resource,
            ))
        })
        .clone()
}

/// The document store broker.
pub fn document_store() -> Arc<Broker<DocumentConnector>> {
    DOCUMENT
        .get_or_init(|| {
            let config = config();
            let resource = config.resource(ResourceKind::DocumentStore);
            Arc::new(Broker::new(
                DocumentConnector::new(resource.databases.clone(), config.settings.probe_timeout()),
                config.settings.clone(),
                resource,
            ))
        })
        .clone()
}

/// The relational store broker.
pub fn relational() -> Arc<Broker<RelationalConnector>> {
    RELATIONAL
        .get_or_init(|| {
            let config = config();
            let resource = config.resource(ResourceKind::Relational);
            Arc::new(Broker::new(
                RelationalConnector::new(config.settings.probe_timeout()),
                config.settings.clone(),
                resource,
            ))
        })
        .clone()
}

/// Registers a custom broker for end-of-run teardown.
///
/// Registering a second broker for the same kind replaces the first.
pub fn register(broker: Arc<dyn SharedResource>) {
    let mut custom = CUSTOM.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let kind = broker.kind();
    custom.retain(|b| b.kind() != kind);
    debug!("Registered broker for {}", kind);
    custom.push(broker);
}

/// Every broker created or registered so far. Built-in brokers that were never
/// used are not instantiated.
pub fn brokers() -> Vec<Arc<dyn SharedResource>> {
    let mut all: Vec<Arc<dyn SharedResource>> = Vec::new();
    if let Some(b) = SEARCH.get() {
        all.push(b.clone());
    }
    if let Some(b) = DOCUMENT.get() {
        all.push(b.clone());
    }
    if let Some(b) = RELATIONAL.get() {
        all.push(b.clone());
    }
    let custom = CUSTOM.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    all.extend(custom.iter().cloned());
    all
}

/// The broker for a kind, if it exists. Built-in kinds are created on demand.
pub fn broker(kind: ResourceKind) -> Option<Arc<dyn SharedResource>> {
    match kind {
        ResourceKind::SearchEngine => Some(search_engine()),
        ResourceKind::DocumentStore => Some(document_store()),
        ResourceKind::Relational => Some(relational()),
        ResourceKind::Custom(_) => {
            let custom = CUSTOM.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            custom.iter().find(|b| b.kind() == kind).cloned()
        }
    }
}
