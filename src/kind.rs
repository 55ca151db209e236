//! Resource kinds.
//!
//! A [`ResourceKind`] names one category of backing dependency. Each kind maps
//! to exactly one broker per process, one `[resources.<key>]` table in the
//! configuration file, and one family of environment toggles.

use std::fmt;

/// A category of shared external test dependency.
///
/// The three built-in kinds cover the services most integration suites need.
/// Additional kinds are added by constructing a broker for
/// [`ResourceKind::Custom`] and registering it with
/// [`registry::register`](crate::registry::register).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// A search/index engine reachable over HTTP (Elasticsearch compatible).
    SearchEngine,
    /// A document store (MongoDB compatible).
    DocumentStore,
    /// A relational store (PostgreSQL).
    Relational,
    /// A user-defined kind, identified by its configuration key.
    Custom(&'static str),
}

impl ResourceKind {
    /// The built-in kinds, in the order they are documented and reported.
    pub const BUILTIN: [ResourceKind; 3] = [
        ResourceKind::SearchEngine,
        ResourceKind::DocumentStore,
        ResourceKind::Relational,
    ];

    /// Key used for the `[resources.<key>]` table and for container names.
    pub fn key(&self) -> &'static str {
        match self {
            ResourceKind::SearchEngine => "search",
            ResourceKind::DocumentStore => "document",
            ResourceKind::Relational => "relational",
            ResourceKind::Custom(name) => name,
        }
    }

    /// Prefix of the per-kind environment variables
    /// (`USE_EXTERNAL_<PREFIX>`, `<PREFIX>_URL`).
    pub fn env_prefix(&self) -> String {
        match self {
            ResourceKind::SearchEngine => "ES".to_string(),
            ResourceKind::DocumentStore => "MONGO".to_string(),
            ResourceKind::Relational => "PG".to_string(),
            ResourceKind::Custom(name) => env_prefix_for(name),
        }
    }

    /// Looks up a kind from a configuration key or a common alias.
    ///
    /// Only built-in kinds can be parsed; custom kinds exist only in code.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "search" | "es" | "elasticsearch" => Some(ResourceKind::SearchEngine),
            "document" | "mongo" | "mongodb" => Some(ResourceKind::DocumentStore),
            "relational" | "pg" | "postgres" | "postgresql" => Some(ResourceKind::Relational),
            _ => None,
        }
    }
}

/// Environment prefix for a configuration key that names no built-in kind:
/// upper-cased, with anything but ASCII alphanumerics mapped to `_`.
pub fn env_prefix_for(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
