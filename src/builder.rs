//! Multi-resource builder.
//!
//! Collects the dependencies one test run needs and acquires them all in
//! parallel, one task per kind.
//!
//! # Example
//!
//! ```no_run
//! use testdeps::builder::DependenciesBuilder;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let deps = DependenciesBuilder::new()
//!     .with_search_engine()
//!     .with_relational(["migrations/schema.sql"]);
//!
//! let bundle = deps.build().await?;
//! let pool = bundle.relational().expect("requested above");
//! sqlx::query("SELECT 1").execute(&pool).await?;
//!
//! bundle.cleanup().await;
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::artifact::InitArtifact;
use crate::broker::{BrokerError, SharedResource};
use crate::connector::{DocumentHandle, SearchClient};
use crate::kind::ResourceKind;
use crate::registry;

/// Every kind that failed during [`DependenciesBuilder::build`], with its
/// cause. Kinds that succeeded were released again before this was returned.
#[derive(Debug, thiserror::Error)]
#[error("failed to build dependencies: {}", describe(.failures))]
pub struct BuildError {
    pub failures: Vec<(ResourceKind, BrokerError)>,
}

impl BuildError {
    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.failures.iter().map(|(kind, _)| *kind).collect()
    }
}

fn describe(failures: &[(ResourceKind, BrokerError)]) -> String {
    failures
        .iter()
        .map(|(_, e)| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

struct Request {
    broker: Arc<dyn SharedResource>,
    artifacts: Vec<InitArtifact>,
}

/// Assembles several brokers for one test run.
pub struct DependenciesBuilder {
    requests: Vec<Request>,
    built: Mutex<Option<Arc<Bundle>>>,
}

impl Default for DependenciesBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DependenciesBuilder {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
            built: Mutex::new(None),
        }
    }

    pub fn with_search_engine(self) -> Self {
        self.with_resource(registry::search_engine(), Vec::<InitArtifact>::new())
    }

    /// Search engine whose indices are created from JSON bodies, one index
    /// per file named after the file stem.
    pub fn with_search_indices<I, A>(self, indices: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<InitArtifact>,
    {
        self.with_resource(registry::search_engine(), indices)
    }

    pub fn with_document_store(self) -> Self {
        self.with_resource(registry::document_store(), Vec::<InitArtifact>::new())
    }

    /// Document store seeded from JSON arrays, one collection per file.
    pub fn with_document_seed<I, A>(self, seeds: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<InitArtifact>,
    {
        self.with_resource(registry::document_store(), seeds)
    }

    /// Relational store initialized with SQL scripts, applied in order.
    pub fn with_relational<I, A>(self, scripts: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<InitArtifact>,
    {
        self.with_resource(registry::relational(), scripts)
    }

    /// Any broker, typically one for a [`ResourceKind::Custom`] kind.
    ///
    /// Requesting a kind that was already requested replaces the earlier
    /// request.
    pub fn with_resource<I, A>(mut self, broker: Arc<dyn SharedResource>, artifacts: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<InitArtifact>,
    {
        let kind = broker.kind();
        self.requests.retain(|r| r.broker.kind() != kind);
        self.requests.push(Request {
            broker,
            artifacts: artifacts.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Requested kinds, in request order.
    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.requests.iter().map(|r| r.broker.kind()).collect()
    }

    pub async fn is_built(&self) -> bool {
        self.built.lock().await.is_some()
    }

    /// Acquires every requested broker concurrently.
    ///
    /// The first successful build is cached: later calls (concurrent ones
    /// included) return the same bundle without acquiring again. A failed
    /// build releases whatever it acquired and can be retried.
    pub async fn build(&self) -> Result<Arc<Bundle>, BuildError> {
        let mut built = self.built.lock().await;
        if let Some(bundle) = built.as_ref() {
            debug!("Dependencies already built");
            return Ok(bundle.clone());
        }

        let mut tasks = JoinSet::new();
        for (index, request) in self.requests.iter().enumerate() {
            let broker = request.broker.clone();
            let artifacts = request.artifacts.clone();
            tasks.spawn(async move {
                let kind = broker.kind();
                let result = AssertUnwindSafe(broker.acquire_any(&artifacts))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(BrokerError::ProvisionFailed {
                            kind,
                            phase: "acquire",
                            source: "acquire panicked".into(),
                        })
                    });
                (index, result)
            });
        }

        let mut handles: Vec<Option<Arc<dyn Any + Send + Sync>>> =
            vec![None; self.requests.len()];
        let mut failures: Vec<(usize, BrokerError)> = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(handle))) => handles[index] = Some(handle),
                Ok((index, Err(e))) => failures.push((index, e)),
                Err(e) => error!("Acquire task did not complete: {}", e),
            }
        }

        record_incomplete(&handles, &mut failures, |index| {
            self.requests[index].broker.kind()
        });
        if !failures.is_empty() {
            for (index, handle) in handles.iter().enumerate().rev() {
                if handle.is_some() {
                    let broker = &self.requests[index].broker;
                    debug!("Rolling back {}", broker.kind());
                    broker.release().await;
                }
            }
            failures.sort_by_key(|(index, _)| *index);
            let failures = failures
                .into_iter()
                .map(|(index, e)| (self.requests[index].broker.kind(), e))
                .collect();
            return Err(BuildError { failures });
        }

        let entries = self
            .requests
            .iter()
            .zip(handles)
            .filter_map(|(request, handle)| {
                handle.map(|handle| Entry {
                    broker: request.broker.clone(),
                    handle,
                })
            })
            .collect();

        let bundle = Arc::new(Bundle {
            entries,
            cleaned: AtomicBool::new(false),
        });
        info!("Dependencies ready: {:?}", self.kinds());
        *built = Some(bundle.clone());
        Ok(bundle)
    }
}

/// Adds a failure for every slot that has neither a handle nor an error,
/// which happens when an acquire task is cancelled or aborted.
fn record_incomplete<T>(
    handles: &[Option<T>],
    failures: &mut Vec<(usize, BrokerError)>,
    kind_of: impl Fn(usize) -> ResourceKind,
) {
    for (index, handle) in handles.iter().enumerate() {
        if handle.is_none() && !failures.iter().any(|(failed, _)| *failed == index) {
            failures.push((
                index,
                BrokerError::ProvisionFailed {
                    kind: kind_of(index),
                    phase: "acquire",
                    source: "acquire task did not complete".into(),
                },
            ));
        }
    }
}

struct Entry {
    broker: Arc<dyn SharedResource>,
    handle: Arc<dyn Any + Send + Sync>,
}

/// Handles for every dependency of one test run.
pub struct Bundle {
    entries: Vec<Entry>,
    cleaned: AtomicBool,
}

impl Bundle {
    fn entry(&self, kind: ResourceKind) -> Option<&Entry> {
        self.entries.iter().find(|e| e.broker.kind() == kind)
    }

    /// The handle for `kind`, if it was requested and has type `H`.
    pub fn connection<H: Clone + 'static>(&self, kind: ResourceKind) -> Option<H> {
        self.entry(kind)?.handle.downcast_ref::<H>().cloned()
    }

    pub fn search(&self) -> Option<SearchClient> {
        self.connection(ResourceKind::SearchEngine)
    }

    pub fn documents(&self) -> Option<DocumentHandle> {
        self.connection(ResourceKind::DocumentStore)
    }

    pub fn relational(&self) -> Option<PgPool> {
        self.connection(ResourceKind::Relational)
    }

    pub async fn endpoint(&self, kind: ResourceKind) -> Option<String> {
        self.entry(kind)?.broker.endpoint().await
    }

    /// Held kinds, in request order.
    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.entries.iter().map(|e| e.broker.kind()).collect()
    }

    pub fn broker(&self, kind: ResourceKind) -> Option<Arc<dyn SharedResource>> {
        self.entry(kind).map(|e| e.broker.clone())
    }

    pub(crate) fn brokers(&self) -> impl Iterator<Item = &Arc<dyn SharedResource>> {
        self.entries.iter().map(|e| &e.broker)
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }

    /// Releases every held broker once, in reverse request order.
    /// Later calls do nothing.
    pub async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.entries.iter().rev() {
            entry.broker.release().await;
        }
        debug!("Released {} dependencies", self.entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINDS: [ResourceKind; 3] = ResourceKind::BUILTIN;

    #[test]
    fn test_missing_handle_becomes_failure() {
        let handles = vec![Some(()), None, Some(())];
        let mut failures = Vec::new();
        record_incomplete(&handles, &mut failures, |index| KINDS[index]);

        assert_eq!(failures.len(), 1);
        let (index, err) = &failures[0];
        assert_eq!(*index, 1);
        assert!(matches!(
            err,
            BrokerError::ProvisionFailed {
                kind: ResourceKind::DocumentStore,
                phase: "acquire",
                ..
            }
        ));
    }

    #[test]
    fn test_reported_failures_are_not_duplicated() {
        let handles: Vec<Option<()>> = vec![None, Some(())];
        let mut failures = vec![(
            0,
            BrokerError::ProvisionFailed {
                kind: ResourceKind::SearchEngine,
                phase: "start",
                source: "boom".into(),
            },
        )];
        record_incomplete(&handles, &mut failures, |index| KINDS[index]);

        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].1, BrokerError::ProvisionFailed { phase: "start", .. }));
    }

    #[test]
    fn test_complete_build_records_nothing() {
        let handles = vec![Some(1), Some(2)];
        let mut failures = Vec::new();
        record_incomplete(&handles, &mut failures, |index| KINDS[index]);
        assert!(failures.is_empty());
    }
}
