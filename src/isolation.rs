//! Isolation and cleanup protocol.
//!
//! Concurrent tests share one backing instance per kind. They stay out of each
//! other's way by tagging every write with a [`TenantScope`] and filtering every
//! read by it. Brokers do no partitioning of their own.
//!
//! Tests that cannot be scoped (schema changes, global counts) use
//! [`IsolationStrategy::FullWipe`] instead and must not run concurrently with
//! other tests on the same kinds.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::broker::{BrokerError, BrokerResult, SharedResource};
use crate::builder::Bundle;
use crate::kind::ResourceKind;

/// Field that carries the scope in stored records.
pub const TENANT_FIELD: &str = "tenant_id";

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque per-test data discriminator.
///
/// Minted fresh for every test or sub-test. Never persisted across runs and
/// never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantScope(String);

impl TenantScope {
    /// Mints a new scope: `test_` followed by 16 hex characters of OS entropy.
    pub fn mint() -> Self {
        let mut bytes = [0u8; 8];
        match OsRng.try_fill_bytes(&mut bytes) {
            Ok(()) => {
                let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                Self(format!("test_{}", hex))
            }
            Err(e) => {
                warn!("OS entropy unavailable ({}), using timestamp scope", e);
                Self::fallback()
            }
        }
    }

    fn fallback() -> Self {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let counter = FALLBACK_COUNTER.fetch_add(1, Ordering::SeqCst);
        Self(format!("test_{}_{}", nanos, counter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives a per-scope index, collection or table name.
    pub fn namespace(&self, base: &str) -> String {
        format!("{}_{}", base, self.0)
    }

    pub fn owns<T: Tenanted + ?Sized>(&self, record: &T) -> bool {
        record.tenant_id() == Some(self.as_str())
    }

    /// Keeps only the records that belong to this scope.
    pub fn retain<T, I>(&self, records: I) -> Vec<T>
    where
        T: Tenanted,
        I: IntoIterator<Item = T>,
    {
        records.into_iter().filter(|r| self.owns(r)).collect()
    }

    /// Search engine query clause matching this scope.
    pub fn search_filter(&self) -> Value {
        json!({ "term": { "tenant_id": self.0 } })
    }

    /// Document store filter matching this scope.
    pub fn document_filter(&self) -> mongodb::bson::Document {
        mongodb::bson::doc! { "tenant_id": self.0.as_str() }
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantScope {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A record that carries a tenant discriminator.
pub trait Tenanted {
    fn tenant_id(&self) -> Option<&str>;
}

impl Tenanted for Value {
    fn tenant_id(&self) -> Option<&str> {
        self.get(TENANT_FIELD).and_then(Value::as_str)
    }
}

impl Tenanted for mongodb::bson::Document {
    fn tenant_id(&self) -> Option<&str> {
        self.get_str(TENANT_FIELD).ok()
    }
}

impl<T: Tenanted> Tenanted for &T {
    fn tenant_id(&self) -> Option<&str> {
        (**self).tenant_id()
    }
}

/// Outcome of [`clean_all`].
#[derive(Debug, Default)]
pub struct CleanReport {
    pub cleaned: Vec<ResourceKind>,
    pub failures: Vec<(ResourceKind, BrokerError)>,
}

impl CleanReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Wipes the data of every kind in the bundle.
///
/// Failures are logged and reported, never raised.
pub async fn clean_all(bundle: &Bundle) -> CleanReport {
    let mut report = CleanReport::default();
    for broker in bundle.brokers() {
        match broker.clean_data().await {
            Ok(()) => report.cleaned.push(broker.kind()),
            Err(e) => {
                warn!("{}", e);
                report.failures.push((broker.kind(), e));
            }
        }
    }
    debug!(
        "Cleaned {} kind(s), {} failure(s)",
        report.cleaned.len(),
        report.failures.len()
    );
    report
}

/// Makes every write so far visible to reads, on every kind in the bundle.
///
/// All kinds are refreshed; the first failure is returned.
pub async fn wait_for_consistency(bundle: &Bundle) -> BrokerResult<()> {
    let mut first_error = None;
    for broker in bundle.brokers() {
        if let Err(e) = broker.refresh().await {
            warn!("{}", e);
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// How a test keeps its data apart from other tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationStrategy {
    /// Tag and filter by a fresh scope per sub-test. Safe under concurrency.
    Scoped,
    /// Wipe every kind before each sub-test. Not safe under concurrency.
    FullWipe,
}

/// Binds one bundle to one isolation strategy for the duration of a test.
pub struct TestContext {
    bundle: Arc<Bundle>,
    strategy: IsolationStrategy,
    scope: TenantScope,
}

impl TestContext {
    pub fn new(bundle: Arc<Bundle>, strategy: IsolationStrategy) -> Self {
        Self {
            bundle,
            strategy,
            scope: TenantScope::mint(),
        }
    }

    pub fn bundle(&self) -> &Arc<Bundle> {
        &self.bundle
    }

    pub fn strategy(&self) -> IsolationStrategy {
        self.strategy
    }

    pub fn scope(&self) -> &TenantScope {
        &self.scope
    }

    /// Prepares isolation for the next sub-test and returns its scope.
    ///
    /// `Scoped` mints a fresh scope. `FullWipe` wipes every kind and keeps
    /// the current scope.
    pub async fn prepare_subtest(&mut self) -> TenantScope {
        match self.strategy {
            IsolationStrategy::Scoped => {
                self.scope = TenantScope::mint();
            }
            IsolationStrategy::FullWipe => {
                let report = clean_all(&self.bundle).await;
                if !report.is_clean() {
                    warn!(
                        "Full wipe incomplete for {:?}",
                        report.failures.iter().map(|(k, _)| *k).collect::<Vec<_>>()
                    );
                }
            }
        }
        self.scope.clone()
    }

    pub async fn wait_for_consistency(&self) -> BrokerResult<()> {
        wait_for_consistency(&self.bundle).await
    }
}
