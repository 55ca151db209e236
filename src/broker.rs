//! Shared resource broker.
//!
//! A [`Broker`] owns the single physical instance of one resource kind for the
//! whole test process. Tests acquire a lease, receive a clone of the shared
//! client handle, and release the lease when done.
//!
//! # Lifecycle
//!
//! ```text
//!              acquire()                    probe ok
//!  NotStarted ───────────► Starting ─────────────────► Ready
//!      ▲                      │  ▲                       │
//!      │ start failed         │  │ acquire()             │ probe failed
//!      └──────────────────────┘  │                       ▼
//!                                └──────────────────  Degraded
//! ```
//!
//! `release()` of the last lease returns the broker to `NotStarted` only when
//! reuse across runs is disabled. Otherwise the instance stays up for the next
//! process, which reattaches to it by name.
//!
//! # Concurrency
//!
//! The ready path holds the shared lock across probe and increment, so a
//! teardown (which needs the exclusive lock) cannot slip in between.
//! Provisioning happens under the exclusive lock; every concurrent acquirer
//! waits on that one attempt and then re-checks.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::artifact::InitArtifact;
use crate::config::{ResourceSettings, Settings};
use crate::connector::{Connector, ConnectorError, ConnectorResult};
use crate::kind::ResourceKind;
use crate::provisioner::{self, Instance, InstanceOrigin, Provisioner};

/// Boxed error used as the chained source of broker errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle state of a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    NotStarted,
    Starting,
    Ready,
    /// The last known handle failed its probe or initialization failed.
    Degraded,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BrokerState::NotStarted => "not started",
            BrokerState::Starting => "starting",
            BrokerState::Ready => "ready",
            BrokerState::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by brokers. Every variant names the kind and the phase.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("{kind}: provisioning failed during {phase}: {source}")]
    ProvisionFailed {
        kind: ResourceKind,
        phase: &'static str,
        #[source]
        source: BoxError,
    },

    /// Logged when a probe fails; acquire re-provisions instead of returning it.
    #[error("{kind}: health check failed: {source}")]
    HealthCheckFailed {
        kind: ResourceKind,
        #[source]
        source: ConnectorError,
    },

    #[error("{kind}: initialization artifact {artifact} failed: {source}")]
    InitializationFailed {
        kind: ResourceKind,
        artifact: String,
        #[source]
        source: ConnectorError,
    },

    #[error("{kind}: cleanup failed during {phase}: {source}")]
    CleanupFailed {
        kind: ResourceKind,
        phase: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("{kind}: not ready (state: {state})")]
    NotReady {
        kind: ResourceKind,
        state: BrokerState,
    },
}

impl BrokerError {
    pub fn kind(&self) -> ResourceKind {
        match self {
            BrokerError::ProvisionFailed { kind, .. }
            | BrokerError::HealthCheckFailed { kind, .. }
            | BrokerError::InitializationFailed { kind, .. }
            | BrokerError::CleanupFailed { kind, .. }
            | BrokerError::NotReady { kind, .. } => *kind,
        }
    }
}

/// Where the provisioner comes from.
enum ProvisionerSource {
    /// Resolved from settings at the first provisioning attempt.
    Configured(ResourceSettings),
    Fixed(Arc<dyn Provisioner>),
}

struct Inner<H> {
    state: BrokerState,
    handle: Option<H>,
    instance: Option<Instance>,
    provisioner: Option<Arc<dyn Provisioner>>,
    /// Artifacts the current instance was provisioned with.
    artifacts: Vec<InitArtifact>,
}

/// Per-kind singleton managing one shared backing instance.
pub struct Broker<C: Connector> {
    kind: ResourceKind,
    connector: C,
    settings: Settings,
    source: ProvisionerSource,
    inner: RwLock<Inner<C::Handle>>,
    ref_count: AtomicUsize,
    /// Leases still held when a shutdown tore the instance down.
    orphaned: AtomicUsize,
    provision_count: AtomicUsize,
}

impl<C: Connector> Broker<C> {
    /// Creates a broker whose provisioner is chosen from `resource`
    /// (`use_external` selects the external endpoint, otherwise Docker).
    pub fn new(connector: C, settings: Settings, resource: ResourceSettings) -> Self {
        Self::with_source(
            resource.kind,
            connector,
            settings,
            ProvisionerSource::Configured(resource),
        )
    }

    /// Creates a broker with an explicit provisioner.
    pub fn with_provisioner(
        kind: ResourceKind,
        connector: C,
        settings: Settings,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self::with_source(kind, connector, settings, ProvisionerSource::Fixed(provisioner))
    }

    fn with_source(
        kind: ResourceKind,
        connector: C,
        settings: Settings,
        source: ProvisionerSource,
    ) -> Self {
        Self {
            kind,
            connector,
            settings,
            source,
            inner: RwLock::new(Inner {
                state: BrokerState::NotStarted,
                handle: None,
                instance: None,
                provisioner: None,
                artifacts: Vec::new(),
            }),
            ref_count: AtomicUsize::new(0),
            orphaned: AtomicUsize::new(0),
            provision_count: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn reuse_across_runs(&self) -> bool {
        self.settings.reuse_across_runs
    }

    /// Number of outstanding leases.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Number of successful provisioning attempts so far.
    pub fn provision_count(&self) -> usize {
        self.provision_count.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> BrokerState {
        self.inner.read().await.state
    }

    /// The shared handle, only while ready.
    pub async fn connection(&self) -> Option<C::Handle> {
        let inner = self.inner.read().await;
        match inner.state {
            BrokerState::Ready => inner.handle.clone(),
            _ => None,
        }
    }

    /// Address of the live instance, only while ready.
    pub async fn endpoint(&self) -> Option<String> {
        let inner = self.inner.read().await;
        match inner.state {
            BrokerState::Ready => inner.instance.as_ref().map(|i| i.address.clone()),
            _ => None,
        }
    }

    /// Acquires a lease, provisioning the instance if needed.
    ///
    /// `artifacts` are applied once per fresh instance. They are ignored (with
    /// a warning if they differ) when the broker is already ready.
    pub async fn acquire(&self, artifacts: &[InitArtifact]) -> BrokerResult<C::Handle> {
        {
            let inner = self.inner.read().await;
            if let Some(handle) = self.healthy_handle(&inner).await {
                self.warn_on_artifact_drift(&inner, artifacts);
                self.ref_count.fetch_add(1, Ordering::SeqCst);
                debug!("{}: reused ready instance", self.kind);
                return Ok(handle);
            }
        }

        let mut inner = self.inner.write().await;

        // Another acquirer may have provisioned while we waited.
        if let Some(handle) = self.healthy_handle(&inner).await {
            self.warn_on_artifact_drift(&inner, artifacts);
            self.ref_count.fetch_add(1, Ordering::SeqCst);
            return Ok(handle);
        }

        if let Some(stale) = inner.handle.take() {
            inner.state = BrokerState::Degraded;
            self.connector.close(&stale).await;
            inner.instance = None;
        } else if let Some(abandoned) = inner.instance.take() {
            // An earlier acquire was dropped after its instance started.
            self.discard_abandoned(&inner, &abandoned).await;
        }

        let prior = match inner.state {
            BrokerState::NotStarted => BrokerState::NotStarted,
            // A previous attempt was cancelled mid-way, or the handle went stale.
            _ => BrokerState::Degraded,
        };

        inner.state = BrokerState::Starting;
        info!("{}: provisioning", self.kind);

        match self.provision(&mut inner, artifacts).await {
            Ok(handle) => {
                inner.state = BrokerState::Ready;
                self.ref_count.fetch_add(1, Ordering::SeqCst);
                Ok(handle)
            }
            Err(e) => {
                inner.state = match e {
                    BrokerError::InitializationFailed { .. } => BrokerState::Degraded,
                    _ => prior,
                };
                error!("{}", e);
                Err(e)
            }
        }
    }

    /// Releases a lease. The last release stops the instance when reuse is
    /// disabled.
    pub async fn release(&self) {
        if self
            .orphaned
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            debug!("{}: released a lease taken before shutdown", self.kind);
            return;
        }

        let previous = self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        match previous {
            Err(_) => {
                error!("{}: release without matching acquire", self.kind);
                debug_assert!(false, "release without matching acquire");
            }
            Ok(1) if !self.settings.reuse_across_runs => {
                let mut inner = self.inner.write().await;
                // An acquire may have slipped in before we got the lock.
                if self.ref_count() == 0 {
                    self.teardown(&mut inner).await;
                }
            }
            Ok(_) => {}
        }
    }

    /// Wipes all data in the instance without stopping it.
    pub async fn clean_data(&self) -> BrokerResult<()> {
        let inner = self.inner.read().await;
        let handle = self.ready_handle(&inner)?;
        self.connector
            .clean(handle)
            .await
            .map_err(|e| BrokerError::CleanupFailed {
                kind: self.kind,
                phase: "clean",
                source: Box::new(e),
            })?;
        debug!("{}: data cleaned", self.kind);
        Ok(())
    }

    /// Makes recent writes visible to subsequent reads.
    pub async fn refresh(&self) -> BrokerResult<()> {
        let inner = self.inner.read().await;
        let handle = self.ready_handle(&inner)?;
        self.connector
            .refresh(handle)
            .await
            .map_err(|e| BrokerError::CleanupFailed {
                kind: self.kind,
                phase: "refresh",
                source: Box::new(e),
            })
    }

    /// End-of-run teardown.
    ///
    /// With reuse disabled the instance is stopped even if leases are still
    /// outstanding. With reuse enabled only the client handle is closed.
    ///
    /// Outstanding leases are orphaned: the live count restarts at zero and
    /// their later releases are absorbed without touching any new instance.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.write().await;
        if inner.handle.is_none() && inner.instance.is_none() {
            return;
        }

        let outstanding = self.ref_count.swap(0, Ordering::SeqCst);
        self.orphaned.fetch_add(outstanding, Ordering::SeqCst);
        if self.settings.reuse_across_runs {
            if let Some(handle) = inner.handle.take() {
                self.connector.close(&handle).await;
            }
            inner.instance = None;
            inner.state = BrokerState::NotStarted;
            debug!("{}: closed client, instance kept for reuse", self.kind);
            return;
        }

        if outstanding > 0 {
            warn!(
                "{}: shutting down with {} outstanding lease(s)",
                self.kind, outstanding
            );
        }
        self.teardown(&mut inner).await;
    }

    fn ready_handle<'a>(&self, inner: &'a Inner<C::Handle>) -> BrokerResult<&'a C::Handle> {
        match (inner.state, inner.handle.as_ref()) {
            (BrokerState::Ready, Some(handle)) => Ok(handle),
            (state, _) => Err(BrokerError::NotReady {
                kind: self.kind,
                state,
            }),
        }
    }

    async fn healthy_handle(&self, inner: &Inner<C::Handle>) -> Option<C::Handle> {
        let handle = match (inner.state, inner.handle.as_ref()) {
            (BrokerState::Ready, Some(handle)) => handle,
            _ => return None,
        };
        match self.probe(handle).await {
            Ok(()) => Some(handle.clone()),
            Err(source) => {
                let e = BrokerError::HealthCheckFailed {
                    kind: self.kind,
                    source,
                };
                warn!("{}; re-provisioning", e);
                None
            }
        }
    }

    async fn probe(&self, handle: &C::Handle) -> ConnectorResult<()> {
        let timeout = self.settings.probe_timeout();
        match tokio::time::timeout(timeout, self.connector.probe(handle)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Connect(format!(
                "probe timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    fn warn_on_artifact_drift(&self, inner: &Inner<C::Handle>, artifacts: &[InitArtifact]) {
        if !artifacts.is_empty() && artifacts != inner.artifacts.as_slice() {
            warn!(
                "{}: already initialized; ignoring {} different artifact(s)",
                self.kind,
                artifacts.len()
            );
        }
    }

    fn resolve_provisioner(
        &self,
        inner: &mut Inner<C::Handle>,
    ) -> BrokerResult<Arc<dyn Provisioner>> {
        if let Some(provisioner) = &inner.provisioner {
            return Ok(provisioner.clone());
        }
        let provisioner = match &self.source {
            ProvisionerSource::Fixed(p) => p.clone(),
            ProvisionerSource::Configured(resource) => {
                provisioner::resolve(&self.settings, resource).map_err(|e| {
                    BrokerError::ProvisionFailed {
                        kind: self.kind,
                        phase: "resolve",
                        source: Box::new(e),
                    }
                })?
            }
        };
        debug!("{}: using {} provisioner", self.kind, provisioner.name());
        inner.provisioner = Some(provisioner.clone());
        Ok(provisioner)
    }

    async fn provision(
        &self,
        inner: &mut Inner<C::Handle>,
        artifacts: &[InitArtifact],
    ) -> BrokerResult<C::Handle> {
        let provisioner = self.resolve_provisioner(inner)?;

        let instance = provisioner
            .start(artifacts)
            .await
            .map_err(|e| BrokerError::ProvisionFailed {
                kind: self.kind,
                phase: "start",
                source: Box::new(e),
            })?;
        inner.instance = Some(instance.clone());

        let handle = match self.connect_ready(&instance).await {
            Ok(handle) => handle,
            Err(e) => {
                if instance.origin == InstanceOrigin::Created {
                    self.stop_instance(provisioner.as_ref(), &instance).await;
                }
                inner.instance = None;
                return Err(BrokerError::ProvisionFailed {
                    kind: self.kind,
                    phase: "connect",
                    source: Box::new(e),
                });
            }
        };

        if instance.origin.applies_artifacts() {
            for artifact in artifacts {
                if let Err(source) = self.connector.initialize(&handle, artifact).await {
                    self.connector.close(&handle).await;
                    if instance.origin == InstanceOrigin::Created {
                        self.stop_instance(provisioner.as_ref(), &instance).await;
                    }
                    inner.instance = None;
                    return Err(BrokerError::InitializationFailed {
                        kind: self.kind,
                        artifact: artifact.to_string(),
                        source,
                    });
                }
            }
        } else if !artifacts.is_empty() {
            debug!(
                "{}: reattached to {}, skipping {} artifact(s)",
                self.kind,
                instance.id,
                artifacts.len()
            );
        }

        if instance.origin == InstanceOrigin::Created {
            if let Err(e) = provisioner.mark_initialized(&instance).await {
                warn!(
                    "{}: could not mark {} initialized: {}",
                    self.kind, instance.id, e
                );
            }
        }

        self.provision_count.fetch_add(1, Ordering::SeqCst);
        info!(
            "{}: ready at {} ({:?})",
            self.kind, instance.address, instance.origin
        );
        inner.handle = Some(handle.clone());
        inner.instance = Some(instance);
        inner.artifacts = artifacts.to_vec();
        Ok(handle)
    }

    /// Connects and probes. Local instances are retried until the startup
    /// deadline since the service may still be warming up; external endpoints
    /// get exactly one attempt.
    async fn connect_ready(&self, instance: &Instance) -> ConnectorResult<C::Handle> {
        let deadline = Instant::now() + self.settings.startup_timeout();
        loop {
            let attempt = match self.connector.connect(&instance.address).await {
                Ok(handle) => match self.probe(&handle).await {
                    Ok(()) => return Ok(handle),
                    Err(e) => {
                        self.connector.close(&handle).await;
                        e
                    }
                },
                Err(e) => e,
            };

            if !instance.origin.retries_connect() || Instant::now() >= deadline {
                return Err(attempt);
            }
            debug!("{}: not reachable yet: {}", self.kind, attempt);
            tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
        }
    }

    async fn stop_instance(&self, provisioner: &dyn Provisioner, instance: &Instance) {
        let timeout = self.settings.stop_timeout();
        let failure: Option<BoxError> =
            match tokio::time::timeout(timeout, provisioner.stop(instance)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(Box::new(e)),
                Err(_) => Some(format!("stop timed out after {}s", timeout.as_secs()).into()),
            };
        if let Some(source) = failure {
            let e = BrokerError::CleanupFailed {
                kind: self.kind,
                phase: "stop",
                source,
            };
            warn!("{}", e);
        }
    }

    /// Stops an instance whose provisioning attempt never finished. Only
    /// instances created by that attempt are stopped.
    async fn discard_abandoned(&self, inner: &Inner<C::Handle>, instance: &Instance) {
        if instance.origin != InstanceOrigin::Created {
            return;
        }
        warn!(
            "{}: stopping {} left by an abandoned provisioning attempt",
            self.kind, instance.id
        );
        if let Some(provisioner) = inner.provisioner.clone() {
            self.stop_instance(provisioner.as_ref(), instance).await;
        }
    }

    async fn teardown(&self, inner: &mut Inner<C::Handle>) {
        if let Some(handle) = inner.handle.take() {
            self.connector.close(&handle).await;
        }
        if let Some(instance) = inner.instance.take() {
            if let Some(provisioner) = inner.provisioner.clone() {
                self.stop_instance(provisioner.as_ref(), &instance).await;
            }
            info!("{}: stopped {}", self.kind, instance.id);
        }
        inner.artifacts.clear();
        inner.state = BrokerState::NotStarted;
    }
}

/// Kind-erased view of a broker, used by the builder and the registry.
#[async_trait]
pub trait SharedResource: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Acquires a lease and returns the handle as `Arc<C::Handle>` erased.
    async fn acquire_any(&self, artifacts: &[InitArtifact])
    -> BrokerResult<Arc<dyn Any + Send + Sync>>;

    async fn release(&self);

    async fn clean_data(&self) -> BrokerResult<()>;

    async fn refresh(&self) -> BrokerResult<()>;

    async fn shutdown(&self);

    async fn state(&self) -> BrokerState;

    async fn endpoint(&self) -> Option<String>;

    fn ref_count(&self) -> usize;

    fn provision_count(&self) -> usize;

    fn reuse_across_runs(&self) -> bool;
}

#[async_trait]
impl<C: Connector> SharedResource for Broker<C> {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn acquire_any(
        &self,
        artifacts: &[InitArtifact],
    ) -> BrokerResult<Arc<dyn Any + Send + Sync>> {
        let handle = Broker::acquire(self, artifacts).await?;
        Ok(Arc::new(handle))
    }

    async fn release(&self) {
        Broker::release(self).await
    }

    async fn clean_data(&self) -> BrokerResult<()> {
        Broker::clean_data(self).await
    }

    async fn refresh(&self) -> BrokerResult<()> {
        Broker::refresh(self).await
    }

    async fn shutdown(&self) {
        Broker::shutdown(self).await
    }

    async fn state(&self) -> BrokerState {
        Broker::state(self).await
    }

    async fn endpoint(&self) -> Option<String> {
        Broker::endpoint(self).await
    }

    fn ref_count(&self) -> usize {
        Broker::ref_count(self)
    }

    fn provision_count(&self) -> usize {
        Broker::provision_count(self)
    }

    fn reuse_across_runs(&self) -> bool {
        Broker::reuse_across_runs(self)
    }
}
