//! In-memory provisioner and connector used by the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use testdeps::artifact::InitArtifact;
use testdeps::broker::Broker;
use testdeps::config::Settings;
use testdeps::connector::{Connector, ConnectorError, ConnectorResult};
use testdeps::isolation::TenantScope;
use testdeps::provisioner::{
    Instance, InstanceOrigin, Provisioner, ProvisionerError, ProvisionerResult,
};
use testdeps::ResourceKind;

/// Shared event log, used to check ordering across brokers.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn settings(reuse_across_runs: bool) -> Settings {
    Settings {
        reuse_across_runs,
        startup_timeout_secs: 1,
        stop_timeout_secs: 1,
        probe_timeout_secs: 1,
        ..Default::default()
    }
}

/// Provisioner that hands out numbered fake instances.
pub struct FakeProvisioner {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub marks: AtomicUsize,
    fail: AtomicBool,
    fail_stop: AtomicBool,
    origin: Mutex<InstanceOrigin>,
    delay: Duration,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            marks: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            origin: Mutex::new(InstanceOrigin::Created),
            delay,
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_failing_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    pub fn set_origin(&self, origin: InstanceOrigin) {
        *self.origin.lock().unwrap() = origin;
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Instances marked initialized.
    pub fn marks(&self) -> usize {
        self.marks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn start(&self, _artifacts: &[InitArtifact]) -> ProvisionerResult<Instance> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProvisionerError::Runtime("injected start failure".to_string()));
        }
        let origin = *self.origin.lock().unwrap();
        Ok(Instance::new(
            format!("fake-{}", n),
            format!("fake://instance/{}", n),
            origin,
        ))
    }

    async fn stop(&self, _instance: &Instance) -> ProvisionerResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ProvisionerError::Runtime("injected stop failure".to_string()));
        }
        Ok(())
    }

    async fn mark_initialized(&self, _instance: &Instance) -> ProvisionerResult<()> {
        self.marks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Backing "instance" of the fake connector: a tenant-tagged record list.
#[derive(Debug)]
pub struct FakeStore {
    label: String,
    log: EventLog,
    healthy: AtomicBool,
    records: Mutex<Vec<Value>>,
    applied: Mutex<Vec<String>>,
    fail_connect: AtomicBool,
    fail_clean: AtomicBool,
    fail_artifact: Mutex<Option<String>>,
    pub connects: AtomicUsize,
    pub cleans: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub closes: AtomicUsize,
}

impl FakeStore {
    pub fn new(label: &str, log: EventLog) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            log,
            healthy: AtomicBool::new(true),
            records: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
            fail_clean: AtomicBool::new(false),
            fail_artifact: Mutex::new(None),
            connects: AtomicUsize::new(0),
            cleans: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_clean(&self, fail: bool) {
        self.fail_clean.store(fail, Ordering::SeqCst);
    }

    pub fn fail_artifact(&self, stem: Option<&str>) {
        *self.fail_artifact.lock().unwrap() = stem.map(str::to_string);
    }

    pub fn insert(&self, scope: &TenantScope, id: &str) {
        self.records
            .lock()
            .unwrap()
            .push(json!({ "id": id, "tenant_id": scope.as_str() }));
    }

    pub fn all(&self) -> Vec<Value> {
        self.records.lock().unwrap().clone()
    }

    /// Records visible to `scope`.
    pub fn scoped(&self, scope: &TenantScope) -> Vec<Value> {
        scope.retain(self.all())
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct FakeConnector {
    store: Arc<FakeStore>,
}

impl FakeConnector {
    pub fn new(store: Arc<FakeStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Handle = Arc<FakeStore>;

    async fn connect(&self, _address: &str) -> ConnectorResult<Arc<FakeStore>> {
        self.store.connects.fetch_add(1, Ordering::SeqCst);
        if self.store.fail_connect.load(Ordering::SeqCst) {
            return Err(ConnectorError::Connect("injected connect failure".to_string()));
        }
        // A fresh connection means a fresh (healthy) instance.
        self.store.set_healthy(true);
        Ok(self.store.clone())
    }

    async fn probe(&self, handle: &Arc<FakeStore>) -> ConnectorResult<()> {
        if handle.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConnectorError::Connect("instance unhealthy".to_string()))
        }
    }

    async fn initialize(
        &self,
        handle: &Arc<FakeStore>,
        artifact: &InitArtifact,
    ) -> ConnectorResult<()> {
        let stem = artifact.stem();
        if handle.fail_artifact.lock().unwrap().as_deref() == Some(stem.as_str()) {
            return Err(ConnectorError::Query(format!("{} is broken", stem)));
        }
        handle.applied.lock().unwrap().push(stem);
        Ok(())
    }

    async fn clean(&self, handle: &Arc<FakeStore>) -> ConnectorResult<()> {
        if handle.fail_clean.load(Ordering::SeqCst) {
            return Err(ConnectorError::Query("injected clean failure".to_string()));
        }
        handle.records.lock().unwrap().clear();
        handle.cleans.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn refresh(&self, handle: &Arc<FakeStore>) -> ConnectorResult<()> {
        handle.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, handle: &Arc<FakeStore>) {
        handle.closes.fetch_add(1, Ordering::SeqCst);
        handle
            .log
            .lock()
            .unwrap()
            .push(format!("close:{}", handle.label));
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// A broker backed by fakes, plus the fakes for inspection.
pub struct FakeBroker {
    pub broker: Arc<Broker<FakeConnector>>,
    pub provisioner: Arc<FakeProvisioner>,
    pub store: Arc<FakeStore>,
}

pub fn fake_broker(kind: ResourceKind, reuse_across_runs: bool) -> FakeBroker {
    fake_broker_with(kind, reuse_across_runs, FakeProvisioner::new(), event_log())
}

pub fn fake_broker_with(
    kind: ResourceKind,
    reuse_across_runs: bool,
    provisioner: FakeProvisioner,
    log: EventLog,
) -> FakeBroker {
    let provisioner = Arc::new(provisioner);
    let store = FakeStore::new(kind.key(), log);
    let broker = Arc::new(Broker::with_provisioner(
        kind,
        FakeConnector::new(store.clone()),
        settings(reuse_across_runs),
        provisioner.clone(),
    ));
    FakeBroker {
        broker,
        provisioner,
        store,
    }
}

/// Writes artifact files named `<stem>.sql` into a temp dir.
pub fn artifact_files(dir: &tempfile::TempDir, stems: &[&str]) -> Vec<InitArtifact> {
    stems
        .iter()
        .map(|stem| {
            let path: PathBuf = dir.path().join(format!("{}.sql", stem));
            std::fs::write(&path, format!("-- {}\n", stem)).unwrap();
            InitArtifact::from_path(path)
        })
        .collect()
}
