mod common;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use common::{fake_broker, FakeConnector};
use testdeps::broker::{Broker, BrokerState, SharedResource};
use testdeps::config::Config;
use testdeps::{coordinator, registry, ResourceKind};

#[tokio::test]
async fn test_teardown_respects_reuse_policy() {
    let owned = fake_broker(ResourceKind::Relational, false);
    let reused = fake_broker(ResourceKind::SearchEngine, true);
    owned.broker.acquire(&[]).await.unwrap();
    reused.broker.acquire(&[]).await.unwrap();
    owned.broker.release().await;
    reused.broker.release().await;

    let brokers: Vec<Arc<dyn SharedResource>> =
        vec![owned.broker.clone(), reused.broker.clone()];
    coordinator::teardown(&brokers).await;

    assert_eq!(owned.provisioner.stops(), 1);
    assert_eq!(owned.store.closes(), 1);
    assert_eq!(reused.provisioner.stops(), 0);
    assert_eq!(reused.store.closes(), 1);
    assert_eq!(owned.broker.state().await, BrokerState::NotStarted);
    assert_eq!(reused.broker.state().await, BrokerState::NotStarted);
}

#[tokio::test]
async fn test_teardown_continues_past_stop_failure() {
    let first = fake_broker(ResourceKind::Relational, false);
    let second = fake_broker(ResourceKind::DocumentStore, false);
    first.provisioner.set_failing_stop(true);
    first.broker.acquire(&[]).await.unwrap();
    second.broker.acquire(&[]).await.unwrap();

    let brokers: Vec<Arc<dyn SharedResource>> =
        vec![first.broker.clone(), second.broker.clone()];
    coordinator::teardown(&brokers).await;

    assert_eq!(first.provisioner.stops(), 1);
    assert_eq!(second.provisioner.stops(), 1);
    assert_eq!(first.broker.state().await, BrokerState::NotStarted);
    assert_eq!(second.broker.ref_count(), 0);
}

#[tokio::test]
async fn test_teardown_of_nothing_is_a_no_op() {
    coordinator::teardown(&[]).await;

    let idle = fake_broker(ResourceKind::Relational, false);
    coordinator::teardown(&[idle.broker.clone() as Arc<dyn SharedResource>]).await;
    assert_eq!(idle.provisioner.starts(), 0);
    assert_eq!(idle.provisioner.stops(), 0);
}

async fn failing_body(broker: Arc<Broker<FakeConnector>>) {
    broker.acquire(&[]).await.unwrap();
    panic!("test body failed");
}

// The only test in this binary that touches the process-wide registry.
#[tokio::test]
async fn test_run_tears_down_registered_brokers_after_panic() {
    let _ = registry::configure(Config::default());

    let owned = fake_broker(ResourceKind::Custom("coordinator-owned"), false);
    let reused = fake_broker(ResourceKind::Custom("coordinator-reused"), true);
    registry::register(owned.broker.clone());
    registry::register(reused.broker.clone());
    reused.broker.acquire(&[]).await.unwrap();

    let broker = owned.broker.clone();
    let outcome = AssertUnwindSafe(coordinator::run(move || failing_body(broker)))
        .catch_unwind()
        .await;

    assert!(outcome.is_err());
    assert_eq!(owned.provisioner.starts(), 1);
    assert_eq!(owned.provisioner.stops(), 1);
    assert_eq!(reused.provisioner.stops(), 0);
    assert_eq!(reused.store.closes(), 1);
    assert_eq!(owned.broker.ref_count(), 0);
}
