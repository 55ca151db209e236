//! Test-run coordinator.
//!
//! Rust's test harness has no process-level setup/teardown hook, so suites
//! that want deterministic teardown wrap their body in [`run`] (typically from
//! a `harness = false` test target or a shared `#[tokio::main]`) or call
//! [`teardown_all`] from their last test.
//!
//! Teardown only stops instances of brokers whose reuse policy is disabled.
//! Failures are logged, never propagated.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::info;

use crate::broker::SharedResource;
use crate::logging;
use crate::registry;

/// Runs `body`, then tears down every registered broker.
///
/// Teardown also runs when `body` panics; the panic is resumed afterwards.
pub async fn run<F, Fut, T>(body: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    logging::init(registry::config().settings.debug);

    let outcome = AssertUnwindSafe(body()).catch_unwind().await;
    teardown_all().await;

    match outcome {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Shuts down every broker known to the registry.
pub async fn teardown_all() {
    teardown(&registry::brokers()).await;
}

/// Shuts down the given brokers.
pub async fn teardown(brokers: &[Arc<dyn SharedResource>]) {
    if brokers.is_empty() {
        return;
    }
    info!("Cleaning up shared test resources");
    for broker in brokers {
        broker.shutdown().await;
    }
    info!("Cleanup completed");
}
