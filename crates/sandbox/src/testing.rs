//! Test-runner integration

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing_subscriber::EnvFilter;

use crate::registry::CleanupRegistry;

/// Install a `tracing` subscriber for tests. Safe to call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Run a test body, then tear down every sandbox it provisioned, whether
/// the body returned or panicked. A panic is resumed after the teardown.
///
/// The body gets its own registry through [`CleanupRegistry::scope`], so
/// sandboxes belonging to tests running concurrently are left alone.
pub async fn with_cleanup<F, T>(body: F) -> T
where
    F: Future<Output = T>,
{
    with_registry_cleanup(&CleanupRegistry::new(), body).await
}

/// [`with_cleanup`] against an explicit registry, which is also
/// [`CleanupRegistry::current`] while `body` runs.
pub async fn with_registry_cleanup<F, T>(registry: &CleanupRegistry, body: F) -> T
where
    F: Future<Output = T>,
{
    let result = AssertUnwindSafe(registry.scope(body)).catch_unwind().await;
    registry.drain_all().await;
    match result {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
