//! Patch-and-observe coordination
//!
//! A patch writes a source file while racing three signals:
//!
//! ```text
//!            ┌── navigation on the main frame ──▶ Reloaded
//!  Pending ──┼── hot-update success ────────────▶ Applied
//!            └── timer (30s by default) ────────▶ TimedOut
//! ```
//!
//! Both listeners and the timer exist before the write starts, so a
//! notification pushed in response to the write cannot be missed. The first
//! signal wins; the losing listeners are dropped with the race future.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::PatchSettings;
use crate::error::{SandboxError, SandboxResult};
use crate::events::EventHub;
use crate::lifecycle::{write_source, SessionResources};

/// How a single patch resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Hot update accepted, no navigation
    Applied,
    /// The page navigated instead of (or after) hot updating
    Reloaded,
    /// Neither signal arrived within the bound
    TimedOut,
}

impl PatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchOutcome::Applied => "success",
            PatchOutcome::Reloaded => "reloaded",
            PatchOutcome::TimedOut => "timed-out",
        }
    }
}

impl fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wait for the first of navigation, hot-update success or `deadline`.
///
/// When a navigation and a hot update are both ready at the same poll, the
/// navigation wins.
pub async fn race_outcome(
    mut navigations: broadcast::Receiver<String>,
    mut hot_updates: broadcast::Receiver<()>,
    deadline: tokio::time::Sleep,
) -> PatchOutcome {
    tokio::pin!(deadline);
    tokio::select! {
        biased;
        url = next_signal(&mut navigations) => {
            debug!(%url, "Navigation observed during patch");
            PatchOutcome::Reloaded
        }
        () = next_signal(&mut hot_updates) => PatchOutcome::Applied,
        () = &mut deadline => PatchOutcome::TimedOut,
    }
}

/// Next value from a listener. A closed channel never resolves, leaving the
/// decision to the timer.
async fn next_signal<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
    loop {
        match rx.recv().await {
            Ok(value) => return value,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Applies file mutations to a live sandbox and classifies the result.
#[derive(Clone)]
pub struct PatchCoordinator {
    resources: Arc<SessionResources>,
    timeout: Duration,
    settle_delay: Duration,
}

impl PatchCoordinator {
    pub fn new(resources: Arc<SessionResources>, settings: &PatchSettings) -> Self {
        Self {
            resources,
            timeout: settings.timeout(),
            settle_delay: settings.settle_delay(),
        }
    }

    /// Write `content` to `file` and wait for the page to react.
    ///
    /// Returns [`PatchOutcome::Applied`] or [`PatchOutcome::Reloaded`]; a
    /// timeout fails with [`SandboxError::InconsistentState`]. Write errors
    /// are returned as-is.
    pub async fn patch(&self, file: &str, content: &str) -> SandboxResult<PatchOutcome> {
        self.resources.ensure_live()?;
        let hub: EventHub = self.resources.page().events();

        // Listeners and timer first; nothing below may yield before this.
        let navigations = hub.subscribe_navigations();
        let hot_updates = hub.subscribe_hot_updates();
        let deadline = tokio::time::sleep(self.timeout);

        debug!(session = %self.resources.id(), file, "Patching");

        let write = write_source(self.resources.layout(), file, content);
        let race = async { Ok::<_, SandboxError>(race_outcome(navigations, hot_updates, deadline).await) };
        let ((), outcome) = tokio::try_join!(write, race)?;

        match outcome {
            PatchOutcome::Reloaded => {
                info!(session = %self.resources.id(), file, "Application reloaded");
                let mut state = self.resources.state().lock();
                state.logs.push("Application reloaded".to_string());
                state.did_full_refresh = true;
            }
            PatchOutcome::Applied => {
                info!(session = %self.resources.id(), file, "Hot update complete");
                self.resources
                    .state()
                    .lock()
                    .logs
                    .push("Hot update complete".to_string());
            }
            PatchOutcome::TimedOut => {
                return Err(SandboxError::InconsistentState {
                    state: outcome.as_str().to_string(),
                });
            }
        }

        tokio::time::sleep(self.settle_delay).await;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PageEvent;
    use tokio::time::Instant;

    fn arm(hub: &EventHub, timeout: Duration) -> impl std::future::Future<Output = PatchOutcome> {
        race_outcome(
            hub.subscribe_navigations(),
            hub.subscribe_hot_updates(),
            tokio::time::sleep(timeout),
        )
    }

    #[tokio::test]
    async fn test_hot_update_wins() {
        let hub = EventHub::new();
        let race = arm(&hub, Duration::from_secs(30));
        hub.emit(PageEvent::HotUpdateApplied);
        assert_eq!(race.await, PatchOutcome::Applied);
    }

    #[tokio::test]
    async fn test_navigation_wins() {
        let hub = EventHub::new();
        let race = arm(&hub, Duration::from_secs(30));
        hub.emit(PageEvent::Navigated { url: "http://localhost/".into() });
        assert_eq!(race.await, PatchOutcome::Reloaded);
    }

    #[tokio::test]
    async fn test_simultaneous_signals_prefer_navigation() {
        let hub = EventHub::new();
        let race = arm(&hub, Duration::from_secs(30));
        hub.emit(PageEvent::HotUpdateApplied);
        hub.emit(PageEvent::Navigated { url: "http://localhost/".into() });
        assert_eq!(race.await, PatchOutcome::Reloaded);
    }

    #[tokio::test]
    async fn test_signals_before_arming_are_ignored() {
        let hub = EventHub::new();
        hub.emit(PageEvent::HotUpdateApplied);
        let race = arm(&hub, Duration::from_millis(20));
        assert_eq!(race.await, PatchOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_bound() {
        let hub = EventHub::new();
        let start = Instant::now();
        let outcome = arm(&hub, Duration::from_secs(30)).await;
        assert_eq!(outcome, PatchOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(31));
    }

    #[tokio::test]
    async fn test_listeners_detached_after_race() {
        let hub = EventHub::new();
        let race = arm(&hub, Duration::from_secs(30));
        hub.emit(PageEvent::HotUpdateApplied);
        race.await;

        // A late navigation has nobody left to notify.
        let debug = format!("{:?}", hub);
        assert!(debug.contains("navigation_listeners: 0"));
        assert!(debug.contains("hot_update_listeners: 0"));
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(PatchOutcome::Applied.to_string(), "success");
        assert_eq!(PatchOutcome::Reloaded.to_string(), "reloaded");
        assert_eq!(PatchOutcome::TimedOut.to_string(), "timed-out");
    }
}
