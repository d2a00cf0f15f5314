//! The sandbox façade tests talk to

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bridge::EvaluationBridge;
use crate::config::{HarnessSettings, SandboxOptions};
use crate::error::SandboxResult;
use crate::lifecycle::{write_source, NodeLauncher, ResourceLifecycle, SessionResources};
use crate::patch::{PatchCoordinator, PatchOutcome};

/// A live dev server plus page, scoped to one test.
pub struct Sandbox {
    resources: Arc<SessionResources>,
    bridge: EvaluationBridge,
    coordinator: PatchCoordinator,
}

impl Sandbox {
    /// Provision with settings from [`HarnessSettings::load`] and the real
    /// dev server and Playwright page.
    pub async fn provision(options: SandboxOptions) -> SandboxResult<Self> {
        let settings = HarnessSettings::load()?;
        let lifecycle = ResourceLifecycle::new(settings.clone(), Arc::new(NodeLauncher::new(settings)));
        Self::provision_with(&lifecycle, options).await
    }

    /// Provision through an explicit lifecycle (custom launcher or registry).
    pub async fn provision_with(lifecycle: &ResourceLifecycle, options: SandboxOptions) -> SandboxResult<Self> {
        let resources = lifecycle.provision(&options).await?;
        let bridge = EvaluationBridge::new(resources.page().clone());
        let coordinator = PatchCoordinator::new(resources.clone(), &lifecycle.settings().patch);
        Ok(Self {
            resources,
            bridge,
            coordinator,
        })
    }

    pub fn id(&self) -> &str {
        self.resources.id()
    }

    pub fn port(&self) -> u16 {
        self.resources.port()
    }

    pub fn base_url(&self) -> String {
        self.resources.base_url()
    }

    pub fn root_dir(&self) -> &Path {
        &self.resources.layout().root
    }

    pub fn src_dir(&self) -> &Path {
        &self.resources.layout().src
    }

    /// Write a source file without waiting for the page to react.
    pub async fn write(&self, file: &str, content: &str) -> SandboxResult<()> {
        self.resources.ensure_live()?;
        debug!(session = %self.id(), file, "Writing source file");
        write_source(self.resources.layout(), file, content).await
    }

    /// Write a source file and wait for a hot update or a reload.
    pub async fn patch(&self, file: &str, content: &str) -> SandboxResult<PatchOutcome> {
        self.coordinator.patch(file, content).await
    }

    /// Delete a source file.
    pub async fn remove(&self, file: &str) -> SandboxResult<()> {
        self.resources.ensure_live()?;
        debug!(session = %self.id(), file, "Removing source file");
        tokio::fs::remove_file(self.resources.layout().source_path(file)).await?;
        Ok(())
    }

    /// Current content of a source file.
    pub async fn read(&self, file: &str) -> SandboxResult<String> {
        self.resources.ensure_live()?;
        Ok(tokio::fs::read_to_string(self.resources.layout().source_path(file)).await?)
    }

    pub async fn evaluate(&self, function: &str, args: &[Value]) -> SandboxResult<Value> {
        self.resources.ensure_live()?;
        self.bridge.evaluate(function, args).await
    }

    pub async fn evaluate_as<T: DeserializeOwned>(&self, function: &str, args: &[Value]) -> SandboxResult<T> {
        self.resources.ensure_live()?;
        self.bridge.evaluate_as(function, args).await
    }

    /// Reload the page and clear the full-refresh latch.
    pub async fn reload(&self) -> SandboxResult<()> {
        self.resources.ensure_live()?;
        info!(session = %self.id(), "Reloading page");
        self.resources.page().reload().await?;
        self.resources.state().lock().did_full_refresh = false;
        Ok(())
    }

    pub fn logs(&self) -> Vec<String> {
        self.resources.state().lock().logs.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.resources.state().lock().errors.clone()
    }

    pub fn did_full_refresh(&self) -> bool {
        self.resources.state().lock().did_full_refresh
    }

    /// Clear logs and errors.
    pub fn reset_state(&self) {
        self.resources.state().lock().clear_buffers();
    }

    /// Tear the sandbox down now instead of at the end-of-test drain.
    pub async fn dispose(&self) {
        self.resources.release().await;
    }

    pub fn is_disposed(&self) -> bool {
        self.resources.is_released()
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox").field("resources", &self.resources).finish()
    }
}
