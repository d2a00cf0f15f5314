//! Sandbox provisioning and teardown
//!
//! [`ResourceLifecycle::provision`] builds everything one sandbox owns: the
//! project directory, the dev server and the page. The returned
//! [`SessionResources`] is released exactly once, either explicitly or by the
//! [`CleanupRegistry`] drain at the end of a test.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{HarnessSettings, SandboxOptions};
use crate::error::{SandboxError, SandboxResult};
use crate::events::PageEvent;
use crate::page::{BindingHandler, PageDriver, PlaywrightPage};
use crate::registry::CleanupRegistry;
use crate::scaffold;
use crate::server::{find_free_port, DevServer, ServerProcess};
use crate::state::SharedState;

/// Factory for the two external collaborators of a sandbox.
#[async_trait]
pub trait Launcher: Send + Sync {
    fn allocate_port(&self) -> SandboxResult<u16> {
        find_free_port()
    }

    async fn start_server(&self, layout: &ProjectLayout, port: u16) -> SandboxResult<Box<dyn ServerProcess>>;

    async fn open_page(&self, layout: &ProjectLayout) -> SandboxResult<Arc<dyn PageDriver>>;
}

/// Launches a real dev server and a Playwright page.
#[derive(Debug, Clone)]
pub struct NodeLauncher {
    settings: HarnessSettings,
}

impl NodeLauncher {
    pub fn new(settings: HarnessSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Launcher for NodeLauncher {
    async fn start_server(&self, layout: &ProjectLayout, port: u16) -> SandboxResult<Box<dyn ServerProcess>> {
        let server = DevServer::spawn(&self.settings.server, &layout.root, port).await?;
        Ok(Box::new(server))
    }

    async fn open_page(&self, layout: &ProjectLayout) -> SandboxResult<Arc<dyn PageDriver>> {
        let page = PlaywrightPage::launch(&self.settings.page, &layout.root.join(".driver")).await?;
        Ok(Arc::new(page))
    }
}

/// Directory layout of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    pub root: PathBuf,
    pub src: PathBuf,
    pub public: PathBuf,
}

impl ProjectLayout {
    pub fn new(root_dir: &Path, id: &str) -> Self {
        let root = root_dir.join(id);
        Self {
            src: root.join("src"),
            public: root.join("public"),
            root,
        }
    }

    /// Path of `file` inside the source directory.
    pub fn source_path(&self, file: &str) -> PathBuf {
        self.src.join(file)
    }
}

/// Everything a live sandbox owns.
pub struct SessionResources {
    id: String,
    port: u16,
    layout: ProjectLayout,
    state: SharedState,
    page: Arc<dyn PageDriver>,
    server: tokio::sync::Mutex<Option<Box<dyn ServerProcess>>>,
    keep_artifacts: bool,
    registry: CleanupRegistry,
    released: AtomicBool,
    /// Filled on drop when the session was never released.
    orphaned: Arc<Mutex<Option<Leftovers>>>,
}

/// Handles a dropped, unreleased session hands over to its registered teardown.
struct Leftovers {
    page: Arc<dyn PageDriver>,
    server: Option<Box<dyn ServerProcess>>,
}

impl SessionResources {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://localhost:{}/", self.port)
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn page(&self) -> &Arc<dyn PageDriver> {
        &self.page
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Fails with [`SandboxError::Disposed`] once [`Self::release`] has started.
    pub fn ensure_live(&self) -> SandboxResult<()> {
        if self.is_released() {
            return Err(SandboxError::Disposed(self.id.clone()));
        }
        Ok(())
    }

    /// Close the page, stop the server, delete the directory and leave the
    /// registry. Later calls do nothing. Failures are logged, never returned.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            debug!(session = %self.id, "Sandbox already released");
            return;
        }

        info!(session = %self.id, "Releasing sandbox");

        let server = self.server.lock().await.take();
        shut_down(&self.id, self.page.as_ref(), server, &self.layout, self.keep_artifacts).await;

        self.registry.unregister(&self.id);
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        if self.is_released() {
            return;
        }
        let server = self.server.get_mut().take();
        *self.orphaned.lock() = Some(Leftovers {
            page: self.page.clone(),
            server,
        });
    }
}

impl std::fmt::Debug for SessionResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResources")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("layout", &self.layout)
            .field("released", &self.is_released())
            .finish()
    }
}

async fn shut_down(
    id: &str,
    page: &dyn PageDriver,
    server: Option<Box<dyn ServerProcess>>,
    layout: &ProjectLayout,
    keep_artifacts: bool,
) {
    if let Err(e) = page.close().await {
        log_teardown_failure(id, format!("closing page: {}", e));
    }

    if let Some(mut server) = server {
        if let Err(e) = server.terminate().await {
            log_teardown_failure(id, format!("stopping server: {}", e));
        }
    }

    remove_project(id, layout, keep_artifacts).await;
}

fn log_teardown_failure(id: &str, reason: String) {
    let error = SandboxError::TeardownFailure(reason);
    warn!(session = %id, "{}", error);
}

async fn remove_project(id: &str, layout: &ProjectLayout, keep_artifacts: bool) {
    if keep_artifacts {
        info!(session = %id, path = %layout.root.display(), "Keeping sandbox directory");
        return;
    }
    match tokio::fs::remove_dir_all(&layout.root).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log_teardown_failure(id, format!("removing {}: {}", layout.root.display(), e)),
    }
}

/// Creates sandboxes against one launcher and registry.
#[derive(Clone)]
pub struct ResourceLifecycle {
    settings: HarnessSettings,
    launcher: Arc<dyn Launcher>,
    registry: Option<CleanupRegistry>,
}

impl ResourceLifecycle {
    /// Sandboxes go to [`CleanupRegistry::current`] at provision time.
    pub fn new(settings: HarnessSettings, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            settings,
            launcher,
            registry: None,
        }
    }

    /// Pin every sandbox to `registry`, whatever scope provisions it.
    pub fn with_registry(mut self, registry: CleanupRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    pub fn registry(&self) -> CleanupRegistry {
        self.registry.clone().unwrap_or_else(CleanupRegistry::current)
    }

    pub async fn provision(&self, options: &SandboxOptions) -> SandboxResult<Arc<SessionResources>> {
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let port = self.launcher.allocate_port()?;
        let layout = ProjectLayout::new(&self.settings.root_dir, &id);
        let keep = self.settings.keep_artifacts;
        let registry = self.registry();

        info!(session = %id, port, root = %layout.root.display(), "Provisioning sandbox");

        if let Err(e) = write_project(&layout, port, options).await {
            remove_project(&id, &layout, keep).await;
            return Err(e);
        }

        let server = match self.launcher.start_server(&layout, port).await {
            Ok(server) => server,
            Err(e) => {
                remove_project(&id, &layout, keep).await;
                return Err(e);
            }
        };

        let page = match self.launcher.open_page(&layout).await {
            Ok(page) => page,
            Err(e) => {
                let mut server = server;
                if let Err(stop) = server.terminate().await {
                    log_teardown_failure(&id, format!("stopping server: {}", stop));
                }
                remove_project(&id, &layout, keep).await;
                return Err(e);
            }
        };

        let resources = Arc::new(SessionResources {
            id: id.clone(),
            port,
            layout,
            state: SharedState::default(),
            page,
            server: tokio::sync::Mutex::new(Some(server)),
            keep_artifacts: keep,
            registry: registry.clone(),
            released: AtomicBool::new(false),
            orphaned: Arc::new(Mutex::new(None)),
        });

        // Weak, so the registry never owns the session. A session dropped
        // without release leaves its handles in `orphaned` for this teardown.
        let session = Arc::downgrade(&resources);
        let orphaned = resources.orphaned.clone();
        let layout = resources.layout.clone();
        let owner = id.clone();
        registry.register(id.clone(), move || async move {
            if let Some(resources) = session.upgrade() {
                resources.release().await;
                return;
            }
            let leftovers = orphaned.lock().take();
            if let Some(Leftovers { page, server }) = leftovers {
                debug!(session = %owner, "Tearing down dropped sandbox");
                shut_down(&owner, page.as_ref(), server, &layout, keep).await;
            }
        });

        if let Err(e) = connect_page(&resources).await {
            resources.release().await;
            return Err(e);
        }

        Ok(resources)
    }
}

/// Materialize the project tree: scaffold first, then seed files.
async fn write_project(layout: &ProjectLayout, port: u16, options: &SandboxOptions) -> SandboxResult<()> {
    // A kept directory from an earlier run with the same id
    match tokio::fs::remove_dir_all(&layout.root).await {
        Ok(()) => debug!(path = %layout.root.display(), "Removed stale sandbox directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(&layout.src).await?;
    tokio::fs::create_dir_all(&layout.public).await?;

    tokio::fs::write(layout.src.join("package.json"), scaffold::package_json(options.es_module)).await?;
    tokio::fs::write(layout.public.join("index.html"), scaffold::index_html(port)).await?;
    tokio::fs::write(layout.root.join("webpack.config.js"), scaffold::webpack_config(options.es_module)).await?;
    tokio::fs::write(layout.root.join(scaffold::HOOKS_FILE), scaffold::hot_hooks()).await?;

    for (file, content) in &options.initial_files {
        write_source(layout, file, content).await?;
    }

    let entry = scaffold::entry_file(options.es_module);
    if !options.initial_files.contains_key(entry) {
        tokio::fs::write(layout.src.join(entry), scaffold::default_entry(options.es_module)).await?;
    }

    Ok(())
}

/// Write `content` to `file` under the source directory, creating parents.
pub(crate) async fn write_source(layout: &ProjectLayout, file: &str, content: &str) -> SandboxResult<()> {
    let path = layout.source_path(file);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, content).await?;
    Ok(())
}

/// Hook the page up to session state and load the app.
async fn connect_page(resources: &SessionResources) -> SandboxResult<()> {
    let hub = resources.page.events();

    // Every top-level navigation wipes the buffers, patch or not.
    let state = resources.state.clone();
    hub.observe(move |event| match event {
        PageEvent::Navigated { .. } => state.lock().clear_buffers(),
        PageEvent::HotUpdateError { message } => state.lock().errors.push(message.clone()),
        PageEvent::Console { text } => state.lock().logs.push(text.clone()),
        PageEvent::HotUpdateApplied => {}
    });

    let success_hub = hub.clone();
    let on_success: BindingHandler = Arc::new(move |_args: Vec<Value>| {
        success_hub.emit(PageEvent::HotUpdateApplied);
    });
    resources
        .page
        .expose_binding(scaffold::HOT_SUCCESS_BINDING, on_success)
        .await?;

    let error_hub = hub.clone();
    let on_error: BindingHandler = Arc::new(move |args: Vec<Value>| {
        error_hub.emit(PageEvent::HotUpdateError {
            message: binding_message(&args),
        });
    });
    resources
        .page
        .expose_binding(scaffold::HOT_ERROR_BINDING, on_error)
        .await?;

    resources.page.goto(&resources.base_url()).await?;
    Ok(())
}

fn binding_message(args: &[Value]) -> String {
    match args.first() {
        Some(Value::String(message)) => message.clone(),
        Some(other) => other.to_string(),
        None => "hot update error".to_string(),
    }
}
