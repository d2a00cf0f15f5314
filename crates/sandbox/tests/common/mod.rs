//! Scripted stand-ins for the dev server and the browser page.
//!
//! The fake server polls the sandbox source tree and, for every changed file,
//! reacts the way a dev server would: a hot update, a full reload, both, or
//! nothing. Reactions go through the same bindings and navigation events the
//! real page driver produces.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

use refresh_sandbox::config::PatchSettings;
use refresh_sandbox::scaffold::{HOT_ERROR_BINDING, HOT_SUCCESS_BINDING};
use refresh_sandbox::{
    BindingHandler, CleanupRegistry, EventHub, HarnessSettings, Launcher, PageDriver, PageEvent,
    ProjectLayout, ResourceLifecycle, SandboxError, SandboxResult, ServerProcess,
};

/// How the fake dev server answers a changed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    HotUpdate,
    FullReload,
    /// Hot-update success and a navigation in the same tick
    HotThenReload,
    HotError(String),
    Silent,
}

type ReactFn = Arc<dyn Fn(&str) -> Reaction + Send + Sync>;

pub struct FakePage {
    hub: EventHub,
    bindings: Mutex<HashMap<String, BindingHandler>>,
    calls: Mutex<Vec<String>>,
    eval_result: Mutex<Result<Value, String>>,
    closes: AtomicUsize,
    url: Mutex<String>,
}

impl FakePage {
    fn new(hub: EventHub) -> Self {
        Self {
            hub,
            bindings: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            eval_result: Mutex::new(Ok(Value::Null)),
            closes: AtomicUsize::new(0),
            url: Mutex::new(String::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn has_binding(&self, name: &str) -> bool {
        self.bindings.lock().contains_key(name)
    }

    pub fn set_eval_result(&self, result: Result<Value, String>) {
        *self.eval_result.lock() = result;
    }

    /// What `window.<name>(...args)` in the page would do.
    pub fn call_binding(&self, name: &str, args: Vec<Value>) {
        let handler = self.bindings.lock().get(name).cloned();
        if let Some(handler) = handler {
            handler(args);
        }
    }

    /// A top-level navigation the harness did not ask for.
    pub fn navigate_externally(&self) {
        let url = self.url.lock().clone();
        self.hub.emit(PageEvent::Navigated { url });
    }

    pub fn console(&self, text: &str) {
        self.hub.emit(PageEvent::Console { text: text.to_string() });
    }
}

#[async_trait]
impl PageDriver for FakePage {
    fn events(&self) -> EventHub {
        self.hub.clone()
    }

    async fn expose_binding(&self, name: &str, handler: BindingHandler) -> SandboxResult<()> {
        self.calls.lock().push(format!("expose:{}", name));
        self.bindings.lock().insert(name.to_string(), handler);
        Ok(())
    }

    async fn goto(&self, url: &str) -> SandboxResult<()> {
        self.calls.lock().push(format!("goto:{}", url));
        *self.url.lock() = url.to_string();
        self.hub.emit(PageEvent::Navigated { url: url.to_string() });
        Ok(())
    }

    async fn reload(&self) -> SandboxResult<()> {
        self.calls.lock().push("reload".to_string());
        self.navigate_externally();
        Ok(())
    }

    async fn evaluate(&self, function: &str, args: Vec<Value>) -> SandboxResult<Value> {
        self.calls
            .lock()
            .push(format!("evaluate:{}:{}", function, Value::Array(args)));
        self.eval_result.lock().clone().map_err(SandboxError::Evaluation)
    }

    async fn close(&self) -> SandboxResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeServer {
    port: u16,
    stopped: Arc<AtomicBool>,
    terminations: Arc<AtomicUsize>,
}

#[async_trait]
impl ServerProcess for FakeServer {
    fn port(&self) -> u16 {
        self.port
    }

    async fn terminate(&mut self) -> SandboxResult<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One fake page and server per launcher.
pub struct FakeLauncher {
    pub page: Arc<FakePage>,
    react: Option<ReactFn>,
    fail_page: bool,
    terminations: Arc<AtomicUsize>,
    started: AtomicUsize,
}

impl FakeLauncher {
    /// Every changed file gets the same reaction.
    pub fn reacting(reaction: Reaction) -> Self {
        Self::with_rule(move |_| reaction.clone())
    }

    /// Per-file reactions.
    pub fn with_rule<F>(rule: F) -> Self
    where
        F: Fn(&str) -> Reaction + Send + Sync + 'static,
    {
        Self {
            page: Arc::new(FakePage::new(EventHub::new())),
            react: Some(Arc::new(rule)),
            fail_page: false,
            terminations: Arc::new(AtomicUsize::new(0)),
            started: AtomicUsize::new(0),
        }
    }

    /// A server that never watches files.
    pub fn silent() -> Self {
        Self {
            react: None,
            ..Self::reacting(Reaction::Silent)
        }
    }

    pub fn failing_page() -> Self {
        Self {
            fail_page: true,
            ..Self::silent()
        }
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn servers_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn start_server(&self, layout: &ProjectLayout, port: u16) -> SandboxResult<Box<dyn ServerProcess>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let stopped = Arc::new(AtomicBool::new(false));

        if let Some(react) = self.react.clone() {
            // Baseline taken now, before any patch can race the first poll.
            let known = snapshot(&layout.src);
            tokio::spawn(watch(
                layout.src.clone(),
                known,
                react,
                self.page.clone(),
                stopped.clone(),
            ));
        }

        Ok(Box::new(FakeServer {
            port,
            stopped,
            terminations: self.terminations.clone(),
        }))
    }

    async fn open_page(&self, _layout: &ProjectLayout) -> SandboxResult<Arc<dyn PageDriver>> {
        if self.fail_page {
            return Err(SandboxError::PageDriver("browser failed to launch".into()));
        }
        Ok(self.page.clone())
    }
}

fn snapshot(src: &Path) -> BTreeMap<PathBuf, String> {
    WalkDir::new(src)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let content = std::fs::read_to_string(entry.path()).ok()?;
            let relative = entry.path().strip_prefix(src).ok()?.to_path_buf();
            Some((relative, content))
        })
        .collect()
}

async fn watch(
    src: PathBuf,
    mut known: BTreeMap<PathBuf, String>,
    react: ReactFn,
    page: Arc<FakePage>,
    stopped: Arc<AtomicBool>,
) {
    while !stopped.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let first = snapshot(&src);
        let changed: Vec<PathBuf> = first
            .iter()
            .filter(|(path, content)| known.get(*path) != Some(*content))
            .map(|(path, _)| path.clone())
            .collect();
        if changed.is_empty() {
            continue;
        }

        // Only react to files that have stopped changing.
        tokio::time::sleep(Duration::from_millis(2)).await;
        let settled = snapshot(&src);
        for path in changed {
            let (Some(before), Some(after)) = (first.get(&path), settled.get(&path)) else {
                continue;
            };
            if before != after {
                continue;
            }
            known.insert(path.clone(), after.clone());

            let file = path.to_string_lossy().replace('\\', "/");
            match react(&file) {
                Reaction::HotUpdate => page.call_binding(HOT_SUCCESS_BINDING, vec![]),
                Reaction::FullReload => page.navigate_externally(),
                Reaction::HotThenReload => {
                    page.call_binding(HOT_SUCCESS_BINDING, vec![]);
                    page.navigate_externally();
                }
                Reaction::HotError(message) => {
                    page.call_binding(HOT_ERROR_BINDING, vec![Value::String(message)])
                }
                Reaction::Silent => {}
            }
        }
    }
}

/// Settings rooted in `root`, with a short bound and settle delay.
pub fn settings(root: &Path) -> HarnessSettings {
    HarnessSettings {
        root_dir: root.to_path_buf(),
        patch: PatchSettings {
            timeout_ms: 5_000,
            settle_ms: 10,
        },
        ..Default::default()
    }
}

pub fn lifecycle(root: &Path, launcher: Arc<FakeLauncher>, registry: &CleanupRegistry) -> ResourceLifecycle {
    ResourceLifecycle::new(settings(root), launcher).with_registry(registry.clone())
}
