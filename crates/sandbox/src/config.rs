//! Harness configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{SandboxError, SandboxResult};

/// Environment variable naming a TOML settings file.
pub const CONFIG_ENV: &str = "SANDBOX_CONFIG";

/// When set to anything but `0`/`false`, sandbox directories survive teardown.
pub const DEBUG_ENV: &str = "SANDBOX_DEBUG";

/// Overrides [`HarnessSettings::root_dir`].
pub const ROOT_ENV: &str = "SANDBOX_ROOT";

/// Process-level settings shared by every sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    /// Directory under which each sandbox gets `<root_dir>/<id>/`
    pub root_dir: PathBuf,

    /// Keep sandbox directories after teardown for inspection
    pub keep_artifacts: bool,

    /// Patch race timing
    pub patch: PatchSettings,

    /// Dev server process
    pub server: ServerSettings,

    /// Browser page driver
    pub page: PageSettings,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join("refresh-sandbox"),
            keep_artifacts: false,
            patch: PatchSettings::default(),
            server: ServerSettings::default(),
            page: PageSettings::default(),
        }
    }
}

impl HarnessSettings {
    /// Load settings from `$SANDBOX_CONFIG` (if set), then apply env overrides.
    pub fn load() -> SandboxResult<Self> {
        let mut settings = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Parse settings from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> SandboxResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let settings = toml::from_str(&raw)?;
        debug!(path = %path.display(), "Loaded harness settings");
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(DEBUG_ENV) {
            self.keep_artifacts = is_truthy(&value);
        }
        if let Some(root) = std::env::var_os(ROOT_ENV) {
            self.root_dir = PathBuf::from(root);
        }
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(value.trim().to_ascii_lowercase().as_str(), "" | "0" | "false" | "no")
}

/// Timing of the patch-and-observe race.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchSettings {
    /// How long to wait for a hot update or a reload
    pub timeout_ms: u64,

    /// Pause after a classified patch so re-render work can finish
    pub settle_ms: u64,
}

impl Default for PatchSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            settle_ms: 1_000,
        }
    }
}

impl PatchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// How to start the dev server.
///
/// `{port}` and `{root}` in `args` are substituted per sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub command: String,
    pub args: Vec<String>,
    pub startup_timeout_ms: u64,
    pub health_path: String,
    /// Grace period between SIGTERM and a hard kill
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            command: "npx".to_string(),
            args: vec![
                "webpack".to_string(),
                "serve".to_string(),
                "--config".to_string(),
                "{root}/webpack.config.js".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
            ],
            startup_timeout_ms: 30_000,
            health_path: "/".to_string(),
            shutdown_grace_ms: 2_000,
        }
    }
}

impl ServerSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Arguments with placeholders filled in.
    pub fn resolved_args(&self, port: u16, root: &Path) -> Vec<String> {
        let root = root.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{port}", &port.to_string()).replace("{root}", &root))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

/// How to run the Playwright page driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageSettings {
    pub node_binary: PathBuf,
    /// Extra module search path so the driver can `require('playwright')`
    pub node_path: Option<PathBuf>,
    pub browser: Browser,
    pub headless: bool,
    pub request_timeout_ms: u64,
}

impl Default for PageSettings {
    fn default() -> Self {
        Self {
            node_binary: PathBuf::from("node"),
            node_path: None,
            browser: Browser::Chromium,
            headless: true,
            request_timeout_ms: 30_000,
        }
    }
}

impl PageSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Per-sandbox generation options.
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    /// Sandbox identifier; generated when absent
    pub id: Option<String>,

    /// Generate an ES module project instead of CommonJS
    pub es_module: bool,

    /// Seed files, relative to the source directory
    pub initial_files: BTreeMap<String, String>,
}

impl SandboxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn es_module(mut self, es_module: bool) -> Self {
        self.es_module = es_module;
        self
    }

    pub fn file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.initial_files.insert(path.into(), content.into());
        self
    }
}
