//! Hot-Reload Sandbox
//!
//! This crate provides a Rust-controlled harness for testing code reloading
//! against a live dev server:
//! - Provisions a throwaway project directory per test
//! - Spawns the dev server as a subprocess
//! - Controls a browser page via a Playwright driver process
//! - Patches source files and classifies the page's reaction
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Sandbox (session façade)                 │
//! │    ├── write / remove / read        -> source directory     │
//! │    ├── patch(file, content)         -> PatchCoordinator     │
//! │    ├── evaluate(fn, args)           -> EvaluationBridge     │
//! │    ├── reload()                     -> PageDriver           │
//! │    └── logs / errors / did_full_refresh                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ResourceLifecycle                                          │
//! │    ├── provision() -> SessionResources                      │
//! │    │     ├── ProjectLayout (root, src, public)              │
//! │    │     ├── ServerProcess (DevServer)                      │
//! │    │     └── PageDriver (PlaywrightPage) + EventHub         │
//! │    └── release() -> once, swallowing failures               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CleanupRegistry (global or per-test scope, drained after)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use refresh_sandbox::{testing::with_cleanup, PatchOutcome, Sandbox, SandboxOptions};
//!
//! # async fn demo() -> refresh_sandbox::SandboxResult<()> {
//! with_cleanup(async {
//!     let sandbox = Sandbox::provision(
//!         SandboxOptions::new().file("a.js", "module.exports = 1"),
//!     )
//!     .await?;
//!     assert_eq!(sandbox.patch("a.js", "module.exports = 2").await?, PatchOutcome::Applied);
//!     assert!(!sandbox.did_full_refresh());
//!     Ok::<_, refresh_sandbox::SandboxError>(())
//! })
//! .await
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod page;
pub mod patch;
pub mod registry;
pub mod scaffold;
pub mod server;
pub mod session;
pub mod state;
pub mod testing;

pub use bridge::{EvaluationBridge, PageFunction};
pub use config::{HarnessSettings, SandboxOptions};
pub use error::{SandboxError, SandboxResult};
pub use events::{EventHub, PageEvent};
pub use lifecycle::{Launcher, NodeLauncher, ProjectLayout, ResourceLifecycle, SessionResources};
pub use page::{BindingHandler, PageDriver, PlaywrightPage};
pub use patch::{PatchCoordinator, PatchOutcome};
pub use registry::CleanupRegistry;
pub use server::{DevServer, ServerProcess};
pub use session::Sandbox;
pub use state::SessionState;
