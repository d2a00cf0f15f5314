//! Observable per-session state

use parking_lot::Mutex;
use std::sync::Arc;

/// Buffers and the full-refresh latch, shared between the session façade,
/// the patch coordinator and the page event observer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub logs: Vec<String>,
    pub errors: Vec<String>,
    /// Set by a patch that ended in a reload; only `reload` clears it.
    pub did_full_refresh: bool,
}

impl SessionState {
    /// Clear logs and errors. The latch is untouched.
    pub fn clear_buffers(&mut self) {
        self.logs.clear();
        self.errors.clear();
    }
}

pub type SharedState = Arc<Mutex<SessionState>>;
