//! Navigation seam between the identity core and whatever hosts it (a router,
//! a CLI, a test). Guards and the redirector only talk to [`Navigator`].

use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub const SIGN_IN_PATH: &str = "/login";
pub const OAUTH_CALLBACK_PATH: &str = "/auth/callback";
pub const ROOT_PATH: &str = "/";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NavigateOptions {
    /// Replace the current history entry instead of pushing a new one.
    pub replace: bool,
}

impl NavigateOptions {
    #[must_use]
    pub const fn replace() -> Self {
        Self { replace: true }
    }
}

pub trait Navigator: Send + Sync {
    fn current_path(&self) -> String;

    fn navigate(&self, to: &str, options: NavigateOptions);

    /// Full reload: every piece of in-memory state owned by the host is dropped.
    fn hard_reload(&self, to: &str);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NavigationEntry {
    Push(String),
    Replace(String),
    Reload(String),
}

#[derive(Debug)]
struct History {
    current: String,
    entries: Vec<NavigationEntry>,
}

/// Navigator that keeps its history in memory.
#[derive(Debug)]
pub struct MemoryNavigator {
    history: Mutex<History>,
}

impl MemoryNavigator {
    #[must_use]
    pub fn new(start: impl Into<String>) -> Self {
        Self {
            history: Mutex::new(History {
                current: start.into(),
                entries: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub fn entries(&self) -> Vec<NavigationEntry> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    #[must_use]
    pub fn reloads(&self) -> usize {
        self.entries()
            .iter()
            .filter(|entry| matches!(entry, NavigationEntry::Reload(_)))
            .count()
    }

    fn record(&self, to: &str, entry: NavigationEntry) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.current = to.to_string();
        history.entries.push(entry);
    }
}

impl Default for MemoryNavigator {
    fn default() -> Self {
        Self::new(ROOT_PATH)
    }
}

impl Navigator for MemoryNavigator {
    fn current_path(&self) -> String {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }

    fn navigate(&self, to: &str, options: NavigateOptions) {
        debug!("navigate to {to} (replace: {})", options.replace);
        let entry = if options.replace {
            NavigationEntry::Replace(to.to_string())
        } else {
            NavigationEntry::Push(to.to_string())
        };
        self.record(to, entry);
    }

    fn hard_reload(&self, to: &str) {
        debug!("hard reload to {to}");
        self.record(to, NavigationEntry::Reload(to.to_string()));
    }
}
