//! Sends authenticated visitors to their role dashboard once their profile
//! is known.

use crate::{
    context::AuthState,
    model::Profile,
    navigation::{NavigateOptions, Navigator, OAUTH_CALLBACK_PATH},
};
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info};

const DASHBOARD_PREFIXES: [&str; 2] = ["/dashboard", "/admin"];
const LOGOUT_PATHS: [&str; 2] = ["/logout", "/debug-logout"];

pub struct PostAuthRedirector;

impl PostAuthRedirector {
    /// Where an observer in `state` at `current_path` should be sent, if
    /// anywhere.
    #[must_use]
    pub fn destination(state: &AuthState, current_path: &str) -> Option<String> {
        if state.loading || !state.is_authenticated() {
            return None;
        }
        let role = state.role()?;

        let path = current_path.split(['?', '#']).next().unwrap_or(current_path);
        let excluded = DASHBOARD_PREFIXES
            .iter()
            .any(|prefix| under(path, prefix))
            || path == OAUTH_CALLBACK_PATH
            || LOGOUT_PATHS.contains(&path);
        if excluded {
            return None;
        }

        Some(role.dashboard_path().to_string())
    }

    /// Watches the auth state and redirects (replacing the history entry)
    /// whenever authentication, profile or loading changes.
    pub fn spawn(
        mut receiver: watch::Receiver<AuthState>,
        navigator: Arc<dyn Navigator>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last: Option<(bool, Option<Profile>, bool)> = None;

            loop {
                let state = receiver.borrow_and_update().clone();
                let key = (
                    state.is_authenticated(),
                    state.profile.clone(),
                    state.loading,
                );

                if last.as_ref() != Some(&key) {
                    last = Some(key);
                    if let Some(to) = Self::destination(&state, &navigator.current_path()) {
                        info!(%to, "redirecting to role dashboard");
                        navigator.navigate(&to, NavigateOptions::replace());
                    }
                }

                if receiver.changed().await.is_err() {
                    debug!("auth state closed, redirector stopping");
                    break;
                }
            }
        })
    }
}

/// Whether `path` is `prefix` itself or one of its sub-paths.
fn under(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}
