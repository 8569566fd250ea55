//! Scorched-earth sign-out. Every step runs regardless of how the previous
//! one went: the remote revocation may fail, the store may hold keys written
//! by older client versions, cookies may outlive both. What matters is that
//! no credential survives on this client.

use crate::{
    error::AuthError,
    identity::IdentityService,
    model::SignOutScope,
    navigation::{Navigator, ROOT_PATH},
    storage::{SessionStore, StorageArea},
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Substrings that mark a storage key as identity material.
const IDENTITY_KEY_PATTERNS: [&str; 5] = [
    "supabase",
    "auth-token",
    "access_token",
    "refresh_token",
    "session",
];

#[must_use]
pub fn is_identity_key(key: &str) -> bool {
    let key = key.to_lowercase();
    key.starts_with("sb-")
        || IDENTITY_KEY_PATTERNS
            .iter()
            .any(|pattern| key.contains(pattern))
}

#[derive(Debug, Default)]
pub struct SignOutReport {
    /// Remote revocation failure, if any. Never blocks the local teardown.
    pub remote_error: Option<AuthError>,
    pub removed_keys: Vec<(StorageArea, String)>,
    pub expired_cookies: Vec<String>,
    pub storage_errors: Vec<AuthError>,
    pub reloaded_to: String,
}

impl SignOutReport {
    /// True when every local step succeeded.
    #[must_use]
    pub fn local_clean(&self) -> bool {
        self.storage_errors.is_empty()
    }
}

pub struct DefensiveSignOut {
    identity: Arc<dyn IdentityService>,
    store: Arc<dyn SessionStore>,
    navigator: Arc<dyn Navigator>,
}

impl DefensiveSignOut {
    #[must_use]
    pub fn new(
        identity: Arc<dyn IdentityService>,
        store: Arc<dyn SessionStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            identity,
            store,
            navigator,
        }
    }

    pub async fn run(&self) -> SignOutReport {
        let mut report = SignOutReport::default();

        if let Err(e) = self.identity.sign_out(SignOutScope::Global).await {
            warn!("Remote sign-out failed, clearing local credentials anyway: {}", e);
            report.remote_error = Some(e);
        }

        for area in StorageArea::ALL {
            self.purge_area(area, &mut report);
        }
        self.expire_cookies(&mut report);

        info!(
            removed_keys = report.removed_keys.len(),
            expired_cookies = report.expired_cookies.len(),
            "local credentials cleared"
        );

        self.navigator.hard_reload(ROOT_PATH);
        report.reloaded_to = ROOT_PATH.to_string();

        report
    }

    fn purge_area(&self, area: StorageArea, report: &mut SignOutReport) {
        match self.store.keys(area) {
            Ok(keys) => {
                for key in keys.into_iter().filter(|key| is_identity_key(key)) {
                    match self.store.remove(area, &key) {
                        Ok(()) => report.removed_keys.push((area, key)),
                        Err(e) => {
                            error!("Failed to remove {key} from {area:?} storage: {e}");
                            report.storage_errors.push(e);
                        }
                    }
                }
            }
            Err(e) => {
                error!("Failed to list {area:?} storage: {e}");
                report.storage_errors.push(e);
            }
        }

        // Keys written under names we do not recognise go too.
        if let Err(e) = self.store.clear(area) {
            error!("Failed to clear {area:?} storage: {e}");
            report.storage_errors.push(e);
        }
    }

    fn expire_cookies(&self, report: &mut SignOutReport) {
        let cookies = match self.store.cookies() {
            Ok(cookies) => cookies,
            Err(e) => {
                error!("Failed to list cookies: {e}");
                report.storage_errors.push(e);
                return;
            }
        };

        for cookie in cookies {
            match self.store.set_cookie(cookie.expired()) {
                Ok(()) => report.expired_cookies.push(cookie.name),
                Err(e) => {
                    error!("Failed to expire cookie {}: {e}", cookie.name);
                    report.storage_errors.push(e);
                }
            }
        }
    }
}
