//! Lazy profile provisioning. Every authenticated identity must end up with
//! exactly one row in `profiles`; the row is created on first sight with a
//! default shape and never deleted here.

use crate::{
    error::Result,
    identity::IdentityService,
    model::{NewProfile, Profile, Role, User},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Insert payload for an identity seen for the first time.
///
/// A missing role hint falls back to [`Role::Student`]; a sign-up flow that
/// forgets to send role metadata therefore lands the user in the student area.
#[must_use]
pub fn default_profile(id: &str, email: &str, role_hint: Option<Role>) -> NewProfile {
    let role = role_hint.unwrap_or_else(|| {
        warn!(id, "identity carries no role metadata, defaulting to student");
        Role::default()
    });

    NewProfile {
        id: id.to_string(),
        email: email.to_string(),
        first_name: String::new(),
        last_name: String::new(),
        role,
        country: None,
        created_at: Utc::now(),
    }
}

#[derive(Clone)]
pub struct ProfileReconciler {
    identity: Arc<dyn IdentityService>,
}

impl ProfileReconciler {
    #[must_use]
    pub fn new(identity: Arc<dyn IdentityService>) -> Self {
        Self { identity }
    }

    /// Returns the identity's profile, creating the default row when the read
    /// reports it missing.
    ///
    /// A failed insert means another writer got there first: the row is read
    /// back once and the winner's copy returned. The insert is never retried.
    ///
    /// # Errors
    /// Returns read errors other than not-found unchanged, and the insert
    /// error when the row still cannot be read after a failed insert.
    #[instrument(skip(self, email))]
    pub async fn ensure_profile(
        &self,
        id: &str,
        email: &str,
        role_hint: Option<Role>,
    ) -> Result<Profile> {
        match self.identity.fetch_profile(id).await {
            Ok(profile) => return Ok(profile),
            Err(err) if err.is_not_found() => {
                debug!("no profile row yet, provisioning");
            }
            Err(err) => return Err(err),
        }

        let new_profile = default_profile(id, email, role_hint);
        match self.identity.insert_profile(&new_profile).await {
            Ok(profile) => {
                info!(role = %profile.role, "profile created");
                Ok(profile)
            }
            Err(insert_err) => {
                warn!("profile insert failed, re-reading: {insert_err}");
                self.identity.fetch_profile(id).await.map_err(|_| insert_err)
            }
        }
    }

    /// Count-then-insert guard used when the initial profile read failed:
    /// inserts the default row only when no row is visible for the identity.
    ///
    /// Returns `Ok(None)` when a row exists but could not be read, which
    /// usually means a row-level permission problem.
    ///
    /// # Errors
    /// Returns the count or insert error.
    #[instrument(skip(self, user), fields(id = %user.id))]
    pub async fn provision_after_failed_read(&self, user: &User) -> Result<Option<Profile>> {
        let count = self.identity.count_profiles(&user.id).await?;
        if count > 0 {
            warn!(count, "profile row exists but could not be read");
            return Ok(None);
        }

        let new_profile = default_profile(&user.id, &user.email, user.requested_role());
        let profile = self.identity.insert_profile(&new_profile).await?;
        info!(role = %profile.role, "profile created after failed read");
        Ok(Some(profile))
    }
}
