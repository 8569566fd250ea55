//! The auth state machine.
//!
//! [`AuthContext`] owns the canonical [`AuthState`] and publishes every change
//! through a `watch` channel. State moves on two inputs: change notifications
//! from the identity service, consumed in delivery order by one task, and
//! explicit user operations. Each asynchronous resolution captures a
//! generation number when it starts and is applied only if no newer
//! transition happened meanwhile.

use crate::{
    error::{AuthError, Result},
    identity::{IdentityService, Notification, Subscription},
    model::{
        AuthChange, AuthEvent, NewProfile, OAuthProvider, Profile, ProfileUpdate, Role, Session,
        SignUpData, SignUpOutcome, User,
    },
    navigation::{Navigator, OAUTH_CALLBACK_PATH},
    reconciler::ProfileReconciler,
    signout::{DefensiveSignOut, SignOutReport},
    storage::{SessionStore, StorageArea},
};
use chrono::Utc;
use serde_json::{Map, Value};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(10);
pub const DEFAULT_OAUTH_REDIRECT_URL: &str = "http://localhost:54321/auth/callback";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Upper bound on how long `loading` may stay true after mount.
    pub watchdog: Duration,
    /// Fixed redirect target handed to the OAuth provider.
    pub oauth_redirect_url: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            watchdog: DEFAULT_WATCHDOG,
            oauth_redirect_url: DEFAULT_OAUTH_REDIRECT_URL.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthPhase {
    Uninitialized,
    Loading,
    Error,
    Unauthenticated,
    AuthenticatedWithProfile,
    AuthenticatedNoProfile,
}

#[derive(Clone, Debug, Default)]
pub struct AuthState {
    pub session: Option<Session>,
    pub user: Option<User>,
    pub profile: Option<Profile>,
    pub loading: bool,
    /// Failure of the last user-triggered operation.
    pub error: Option<AuthError>,
    pub mounted: bool,
}

impl AuthState {
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.profile.as_ref().map(|profile| profile.role)
    }

    #[must_use]
    pub const fn phase(&self) -> AuthPhase {
        if self.loading {
            return AuthPhase::Loading;
        }
        if self.session.is_some() {
            return if self.profile.is_some() {
                AuthPhase::AuthenticatedWithProfile
            } else {
                AuthPhase::AuthenticatedNoProfile
            };
        }
        if self.error.is_some() {
            AuthPhase::Error
        } else if self.mounted {
            AuthPhase::Unauthenticated
        } else {
            AuthPhase::Uninitialized
        }
    }

    fn adopt(&mut self, session: Session) {
        let same_user = self
            .user
            .as_ref()
            .is_some_and(|user| user.id == session.user.id);
        if !same_user {
            self.profile = None;
        }
        self.user = Some(session.user.clone());
        self.session = Some(session);
    }

    fn reset(&mut self) {
        self.session = None;
        self.user = None;
        self.profile = None;
        self.loading = false;
    }
}

struct Inner {
    identity: Arc<dyn IdentityService>,
    store: Arc<dyn SessionStore>,
    navigator: Arc<dyn Navigator>,
    reconciler: ProfileReconciler,
    config: AuthConfig,
    state: watch::Sender<AuthState>,
    generation: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct AuthContext {
    inner: Arc<Inner>,
}

impl AuthContext {
    #[must_use]
    pub fn new(
        identity: Arc<dyn IdentityService>,
        store: Arc<dyn SessionStore>,
        navigator: Arc<dyn Navigator>,
        config: AuthConfig,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::default());
        Self {
            inner: Arc::new(Inner {
                reconciler: ProfileReconciler::new(identity.clone()),
                identity,
                store,
                navigator,
                config,
                state,
                generation: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn reconciler(&self) -> &ProfileReconciler {
        &self.inner.reconciler
    }

    #[must_use]
    pub fn snapshot(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    /// Resolves once `loading` is false.
    pub async fn wait_until_settled(&self) {
        let mut receiver = self.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = receiver.wait_for(|state| !state.loading).await;
    }

    /// Starts the context: subscribes to change notifications, resolves the
    /// current session in the background and arms the loading watchdog.
    /// Must be called inside a tokio runtime. A second call is a no-op.
    pub fn mount(&self) {
        let mounted = self.inner.state.send_if_modified(|state| {
            if state.mounted {
                return false;
            }
            state.mounted = true;
            state.loading = true;
            true
        });
        if !mounted {
            debug!("auth context already mounted");
            return;
        }

        // Subscribe before the first fetch so no notification is missed.
        let subscription = self.inner.identity.on_auth_state_change();
        let generation = self.inner.generation.load(Ordering::SeqCst);

        let events = tokio::spawn(self.clone().event_loop(subscription));
        let initial = tokio::spawn({
            let context = self.clone();
            async move { context.initialize(generation).await }
        });
        let watchdog = tokio::spawn(self.clone().watchdog());

        self.tasks().extend([events, initial, watchdog]);
        info!("auth context mounted");
    }

    /// Stops background processing and drops the subscription. The
    /// background tasks hold clones of the context, so a mounted context
    /// lives until this is called.
    pub fn unmount(&self) {
        for task in self.tasks().drain(..) {
            task.abort();
        }
        self.transition(|state| {
            state.mounted = false;
            state.loading = false;
        });
        info!("auth context unmounted");
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `f` and starts a new generation, invalidating every
    /// resolution still in flight. Returns the new generation.
    fn transition(&self, f: impl FnOnce(&mut AuthState)) -> u64 {
        let mut generation = 0;
        self.inner.state.send_modify(|state| {
            f(state);
            generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        });
        generation
    }

    /// Applies `f` only if `generation` is still current.
    fn apply_if_current(&self, generation: u64, f: impl FnOnce(&mut AuthState)) -> bool {
        let applied = self.inner.state.send_if_modified(|state| {
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            f(state);
            true
        });
        if !applied {
            debug!(generation, "discarding stale auth resolution");
        }
        applied
    }

    fn set_error(&self, err: &AuthError) {
        let err = err.clone();
        self.inner.state.send_modify(|state| state.error = Some(err));
    }

    fn clear_error(&self) {
        self.inner.state.send_if_modified(|state| state.error.take().is_some());
    }

    async fn watchdog(self) {
        tokio::time::sleep(self.inner.config.watchdog).await;
        self.inner.state.send_if_modified(|state| {
            if !state.loading {
                return false;
            }
            warn!(
                "auth initialization still pending after {:?}, releasing loading state",
                self.inner.config.watchdog
            );
            state.loading = false;
            true
        });
    }

    async fn event_loop(self, mut subscription: Subscription) {
        while let Some(notification) = subscription.recv().await {
            match notification {
                Notification::Change(change) => self.handle_change(change).await,
                Notification::Lagged { .. } => self.resync().await,
            }
        }
        debug!("auth change subscription closed");
    }

    /// Rebuilds state from the current session after notifications were lost.
    async fn resync(&self) {
        match self.inner.identity.get_session().await {
            Ok(session) => {
                let event = if session.is_some() {
                    AuthEvent::InitialSession
                } else {
                    AuthEvent::SignedOut
                };
                self.handle_change(AuthChange { event, session }).await;
            }
            Err(e) => error!("Failed to re-read session after missed changes: {}", e),
        }
    }

    #[instrument(skip(self))]
    async fn initialize(&self, generation: u64) {
        let session = match self.inner.identity.get_session().await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to fetch current session: {}", e);
                self.apply_if_current(generation, |state| state.loading = false);
                return;
            }
        };

        let Some(session) = session else {
            self.apply_if_current(generation, AuthState::reset);
            return;
        };

        let user = session.user.clone();
        if !self.apply_if_current(generation, |state| state.adopt(session)) {
            return;
        }

        let profile = match self.inner.identity.fetch_profile(&user.id).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!("Failed to read profile on startup: {}", e);
                match self.inner.reconciler.provision_after_failed_read(&user).await {
                    Ok(profile) => profile,
                    Err(e) => {
                        error!("Failed to provision profile: {}", e);
                        None
                    }
                }
            }
        };

        self.apply_if_current(generation, |state| {
            state.profile = profile;
            state.loading = false;
        });
    }

    async fn handle_change(&self, change: AuthChange) {
        debug!(event = ?change.event, has_session = change.session.is_some(), "auth state change");

        let session = match change {
            AuthChange {
                event: AuthEvent::SignedOut,
                ..
            }
            | AuthChange { session: None, .. } => {
                self.transition(AuthState::reset);
                return;
            }
            AuthChange {
                session: Some(session),
                ..
            } => session,
        };

        let user = session.user.clone();
        let generation = self.transition(|state| state.adopt(session));

        let profile = match self
            .inner
            .reconciler
            .ensure_profile(&user.id, &user.email, user.requested_role())
            .await
        {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!("Failed to resolve profile: {}", e);
                None
            }
        };

        self.apply_if_current(generation, |state| {
            state.profile = profile;
            state.loading = false;
        });
    }

    /// Creates the identity with only `{role}` as metadata, then inserts the
    /// full profile row. When the insert fails the sign-up fields are written
    /// onto whatever row exists; failures there are only logged, since the
    /// row is provisioned lazily on the next session resolution anyway.
    ///
    /// # Errors
    /// Returns the identity service error when sign-up itself fails.
    #[instrument(skip(self, password, data), fields(role = %data.role))]
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        data: SignUpData,
    ) -> Result<SignUpOutcome> {
        self.clear_error();

        let mut metadata = Map::new();
        metadata.insert(
            "role".to_string(),
            Value::String(data.role.as_str().to_string()),
        );

        let outcome = match self.inner.identity.sign_up(email, password, metadata).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Sign-up failed: {}", e);
                self.set_error(&e);
                return Err(e);
            }
        };

        let profile = NewProfile {
            id: outcome.user.id.clone(),
            email: email.to_string(),
            first_name: data.first_name,
            last_name: data.last_name,
            role: data.role,
            country: data.country,
            created_at: Utc::now(),
        };
        match self.inner.identity.insert_profile(&profile).await {
            Ok(_) => info!(id = %profile.id, "profile created at sign-up"),
            Err(e) => {
                // Usually a default row created first by the SignedIn
                // notification; carry the sign-up fields over to it.
                warn!("Profile insert at sign-up failed, updating existing row: {}", e);
                if let Err(e) = self.write_sign_up_fields(&profile).await {
                    error!("Failed to store sign-up profile fields: {}", e);
                }
            }
        }

        Ok(outcome)
    }

    async fn write_sign_up_fields(&self, profile: &NewProfile) -> Result<()> {
        let update = ProfileUpdate {
            first_name: Some(profile.first_name.clone()),
            last_name: Some(profile.last_name.clone()),
            country: profile.country.clone(),
            avatar_url: None,
            updated_at: Some(Utc::now()),
        };
        self.inner
            .identity
            .update_profile(&profile.id, &update)
            .await?;

        let row = self.inner.identity.fetch_profile(&profile.id).await?;
        self.inner.state.send_if_modified(|state| {
            if state.user.as_ref().is_some_and(|user| user.id == row.id) {
                state.profile = Some(row);
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// # Errors
    /// Returns the identity service error when the credentials are rejected.
    #[instrument(skip(self, password))]
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        self.clear_error();

        let session = match self
            .inner
            .identity
            .sign_in_with_password(email, password)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                error!("Sign-in failed: {}", e);
                self.set_error(&e);
                return Err(e);
            }
        };

        let user_id = session.user.id.clone();
        let generation = self.transition(|state| state.adopt(session.clone()));

        match self.inner.identity.fetch_profile(&user_id).await {
            Ok(profile) => {
                self.apply_if_current(generation, |state| state.profile = Some(profile));
            }
            Err(e) => warn!("Signed in without a readable profile: {}", e),
        }

        Ok(session)
    }

    /// Returns the provider authorization URL. Local state only changes once
    /// the callback code is exchanged.
    ///
    /// # Errors
    /// Returns the identity service error.
    #[instrument(skip(self))]
    pub async fn sign_in_with_google(&self) -> Result<String> {
        self.clear_error();

        self.inner
            .identity
            .sign_in_with_oauth(OAuthProvider::Google, &self.inner.config.oauth_redirect_url)
            .await
            .inspect_err(|e| {
                error!("OAuth sign-in failed: {}", e);
                self.set_error(e);
            })
    }

    /// Exchanges the code received on [`OAUTH_CALLBACK_PATH`]; the resulting
    /// `SignedIn` notification drives the state.
    ///
    /// # Errors
    /// Returns the identity service error.
    #[instrument(skip(self, code))]
    pub async fn complete_oauth(&self, code: &str) -> Result<Session> {
        self.clear_error();

        self.inner
            .identity
            .exchange_code_for_session(code)
            .await
            .inspect_err(|e| {
                error!("OAuth code exchange failed: {}", e);
                self.set_error(e);
            })
    }

    /// Runs the defensive sign-out and resets local state.
    ///
    /// # Errors
    /// Never fails today; the `Result` keeps the operation uniform with the
    /// other user operations.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<SignOutReport> {
        let report = DefensiveSignOut::new(
            self.inner.identity.clone(),
            self.inner.store.clone(),
            self.inner.navigator.clone(),
        )
        .run()
        .await;

        self.transition(|state| {
            state.reset();
            state.error = None;
        });

        Ok(report)
    }

    /// Applies a partial update to the current user's profile and adopts the
    /// re-read row.
    ///
    /// # Errors
    /// Returns [`AuthError::NotAuthenticated`] without a user, or the
    /// identity service error.
    #[instrument(skip(self, update))]
    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<Profile> {
        self.clear_error();

        let Some(user) = self.snapshot().user else {
            let err = AuthError::NotAuthenticated;
            self.set_error(&err);
            return Err(err);
        };

        let update = ProfileUpdate {
            updated_at: Some(Utc::now()),
            ..update
        };

        match self.write_profile(&user.id, &update).await {
            Ok(profile) => {
                let adopted = profile.clone();
                self.inner.state.send_if_modified(|state| {
                    if state.user.as_ref().is_some_and(|current| current.id == user.id) {
                        state.profile = Some(adopted);
                        true
                    } else {
                        false
                    }
                });
                Ok(profile)
            }
            Err(e) => {
                error!("Profile update failed: {}", e);
                self.set_error(&e);
                Err(e)
            }
        }
    }

    async fn write_profile(&self, id: &str, update: &ProfileUpdate) -> Result<Profile> {
        self.inner.identity.update_profile(id, update).await?;
        self.inner.identity.fetch_profile(id).await
    }

    /// Logs what this client currently holds, then signs out.
    ///
    /// # Errors
    /// See [`AuthContext::sign_out`].
    pub async fn debug_logout(&self) -> Result<SignOutReport> {
        let state = self.snapshot();
        match &state.session {
            Some(session) => info!(
                user_id = %session.user.id,
                email = %session.user.email,
                expires_at = session.expires_at,
                role = ?state.role(),
                "debug logout: active session"
            ),
            None => info!("debug logout: no active session"),
        }

        for area in StorageArea::ALL {
            match self.inner.store.keys(area) {
                Ok(keys) => info!(?area, ?keys, "debug logout: storage keys"),
                Err(e) => warn!("Failed to list {area:?} storage: {e}"),
            }
        }
        match self.inner.store.cookies() {
            Ok(cookies) => {
                let names: Vec<_> = cookies.iter().map(|cookie| cookie.name.as_str()).collect();
                info!(?names, "debug logout: cookies");
            }
            Err(e) => warn!("Failed to list cookies: {e}"),
        }
        debug!(callback = OAUTH_CALLBACK_PATH, "debug logout: signing out");

        self.sign_out().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identity::MemoryIdentityService, navigation::MemoryNavigator, storage::MemoryStore,
    };

    struct Harness {
        identity: Arc<MemoryIdentityService>,
        context: AuthContext,
    }

    fn harness() -> Harness {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let identity = Arc::new(MemoryIdentityService::new(store.clone()));
        let navigator = Arc::new(MemoryNavigator::default());
        let context = AuthContext::new(
            identity.clone(),
            store,
            navigator,
            AuthConfig::default(),
        );
        Harness { identity, context }
    }

    #[test]
    fn phase_follows_state() {
        let mut state = AuthState::default();
        assert_eq!(state.phase(), AuthPhase::Uninitialized);

        state.mounted = true;
        state.loading = true;
        assert_eq!(state.phase(), AuthPhase::Loading);

        state.loading = false;
        assert_eq!(state.phase(), AuthPhase::Unauthenticated);

        state.error = Some(AuthError::Transport("offline".to_string()));
        assert_eq!(state.phase(), AuthPhase::Error);
    }

    #[tokio::test]
    async fn sign_in_failure_sets_error() {
        let h = harness();
        let result = h.context.sign_in("a@b.com", "nope").await;
        assert!(result.is_err());

        let state = h.context.snapshot();
        assert!(!state.is_authenticated());
        assert!(state.error.is_some());
        assert_eq!(state.phase(), AuthPhase::Error);
    }

    #[tokio::test]
    async fn sign_in_adopts_session_and_profile() -> Result<()> {
        let h = harness();
        h.identity
            .register(User::new("u1", "a@b.com").with_role(Role::Agent), "pw");
        h.identity.seed_profile(
            crate::reconciler::default_profile("u1", "a@b.com", Some(Role::Agent)).into_profile(),
        );

        h.context.sign_in("a@b.com", "pw").await?;

        let state = h.context.snapshot();
        assert!(state.is_authenticated());
        assert_eq!(state.role(), Some(Role::Agent));
        assert_eq!(state.phase(), AuthPhase::AuthenticatedWithProfile);
        Ok(())
    }

    #[tokio::test]
    async fn update_profile_requires_a_user() {
        let h = harness();
        let result = h.context.update_profile(ProfileUpdate::default()).await;
        assert_eq!(result.err(), Some(AuthError::NotAuthenticated));
        assert_eq!(
            h.context.snapshot().error.map(|err| err.to_string()),
            Some("User not authenticated".to_string())
        );
    }

    #[tokio::test]
    async fn update_profile_stamps_and_adopts() -> Result<()> {
        let h = harness();
        h.identity.register(User::new("u1", "a@b.com"), "pw");
        h.identity
            .seed_profile(crate::reconciler::default_profile("u1", "a@b.com", None).into_profile());
        h.context.sign_in("a@b.com", "pw").await?;

        let profile = h
            .context
            .update_profile(ProfileUpdate {
                first_name: Some("Ada".to_string()),
                ..ProfileUpdate::default()
            })
            .await?;

        assert_eq!(profile.first_name, "Ada");
        assert!(profile.updated_at.is_some());
        assert_eq!(h.context.snapshot().profile, Some(profile));
        Ok(())
    }

    #[tokio::test]
    async fn oauth_uses_the_configured_redirect() -> Result<()> {
        let h = harness();
        h.identity.set_oauth_identity(User::new("g1", "g@b.com"));

        let url = h.context.sign_in_with_google().await?;
        assert!(url.contains("provider=google"));
        assert!(url.contains(DEFAULT_OAUTH_REDIRECT_URL));
        assert!(!h.context.snapshot().is_authenticated());
        Ok(())
    }
}
