//! In-process identity service. Behaves like the hosted service closely
//! enough to drive the auth context end to end (session persisted in the
//! session store, change notifications, unique profile ids) and exposes fault
//! injection so tests can reproduce slow, failing or denied backend calls.

use super::{IdentityService, Subscription, EVENT_CHANNEL_CAPACITY};
use crate::{
    error::{AuthError, Result},
    model::{
        AuthChange, AuthEvent, NewProfile, OAuthProvider, Profile, ProfileUpdate, Session,
        SessionPayload, SignOutScope, SignUpOutcome, User,
    },
    reconciler::default_profile,
    storage::{SessionStore, StorageArea},
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

pub const MEMORY_SESSION_KEY: &str = "sb-memory-auth-token";

const TOKEN_TTL_SECONDS: u64 = 3600;

#[derive(Default)]
struct Faults {
    hang_get_session: bool,
    get_session_delay: Option<Duration>,
    get_session_error: Option<AuthError>,
    profile_read_error: Option<AuthError>,
    next_profile_read_error: Option<AuthError>,
    reject_profile_inserts: bool,
    sign_out_error: Option<AuthError>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, (User, String)>,
    profiles: HashMap<String, Profile>,
    oauth_identity: Option<User>,
    oauth_codes: HashMap<String, User>,
    last_sign_up_metadata: Option<Map<String, Value>>,
    require_email_confirmation: bool,
    create_profile_on_sign_up: bool,
    insert_attempts: usize,
    sign_out_calls: Vec<SignOutScope>,
    faults: Faults,
}

pub struct MemoryIdentityService {
    store: Arc<dyn SessionStore>,
    state: Mutex<State>,
    events: broadcast::Sender<AuthChange>,
}

impl MemoryIdentityService {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an account without going through sign-up.
    pub fn register(&self, user: User, password: &str) {
        self.state()
            .accounts
            .insert(user.email.clone(), (user, password.to_string()));
    }

    /// Stores a profile row directly, bypassing the insert path.
    pub fn seed_profile(&self, profile: Profile) {
        self.state().profiles.insert(profile.id.clone(), profile);
    }

    #[must_use]
    pub fn stored_profile(&self, id: &str) -> Option<Profile> {
        self.state().profiles.get(id).cloned()
    }

    #[must_use]
    pub fn profile_count(&self) -> usize {
        self.state().profiles.len()
    }

    #[must_use]
    pub fn insert_attempts(&self) -> usize {
        self.state().insert_attempts
    }

    #[must_use]
    pub fn last_sign_up_metadata(&self) -> Option<Map<String, Value>> {
        self.state().last_sign_up_metadata.clone()
    }

    #[must_use]
    pub fn sign_out_calls(&self) -> Vec<SignOutScope> {
        self.state().sign_out_calls.clone()
    }

    pub fn set_oauth_identity(&self, user: User) {
        self.state().oauth_identity = Some(user);
    }

    pub fn require_email_confirmation(&self, required: bool) {
        self.state().require_email_confirmation = required;
    }

    /// Sign-up also writes the default profile row, as a database trigger on
    /// new users would.
    pub fn create_profile_on_sign_up(&self, enabled: bool) {
        self.state().create_profile_on_sign_up = enabled;
    }

    /// `get_session` never resolves.
    pub fn hang_get_session(&self, hang: bool) {
        self.state().faults.hang_get_session = hang;
    }

    /// `get_session` answers with the session it saw when called, after `delay`.
    pub fn delay_get_session(&self, delay: Option<Duration>) {
        self.state().faults.get_session_delay = delay;
    }

    pub fn fail_get_session(&self, error: Option<AuthError>) {
        self.state().faults.get_session_error = error;
    }

    /// Every profile read fails with `error`, whether or not the row exists.
    pub fn fail_profile_reads(&self, error: Option<AuthError>) {
        self.state().faults.profile_read_error = error;
    }

    /// Only the next profile read fails with `error`.
    pub fn fail_next_profile_read(&self, error: AuthError) {
        self.state().faults.next_profile_read_error = Some(error);
    }

    pub fn reject_profile_inserts(&self, reject: bool) {
        self.state().faults.reject_profile_inserts = reject;
    }

    pub fn fail_sign_out(&self, error: Option<AuthError>) {
        self.state().faults.sign_out_error = error;
    }

    /// Pushes a change notification as if it came from another tab or device.
    pub fn emit(&self, event: AuthEvent, session: Option<Session>) {
        let _ = self.events.send(AuthChange { event, session });
    }

    fn issue_session(user: User) -> Session {
        SessionPayload {
            access_token: Uuid::new_v4().to_string(),
            refresh_token: Uuid::new_v4().to_string(),
            token_type: "bearer".to_string(),
            expires_in: TOKEN_TTL_SECONDS,
            expires_at: None,
            user,
        }
        .into_session(Utc::now())
    }

    fn stored_session(&self) -> Result<Option<Session>> {
        let Some(raw) = self.store.get(StorageArea::Local, MEMORY_SESSION_KEY)? else {
            return Ok(None);
        };
        let payload: SessionPayload = serde_json::from_str(&raw)?;
        Ok(Some(payload.into_session(Utc::now())))
    }

    fn persist(&self, session: &Session) -> Result<()> {
        let raw = serde_json::to_string(&session.to_payload())?;
        self.store.set(StorageArea::Local, MEMORY_SESSION_KEY, &raw)
    }

    fn start_session(&self, user: User, event: AuthEvent) -> Result<Session> {
        let session = Self::issue_session(user);
        self.persist(&session)?;
        self.emit(event, Some(session.clone()));
        Ok(session)
    }
}

#[async_trait]
impl IdentityService for MemoryIdentityService {
    async fn get_session(&self) -> Result<Option<Session>> {
        let (hang, delay, error) = {
            let state = self.state();
            (
                state.faults.hang_get_session,
                state.faults.get_session_delay,
                state.faults.get_session_error.clone(),
            )
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(error) = error {
            return Err(error);
        }
        let session = self.stored_session()?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Map<String, Value>,
    ) -> Result<SignUpOutcome> {
        let (confirm, trigger) = {
            let mut state = self.state();
            if state.accounts.contains_key(email) {
                return Err(AuthError::Http {
                    status: 422,
                    code: Some("user_already_exists".to_string()),
                    message: "User already registered".to_string(),
                });
            }
            state.last_sign_up_metadata = Some(metadata.clone());
            (
                state.require_email_confirmation,
                state.create_profile_on_sign_up,
            )
        };

        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            user_metadata: metadata,
        };
        self.register(user.clone(), password);
        debug!("memory identity registered {}", user.id);
        if trigger {
            let row = default_profile(&user.id, email, user.requested_role()).into_profile();
            self.seed_profile(row);
        }

        let session = if confirm {
            None
        } else {
            Some(self.start_session(user.clone(), AuthEvent::SignedIn)?)
        };
        Ok(SignUpOutcome { user, session })
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let user = {
            let state = self.state();
            match state.accounts.get(email) {
                Some((user, stored)) if stored == password => user.clone(),
                _ => {
                    return Err(AuthError::Http {
                        status: 400,
                        code: Some("invalid_credentials".to_string()),
                        message: "Invalid login credentials".to_string(),
                    })
                }
            }
        };
        self.start_session(user, AuthEvent::SignedIn)
    }

    async fn sign_in_with_oauth(
        &self,
        provider: OAuthProvider,
        redirect_to: &str,
    ) -> Result<String> {
        let mut state = self.state();
        let user = state
            .oauth_identity
            .clone()
            .ok_or_else(|| AuthError::Config("no oauth identity configured".to_string()))?;
        let code = Uuid::new_v4().to_string();
        state.oauth_codes.insert(code.clone(), user);
        Ok(format!(
            "memory://authorize?provider={}&redirect_to={redirect_to}&code={code}",
            provider.as_str()
        ))
    }

    async fn exchange_code_for_session(&self, code: &str) -> Result<Session> {
        let user = self
            .state()
            .oauth_codes
            .remove(code)
            .ok_or_else(|| AuthError::Http {
                status: 400,
                code: Some("bad_code_verifier".to_string()),
                message: "invalid flow state".to_string(),
            })?;
        self.start_session(user, AuthEvent::SignedIn)
    }

    async fn refresh_session(&self) -> Result<Session> {
        let current = self.stored_session()?.ok_or(AuthError::NotAuthenticated)?;
        self.start_session(current.user, AuthEvent::TokenRefreshed)
    }

    async fn sign_out(&self, scope: SignOutScope) -> Result<()> {
        let error = {
            let mut state = self.state();
            state.sign_out_calls.push(scope);
            state.faults.sign_out_error.clone()
        };
        if let Some(error) = error {
            return Err(error);
        }
        self.store.remove(StorageArea::Local, MEMORY_SESSION_KEY)?;
        self.emit(AuthEvent::SignedOut, None);
        Ok(())
    }

    fn on_auth_state_change(&self) -> Subscription {
        Subscription::new(self.events.subscribe())
    }

    async fn fetch_profile(&self, id: &str) -> Result<Profile> {
        let mut state = self.state();
        if let Some(error) = state.faults.next_profile_read_error.take() {
            return Err(error);
        }
        if let Some(error) = &state.faults.profile_read_error {
            return Err(error.clone());
        }
        state
            .profiles
            .get(id)
            .cloned()
            .ok_or_else(AuthError::not_found)
    }

    async fn count_profiles(&self, id: &str) -> Result<u64> {
        Ok(u64::from(self.state().profiles.contains_key(id)))
    }

    async fn insert_profile(&self, profile: &NewProfile) -> Result<Profile> {
        let mut state = self.state();
        state.insert_attempts += 1;
        if state.faults.reject_profile_inserts {
            return Err(AuthError::Http {
                status: 403,
                code: Some("42501".to_string()),
                message: "new row violates row-level security policy".to_string(),
            });
        }
        if state.profiles.contains_key(&profile.id) {
            return Err(AuthError::Http {
                status: 409,
                code: Some("23505".to_string()),
                message: "duplicate key value violates unique constraint \"profiles_pkey\""
                    .to_string(),
            });
        }
        let row = profile.clone().into_profile();
        state.profiles.insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn update_profile(&self, id: &str, update: &ProfileUpdate) -> Result<()> {
        let mut state = self.state();
        let row = state.profiles.get_mut(id).ok_or_else(AuthError::not_found)?;
        update.apply_to(row);
        Ok(())
    }
}
