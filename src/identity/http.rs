//! Identity service backed by a hosted `GoTrue` (`/auth/v1`) and `PostgREST`
//! (`/rest/v1`) pair. The session is persisted in the session store under
//! `sb-<project-ref>-auth-token`, which is the only source of truth: anything
//! that clears the store also ends the session here.

use super::{pkce::Pkce, IdentityService, Subscription, EVENT_CHANNEL_CAPACITY};
use crate::{
    error::{AuthError, Result, NOT_FOUND_CODE},
    model::{
        AuthChange, AuthEvent, NewProfile, OAuthProvider, Profile, ProfileUpdate, Session,
        SessionPayload, SignOutScope, SignUpOutcome, User,
    },
    storage::{SessionStore, StorageArea},
    APP_USER_AGENT,
};
use async_trait::async_trait;
use chrono::Utc;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::{header::HeaderMap, Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Map, Value};
use std::{sync::Arc, time::Duration};
use tokio::{sync::broadcast, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use url::Url;

const PGRST_OBJECT: &str = "application/vnd.pgrst.object+json";
const PROFILES_PATH: &str = "/rest/v1/profiles";

/// Refresh this many seconds before the access token actually expires.
const EXPIRY_MARGIN_SECONDS: i64 = 10;
const IDLE_REFRESH_POLL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub url: String,
    pub anon_key: SecretString,
}

impl HttpConfig {
    #[must_use]
    pub fn new(url: impl Into<String>, anon_key: SecretString) -> Self {
        Self {
            url: url.into(),
            anon_key,
        }
    }
}

/// First DNS label of the service host (`abcd.supabase.co` → `abcd`).
///
/// # Errors
/// Returns an error if `url` cannot be parsed or has no host.
pub fn project_ref(url: &str) -> Result<String> {
    let url = Url::parse(url).map_err(|err| AuthError::Config(format!("{url}: {err}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| AuthError::Config("identity service URL has no host".to_string()))?;
    Ok(host.split('.').next().unwrap_or(host).to_string())
}

#[must_use]
pub fn session_storage_key(project_ref: &str) -> String {
    format!("sb-{project_ref}-auth-token")
}

pub struct HttpIdentityService {
    base_url: String,
    anon_key: SecretString,
    storage_key: String,
    client: Client,
    store: Arc<dyn SessionStore>,
    events: broadcast::Sender<AuthChange>,
}

impl HttpIdentityService {
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn new(config: HttpConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        let reference = project_ref(&config.url)?;
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .build()
            .map_err(|err| AuthError::Config(format!("Error creating reqwest client: {err}")))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            anon_key: config.anon_key,
            storage_key: session_storage_key(&reference),
            client,
            store,
            events,
        })
    }

    #[must_use]
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    fn verifier_key(&self) -> String {
        format!("{}-code-verifier", self.storage_key)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let endpoint = format!("{}{path}", self.base_url);
        Url::parse(&endpoint).map_err(|err| AuthError::Config(format!("{endpoint}: {err}")))
    }

    fn request(&self, method: Method, url: Url, bearer: Option<&SecretString>) -> RequestBuilder {
        let bearer = bearer.unwrap_or(&self.anon_key);
        self.client
            .request(method, url)
            .header("apikey", self.anon_key.expose_secret())
            .bearer_auth(bearer.expose_secret())
    }

    /// Bearer for row storage: the user's access token, or the anon key.
    fn row_bearer(&self) -> Result<Option<SecretString>> {
        Ok(self.stored_session()?.map(|session| session.access_token))
    }

    fn emit(&self, event: AuthEvent, session: Option<Session>) {
        let _ = self.events.send(AuthChange { event, session });
    }

    fn stored_session(&self) -> Result<Option<Session>> {
        let Some(raw) = self.store.get(StorageArea::Local, &self.storage_key)? else {
            return Ok(None);
        };
        match serde_json::from_str::<SessionPayload>(&raw) {
            Ok(payload) => Ok(Some(payload.into_session(Utc::now()))),
            Err(err) => {
                warn!("discarding unreadable persisted session: {err}");
                self.store.remove(StorageArea::Local, &self.storage_key)?;
                Ok(None)
            }
        }
    }

    fn save_session(&self, session: &Session, event: AuthEvent) -> Result<()> {
        let raw = serde_json::to_string(&session.to_payload())?;
        self.store.set(StorageArea::Local, &self.storage_key, &raw)?;
        self.emit(event, Some(session.clone()));
        Ok(())
    }

    fn drop_session(&self) -> Result<()> {
        self.store.remove(StorageArea::Local, &self.storage_key)?;
        self.emit(AuthEvent::SignedOut, None);
        Ok(())
    }

    async fn token_request(&self, grant_type: &str, body: Value) -> Result<Session> {
        let mut url = self.endpoint("/auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);

        let span = info_span!(
            "identity.token",
            http.method = "POST",
            grant_type = grant_type,
            url = %self.base_url
        );
        let response = self
            .request(Method::POST, url, None)
            .json(&body)
            .send()
            .instrument(span)
            .await?;
        let response = check(response).await?;
        let payload: SessionPayload = response.json().await?;

        Ok(payload.into_session(Utc::now()))
    }

    /// Keeps the persisted session fresh: refreshes at a jittered 70-90% of
    /// its remaining lifetime with up to three attempts, and signs out
    /// locally once every attempt has failed.
    #[must_use]
    pub fn start_auto_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();

            loop {
                let session = match service.stored_session() {
                    Ok(Some(session)) => session,
                    Ok(None) => {
                        sleep(IDLE_REFRESH_POLL).await;
                        continue;
                    }
                    Err(e) => {
                        error!("Failed to read persisted session: {}", e);
                        sleep(IDLE_REFRESH_POLL).await;
                        continue;
                    }
                };

                let wait = refresh_delay(
                    session.expires_at,
                    Utc::now().timestamp(),
                    rng.gen_range(70..90),
                );
                debug!("Will refresh session in {} seconds", wait.as_secs());
                sleep(wait).await;

                for attempt in 1..=3 {
                    let backoff_time = 2u64.pow(attempt - 1);

                    if attempt > 1 {
                        warn!("Backing off for {} seconds", backoff_time);
                        sleep(Duration::from_secs(backoff_time)).await;
                    }

                    match service.refresh_session().await {
                        Ok(session) => {
                            info!(expires_in = session.expires_in, "session refreshed");
                            break;
                        }
                        Err(AuthError::NotAuthenticated) => break,
                        Err(e) => {
                            error!("Failed to refresh session: {}", e);

                            if attempt == 3 {
                                error!("Failed to refresh session after 3 attempts");
                                if let Err(e) = service.drop_session() {
                                    error!("Failed to drop session: {}", e);
                                }
                            }
                        }
                    }
                }
            }
        })
    }
}

/// `percent` of the lifetime left between `now` and `expires_at`; zero once
/// expired.
fn refresh_delay(expires_at: i64, now: i64, percent: i64) -> Duration {
    let remaining = expires_at.saturating_sub(now).max(0);
    let wait = remaining.saturating_mul(percent) / 100;
    Duration::from_secs(u64::try_from(wait).unwrap_or(0))
}

/// Turns a non-success response into an [`AuthError`], recognising the
/// `PostgREST` zero-rows code.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: Value = response.json().await.unwrap_or(Value::Null);
    Err(error_from_body(status, &body))
}

fn error_from_body(status: StatusCode, body: &Value) -> AuthError {
    let code = ["error_code", "code", "error"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(ToString::to_string);
    let message = ["message", "msg", "error_description", "error"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or(""))
        .to_string();

    if code.as_deref() == Some(NOT_FOUND_CODE) {
        return AuthError::NotFound {
            code: NOT_FOUND_CODE.to_string(),
        };
    }
    if status == StatusCode::FORBIDDEN {
        return AuthError::Permission(message);
    }
    AuthError::Http {
        status: status.as_u16(),
        code,
        message,
    }
}

/// Total from a `Content-Range` header (`0-0/1`, `*/0`).
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()?
        .trim()
        .parse()
        .ok()
}

fn sign_up_outcome(body: Value) -> Result<SignUpOutcome> {
    if body.get("access_token").is_some() {
        let session = serde_json::from_value::<SessionPayload>(body)?.into_session(Utc::now());
        return Ok(SignUpOutcome {
            user: session.user.clone(),
            session: Some(session),
        });
    }
    // Email confirmation pending: the body is the user, possibly wrapped.
    let user: User = match body.get("user") {
        Some(user) => serde_json::from_value(user.clone())?,
        None => serde_json::from_value(body)?,
    };
    Ok(SignUpOutcome {
        user,
        session: None,
    })
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    #[instrument(skip(self))]
    async fn get_session(&self) -> Result<Option<Session>> {
        let Some(session) = self.stored_session()? else {
            return Ok(None);
        };
        let now = Utc::now().timestamp();
        if session.expires_at - EXPIRY_MARGIN_SECONDS > now {
            return Ok(Some(session));
        }

        debug!("persisted session expired, refreshing");
        match self.refresh_session().await {
            Ok(session) => Ok(Some(session)),
            Err(AuthError::Transport(message)) => Err(AuthError::Transport(message)),
            Err(e) => {
                // Revoked or unknown refresh token: the session is gone.
                warn!("Failed to refresh expired session: {}", e);
                self.drop_session()?;
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, password, metadata))]
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Map<String, Value>,
    ) -> Result<SignUpOutcome> {
        let url = self.endpoint("/auth/v1/signup")?;
        let span = info_span!("identity.sign_up", http.method = "POST", url = %url);
        let response = self
            .request(Method::POST, url, None)
            .json(&json!({
                "email": email,
                "password": password,
                "data": metadata,
            }))
            .send()
            .instrument(span)
            .await?;
        let response = check(response).await?;
        let outcome = sign_up_outcome(response.json().await?)?;

        if let Some(session) = &outcome.session {
            self.save_session(session, AuthEvent::SignedIn)?;
        }
        Ok(outcome)
    }

    #[instrument(skip(self, password))]
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let session = self
            .token_request(
                "password",
                json!({ "email": email, "password": password }),
            )
            .await?;
        self.save_session(&session, AuthEvent::SignedIn)?;
        Ok(session)
    }

    #[instrument(skip(self))]
    async fn sign_in_with_oauth(
        &self,
        provider: OAuthProvider,
        redirect_to: &str,
    ) -> Result<String> {
        let pkce = Pkce::generate();
        self.store.set(
            StorageArea::Local,
            &self.verifier_key(),
            pkce.verifier.expose_secret(),
        )?;

        let mut url = self.endpoint("/auth/v1/authorize")?;
        url.query_pairs_mut()
            .append_pair("provider", provider.as_str())
            .append_pair("redirect_to", redirect_to)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", super::pkce::CHALLENGE_METHOD);

        Ok(url.to_string())
    }

    #[instrument(skip(self, code))]
    async fn exchange_code_for_session(&self, code: &str) -> Result<Session> {
        let verifier_key = self.verifier_key();
        let verifier = self
            .store
            .get(StorageArea::Local, &verifier_key)?
            .ok_or_else(|| AuthError::Storage("missing PKCE code verifier".to_string()))?;

        let session = self
            .token_request(
                "pkce",
                json!({ "auth_code": code, "code_verifier": verifier }),
            )
            .await?;
        self.store.remove(StorageArea::Local, &verifier_key)?;
        self.save_session(&session, AuthEvent::SignedIn)?;
        Ok(session)
    }

    #[instrument(skip(self))]
    async fn refresh_session(&self) -> Result<Session> {
        let current = self.stored_session()?.ok_or(AuthError::NotAuthenticated)?;
        let session = self
            .token_request(
                "refresh_token",
                json!({ "refresh_token": current.refresh_token.expose_secret() }),
            )
            .await?;
        self.save_session(&session, AuthEvent::TokenRefreshed)?;
        Ok(session)
    }

    #[instrument(skip(self))]
    async fn sign_out(&self, scope: SignOutScope) -> Result<()> {
        let Some(session) = self.stored_session()? else {
            self.emit(AuthEvent::SignedOut, None);
            return Ok(());
        };

        let mut url = self.endpoint("/auth/v1/logout")?;
        url.query_pairs_mut().append_pair("scope", scope.as_str());
        let span = info_span!(
            "identity.sign_out",
            http.method = "POST",
            scope = scope.as_str(),
            url = %self.base_url
        );
        let result = match self
            .request(Method::POST, url, Some(&session.access_token))
            .send()
            .instrument(span)
            .await
        {
            Ok(response) => match check(response).await {
                Ok(_) => Ok(()),
                // Token already revoked or user gone: nothing left to end remotely.
                Err(AuthError::Http {
                    status: 401 | 404, ..
                }) => Ok(()),
                Err(e) => Err(e),
            },
            Err(e) => Err(AuthError::from(e)),
        };

        if scope != SignOutScope::Others {
            self.drop_session()?;
        }
        result
    }

    fn on_auth_state_change(&self) -> Subscription {
        Subscription::new(self.events.subscribe())
    }

    #[instrument(skip(self))]
    async fn fetch_profile(&self, id: &str) -> Result<Profile> {
        let mut url = self.endpoint(PROFILES_PATH)?;
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{id}"))
            .append_pair("select", "*");
        let bearer = self.row_bearer()?;

        let span = info_span!("identity.fetch_profile", http.method = "GET", url = %url);
        let response = self
            .request(Method::GET, url, bearer.as_ref())
            .header(reqwest::header::ACCEPT, PGRST_OBJECT)
            .send()
            .instrument(span)
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    #[instrument(skip(self))]
    async fn count_profiles(&self, id: &str) -> Result<u64> {
        let mut url = self.endpoint(PROFILES_PATH)?;
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{id}"))
            .append_pair("select", "id");
        let bearer = self.row_bearer()?;

        let span = info_span!("identity.count_profiles", http.method = "HEAD", url = %url);
        let response = self
            .request(Method::HEAD, url, bearer.as_ref())
            .header("Prefer", "count=exact")
            .send()
            .instrument(span)
            .await?;
        let response = check(response).await?;

        content_range_total(response.headers())
            .ok_or_else(|| AuthError::Parse("missing Content-Range total".to_string()))
    }

    #[instrument(skip(self, profile), fields(id = %profile.id))]
    async fn insert_profile(&self, profile: &NewProfile) -> Result<Profile> {
        let url = self.endpoint(PROFILES_PATH)?;
        let bearer = self.row_bearer()?;

        let span = info_span!("identity.insert_profile", http.method = "POST", url = %url);
        let response = self
            .request(Method::POST, url, bearer.as_ref())
            .header("Prefer", "return=representation")
            .header(reqwest::header::ACCEPT, PGRST_OBJECT)
            .json(profile)
            .send()
            .instrument(span)
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    #[instrument(skip(self, update))]
    async fn update_profile(&self, id: &str, update: &ProfileUpdate) -> Result<()> {
        let mut url = self.endpoint(PROFILES_PATH)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        let bearer = self.row_bearer()?;

        let span = info_span!("identity.update_profile", http.method = "PATCH", url = %url);
        let response = self
            .request(Method::PATCH, url, bearer.as_ref())
            .header("Prefer", "return=minimal")
            .json(update)
            .send()
            .instrument(span)
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{identity::Notification, model::Role, storage::MemoryStore};
    use std::net::TcpListener;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn token_body(access: &str) -> Value {
        json!({
            "access_token": access,
            "refresh_token": "refresh-1",
            "token_type": "bearer",
            "expires_in": 3600,
            "user": {
                "id": "u1",
                "email": "a@b.com",
                "user_metadata": { "role": "agent" }
            }
        })
    }

    #[test]
    fn refresh_delay_is_a_share_of_the_remaining_lifetime() {
        assert_eq!(refresh_delay(1_000, 0, 80), Duration::from_secs(800));
        assert_eq!(refresh_delay(100, 500, 80), Duration::ZERO);
        assert_eq!(
            refresh_delay(i64::MAX, i64::MIN, 89),
            Duration::from_secs(u64::try_from(i64::MAX / 100).unwrap_or(0))
        );
        assert_eq!(refresh_delay(i64::MIN, i64::MAX, 70), Duration::ZERO);
    }

    fn service(server: &MockServer) -> Result<(Arc<MemoryStore>, HttpIdentityService)> {
        let store = Arc::new(MemoryStore::new());
        let config = HttpConfig::new(server.uri(), SecretString::from("anon-key".to_string()));
        let service = HttpIdentityService::new(config, store.clone())?;
        Ok((store, service))
    }

    #[test]
    fn project_ref_is_first_host_label() -> Result<()> {
        assert_eq!(project_ref("https://abcd.supabase.co")?, "abcd");
        assert_eq!(project_ref("http://127.0.0.1:54321")?, "127");
        assert!(project_ref("not a url").is_err());
        assert_eq!(session_storage_key("abcd"), "sb-abcd-auth-token");
        Ok(())
    }

    #[test]
    fn error_body_mapping() {
        let not_found = error_from_body(
            StatusCode::NOT_ACCEPTABLE,
            &json!({ "code": "PGRST116", "message": "JSON object requested, multiple (or no) rows returned" }),
        );
        assert!(not_found.is_not_found());

        let denied = error_from_body(
            StatusCode::FORBIDDEN,
            &json!({ "code": "42501", "message": "permission denied for table profiles" }),
        );
        assert!(denied.is_permission());

        let gotrue = error_from_body(
            StatusCode::BAD_REQUEST,
            &json!({ "code": 400, "error_code": "invalid_credentials", "msg": "Invalid login credentials" }),
        );
        assert_eq!(
            gotrue,
            AuthError::Http {
                status: 400,
                code: Some("invalid_credentials".to_string()),
                message: "Invalid login credentials".to_string(),
            }
        );
    }

    #[test]
    fn content_range_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::CONTENT_RANGE, "*/0".parse().unwrap());
        assert_eq!(content_range_total(&headers), Some(0));
        headers.insert(reqwest::header::CONTENT_RANGE, "0-0/1".parse().unwrap());
        assert_eq!(content_range_total(&headers), Some(1));
        headers.insert(reqwest::header::CONTENT_RANGE, "0-0/*".parse().unwrap());
        assert_eq!(content_range_total(&headers), None);
    }

    #[tokio::test]
    async fn password_sign_in_persists_session() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .and(header("apikey", "anon-key"))
            .and(body_json(json!({ "email": "a@b.com", "password": "pw" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-1")))
            .mount(&server)
            .await;

        let (store, service) = service(&server)?;
        let mut subscription = service.on_auth_state_change();
        let session = service.sign_in_with_password("a@b.com", "pw").await?;

        assert_eq!(session.user.requested_role(), Some(Role::Agent));
        assert!(store
            .get(StorageArea::Local, service.storage_key())?
            .is_some());
        let change = subscription
            .recv()
            .await
            .and_then(Notification::into_change)
            .ok_or(AuthError::NotAuthenticated)?;
        assert_eq!(change.event, AuthEvent::SignedIn);

        let current = service.get_session().await?;
        assert!(current.is_some_and(|current| current.same_token(&session)));
        Ok(())
    }

    #[tokio::test]
    async fn auto_refresh_renews_an_expiring_session() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        let mut expiring = token_body("access-1");
        expiring["expires_in"] = json!(1);
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .respond_with(ResponseTemplate::new(200).set_body_json(expiring))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .and(body_json(json!({ "refresh_token": "refresh-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-2")))
            .mount(&server)
            .await;

        let (_, service) = service(&server)?;
        let service = Arc::new(service);
        service.sign_in_with_password("a@b.com", "pw").await?;

        let mut subscription = service.on_auth_state_change();
        let handle = service.start_auto_refresh();

        let change = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .map_err(|_| AuthError::Transport("no refresh within 5s".to_string()))?
            .and_then(Notification::into_change)
            .ok_or(AuthError::NotAuthenticated)?;
        handle.abort();

        assert_eq!(change.event, AuthEvent::TokenRefreshed);
        let refreshed = service.get_session().await?.ok_or(AuthError::NotAuthenticated)?;
        assert_eq!(refreshed.access_token.expose_secret(), "access-2");
        Ok(())
    }

    #[tokio::test]
    async fn missing_profile_row_is_not_found() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/profiles"))
            .and(query_param("id", "eq.u1"))
            .and(header("accept", PGRST_OBJECT))
            .respond_with(ResponseTemplate::new(406).set_body_json(json!({
                "code": "PGRST116",
                "details": "The result contains 0 rows",
                "hint": null,
                "message": "JSON object requested, multiple (or no) rows returned"
            })))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/rest/v1/profiles"))
            .and(header("prefer", "count=exact"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-range", "*/0"))
            .mount(&server)
            .await;

        let (_, service) = service(&server)?;
        let result = service.fetch_profile("u1").await;
        assert!(result.is_err_and(|err| err.is_not_found()));
        assert_eq!(service.count_profiles("u1").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn sign_out_clears_local_session_even_when_server_fails() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-1")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .and(query_param("scope", "global"))
            .and(header("authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "msg": "boom" })))
            .expect(1)
            .mount(&server)
            .await;

        let (store, service) = service(&server)?;
        service.sign_in_with_password("a@b.com", "pw").await?;

        let result = service.sign_out(SignOutScope::Global).await;
        assert!(matches!(result, Err(AuthError::Http { status: 500, .. })));
        assert!(store
            .get(StorageArea::Local, service.storage_key())?
            .is_none());
        assert!(service.get_session().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn sign_up_sends_only_the_given_metadata() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .and(body_json(json!({
                "email": "a@b.com",
                "password": "pw",
                "data": { "role": "agent" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "u1",
                "email": "a@b.com",
                "user_metadata": { "role": "agent" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (_, service) = service(&server)?;
        let mut metadata = Map::new();
        metadata.insert("role".to_string(), json!("agent"));
        let outcome = service.sign_up("a@b.com", "pw", metadata).await?;

        assert_eq!(outcome.user.id, "u1");
        assert!(outcome.session.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn oauth_url_carries_pkce_challenge() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        let (store, service) = service(&server)?;

        let url = service
            .sign_in_with_oauth(OAuthProvider::Google, "http://localhost:54321/auth/callback")
            .await?;
        let url = Url::parse(&url).map_err(|err| AuthError::Parse(err.to_string()))?;
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/auth/v1/authorize");
        assert_eq!(pairs.get("provider").map(String::as_str), Some("google"));
        assert_eq!(
            pairs.get("code_challenge_method").map(String::as_str),
            Some("s256")
        );
        let verifier = store
            .get(StorageArea::Local, &service.verifier_key())?
            .ok_or_else(|| AuthError::Storage("verifier not stored".to_string()))?;
        assert_eq!(
            pairs.get("code_challenge").cloned(),
            Some(super::super::pkce::challenge_for(&verifier))
        );
        Ok(())
    }
}
