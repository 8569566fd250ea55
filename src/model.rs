//! Identity, session and profile types shared by every layer. Tokens are held
//! as [`SecretString`] so `Debug` output never carries credential material.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Agent,
    University,
    Admin,
}

impl Role {
    pub const ALL: [Self; 4] = [Self::Student, Self::Agent, Self::University, Self::Admin];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Agent => "agent",
            Self::University => "university",
            Self::Admin => "admin",
        }
    }

    /// Landing area for an authenticated user holding this role.
    #[must_use]
    pub const fn dashboard_path(self) -> &'static str {
        match self {
            Self::Student => "/dashboard/student",
            Self::Agent => "/dashboard/agent",
            Self::University => "/dashboard/university",
            Self::Admin => "/admin/dashboard",
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::Student
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == value)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|role| role.as_str()).collect();
                format!("unknown role: {value} (expected {})", known.join(", "))
            })
    }
}

/// Authenticated identity as issued by the identity service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub user_metadata: Map<String, Value>,
}

impl User {
    #[must_use]
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            user_metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.user_metadata
            .insert("role".to_string(), Value::String(role.as_str().to_string()));
        self
    }

    /// Role requested at sign-up, if the metadata carries a recognised one.
    #[must_use]
    pub fn requested_role(&self) -> Option<Role> {
        self.user_metadata
            .get("role")
            .and_then(Value::as_str)
            .and_then(|role| role.parse().ok())
    }
}

/// Credential bundle. A session always carries its user.
#[derive(Clone, Debug)]
pub struct Session {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub token_type: String,
    pub expires_in: u64,
    pub expires_at: i64,
    pub user: User,
}

impl Session {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now.timestamp()
    }

    #[must_use]
    pub fn to_payload(&self) -> SessionPayload {
        SessionPayload {
            access_token: self.access_token.expose_secret().to_string(),
            refresh_token: self.refresh_token.expose_secret().to_string(),
            token_type: self.token_type.clone(),
            expires_in: self.expires_in,
            expires_at: Some(self.expires_at),
            user: self.user.clone(),
        }
    }

    /// Two sessions are the same when they carry the same access token.
    #[must_use]
    pub fn same_token(&self, other: &Self) -> bool {
        self.access_token.expose_secret() == other.access_token.expose_secret()
    }
}

/// Wire and storage shape of a session (`/token` responses and the persisted
/// `sb-<ref>-auth-token` entry share it). Must never be logged.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionPayload {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: User,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl SessionPayload {
    /// Converts into a [`Session`], deriving `expires_at` from `issued_at` when absent.
    #[must_use]
    pub fn into_session(self, issued_at: DateTime<Utc>) -> Session {
        let expires_in = i64::try_from(self.expires_in).unwrap_or(i64::MAX);
        let expires_at = self
            .expires_at
            .unwrap_or_else(|| issued_at.timestamp().saturating_add(expires_in));
        Session {
            access_token: SecretString::from(self.access_token),
            refresh_token: SecretString::from(self.refresh_token),
            token_type: self.token_type,
            expires_in: self.expires_in,
            expires_at,
            user: self.user,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Insert payload for the `profiles` table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewProfile {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewProfile {
    #[must_use]
    pub fn into_profile(self) -> Profile {
        Profile {
            id: self.id,
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            role: self.role,
            country: self.country,
            avatar_url: None,
            created_at: self.created_at,
            updated_at: None,
        }
    }
}

/// Partial profile update; unset fields are left untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProfileUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.country.is_none()
            && self.avatar_url.is_none()
    }

    pub fn apply_to(&self, profile: &mut Profile) {
        if let Some(first_name) = &self.first_name {
            profile.first_name.clone_from(first_name);
        }
        if let Some(last_name) = &self.last_name {
            profile.last_name.clone_from(last_name);
        }
        if let Some(country) = &self.country {
            profile.country = Some(country.clone());
        }
        if let Some(avatar_url) = &self.avatar_url {
            profile.avatar_url = Some(avatar_url.clone());
        }
        if self.updated_at.is_some() {
            profile.updated_at = self.updated_at;
        }
    }
}

/// Form data collected at sign-up. Only `role` travels as identity metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignUpData {
    pub first_name: String,
    pub last_name: String,
    pub country: Option<String>,
    pub role: Role,
}

#[derive(Clone, Debug)]
pub struct SignUpOutcome {
    pub user: User,
    /// Absent when the service requires email confirmation first.
    pub session: Option<Session>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OAuthProvider {
    Google,
}

impl OAuthProvider {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignOutScope {
    /// Every session of the identity, on every device.
    #[default]
    Global,
    Local,
    Others,
}

impl SignOutScope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Local => "local",
            Self::Others => "others",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    PasswordRecovery,
}

/// A change notification from the identity service.
#[derive(Clone, Debug)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<Session>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_round_trips_through_strings() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>(), Ok(role));
            assert_eq!(role.to_string(), role.as_str());
        }
        assert_eq!(" Agent ".parse::<Role>(), Ok(Role::Agent));
        assert!("professor"
            .parse::<Role>()
            .is_err_and(|e| e.contains("student, agent, university, admin")));
    }

    #[test]
    fn dashboards_follow_the_mapping_table() {
        assert_eq!(Role::Student.dashboard_path(), "/dashboard/student");
        assert_eq!(Role::Agent.dashboard_path(), "/dashboard/agent");
        assert_eq!(Role::University.dashboard_path(), "/dashboard/university");
        assert_eq!(Role::Admin.dashboard_path(), "/admin/dashboard");
    }

    #[test]
    fn requested_role_ignores_unknown_values() {
        let user = User::new("u1", "a@b.com");
        assert_eq!(user.requested_role(), None);
        assert_eq!(
            user.clone().with_role(Role::Agent).requested_role(),
            Some(Role::Agent)
        );

        let mut odd = user;
        odd.user_metadata
            .insert("role".to_string(), json!("superuser"));
        assert_eq!(odd.requested_role(), None);
    }

    #[test]
    fn session_payload_derives_expiry() {
        let issued_at = Utc::now();
        let payload: SessionPayload = serde_json::from_value(json!({
            "access_token": "tok-a1",
            "refresh_token": "tok-r1",
            "expires_in": 3600,
            "user": { "id": "u1", "email": "a@b.com" }
        }))
        .unwrap();
        let session = payload.into_session(issued_at);
        assert_eq!(session.expires_at, issued_at.timestamp() + 3600);
        assert_eq!(session.token_type, "bearer");
        assert!(!session.is_expired_at(issued_at));
        assert!(!format!("{session:?}").contains("tok-a1"));
    }

    #[test]
    fn profile_update_only_touches_set_fields() {
        let mut profile = NewProfile {
            id: "u1".to_string(),
            email: "a@b.com".to_string(),
            first_name: String::new(),
            last_name: String::new(),
            role: Role::Student,
            country: None,
            created_at: Utc::now(),
        }
        .into_profile();

        let update = ProfileUpdate {
            first_name: Some("Ada".to_string()),
            ..ProfileUpdate::default()
        };
        update.apply_to(&mut profile);

        assert_eq!(profile.first_name, "Ada");
        assert_eq!(profile.last_name, "");
        assert_eq!(profile.updated_at, None);
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({ "first_name": "Ada" })
        );
    }
}
