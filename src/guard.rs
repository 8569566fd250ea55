//! Route guard: a pure projection of [`AuthState`] and an optional required
//! role. The only side effect, performed by [`RouteGuard::enforce`], is the
//! redirect to the sign-in page.

use crate::{
    context::AuthState,
    model::Role,
    navigation::{NavigateOptions, Navigator, SIGN_IN_PATH},
};
use tracing::{debug, warn};
use url::form_urlencoded;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardOutcome {
    /// Auth state not known yet; show a placeholder.
    Loading,
    RedirectToLogin { to: String, from: String },
    /// Authenticated, but not in the role the route needs.
    AccessDenied {
        required: Role,
        actual: Option<Role>,
    },
    Render,
}

impl GuardOutcome {
    /// Text of the denial view, naming both roles.
    #[must_use]
    pub fn denial_message(&self) -> Option<String> {
        match self {
            Self::AccessDenied { required, actual } => {
                let actual = actual.map_or("none", Role::as_str);
                Some(format!(
                    "Access denied: this page requires the {required} role, but your role is {actual}."
                ))
            }
            _ => None,
        }
    }

    /// Sign-in location carrying the originally requested path.
    #[must_use]
    pub fn login_location(&self) -> Option<String> {
        match self {
            Self::RedirectToLogin { to, from } => {
                let from: String = form_urlencoded::byte_serialize(from.as_bytes()).collect();
                Some(format!("{to}?from={from}"))
            }
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteGuard {
    required: Option<Role>,
}

impl RouteGuard {
    #[must_use]
    pub const fn new(required: Option<Role>) -> Self {
        Self { required }
    }

    /// Any authenticated visitor passes.
    #[must_use]
    pub const fn authenticated() -> Self {
        Self { required: None }
    }

    #[must_use]
    pub const fn role(required: Role) -> Self {
        Self {
            required: Some(required),
        }
    }

    #[must_use]
    pub fn evaluate(&self, state: &AuthState, requested: &str) -> GuardOutcome {
        if state.loading {
            return GuardOutcome::Loading;
        }
        if !state.is_authenticated() {
            return GuardOutcome::RedirectToLogin {
                to: SIGN_IN_PATH.to_string(),
                from: requested.to_string(),
            };
        }
        if let Some(required) = self.required {
            let actual = state.role();
            if actual != Some(required) {
                return GuardOutcome::AccessDenied { required, actual };
            }
        }
        GuardOutcome::Render
    }

    /// Evaluates against the navigator's current path and performs the
    /// sign-in redirect when needed.
    pub fn enforce(&self, state: &AuthState, navigator: &dyn Navigator) -> GuardOutcome {
        let requested = navigator.current_path();
        let outcome = self.evaluate(state, &requested);

        match &outcome {
            GuardOutcome::RedirectToLogin { .. } => {
                if let Some(location) = outcome.login_location() {
                    debug!(from = %requested, "unauthenticated, redirecting to sign-in");
                    navigator.navigate(&location, NavigateOptions::default());
                }
            }
            GuardOutcome::AccessDenied { required, actual } => {
                warn!(path = %requested, %required, ?actual, "access denied");
            }
            GuardOutcome::Loading | GuardOutcome::Render => {}
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{NewProfile, Session, SessionPayload, User},
        navigation::{MemoryNavigator, NavigationEntry},
    };
    use chrono::Utc;

    fn signed_in(role: Option<Role>) -> AuthState {
        let user = User::new("u1", "a@b.com");
        let session: Session = SessionPayload {
            access_token: "tok-a1".to_string(),
            refresh_token: "tok-r1".to_string(),
            token_type: "bearer".to_string(),
            expires_in: 3600,
            expires_at: None,
            user: user.clone(),
        }
        .into_session(Utc::now());
        let profile = role.map(|role| {
            NewProfile {
                id: user.id.clone(),
                email: user.email.clone(),
                first_name: String::new(),
                last_name: String::new(),
                role,
                country: None,
                created_at: Utc::now(),
            }
            .into_profile()
        });
        AuthState {
            session: Some(session),
            user: Some(user),
            profile,
            loading: false,
            error: None,
            mounted: true,
        }
    }

    #[test]
    fn loading_never_redirects() {
        let navigator = MemoryNavigator::new("/dashboard/agent");
        let state = AuthState {
            loading: true,
            mounted: true,
            ..AuthState::default()
        };
        let outcome = RouteGuard::role(Role::Agent).enforce(&state, &navigator);
        assert_eq!(outcome, GuardOutcome::Loading);
        assert!(navigator.entries().is_empty());
    }

    #[test]
    fn unauthenticated_goes_to_sign_in_with_origin() {
        let navigator = MemoryNavigator::new("/dashboard/agent");
        let state = AuthState {
            mounted: true,
            ..AuthState::default()
        };
        let outcome = RouteGuard::authenticated().enforce(&state, &navigator);
        assert_eq!(
            outcome,
            GuardOutcome::RedirectToLogin {
                to: "/login".to_string(),
                from: "/dashboard/agent".to_string(),
            }
        );
        assert_eq!(
            navigator.entries(),
            vec![NavigationEntry::Push(
                "/login?from=%2Fdashboard%2Fagent".to_string()
            )]
        );
    }

    #[test]
    fn role_mismatch_is_denied_not_redirected() {
        let navigator = MemoryNavigator::new("/dashboard/university");
        let outcome =
            RouteGuard::role(Role::University).enforce(&signed_in(Some(Role::Student)), &navigator);

        assert_eq!(
            outcome,
            GuardOutcome::AccessDenied {
                required: Role::University,
                actual: Some(Role::Student),
            }
        );
        let message = outcome.denial_message().unwrap_or_default();
        assert!(message.contains("university"));
        assert!(message.contains("student"));
        assert!(navigator.entries().is_empty());
    }

    #[test]
    fn missing_profile_fails_a_role_check() {
        let outcome = RouteGuard::role(Role::Admin).evaluate(&signed_in(None), "/admin/dashboard");
        assert_eq!(
            outcome,
            GuardOutcome::AccessDenied {
                required: Role::Admin,
                actual: None,
            }
        );
        assert!(outcome
            .denial_message()
            .is_some_and(|message| message.contains("none")));
    }

    #[test]
    fn matching_role_renders() {
        let state = signed_in(Some(Role::Agent));
        assert_eq!(
            RouteGuard::role(Role::Agent).evaluate(&state, "/dashboard/agent"),
            GuardOutcome::Render
        );
        assert_eq!(
            RouteGuard::authenticated().evaluate(&signed_in(None), "/settings"),
            GuardOutcome::Render
        );
    }
}
