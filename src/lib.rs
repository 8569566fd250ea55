//! # campus-auth (session and identity reconciliation)
//!
//! `campus-auth` is the client-side identity core of the campus marketplace.
//! It decides who the current visitor is, makes sure every authenticated
//! identity owns exactly one profile row, keeps that profile in step with the
//! identity service's session, routes visitors to their role dashboard, and
//! tears down every client-held credential on sign-out.
//!
//! ## Components
//!
//! - [`identity`]: the remote identity service seam ([`identity::IdentityService`]),
//!   with an HTTP backend speaking the `GoTrue`/`PostgREST` wire format and an
//!   in-memory backend for tests.
//! - [`storage`]: the session store (local/session areas and a cookie jar).
//! - [`reconciler`]: lazy profile provisioning, tolerant of read races.
//! - [`context`]: the auth state machine ([`context::AuthContext`]).
//! - [`guard`] and [`redirect`]: projections of auth state onto navigation.
//! - [`signout`]: defensive sign-out.
//!
//! ## Ordering
//!
//! The identity service's change notifications are the single source of truth
//! for session transitions. Every asynchronous resolution started by the
//! context records a generation number and is dropped if a newer event has
//! been processed in the meantime, so a slow initial session fetch can never
//! resurrect a signed-out visitor.

pub mod callback;
pub mod cli;
pub mod context;
pub mod error;
pub mod guard;
pub mod identity;
pub mod model;
pub mod navigation;
pub mod reconciler;
pub mod redirect;
pub mod signout;
pub mod storage;

pub use context::{AuthConfig, AuthContext, AuthPhase, AuthState};
pub use error::{AuthError, Result};
pub use model::{Profile, Role, Session, User};

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
