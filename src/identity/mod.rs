//! Seam to the remote identity service: credential operations, change
//! notifications and row storage over the `profiles` table. Callers receive
//! `Result`s, never panics; a missing row is reported as
//! [`AuthError::NotFound`](crate::AuthError::NotFound) so the reconciler can
//! tell absence apart from a denied read.

pub mod http;
pub mod memory;
pub mod pkce;

use crate::{
    error::Result,
    model::{
        AuthChange, NewProfile, OAuthProvider, Profile, ProfileUpdate, Session, SignOutScope,
        SignUpOutcome,
    },
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::warn;

pub use http::{HttpConfig, HttpIdentityService};
pub use memory::MemoryIdentityService;

/// Capacity of the change-notification channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Current session, or `None` when signed out.
    async fn get_session(&self) -> Result<Option<Session>>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Map<String, Value>,
    ) -> Result<SignUpOutcome>;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session>;

    /// Returns the provider authorization URL; the session arrives later
    /// through [`IdentityService::exchange_code_for_session`].
    async fn sign_in_with_oauth(&self, provider: OAuthProvider, redirect_to: &str)
        -> Result<String>;

    async fn exchange_code_for_session(&self, code: &str) -> Result<Session>;

    async fn refresh_session(&self) -> Result<Session>;

    async fn sign_out(&self, scope: SignOutScope) -> Result<()>;

    fn on_auth_state_change(&self) -> Subscription;

    async fn fetch_profile(&self, id: &str) -> Result<Profile>;

    async fn count_profiles(&self, id: &str) -> Result<u64>;

    async fn insert_profile(&self, profile: &NewProfile) -> Result<Profile>;

    async fn update_profile(&self, id: &str, update: &ProfileUpdate) -> Result<()>;
}

/// What a [`Subscription`] yields.
#[derive(Debug)]
pub enum Notification {
    Change(AuthChange),
    /// The subscriber fell behind and `skipped` changes were dropped along
    /// with any still queued; the current session must be re-read.
    Lagged { skipped: u64 },
}

impl Notification {
    #[must_use]
    pub fn into_change(self) -> Option<AuthChange> {
        match self {
            Self::Change(change) => Some(change),
            Self::Lagged { .. } => None,
        }
    }
}

/// Live feed of [`AuthChange`]s. Dropping it unsubscribes.
pub struct Subscription {
    receiver: broadcast::Receiver<AuthChange>,
}

impl Subscription {
    #[must_use]
    pub fn new(receiver: broadcast::Receiver<AuthChange>) -> Self {
        Self { receiver }
    }

    /// Next notification in delivery order; `None` once the service is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        match self.receiver.recv().await {
            Ok(change) => Some(Notification::Change(change)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                let skipped = skipped + self.drain();
                warn!("auth change subscriber lagged, dropped {skipped} events");
                Some(Notification::Lagged { skipped })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Discards everything queued; replaying old changes after a gap could
    /// move state backwards.
    fn drain(&mut self) -> u64 {
        let mut drained = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(_) => drained += 1,
                Err(TryRecvError::Lagged(skipped)) => drained += skipped,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return drained,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuthEvent;

    fn change(event: AuthEvent) -> AuthChange {
        AuthChange {
            event,
            session: None,
        }
    }

    #[tokio::test]
    async fn lag_drops_the_backlog_and_is_reported() {
        let (sender, receiver) = broadcast::channel(2);
        let mut subscription = Subscription::new(receiver);

        for event in [
            AuthEvent::SignedIn,
            AuthEvent::TokenRefreshed,
            AuthEvent::TokenRefreshed,
            AuthEvent::SignedOut,
        ] {
            let _ = sender.send(change(event));
        }

        let notification = subscription.recv().await;
        assert!(matches!(
            notification,
            Some(Notification::Lagged { skipped: 4 })
        ));

        let _ = sender.send(change(AuthEvent::SignedIn));
        let next = subscription.recv().await.and_then(Notification::into_change);
        assert_eq!(next.map(|c| c.event), Some(AuthEvent::SignedIn));

        drop(sender);
        assert!(subscription.recv().await.is_none());
    }
}
