#![allow(dead_code)]

use anyhow::{anyhow, Result};
use campus_auth::{
    identity::MemoryIdentityService,
    navigation::MemoryNavigator,
    reconciler::default_profile,
    storage::{MemoryStore, SessionStore},
    AuthConfig, AuthContext, AuthState, Role, User,
};
use std::{sync::Arc, time::Duration};

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub identity: Arc<MemoryIdentityService>,
    pub navigator: Arc<MemoryNavigator>,
    pub context: AuthContext,
}

pub fn harness(start_path: &str) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn SessionStore> = store.clone();
    let identity = Arc::new(MemoryIdentityService::new(shared.clone()));
    let navigator = Arc::new(MemoryNavigator::new(start_path));
    let context = AuthContext::new(
        identity.clone(),
        shared,
        navigator.clone(),
        AuthConfig::default(),
    );
    Harness {
        store,
        identity,
        navigator,
        context,
    }
}

impl Harness {
    /// Registers `email`/`pw` and, when `role` is given, a matching profile row.
    pub fn account(&self, id: &str, email: &str, role: Option<Role>) -> User {
        let mut user = User::new(id, email);
        if let Some(role) = role {
            user = user.with_role(role);
            self.identity
                .seed_profile(default_profile(id, email, Some(role)).into_profile());
        }
        self.identity.register(user.clone(), "pw");
        user
    }

    pub async fn wait_for(&self, predicate: impl FnMut(&AuthState) -> bool) -> Result<AuthState> {
        let mut receiver = self.context.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(5), receiver.wait_for(predicate))
            .await
            .map_err(|_| anyhow!("auth state did not converge within 5s"))??
            .clone();
        Ok(state)
    }
}
