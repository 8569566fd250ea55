pub mod login;
pub mod logout;
pub mod oauth;
pub mod profile;
pub mod signup;
pub mod status;

// The match over `Action` lives in `run` so this module stays small.
mod run;

use crate::{
    cli::globals::GlobalArgs,
    context::{AuthContext, AuthState},
    identity::HttpIdentityService,
    navigation::MemoryNavigator,
    storage::FileStore,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum Action {
    SignUp(signup::Args),
    Login(login::Args),
    OAuth(oauth::Args),
    Status(status::Args),
    Profile(profile::Args),
    Logout(logout::Args),
}

impl Action {
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> Result<()> {
        run::execute(self).await
    }
}

/// Everything an action needs to drive the auth core from the terminal.
/// The stored session is refreshed in the background while it is alive.
pub(crate) struct Client {
    pub context: AuthContext,
    pub navigator: Arc<MemoryNavigator>,
    refresher: JoinHandle<()>,
}

impl Drop for Client {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

impl Client {
    /// Opens the session store under the state directory and wires the HTTP
    /// backend into a fresh context positioned at `start_path`.
    pub(crate) fn connect(globals: &GlobalArgs, start_path: &str) -> Result<Self> {
        let store = Arc::new(FileStore::open(&globals.state_dir).with_context(|| {
            format!(
                "Failed to open session store in {}",
                globals.state_dir.display()
            )
        })?);
        let config = globals.http_config()?;
        let identity = Arc::new(
            HttpIdentityService::new(config, store.clone())
                .context("Failed to configure identity service")?,
        );
        let refresher = identity.start_auto_refresh();
        let navigator = Arc::new(MemoryNavigator::new(start_path));
        let context = AuthContext::new(identity, store, navigator.clone(), globals.auth_config());

        Ok(Self {
            context,
            navigator,
            refresher,
        })
    }

    /// Mounts the context and waits for the stored session to resolve.
    pub(crate) async fn resolve(&self) -> AuthState {
        self.context.mount();
        self.context.wait_until_settled().await;
        self.context.snapshot()
    }
}

pub(crate) fn print_state(state: &AuthState) {
    println!("phase:   {:?}", state.phase());
    if let Some(user) = &state.user {
        println!("user:    {} ({})", user.email, user.id);
    }
    match &state.profile {
        Some(profile) => println!(
            "profile: {} {} [{}]",
            profile.first_name, profile.last_name, profile.role
        ),
        None if state.is_authenticated() => println!("profile: none"),
        None => {}
    }
    if let Some(error) = &state.error {
        println!("error:   {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use std::time::Duration;

    #[tokio::test]
    async fn refresher_runs_for_the_lifetime_of_the_client() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let globals = GlobalArgs {
            url: Some("http://127.0.0.1:9".to_string()),
            anon_key: Some(SecretString::from("anon-key".to_string())),
            state_dir: dir.path().to_path_buf(),
            redirect_url: "http://localhost:54321/auth/callback".to_string(),
            watchdog: Duration::from_secs(10),
        };

        let client = Client::connect(&globals, "/")?;
        tokio::task::yield_now().await;
        assert!(!client.refresher.is_finished());

        let refresher = client.refresher.abort_handle();
        drop(client);
        for _ in 0..50 {
            if refresher.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refresher.is_finished());
        Ok(())
    }
}
