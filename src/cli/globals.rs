use crate::{
    context::AuthConfig,
    error::{AuthError, Result},
    identity::HttpConfig,
};
use secrecy::SecretString;
use std::{path::PathBuf, time::Duration};

/// Settings shared by every subcommand.
#[derive(Clone)]
pub struct GlobalArgs {
    pub url: Option<String>,
    pub anon_key: Option<SecretString>,
    pub state_dir: PathBuf,
    pub redirect_url: String,
    pub watchdog: Duration,
}

impl GlobalArgs {
    /// Backend settings; missing values are reported only when needed.
    ///
    /// # Errors
    /// Returns [`AuthError::Config`] when the URL or anon key is missing.
    pub fn http_config(&self) -> Result<HttpConfig> {
        let url = self
            .url
            .clone()
            .ok_or_else(|| AuthError::Config("missing identity service URL (--url)".to_string()))?;
        let anon_key = self
            .anon_key
            .clone()
            .ok_or_else(|| AuthError::Config("missing anon key (--anon-key)".to_string()))?;
        Ok(HttpConfig::new(url, anon_key))
    }

    #[must_use]
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            watchdog: self.watchdog,
            oauth_redirect_url: self.redirect_url.clone(),
        }
    }
}

impl std::fmt::Debug for GlobalArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalArgs")
            .field("url", &self.url)
            .field("anon_key", &self.anon_key.as_ref().map(|_| "***"))
            .field("state_dir", &self.state_dir)
            .field("redirect_url", &self.redirect_url)
            .field("watchdog", &self.watchdog)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn globals() -> GlobalArgs {
        GlobalArgs {
            url: Some("https://abcd.supabase.co".to_string()),
            anon_key: Some(SecretString::from("anon-key".to_string())),
            state_dir: PathBuf::from(".campus-auth"),
            redirect_url: "http://localhost:54321/auth/callback".to_string(),
            watchdog: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_global_args() -> Result<()> {
        let args = globals();
        let config = args.http_config()?;
        assert_eq!(config.url, "https://abcd.supabase.co");
        assert_eq!(config.anon_key.expose_secret(), "anon-key");
        assert_eq!(args.auth_config().watchdog, Duration::from_secs(10));
        assert!(!format!("{args:?}").contains("anon-key"));
        Ok(())
    }

    #[test]
    fn missing_backend_settings_are_config_errors() {
        let args = GlobalArgs {
            anon_key: None,
            ..globals()
        };
        assert!(matches!(args.http_config(), Err(AuthError::Config(_))));
    }
}
