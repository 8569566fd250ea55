//! Maps validated CLI matches to an [`Action`].

use crate::cli::{
    actions::{login, logout, oauth, profile, signup, status, Action},
    commands::{account::*, backend::*},
    globals::GlobalArgs,
};
use crate::model::{ProfileUpdate, Role, SignUpData};
use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use secrecy::SecretString;
use std::{path::PathBuf, time::Duration};
use tracing::error;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    let globals = globals(matches);

    let (name, sub) = matches
        .subcommand()
        .ok_or_else(|| anyhow!("missing subcommand"))?;

    let action = match name {
        CMD_SIGNUP => Action::SignUp(signup::Args {
            globals,
            email: required(sub, ARG_EMAIL)?,
            password: SecretString::from(required(sub, ARG_PASSWORD)?),
            data: SignUpData {
                first_name: optional(sub, ARG_FIRST_NAME).unwrap_or_default(),
                last_name: optional(sub, ARG_LAST_NAME).unwrap_or_default(),
                country: optional(sub, ARG_COUNTRY),
                role: sub.get_one::<Role>(ARG_ROLE).copied().unwrap_or_default(),
            },
        }),
        CMD_LOGIN => Action::Login(login::Args {
            globals,
            email: required(sub, ARG_EMAIL)?,
            password: SecretString::from(required(sub, ARG_PASSWORD)?),
        }),
        CMD_OAUTH => Action::OAuth(oauth::Args {
            globals,
            timeout: Duration::from_secs(
                sub.get_one::<u64>(ARG_TIMEOUT_SECONDS)
                    .copied()
                    .unwrap_or(300),
            ),
        }),
        CMD_STATUS => Action::Status(status::Args {
            globals,
            path: optional(sub, ARG_PATH).unwrap_or_else(|| "/".to_string()),
            require_role: sub.get_one::<Role>(ARG_REQUIRE_ROLE).copied(),
        }),
        CMD_PROFILE => {
            let update = ProfileUpdate {
                first_name: optional(sub, ARG_FIRST_NAME),
                last_name: optional(sub, ARG_LAST_NAME),
                country: optional(sub, ARG_COUNTRY),
                avatar_url: optional(sub, ARG_AVATAR_URL),
                updated_at: None,
            };
            if update.is_empty() {
                return Err(anyhow!(
                    "nothing to update: pass at least one of --{ARG_FIRST_NAME}, --{ARG_LAST_NAME}, --{ARG_COUNTRY}, --{ARG_AVATAR_URL}"
                ));
            }
            Action::Profile(profile::Args { globals, update })
        }
        CMD_LOGOUT => Action::Logout(logout::Args {
            globals,
            debug: false,
        }),
        CMD_DEBUG_LOGOUT => Action::Logout(logout::Args {
            globals,
            debug: true,
        }),
        other => return Err(anyhow!("unknown subcommand: {other}")),
    };

    Ok(action)
}

fn globals(matches: &ArgMatches) -> GlobalArgs {
    let url = optional(matches, ARG_URL);
    if url.is_none() {
        error!("missing identity service URL: set --{ARG_URL} or CAMPUS_AUTH_URL");
    }
    let anon_key = optional(matches, ARG_ANON_KEY).map(SecretString::from);
    if anon_key.is_none() {
        error!("missing anon key: set --{ARG_ANON_KEY} or CAMPUS_AUTH_ANON_KEY");
    }

    GlobalArgs {
        url,
        anon_key,
        state_dir: matches
            .get_one::<PathBuf>(ARG_STATE_DIR)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(".campus-auth")),
        redirect_url: optional(matches, ARG_REDIRECT_URL)
            .unwrap_or_else(|| crate::context::DEFAULT_OAUTH_REDIRECT_URL.to_string()),
        watchdog: Duration::from_secs(
            matches
                .get_one::<u64>(ARG_WATCHDOG_SECONDS)
                .copied()
                .unwrap_or(10),
        ),
    }
}

fn optional(matches: &ArgMatches, id: &str) -> Option<String> {
    matches.get_one::<String>(id).cloned()
}

fn required(matches: &ArgMatches, id: &str) -> Result<String> {
    optional(matches, id).with_context(|| format!("missing required argument: --{id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;
    use secrecy::ExposeSecret;

    #[test]
    fn signup_maps_to_action() -> Result<()> {
        let matches = commands::new().get_matches_from(vec![
            "campus-auth",
            "--url",
            "https://abcd.supabase.co",
            "--anon-key",
            "anon",
            "signup",
            "--email",
            "a@b.com",
            "--password",
            "pw",
            "--role",
            "university",
            "--first-name",
            "Ada",
        ]);

        let Action::SignUp(args) = handler(&matches)? else {
            return Err(anyhow!("expected a signup action"));
        };
        assert_eq!(args.email, "a@b.com");
        assert_eq!(args.password.expose_secret(), "pw");
        assert_eq!(args.data.role, Role::University);
        assert_eq!(args.data.first_name, "Ada");
        assert_eq!(args.data.last_name, "");
        assert_eq!(args.globals.url.as_deref(), Some("https://abcd.supabase.co"));
        Ok(())
    }

    #[test]
    fn missing_backend_settings_do_not_abort() -> Result<()> {
        temp_env::with_vars(
            [
                ("CAMPUS_AUTH_URL", None::<&str>),
                ("CAMPUS_AUTH_ANON_KEY", None::<&str>),
            ],
            || {
                let matches = commands::new().get_matches_from(vec!["campus-auth", "logout"]);
                let Action::Logout(args) = handler(&matches)? else {
                    return Err(anyhow!("expected a logout action"));
                };
                assert!(!args.debug);
                assert!(args.globals.http_config().is_err());
                Ok(())
            },
        )
    }

    #[test]
    fn empty_profile_update_is_rejected() {
        let matches = commands::new().get_matches_from(vec!["campus-auth", "profile"]);
        let result = handler(&matches);
        assert!(result.is_err_and(|e| e.to_string().contains("nothing to update")));
    }

    #[test]
    fn debug_logout_sets_the_flag() -> Result<()> {
        let matches = commands::new().get_matches_from(vec!["campus-auth", "debug-logout"]);
        let Action::Logout(args) = handler(&matches)? else {
            return Err(anyhow!("expected a logout action"));
        };
        assert!(args.debug);
        Ok(())
    }
}
