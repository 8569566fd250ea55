use clap::{Arg, Command};
use std::path::PathBuf;

pub const ARG_URL: &str = "url";
pub const ARG_ANON_KEY: &str = "anon-key";
pub const ARG_STATE_DIR: &str = "state-dir";
pub const ARG_REDIRECT_URL: &str = "redirect-url";
pub const ARG_WATCHDOG_SECONDS: &str = "watchdog-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_URL)
                .long(ARG_URL)
                .help("Identity service base URL, e.g. https://<project-ref>.supabase.co")
                .env("CAMPUS_AUTH_URL")
                .global(true),
        )
        .arg(
            Arg::new(ARG_ANON_KEY)
                .long(ARG_ANON_KEY)
                .help("Public (anon) API key of the identity service")
                .env("CAMPUS_AUTH_ANON_KEY")
                .hide_env_values(true)
                .global(true),
        )
        .arg(
            Arg::new(ARG_STATE_DIR)
                .long(ARG_STATE_DIR)
                .help("Directory holding the persisted session store")
                .env("CAMPUS_AUTH_STATE_DIR")
                .default_value(".campus-auth")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new(ARG_REDIRECT_URL)
                .long(ARG_REDIRECT_URL)
                .help("OAuth redirect target; its host and port are served locally")
                .env("CAMPUS_AUTH_REDIRECT_URL")
                .default_value(crate::context::DEFAULT_OAUTH_REDIRECT_URL)
                .global(true),
        )
        .arg(
            Arg::new(ARG_WATCHDOG_SECONDS)
                .long(ARG_WATCHDOG_SECONDS)
                .help("Upper bound in seconds for resolving the stored session")
                .env("CAMPUS_AUTH_WATCHDOG_SECONDS")
                .default_value("10")
                .value_parser(clap::value_parser!(u64).range(1..))
                .global(true),
        )
}
