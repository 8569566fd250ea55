use crate::model::Role;
use clap::{builder::ValueParser, Arg, Command};
use once_cell::sync::Lazy;
use regex::Regex;

pub const CMD_SIGNUP: &str = "signup";
pub const CMD_LOGIN: &str = "login";
pub const CMD_OAUTH: &str = "oauth";
pub const CMD_STATUS: &str = "status";
pub const CMD_PROFILE: &str = "profile";
pub const CMD_LOGOUT: &str = "logout";
pub const CMD_DEBUG_LOGOUT: &str = "debug-logout";

pub const ARG_EMAIL: &str = "email";
pub const ARG_PASSWORD: &str = "password";
pub const ARG_FIRST_NAME: &str = "first-name";
pub const ARG_LAST_NAME: &str = "last-name";
pub const ARG_COUNTRY: &str = "country";
pub const ARG_AVATAR_URL: &str = "avatar-url";
pub const ARG_ROLE: &str = "role";
pub const ARG_REQUIRE_ROLE: &str = "require-role";
pub const ARG_PATH: &str = "path";
pub const ARG_TIMEOUT_SECONDS: &str = "timeout-seconds";

static EMAIL_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok());

#[must_use]
pub fn validator_email() -> ValueParser {
    ValueParser::from(move |email: &str| -> std::result::Result<String, String> {
        let email = email.trim();
        match EMAIL_RE.as_ref() {
            Some(re) if re.is_match(email) => Ok(email.to_string()),
            _ => Err(format!("invalid email address: {email}")),
        }
    })
}

#[must_use]
pub fn validator_role() -> ValueParser {
    ValueParser::from(move |role: &str| role.parse::<Role>())
}

fn email_arg() -> Arg {
    Arg::new(ARG_EMAIL)
        .long(ARG_EMAIL)
        .short('e')
        .help("Account email")
        .env("CAMPUS_AUTH_EMAIL")
        .required(true)
        .value_parser(validator_email())
}

fn password_arg() -> Arg {
    Arg::new(ARG_PASSWORD)
        .long(ARG_PASSWORD)
        .help("Account password")
        .env("CAMPUS_AUTH_PASSWORD")
        .hide_env_values(true)
        .required(true)
}

fn signup() -> Command {
    Command::new(CMD_SIGNUP)
        .about("Create an account and its profile")
        .arg(email_arg())
        .arg(password_arg())
        .arg(
            Arg::new(ARG_ROLE)
                .long(ARG_ROLE)
                .help("Marketplace role: student, agent, university, admin")
                .default_value("student")
                .value_parser(validator_role()),
        )
        .arg(
            Arg::new(ARG_FIRST_NAME)
                .long(ARG_FIRST_NAME)
                .default_value(""),
        )
        .arg(Arg::new(ARG_LAST_NAME).long(ARG_LAST_NAME).default_value(""))
        .arg(Arg::new(ARG_COUNTRY).long(ARG_COUNTRY))
}

fn login() -> Command {
    Command::new(CMD_LOGIN)
        .about("Sign in with email and password")
        .arg(email_arg())
        .arg(password_arg())
}

fn oauth() -> Command {
    Command::new(CMD_OAUTH)
        .about("Sign in with Google through the browser")
        .arg(
            Arg::new(ARG_TIMEOUT_SECONDS)
                .long(ARG_TIMEOUT_SECONDS)
                .help("How long to wait for the provider callback")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn status() -> Command {
    Command::new(CMD_STATUS)
        .about("Show the current session, profile and routing decision")
        .arg(
            Arg::new(ARG_PATH)
                .long(ARG_PATH)
                .help("Path to evaluate the route guard against")
                .default_value("/"),
        )
        .arg(
            Arg::new(ARG_REQUIRE_ROLE)
                .long(ARG_REQUIRE_ROLE)
                .help("Role the route requires")
                .value_parser(validator_role()),
        )
}

fn profile() -> Command {
    Command::new(CMD_PROFILE)
        .about("Update the signed-in user's profile")
        .arg(Arg::new(ARG_FIRST_NAME).long(ARG_FIRST_NAME))
        .arg(Arg::new(ARG_LAST_NAME).long(ARG_LAST_NAME))
        .arg(Arg::new(ARG_COUNTRY).long(ARG_COUNTRY))
        .arg(Arg::new(ARG_AVATAR_URL).long(ARG_AVATAR_URL))
}

#[must_use]
pub fn with_subcommands(command: Command) -> Command {
    command
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(signup())
        .subcommand(login())
        .subcommand(oauth())
        .subcommand(status())
        .subcommand(profile())
        .subcommand(Command::new(CMD_LOGOUT).about("Sign out and clear every stored credential"))
        .subcommand(
            Command::new(CMD_DEBUG_LOGOUT)
                .about("Print what this client holds, then sign out"),
        )
}
