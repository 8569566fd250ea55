use crate::cli::actions::{login, logout, oauth, profile, signup, status, Action};
use anyhow::Result;

/// Single dispatch point for all CLI actions.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action) -> Result<()> {
    match action {
        Action::SignUp(args) => signup::execute(args).await,
        Action::Login(args) => login::execute(args).await,
        Action::OAuth(args) => oauth::execute(args).await,
        Action::Status(args) => status::execute(args).await,
        Action::Profile(args) => profile::execute(args).await,
        Action::Logout(args) => logout::execute(args).await,
    }
}
