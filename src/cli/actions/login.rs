use crate::{
    cli::{
        actions::{print_state, Client},
        globals::GlobalArgs,
    },
    redirect::PostAuthRedirector,
};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    pub email: String,
    pub password: SecretString,
}

/// # Errors
/// Returns an error if the credentials are rejected.
pub async fn execute(args: Args) -> Result<()> {
    let client = Client::connect(&args.globals, "/login")?;

    let session = client
        .context
        .sign_in(&args.email, args.password.expose_secret())
        .await
        .context("Sign-in failed")?;

    let mut state = client.context.snapshot();
    if state.profile.is_none() {
        let user = &session.user;
        match client
            .context
            .reconciler()
            .ensure_profile(&user.id, &user.email, user.requested_role())
            .await
        {
            Ok(profile) => state.profile = Some(profile),
            Err(e) => warn!("Failed to provision profile: {}", e),
        }
    }

    print_state(&state);
    if let Some(to) = PostAuthRedirector::destination(&state, "/login") {
        println!("landing: {to}");
    }
    Ok(())
}
