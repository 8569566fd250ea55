use crate::{
    cli::{actions::Client, globals::GlobalArgs},
    model::SignUpData,
    redirect::PostAuthRedirector,
};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    pub email: String,
    pub password: SecretString,
    pub data: SignUpData,
}

/// # Errors
/// Returns an error if the account cannot be created.
pub async fn execute(args: Args) -> Result<()> {
    let client = Client::connect(&args.globals, "/signup")?;
    let role = args.data.role;

    let outcome = client
        .context
        .sign_up(&args.email, args.password.expose_secret(), args.data)
        .await
        .context("Sign-up failed")?;

    info!(id = %outcome.user.id, %role, "account created");
    println!("account: {} ({})", outcome.user.email, outcome.user.id);

    if outcome.session.is_none() {
        println!("Check your inbox to confirm the address, then run `campus-auth login`.");
        return Ok(());
    }

    let profile = client
        .context
        .reconciler()
        .ensure_profile(&outcome.user.id, &outcome.user.email, Some(role))
        .await
        .context("Failed to load profile")?;
    println!("role:    {}", profile.role);

    let mut state = client.resolve().await;
    client.context.unmount();
    if state.profile.is_none() {
        state.profile = Some(profile);
    }
    if let Some(to) = PostAuthRedirector::destination(&state, "/signup") {
        println!("landing: {to}");
    }
    Ok(())
}
