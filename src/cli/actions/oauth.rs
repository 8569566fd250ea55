use crate::{
    callback::{CallbackOutcome, CallbackServer},
    cli::{
        actions::{print_state, Client},
        globals::GlobalArgs,
    },
    navigation::OAUTH_CALLBACK_PATH,
    redirect::PostAuthRedirector,
};
use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::warn;

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    pub timeout: Duration,
}

/// # Errors
/// Returns an error if the provider denies access, no callback arrives in
/// time, or the code exchange fails.
pub async fn execute(args: Args) -> Result<()> {
    let client = Client::connect(&args.globals, OAUTH_CALLBACK_PATH)?;

    // Listen before handing out the URL so the redirect cannot be missed.
    let server = CallbackServer::bind(&args.globals.redirect_url)
        .await
        .context("Failed to start OAuth callback listener")?;

    let url = client
        .context
        .sign_in_with_google()
        .await
        .context("Failed to start Google sign-in")?;
    println!("Open this URL in your browser to continue:\n\n  {url}\n");

    let code = match server.wait(args.timeout).await? {
        CallbackOutcome::Code(code) => code,
        CallbackOutcome::Denied { error, description } => {
            bail!(
                "Google sign-in was not completed: {error}{}",
                description.map(|d| format!(" ({d})")).unwrap_or_default()
            );
        }
    };

    let session = client
        .context
        .complete_oauth(&code)
        .await
        .context("Failed to exchange authorization code")?;

    let mut state = client.resolve().await;
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
    client.context.unmount();

    print_state(&state);
    // Landing is computed as if the callback page had already been left.
    if let Some(to) = PostAuthRedirector::destination(&state, crate::navigation::ROOT_PATH) {
        println!("landing: {to}");
    }
    Ok(())
}
