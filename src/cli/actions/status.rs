use crate::{
    cli::{
        actions::{print_state, Client},
        globals::GlobalArgs,
    },
    guard::{GuardOutcome, RouteGuard},
    model::Role,
    navigation::Navigator,
    redirect::PostAuthRedirector,
};
use anyhow::Result;

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    pub path: String,
    pub require_role: Option<Role>,
}

/// # Errors
/// Returns an error if the client cannot be wired.
pub async fn execute(args: Args) -> Result<()> {
    let client = Client::connect(&args.globals, &args.path)?;
    let state = client.resolve().await;
    client.context.unmount();

    print_state(&state);

    let outcome = RouteGuard::new(args.require_role).enforce(&state, client.navigator.as_ref());
    match &outcome {
        GuardOutcome::Render => println!("route:   {} renders", args.path),
        GuardOutcome::Loading => println!("route:   still loading"),
        GuardOutcome::RedirectToLogin { .. } => println!(
            "route:   redirected to {}",
            client.navigator.current_path()
        ),
        GuardOutcome::AccessDenied { .. } => {
            if let Some(message) = outcome.denial_message() {
                println!("route:   {message}");
            }
        }
    }

    if let Some(to) = PostAuthRedirector::destination(&state, &args.path) {
        println!("landing: {to}");
    }
    Ok(())
}
