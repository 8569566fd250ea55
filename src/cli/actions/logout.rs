use crate::cli::{actions::Client, globals::GlobalArgs};
use crate::navigation::Navigator;
use anyhow::Result;

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    /// Log what the client holds before signing out.
    pub debug: bool,
}

/// # Errors
/// Returns an error if the client cannot be wired; sign-out itself always
/// clears local credentials.
pub async fn execute(args: Args) -> Result<()> {
    let start = if args.debug { "/debug-logout" } else { "/logout" };
    let client = Client::connect(&args.globals, start)?;
    client.resolve().await;

    let report = if args.debug {
        client.context.debug_logout().await?
    } else {
        client.context.sign_out().await?
    };
    client.context.unmount();

    if let Some(error) = &report.remote_error {
        println!("remote sign-out failed: {error}");
    }
    println!(
        "cleared {} stored keys and {} cookies",
        report.removed_keys.len(),
        report.expired_cookies.len()
    );
    if !report.local_clean() {
        println!("{} storage operations failed", report.storage_errors.len());
    }
    println!("now at:  {}", client.navigator.current_path());
    Ok(())
}
