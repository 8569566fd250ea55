use crate::{
    cli::{actions::Client, globals::GlobalArgs},
    model::ProfileUpdate,
};
use anyhow::{Context, Result};

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    pub update: ProfileUpdate,
}

/// # Errors
/// Returns an error when nobody is signed in or the update is rejected.
pub async fn execute(args: Args) -> Result<()> {
    let client = Client::connect(&args.globals, "/settings")?;
    client.resolve().await;

    let result = client.context.update_profile(args.update).await;
    client.context.unmount();

    let profile = result.context("Profile update failed")?;
    println!(
        "profile: {} {} [{}]",
        profile.first_name, profile.last_name, profile.role
    );
    if let Some(country) = &profile.country {
        println!("country: {country}");
    }
    Ok(())
}
