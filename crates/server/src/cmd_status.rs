//! `megatrade status`: check if a relay is running.
//! `megatrade generate-token`: create a random auth token.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;
use crate::VERSION;

pub async fn run(data_dir: &Path, url: &str) -> anyhow::Result<()> {
    println!();
    println!("  MegaTrade v{}", VERSION);
    println!("  Data dir: {}", data_dir.display());

    let config_path = paths::client_config_path();
    if config_path.exists() {
        println!("  Client config: {}", config_path.display());
    } else {
        println!("  Client config: not found (using defaults)");
    }

    if paths::read_token_file().is_some() {
        println!("  Auth token: {}", paths::token_file_path().display());
    } else {
        println!("  Auth token: none");
    }

    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let health_ok = check_health(&health_url).await;
    if health_ok {
        println!("  Health: OK ({})", health_url);
    } else {
        println!("  Health: unreachable ({})", health_url);
    }
    println!();

    if !health_ok {
        println!("  Relay is not running.");
        println!("  Start with: megatrade start");
        println!();
    }

    Ok(())
}

pub fn generate_token(data_dir: &Path) -> anyhow::Result<()> {
    let token_path = write_new_token(data_dir)?;
    let token = std::fs::read_to_string(&token_path)?;

    println!();
    println!(
        "  Auth token generated and saved to {}",
        token_path.display()
    );
    println!();
    println!("  Token: {}", token);
    println!();
    println!("  Usage:");
    println!("    megatrade start --auth-token {}", token);
    println!("  Or:");
    println!(
        "    megatrade start --auth-token $(cat {})",
        token_path.display()
    );
    println!();

    Ok(())
}

/// Write a fresh uuid token to `<data_dir>/auth-token`, readable by the owner only.
fn write_new_token(data_dir: &Path) -> anyhow::Result<PathBuf> {
    let token = uuid::Uuid::new_v4().to_string();
    let token_path = data_dir.join("auth-token");

    std::fs::create_dir_all(data_dir)?;

    std::fs::write(&token_path, &token)?;
    std::fs::set_permissions(&token_path, std::fs::Permissions::from_mode(0o600))?;

    Ok(token_path)
}

async fn check_health(url: &str) -> bool {
    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(1))
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client,
        Err(_) => return false,
    };

    client
        .get(url)
        .send()
        .await
        .map(|resp| resp.status().is_success())
        .unwrap_or(false)
}
