use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use onecta_auth::auth::{
    CacheState, CredentialManager, FileLock, FileStore, HttpRefresher, TokenProvider,
};
use onecta_auth::config::{Command, Config};
use onecta_auth::http_client::OnectaClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Logs go to stderr so stdout only carries command output
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    let app = config.app_credentials()?;

    let idp_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.http_connect_timeout))
        .timeout(Duration::from_secs(config.http_request_timeout))
        .build()
        .context("Failed to create HTTP client")?;

    // One manager per process, shared by every call site
    let manager = Arc::new(
        CredentialManager::new(
            FileStore::new(&config.key_file),
            FileLock::new(&config.key_file, Duration::from_secs(config.lock_timeout)),
            HttpRefresher::new(idp_client, &config.idp_url, config.registration(&app)),
        )
        .with_safety_margin(chrono::Duration::seconds(config.safety_margin as i64)),
    );

    let api = || -> Result<OnectaClient> {
        OnectaClient::new(
            manager.clone() as Arc<dyn TokenProvider>,
            &config.api_url,
            app.device.clone(),
            config.http_connect_timeout,
            config.http_request_timeout,
            config.http_max_retries,
        )
    };

    match command {
        Command::Code { value: None } => {
            let url = manager.refresher().authorize_url()?;
            println!(
                "To generate a new code, open this URL in a browser, then re-run with the code as a parameter\n"
            );
            println!("{url}");
        }

        Command::Code { value: Some(code) } => {
            manager.exchange(&code).await?;
            println!("Stored new token in {}", config.key_file.display());
        }

        Command::Refresh { force } => {
            if force {
                manager.force_refresh().await?;
            } else {
                manager.ensure_fresh().await?;
            }
            print_status(&manager.snapshot().await, &manager);
        }

        Command::Debug => {
            manager.initialize().await?;
            println!("app id: {}", app.id);
            if let Some(device) = &app.device {
                println!("device: {device}");
            }
            println!("key file: {}", config.key_file.display());
            print_status(&manager.snapshot().await, &manager);
        }

        Command::Get { path } => {
            let value = api()?.get(&path).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }

        Command::Mp => {
            let points = api()?.management_points().await?;
            println!("{}", serde_json::to_string_pretty(&points)?);
        }

        Command::Sensors => {
            let summary = api()?.sensors().await?;
            println!("{summary}");
        }

        Command::Temp { value } => {
            api()?.set_room_temperature(value).await?;
            println!("Room temperature setpoint set to {value}");
        }

        Command::Lwo { value } => {
            api()?.set_leaving_water_offset(value).await?;
            println!("Leaving water offset set to {value}");
        }

        Command::Powerful { state } => {
            let on = state == 1;
            api()?.set_powerful_mode(on).await?;
            println!("Powerful mode {}", if on { "on" } else { "off" });
        }
    }

    Ok(())
}

/// Print the cached record with secrets masked, and its remaining lifetime
fn print_status(state: &CacheState, manager: &CredentialManager) {
    let CacheState::Cached(record) = state else {
        println!("No token stored; run `onecta-auth code` to bootstrap");
        return;
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&record.payload.redacted()).unwrap_or_default()
    );
    println!("issued at {}", record.issued_at.to_rfc3339());

    let now = chrono::Utc::now();
    let expiry = record.expiry(manager.safety_margin());
    if now < expiry {
        println!("key expires in {} seconds", (expiry - now).num_seconds());
    } else {
        println!("key expired {} seconds ago", (now - expiry).num_seconds());
    }
}
