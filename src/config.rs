use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::auth::{ClientRegistration, SAFETY_MARGIN_SECS};

/// Upper bound for `--http-retries`; the backoff doubles per attempt
pub const MAX_HTTP_RETRIES: u32 = 10;

/// Onecta token manager and debugging CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// JSON file holding the current token (shared by all processes)
    #[arg(long, env = "ONECTA_KEY_FILE", default_value = "/tmp/daikin_key.json")]
    pub key_file: String,

    /// JSON file with the app registration: "id", "secret" and optional "device"
    #[arg(long, env = "ONECTA_APP_FILE", default_value = "~/.daikin_app.json")]
    pub app_file: String,

    /// Identity provider prefix
    #[arg(
        long,
        env = "ONECTA_IDP_URL",
        default_value = "https://idp.onecta.daikineurope.com/v1/oidc"
    )]
    pub idp_url: String,

    /// Resource API prefix
    #[arg(
        long,
        env = "ONECTA_API_URL",
        default_value = "https://api.onecta.daikineurope.com/v1"
    )]
    pub api_url: String,

    /// Redirect URI registered for the app; echoes the code back to the user
    #[arg(
        long,
        env = "ONECTA_REDIRECT_URI",
        default_value = "https://ibmx20.infinityfreeapp.com/daikin.php"
    )]
    pub redirect_uri: String,

    /// Seconds before real expiry at which a token is treated as expired
    #[arg(long, env = "TOKEN_SAFETY_MARGIN", default_value_t = SAFETY_MARGIN_SECS as u64)]
    pub safety_margin: u64,

    /// Maximum seconds to wait for the token file lock
    #[arg(long, env = "TOKEN_LOCK_TIMEOUT", default_value = "90")]
    pub lock_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP max retries for the resource API
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "5")]
    pub http_retries: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the authorization URL, or exchange the code it produced
    Code {
        /// Authorization code copied from the redirect page
        value: Option<String>,
    },
    /// Make sure the stored token is valid, renewing it if needed
    Refresh {
        /// Renew even if the current token has not expired
        #[arg(long)]
        force: bool,
    },
    /// Show the cached token and its remaining lifetime
    Debug,
    /// GET an API leaf, e.g. `info`, `sites`, `gateway-devices`
    Get { path: String },
    /// Show the first gateway's management points
    Mp,
    /// Print outdoor, room/target, hot-water and leaving-water temperatures
    Sensors,
    /// Set the heating room-temperature setpoint
    Temp {
        #[arg(allow_negative_numbers = true)]
        value: f64,
    },
    /// Set the leaving-water temperature offset
    Lwo {
        #[arg(allow_negative_numbers = true)]
        value: i64,
    },
    /// Turn the hot-water powerful mode off (0) or on (1)
    Powerful {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=1))]
        state: u8,
    },
}

/// App registration file contents
#[derive(Debug, Clone, Deserialize)]
pub struct AppCredentials {
    pub id: String,
    pub secret: String,
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Files
    pub key_file: PathBuf,
    pub app_file: PathBuf,

    // Endpoints
    pub idp_url: String,
    pub api_url: String,
    pub redirect_uri: String,

    // Token policy
    pub safety_margin: u64,
    pub lock_timeout: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone();
        Ok((Self::from_args(args), command))
    }

    pub fn from_args(args: CliArgs) -> Self {
        Config {
            key_file: expand_tilde(&args.key_file),
            app_file: expand_tilde(&args.app_file),

            idp_url: args.idp_url,
            api_url: args.api_url,
            redirect_uri: args.redirect_uri,

            safety_margin: args.safety_margin,
            lock_timeout: args.lock_timeout,

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,

            log_level: args.log_level,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.safety_margin >= 3600 {
            anyhow::bail!(
                "TOKEN_SAFETY_MARGIN of {}s would leave no usable token lifetime",
                self.safety_margin
            );
        }
        if self.http_max_retries > MAX_HTTP_RETRIES {
            anyhow::bail!(
                "HTTP_MAX_RETRIES of {} exceeds the maximum of {}",
                self.http_max_retries,
                MAX_HTTP_RETRIES
            );
        }
        if self.lock_timeout == 0 {
            anyhow::bail!("TOKEN_LOCK_TIMEOUT must be at least one second");
        }
        if let Some(parent) = self.key_file.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                anyhow::bail!(
                    "Directory for ONECTA_KEY_FILE does not exist: {}",
                    parent.display()
                );
            }
        }
        Ok(())
    }

    /// Read the app registration file
    pub fn app_credentials(&self) -> Result<AppCredentials> {
        load_app_credentials(&self.app_file)
    }

    pub fn registration(&self, app: &AppCredentials) -> ClientRegistration {
        ClientRegistration {
            client_id: app.id.clone(),
            client_secret: app.secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
        }
    }
}

/// Parse the app registration JSON
pub fn load_app_credentials(path: &Path) -> Result<AppCredentials> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read app file: {}", path.display()))?;
    let app: AppCredentials = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse app file: {}", path.display()))?;
    if app.id.is_empty() || app.secret.is_empty() {
        anyhow::bail!("App file {} must contain non-empty \"id\" and \"secret\"", path.display());
    }
    Ok(app)
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
