use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;

/// Configuration for the bill service.
///
/// Built once at process start and handed to the signer, the store and the
/// notification dispatcher. Field names follow the environment variables
/// they are read from (envy lowercases variable names).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Shared secret expected in the `x-api-key` header (empty = reject all)
    #[serde(rename = "civicapi_api_key", default)]
    pub api_key: String,

    /// HMAC key for pay-link tokens and webhook signatures
    #[serde(default = "default_webhook_secret")]
    pub webhook_secret: String,

    /// Base URL used when building pay links
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    #[serde(default)]
    pub db_path: Option<String>,

    /// Older name for `DB_PATH`, consulted second
    #[serde(rename = "civicapi_db_path", default)]
    pub legacy_db_path: Option<String>,

    /// Exposes the database path on the health endpoint
    #[serde(rename = "civicapi_debug", default, deserialize_with = "flag")]
    pub debug: bool,

    /// Comma-separated list of allowed CORS origins (empty = any origin)
    #[serde(rename = "civicapi_cors", default)]
    pub cors_origins: String,

    #[serde(rename = "civicapi_bind", default = "default_bind_addr")]
    pub bind_addr: String,

    /// Directory served under `/ui` when it exists
    #[serde(rename = "civicapi_ui_dir", default = "default_ui_dir")]
    pub ui_dir: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub vonage_api_key: Option<String>,

    #[serde(default)]
    pub vonage_api_secret: Option<String>,

    #[serde(default = "default_vonage_from")]
    pub vonage_from: String,

    #[serde(default = "default_vonage_endpoint")]
    pub vonage_endpoint: String,
}

fn default_webhook_secret() -> String {
    "dev-webhook-secret".to_string()
}

fn default_public_base_url() -> String {
    "http://127.0.0.1:4051".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:4051".to_string()
}

fn default_ui_dir() -> String {
    "ui".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_vonage_from() -> String {
    "CIVICAPI".to_string()
}

fn default_vonage_endpoint() -> String {
    "https://rest.nexmo.com/sms/json".to_string()
}

/// Accepts "1" / "true" / "yes" as on, anything else as off
fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    ))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            webhook_secret: default_webhook_secret(),
            public_base_url: default_public_base_url(),
            db_path: None,
            legacy_db_path: None,
            debug: false,
            cors_origins: String::new(),
            bind_addr: default_bind_addr(),
            ui_dir: default_ui_dir(),
            log_level: default_log_level(),
            vonage_api_key: None,
            vonage_api_secret: None,
            vonage_from: default_vonage_from(),
            vonage_endpoint: default_vonage_endpoint(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// This function will:
    /// 1. Load variables from .env file if it exists
    /// 2. Deserialize environment variables into Config struct
    pub fn load() -> Result<Self> {
        dotenv().ok();

        let config = envy::from_env::<Config>().context("Invalid environment configuration")?;

        Ok(config)
    }

    /// SQLite file: `DB_PATH`, then `CIVICAPI_DB_PATH`, then a local default
    pub fn database_path(&self) -> PathBuf {
        self.db_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .or(self.legacy_db_path.as_deref().filter(|p| !p.is_empty()))
            .unwrap_or("civicapi.sqlite3")
            .into()
    }

    /// Parsed CORS allow-list
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .map(String::from)
            .collect()
    }

    /// Both halves of the SMS credentials, when configured
    pub fn sms_credentials(&self) -> Option<(&str, &str)> {
        match (self.vonage_api_key.as_deref(), self.vonage_api_secret.as_deref()) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some((key, secret))
            }
            _ => None,
        }
    }
}
