//! Startup configuration.
//!
//! Everything the bot needs from the environment is read exactly once, in
//! `main`, into an immutable [`Config`]. Components receive it by reference
//! and never call `std::env` themselves.

use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_PLAYLIST_PATH: &str = "playlist.json";
pub const DEFAULT_SCORESABER_API: &str = "https://scoresaber.com/api";
pub const DEFAULT_BEATLEADER_API: &str = "https://api.beatleader.xyz";
pub const DEFAULT_DISCORD_API: &str = "https://discord.com/api/v10";

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// OAuth2 application credentials for the identity provider.
#[derive(Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

/// Runtime parameters, loaded once at startup.
#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub oauth: OAuthConfig,
    pub port: u16,
    pub playlist_path: PathBuf,
    pub scoresaber_api: String,
    pub beatleader_api: String,
    pub discord_api: String,
    pub sync_interval: Duration,
    pub http_timeout: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"<redacted>")
            .field("oauth", &self.oauth)
            .field("port", &self.port)
            .field("playlist_path", &self.playlist_path)
            .field("scoresaber_api", &self.scoresaber_api)
            .field("beatleader_api", &self.beatleader_api)
            .field("discord_api", &self.discord_api)
            .field("sync_interval", &self.sync_interval)
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(name))
        };
        let optional = |name: &str, default: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let discord_token = required("DISCORD_TOKEN")?;
        let oauth = OAuthConfig {
            client_id: required("DISCORD_CLIENT_ID")?,
            client_secret: required("DISCORD_CLIENT_SECRET")?,
            redirect_uri: required("DISCORD_REDIRECT_URI")?,
        };

        let port_raw = required("PORT")?;
        let port = match port_raw.parse::<u16>() {
            Ok(0) => {
                return Err(ConfigError::Invalid {
                    name: "PORT",
                    value: port_raw,
                    reason: "must be a fixed, non-zero port".to_string(),
                })
            }
            Ok(port) => port,
            Err(e) => {
                return Err(ConfigError::Invalid {
                    name: "PORT",
                    value: port_raw,
                    reason: e.to_string(),
                })
            }
        };

        let sync_interval = parse_secs(&lookup, "SYNC_INTERVAL_SECS", DEFAULT_SYNC_INTERVAL)?;
        let http_timeout = parse_secs(&lookup, "HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT)?;

        Ok(Self {
            discord_token,
            oauth,
            port,
            playlist_path: PathBuf::from(optional("PLAYLIST_PATH", DEFAULT_PLAYLIST_PATH)),
            scoresaber_api: trim_base(optional("SCORESABER_API", DEFAULT_SCORESABER_API)),
            beatleader_api: trim_base(optional("BEATLEADER_API", DEFAULT_BEATLEADER_API)),
            discord_api: trim_base(optional("DISCORD_API", DEFAULT_DISCORD_API)),
            sync_interval,
            http_timeout,
        })
    }
}

fn parse_secs<F>(lookup: &F, name: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name).filter(|v| !v.trim().is_empty()) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            name,
            value: raw,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(e) => Err(ConfigError::Invalid {
            name,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn trim_base(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
