//! A Beat Saber community bot: ScoreSaber / BeatLeader player lookups, a
//! ranked playlist kept fresh on a timer, and a small web surface for health
//! checks and OAuth2 login.
//!
//! The gateway, REST and handler layers live in their own modules; this file
//! only wires the bot loop and the web server together.

pub mod bot;
pub mod config;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod http;
pub mod oauth;
pub mod playlist;
pub mod rank;
pub mod scheduler;
pub mod types;
pub mod web;

use std::sync::Arc;

use tracing::{error, info};

pub use config::{Config, ConfigError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("web server: {0}")]
    Web(#[from] std::io::Error),
}

/// Run the bot and the web server.
///
/// The web server is the process lifetime: if the gateway rejects the
/// session for good, the bot side is logged and dropped while `/` keeps
/// answering. Only a web server failure ends `run`.
pub async fn run(config: Config) -> Result<(), Error> {
    let config = Arc::new(config);
    let client = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .user_agent(http::BOT_USER_AGENT)
        .build()?;

    let web_state = Arc::new(web::WebState {
        identity: oauth::IdentityClient::new(
            client.clone(),
            &config.discord_api,
            config.oauth.clone(),
        ),
    });

    info!(port = config.port, playlist = %config.playlist_path.display(), "starting");
    let web = web::serve(config.port, web_state);
    tokio::pin!(web);
    tokio::select! {
        res = bot::start(config.clone(), client) => {
            if let Err(e) = res {
                error!(error = %e, "bot stopped, web server keeps running");
            }
            web.await?;
        }
        res = &mut web => res?,
    }
    Ok(())
}
