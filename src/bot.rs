//! Core bot wiring: shared context, gateway connection and the event loop.
//!
//! Everything the command handlers need lives in [`BotContext`], shared
//! behind an `Arc`. Each inbound command runs in its own task so a slow
//! lookup never holds up the loop.

use std::sync::{Arc, OnceLock};

use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use crate::config::Config;
use crate::events::GatewayEvent;
use crate::gateway::{self, GatewayConfig, GatewayError, Latency};
use crate::handlers;
use crate::http::DiscordHttpClient;
use crate::playlist::PlaylistSync;
use crate::rank::RankClient;
use crate::scheduler::{self, ReadyGate};
use crate::types::{Intents, Snowflake};

/// State shared by every handler.
pub struct BotContext {
    pub http: DiscordHttpClient,
    pub rank: RankClient,
    pub playlist: Arc<PlaylistSync>,
    /// Heartbeat round trip, kept current by the gateway driver.
    pub latency: Latency,
    pub gate: ReadyGate,
    /// Set from the first READY.
    pub bot_user_id: OnceLock<Snowflake>,
}

impl BotContext {
    pub fn new(config: &Config, client: reqwest::Client, latency: Latency) -> Self {
        let rank = RankClient::new(
            client.clone(),
            &config.scoresaber_api,
            &config.beatleader_api,
        );
        Self {
            http: DiscordHttpClient::new(client, &config.discord_api, &config.discord_token),
            playlist: Arc::new(PlaylistSync::new(rank.clone(), &config.playlist_path)),
            rank,
            latency,
            gate: ReadyGate::new(),
            bot_user_id: OnceLock::new(),
        }
    }
}

/// Guilds, guild + DM messages, and message content for prefix commands.
pub fn gateway_intents() -> Intents {
    Intents::GUILDS | Intents::GUILD_MESSAGES | Intents::DIRECT_MESSAGES | Intents::MESSAGE_CONTENT
}

/// Connect to the gateway and run the event loop.
///
/// Outages are retried inside the gateway driver, so this only returns when
/// Discord rejects the session for good (bad token, disallowed intents).
pub async fn start(config: Arc<Config>, client: reqwest::Client) -> Result<(), GatewayError> {
    let gw = gateway::connect(GatewayConfig {
        token: config.discord_token.clone(),
        intents: gateway_intents(),
        shard: None,
        url: gateway::DEFAULT_GATEWAY_URL.to_string(),
    });

    let ctx = Arc::new(BotContext::new(&config, client, gw.latency.clone()));

    // Idles until the first READY opens the gate.
    let _refresh = scheduler::spawn(ctx.playlist.clone(), ctx.gate.clone(), config.sync_interval);

    info!("gateway started, entering event loop");
    while let Ok(event) = gw.events.recv().await {
        dispatch(&ctx, event);
    }

    warn!("gateway rejected the session, event loop stopped");
    Err(GatewayError::Closed)
}

/// Route one gateway event. Returns the handler task for commands.
pub fn dispatch(ctx: &Arc<BotContext>, event: GatewayEvent) -> Option<JoinHandle<()>> {
    match event {
        GatewayEvent::Ready(ready) => {
            handlers::on_ready(ctx, &ready);
            None
        }

        GatewayEvent::MessageCreate(msg) => {
            if msg.author.bot {
                return None;
            }
            let ctx = ctx.clone();
            Some(tokio::spawn(async move {
                handlers::on_message(&ctx, *msg).await;
            }))
        }

        GatewayEvent::Resumed => {
            info!("session resumed");
            None
        }

        // Heartbeats, reconnects and invalid sessions are handled inside the
        // gateway driver.
        GatewayEvent::HeartbeatAck
        | GatewayEvent::HeartbeatRequest
        | GatewayEvent::Reconnect
        | GatewayEvent::InvalidSession(_) => None,

        GatewayEvent::Unknown { event_name, op } => {
            trace!(event = ?event_name, op, "unhandled gateway event");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, ReadyEvent};
    use serde_json::json;
    use static_assertions::assert_impl_all;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    assert_impl_all!(BotContext: Send, Sync);

    fn config(api: &str, dir: &std::path::Path) -> Config {
        Config::from_lookup(|key| {
            match key {
                "DISCORD_TOKEN" => Some("token".to_string()),
                "DISCORD_CLIENT_ID" => Some("1".to_string()),
                "DISCORD_CLIENT_SECRET" => Some("s".to_string()),
                "DISCORD_REDIRECT_URI" => Some("http://localhost/cb".to_string()),
                "PORT" => Some("8080".to_string()),
                "PLAYLIST_PATH" => Some(dir.join("playlist.json").display().to_string()),
                "SCORESABER_API" | "BEATLEADER_API" | "DISCORD_API" => Some(api.to_string()),
                _ => None,
            }
        })
        .unwrap()
    }

    fn message_event(author_is_bot: bool, content: &str) -> GatewayEvent {
        let msg: Message = serde_json::from_value(json!({
            "id": "10",
            "channel_id": "20",
            "author": { "id": "3", "username": "bob", "discriminator": "0", "avatar": null, "bot": author_is_bot, "global_name": null },
            "content": content,
            "timestamp": "2024-01-01T00:00:00+00:00"
        }))
        .unwrap();
        GatewayEvent::MessageCreate(Box::new(msg))
    }

    #[test]
    fn gateway_intents_includes_required_bits() {
        let intents = gateway_intents();
        assert!(intents.contains(Intents::GUILDS));
        assert!(intents.contains(Intents::GUILD_MESSAGES));
        assert!(intents.contains(Intents::MESSAGE_CONTENT));
    }

    #[tokio::test]
    async fn ready_opens_gate() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(BotContext::new(
            &config("http://127.0.0.1:9", dir.path()),
            reqwest::Client::new(),
            Latency::default(),
        ));
        let ready: ReadyEvent = serde_json::from_value(json!({
            "v": 10,
            "user": { "id": "42", "username": "saber", "discriminator": "0", "avatar": null, "bot": true, "global_name": null },
            "session_id": "s",
            "resume_gateway_url": "wss://r",
            "guilds": [],
            "application": { "id": "9", "flags": 0 }
        }))
        .unwrap();

        assert!(dispatch(&ctx, GatewayEvent::Ready(Box::new(ready))).is_none());
        assert!(ctx.gate.is_open());
    }

    #[tokio::test]
    async fn bot_messages_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(BotContext::new(
            &config("http://127.0.0.1:9", dir.path()),
            reqwest::Client::new(),
            Latency::default(),
        ));
        assert!(dispatch(&ctx, message_event(true, "!help")).is_none());
    }

    #[tokio::test]
    async fn commands_are_answered_in_channel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels/20/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "11",
                "channel_id": "20",
                "author": { "id": "42", "username": "saber", "discriminator": "0", "avatar": null, "bot": true, "global_name": null },
                "content": "help",
                "timestamp": "2024-01-01T00:00:01+00:00"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(BotContext::new(
            &config(&server.uri(), dir.path()),
            reqwest::Client::new(),
            Latency::default(),
        ));

        let task = dispatch(&ctx, message_event(false, "!help")).expect("command task");
        task.await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(body["content"].as_str().unwrap().contains("!search"));
        assert_eq!(body["message_reference"]["message_id"], "10");
    }

    #[tokio::test]
    async fn plain_chat_gets_no_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(BotContext::new(
            &config(&server.uri(), dir.path()),
            reqwest::Client::new(),
            Latency::default(),
        ));
        dispatch(&ctx, message_event(false, "nice pass"))
            .expect("task")
            .await
            .unwrap();
    }
}
