//! Event handlers for the bot.
//!
//! `on_ready` and `on_message` are called from the event loop in
//! [`crate::bot`]. Message handling is split into three steps so each can be
//! tested without a live gateway: pull the command text out of the message,
//! parse it into a [`Command`], then [`execute`] it into a [`Reply`].

use std::time::Duration;

use tracing::{error, info, warn};

use crate::bot::BotContext;
use crate::playlist::SyncError;
use crate::rank::{Platform, PlayerInfo};
use crate::types::*;

pub const PREFIX: char = '!';

/// Embed colour for player profiles.
const PROFILE_COLOR: u32 = 0x00ff00;

const SEARCH_USAGE: &str = "Usage: `!search <scoresaber|beatleader> <player id>`";

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Search { platform: String, player_id: String },
    Playlist,
    Update,
    Help,
    /// Recognised command with bad arguments; carries the usage line.
    Usage(&'static str),
    Unknown(String),
}

impl Command {
    /// Parse command text with the prefix already stripped.
    pub fn parse(text: &str) -> Self {
        let mut words = text.split_whitespace();
        let Some(name) = words.next() else {
            return Command::Help;
        };

        match name.to_ascii_lowercase().as_str() {
            "ping" => Command::Ping,
            "playlist" => Command::Playlist,
            "update" => Command::Update,
            "help" => Command::Help,
            "search" => match (words.next(), words.next()) {
                (Some(platform), Some(player_id)) => Command::Search {
                    platform: platform.to_string(),
                    player_id: player_id.to_string(),
                },
                _ => Command::Usage(SEARCH_USAGE),
            },
            _ => Command::Unknown(name.to_string()),
        }
    }
}

/// Pull the command text out of a message.
///
/// `!search a b` and `<@bot> search a b` both yield `search a b`. Plain chat
/// yields `None`. A bare mention yields an empty string.
pub fn command_text<'a>(content: &'a str, bot_user_id: Option<&str>) -> Option<&'a str> {
    let content = content.trim();

    if let Some(rest) = content.strip_prefix(PREFIX) {
        return (!rest.trim().is_empty()).then(|| rest.trim());
    }

    let bid = bot_user_id?;
    let rest = content
        .strip_prefix(&format!("<@{}>", bid))
        .or_else(|| content.strip_prefix(&format!("<@!{}>", bid)))?
        .trim();
    Some(rest.strip_prefix(PREFIX).unwrap_or(rest).trim())
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Embed(Embed),
    File {
        content: String,
        filename: String,
        bytes: Vec<u8>,
    },
}

impl Reply {
    fn text(s: impl Into<String>) -> Self {
        Reply::Text(s.into())
    }
}

/// Run a command and produce what should be sent back.
///
/// Never fails: every error becomes a readable reply.
pub async fn execute(ctx: &BotContext, command: Command, msg: &Message) -> Reply {
    match command {
        Command::Ping => Reply::text(format!("Pong! Latency: {}", ping_latency(ctx, msg))),

        Command::Search {
            platform,
            player_id,
        } => {
            let platform = match platform.parse::<Platform>() {
                Ok(p) => p,
                Err(e) => return Reply::text(e.to_string()),
            };
            match ctx.rank.fetch_player_info(platform, &player_id).await {
                Ok(info) => Reply::Embed(profile_embed(&info, platform)),
                Err(e) => {
                    warn!(%platform, player_id = %player_id, error = %e, "player lookup failed");
                    Reply::text(format!("Error fetching player info: {}", e))
                }
            }
        }

        Command::Playlist => match ctx.playlist.read().await {
            Ok(Some(bytes)) => Reply::File {
                content: "Here's the latest ScoreSaber ranked playlist!".to_string(),
                filename: ctx.playlist.file_name(),
                bytes,
            },
            Ok(None) => Reply::text("Playlist not found. Try updating it with !update."),
            Err(e) => {
                error!(error = %e, "failed to read playlist");
                Reply::text(format!("Error reading playlist: {}", e))
            }
        },

        Command::Update => match ctx.playlist.synchronize().await {
            Ok(summary) => {
                info!(songs = summary.song_count, "manual playlist update");
                Reply::text("Playlist updated successfully!")
            }
            Err(SyncError::InProgress) => {
                Reply::text("A playlist update is already in progress, try again shortly.")
            }
            Err(e) => Reply::text(format!("Error updating playlist: {}", e)),
        },

        Command::Help => Reply::text(help_text()),

        Command::Usage(usage) => Reply::text(usage),

        Command::Unknown(name) => Reply::text(format!(
            "Not sure what that means: `{}{}`. Try `!help`.",
            PREFIX, name
        )),
    }
}

/// Gateway heartbeat round trip if we have one, else the age of the message.
fn ping_latency(ctx: &BotContext, msg: &Message) -> String {
    if let Some(rtt) = ctx.latency.get() {
        return format_ms(rtt);
    }
    let now = chrono::Utc::now();
    msg.snowflake_timestamp_ms()
        .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms as i64))
        .map(|sent_at| format!("{}ms", now.signed_duration_since(sent_at).num_milliseconds()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn format_ms(d: Duration) -> String {
    format!("{}ms", d.as_millis())
}

pub fn profile_embed(info: &PlayerInfo, platform: Platform) -> Embed {
    Embed::new()
        .title(format!("{}'s Profile ({})", info.name, platform.label()))
        .color(PROFILE_COLOR)
        .field("Global Rank", format!("#{}", info.global_rank), true)
        .field("Country", &info.country, true)
        .field("PP", format!("{}pp", info.performance_points), true)
        .thumbnail(&info.avatar_url)
}

pub fn help_text() -> String {
    "**SaberBot commands**\n\
     • `!ping` — Check bot latency\n\
     • `!search <scoresaber|beatleader> <player id>` — Look up a player profile\n\
     • `!playlist` — Get the latest ranked playlist file\n\
     • `!update` — Refresh the ranked playlist now\n\
     • `!help` — Show this message\n\
     \n\
     You can also mention me instead of using `!`."
        .to_string()
}

// ---------------------------------------------------------------------------
// READY handler
// ---------------------------------------------------------------------------

/// Called for every READY. Records who we are and opens the ready gate the
/// first time round.
pub fn on_ready(ctx: &BotContext, ready: &ReadyEvent) {
    info!(user = %ready.user.tag(), guilds = ready.guilds.len(), "bot is ready!");

    if ctx.bot_user_id.set(ready.user.id.clone()).is_err() {
        info!("session re-established");
    }
    if ctx.gate.open() {
        info!("ready gate opened, scheduled playlist refresh enabled");
    }
}

// ---------------------------------------------------------------------------
// MESSAGE_CREATE handler
// ---------------------------------------------------------------------------

/// Called for each non-bot message.
pub async fn on_message(ctx: &BotContext, msg: Message) {
    let bot_user_id = ctx.bot_user_id.get().map(String::as_str);
    let Some(text) = command_text(&msg.content, bot_user_id) else {
        return;
    };
    let command = Command::parse(text);

    info!(
        message_id = %msg.id,
        author = %msg.author.tag(),
        channel_id = %msg.channel_id,
        command = ?command,
        "handling command"
    );

    let reply = execute(ctx, command, &msg).await;
    if let Err(e) = send_reply(ctx, &msg, reply).await {
        error!(error = %e, channel_id = %msg.channel_id, "failed to send reply");
    }
}

async fn send_reply(
    ctx: &BotContext,
    msg: &Message,
    reply: Reply,
) -> Result<(), crate::http::HttpError> {
    let base = CreateMessage::new().reply_to(msg.id.clone());
    match reply {
        Reply::Text(text) => {
            ctx.http
                .create_message(&msg.channel_id, &base.content(text))
                .await?;
        }
        Reply::Embed(embed) => {
            ctx.http
                .create_message(&msg.channel_id, &base.embed(embed))
                .await?;
        }
        Reply::File {
            content,
            filename,
            bytes,
        } => {
            ctx.http
                .create_message_with_file(&msg.channel_id, &base.content(content), &filename, &bytes)
                .await?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
