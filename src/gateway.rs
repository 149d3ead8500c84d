//! Gateway (WebSocket) transport for the Discord API.
//!
//! This module owns the WebSocket connection lifecycle:
//!   - connect → receive HELLO → send IDENTIFY
//!   - background heartbeat task, with ACK round-trip latency tracking
//!   - sequence number + session_id tracking
//!   - automatic reconnect + RESUME on disconnect
//!   - gateway send rate limiting (120 events / 60s)
//!
//! The rest of the codebase consumes a stream of [`GatewayEvent`] values
//! without ever touching `tokio_tungstenite` directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::events::GatewayEvent;
use crate::types::*;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// Discord allows at most 120 gateway sends per 60 seconds.
const SEND_BUDGET_MAX: u32 = 120;
const SEND_BUDGET_WINDOW: Duration = Duration::from_secs(60);

const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("timed out waiting for HELLO")]
    HelloTimeout,
    #[error("stream ended before HELLO")]
    StreamEnded,
    #[error("gateway closed the session with a non-recoverable close code")]
    Closed,
    #[error("unexpected gateway payload: {0}")]
    Protocol(String),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode gateway payload: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Gateway send rate limiter
// ---------------------------------------------------------------------------

/// Sliding-window rate limiter for outbound gateway messages.
struct SendRateLimiter {
    /// Timestamps of recent sends; only the window's worth is kept.
    timestamps: Vec<Instant>,
    budget: u32,
    window: Duration,
}

impl SendRateLimiter {
    fn new(budget: u32, window: Duration) -> Self {
        Self {
            timestamps: Vec::with_capacity(budget as usize),
            budget,
            window,
        }
    }

    /// How long the caller should wait before sending, or `None` if it can
    /// send immediately. Does **not** record the send.
    fn delay_at(&self, now: Instant) -> Option<Duration> {
        let mut in_window = self
            .timestamps
            .iter()
            .filter(|&&t| now.duration_since(t) < self.window);

        if (in_window.clone().count() as u32) < self.budget {
            return None;
        }

        let oldest = in_window.by_ref().min().copied()?;
        let expires_at = oldest + self.window;
        (expires_at > now).then(|| expires_at - now)
    }

    /// Record a send at `now` and prune old entries.
    fn record_at(&mut self, now: Instant) {
        self.timestamps
            .retain(|&t| now.duration_since(t) < self.window);
        self.timestamps.push(now);
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Options for connecting to the Discord gateway.
#[derive(Clone)]
pub struct GatewayConfig {
    pub token: String,
    pub intents: Intents,
    /// Optional shard info: `[shard_id, num_shards]`.
    pub shard: Option<[u32; 2]>,
    pub url: String,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("shard", &self.shard)
            .field("url", &self.url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Latency
// ---------------------------------------------------------------------------

/// Most recent heartbeat → ACK round trip, shared with the command handlers.
#[derive(Debug, Clone, Default)]
pub struct Latency(Arc<AtomicU64>);

impl Latency {
    const UNKNOWN: u64 = 0;

    pub fn get(&self) -> Option<Duration> {
        match self.0.load(Ordering::Relaxed) {
            Self::UNKNOWN => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    fn set(&self, rtt: Duration) {
        let micros = (rtt.as_micros() as u64).max(1);
        self.0.store(micros, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Internal session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct SessionState {
    /// From the READY event.
    session_id: Option<String>,
    /// Resume URL provided by Discord in the READY event.
    resume_gateway_url: Option<String>,
    /// Last sequence number seen.
    sequence: Option<u64>,
    /// When the last heartbeat went out, cleared on ACK.
    heartbeat_sent_at: Option<Instant>,
}

impl SessionState {
    fn resume_payload(&self, token: &str) -> Option<Resume> {
        Some(Resume {
            token: token.to_string(),
            session_id: self.session_id.clone()?,
            seq: self.sequence?,
        })
    }
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<Socket, WsMessage>;
type WsStream = futures_util::stream::SplitStream<Socket>;

/// Shared writer half plus its rate limiter.
#[derive(Clone)]
struct Outbound {
    sink: Arc<Mutex<WsSink>>,
    limiter: Arc<Mutex<SendRateLimiter>>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Handle to a running gateway connection.
///
/// The background driver keeps reconnecting through outages. It stops only
/// when the event receiver is dropped or Discord rejects the session for good
/// (bad token, disallowed intents).
pub struct GatewayHandle {
    /// Receive typed events.
    pub events: async_channel::Receiver<GatewayEvent>,
    /// Heartbeat round-trip latency.
    pub latency: Latency,
    /// Handle to the background driver task.
    pub driver_handle: tokio::task::JoinHandle<()>,
}

/// Connect to the Discord gateway, returning a [`GatewayHandle`].
///
/// This spawns background tasks for:
///   - reading from the WebSocket and parsing events
///   - heartbeating at the interval Discord tells us
///   - reconnecting + resuming on disconnects
///   - rate-limiting outbound sends
pub fn connect(config: GatewayConfig) -> GatewayHandle {
    let (event_tx, event_rx) = async_channel::bounded::<GatewayEvent>(256);
    let latency = Latency::default();

    let driver_handle = tokio::spawn(gateway_driver(config, event_tx, latency.clone()));

    GatewayHandle {
        events: event_rx,
        latency,
        driver_handle,
    }
}

// ---------------------------------------------------------------------------
// The main driver loop (runs in a spawned task)
// ---------------------------------------------------------------------------

async fn gateway_driver(
    config: GatewayConfig,
    event_tx: async_channel::Sender<GatewayEvent>,
    latency: Latency,
) {
    let session = Arc::new(Mutex::new(SessionState::default()));
    let mut reconnect_attempts: u32 = 0;

    loop {
        let url = {
            let s = session.lock().await;
            with_gateway_params(s.resume_gateway_url.as_deref().unwrap_or(&config.url))
        };

        info!(url = %url, "connecting to Discord gateway");

        let disconnect = match run_connection(&url, &config, &session, &event_tx, &latency).await {
            Ok(reason) => {
                reconnect_attempts = 0;
                reason
            }
            Err(e) => {
                error!(error = %e, "gateway connection failed");
                DisconnectReason::ShouldResume
            }
        };

        match disconnect {
            DisconnectReason::ShouldResume => {
                info!("will attempt RESUME");
            }
            DisconnectReason::ShouldReidentify => {
                info!("session invalidated, will re-IDENTIFY");
                let mut s = session.lock().await;
                s.session_id = None;
                s.sequence = None;
            }
            DisconnectReason::Fatal => {
                error!("fatal gateway error, shutting down");
                event_tx.close();
                return;
            }
            DisconnectReason::EventChannelClosed => {
                info!("event channel closed, shutting down gateway driver");
                return;
            }
        }

        reconnect_attempts = reconnect_attempts.saturating_add(1);
        let backoff = backoff_delay(reconnect_attempts);
        warn!(
            delay_ms = backoff.as_millis() as u64,
            attempt = reconnect_attempts,
            "reconnecting after backoff"
        );
        tokio::time::sleep(backoff).await;
    }
}

/// One connection: HELLO, IDENTIFY/RESUME, heartbeat, read loop.
async fn run_connection(
    url: &str,
    config: &GatewayConfig,
    session: &Arc<Mutex<SessionState>>,
    event_tx: &async_channel::Sender<GatewayEvent>,
    latency: &Latency,
) -> Result<DisconnectReason, GatewayError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
    info!("WebSocket connected");

    let (ws_write, mut ws_read) = ws_stream.split();
    let out = Outbound {
        sink: Arc::new(Mutex::new(ws_write)),
        limiter: Arc::new(Mutex::new(SendRateLimiter::new(
            SEND_BUDGET_MAX,
            SEND_BUDGET_WINDOW,
        ))),
    };

    let heartbeat_interval = read_hello(&mut ws_read).await?;
    info!(interval_ms = heartbeat_interval, "received HELLO");

    let resume = session.lock().await.resume_payload(&config.token);
    match resume {
        Some(resume) => {
            send_payload(&out, Opcode::Resume, resume).await?;
            info!("sent RESUME");
        }
        None => {
            let identify = Identify {
                token: config.token.clone(),
                properties: IdentifyProperties {
                    os: std::env::consts::OS.to_string(),
                    browser: "saber-bot".to_string(),
                    device: "saber-bot".to_string(),
                },
                intents: config.intents.bits(),
                shard: config.shard,
            };
            send_payload(&out, Opcode::Identify, identify).await?;
            info!("sent IDENTIFY");
        }
    }

    let heartbeat = tokio::spawn(heartbeat_task(
        out.clone(),
        Arc::clone(session),
        Duration::from_millis(heartbeat_interval),
    ));

    let reason = read_loop(&mut ws_read, &out, event_tx, session, latency).await;

    heartbeat.abort();
    {
        let mut w = out.sink.lock().await;
        let _ = w.send(WsMessage::Close(None)).await;
    }

    Ok(reason)
}

async fn heartbeat_task(out: Outbound, session: Arc<Mutex<SessionState>>, every: Duration) {
    // First heartbeat goes out after `interval * jitter`, jitter ∈ [0, 1).
    let jitter = rand::random::<f64>();
    tokio::time::sleep(every.mul_f64(jitter)).await;

    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let seq = {
            let mut s = session.lock().await;
            s.heartbeat_sent_at = Some(Instant::now());
            s.sequence
        };
        if let Err(e) = send_payload(&out, Opcode::Heartbeat, seq).await {
            warn!(error = %e, "heartbeat send failed, stopping heartbeat task");
            return;
        }
        debug!(seq = ?seq, "sent heartbeat");
    }
}

// ---------------------------------------------------------------------------
// Disconnect reason
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum DisconnectReason {
    ShouldResume,
    ShouldReidentify,
    Fatal,
    EventChannelClosed,
}

/// Map a server close code to what we should do next.
fn close_code_action(code: u16) -> DisconnectReason {
    match code {
        // authentication failed, invalid shard, sharding required,
        // invalid API version, invalid intents, disallowed intents
        4004 | 4010 | 4011 | 4012 | 4013 | 4014 => DisconnectReason::Fatal,
        // invalid seq, session timed out
        4007 | 4009 => DisconnectReason::ShouldReidentify,
        _ => DisconnectReason::ShouldResume,
    }
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

async fn read_loop(
    ws_read: &mut WsStream,
    out: &Outbound,
    event_tx: &async_channel::Sender<GatewayEvent>,
    session: &Arc<Mutex<SessionState>>,
    latency: &Latency,
) -> DisconnectReason {
    while let Some(msg) = ws_read.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(frame)) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                warn!(close_code = ?code, "WebSocket closed by server");
                return code.map(close_code_action).unwrap_or(DisconnectReason::ShouldResume);
            }
            // Ping/Pong/Binary: ignore.
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "WebSocket read error");
                return DisconnectReason::ShouldResume;
            }
        };

        let payload: GatewayPayload = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to parse gateway payload");
                continue;
            }
        };

        if let Some(s) = payload.s {
            session.lock().await.sequence = Some(s);
        }

        let event = GatewayEvent::from_payload(payload);

        match &event {
            GatewayEvent::Ready(ready) => {
                let mut sess = session.lock().await;
                sess.session_id = Some(ready.session_id.clone());
                sess.resume_gateway_url = Some(ready.resume_gateway_url.clone());
                info!(
                    session_id = %ready.session_id,
                    user = %ready.user.username,
                    "gateway READY"
                );
            }

            GatewayEvent::HeartbeatRequest => {
                let seq = session.lock().await.sequence;
                if let Err(e) = send_payload(out, Opcode::Heartbeat, seq).await {
                    warn!(error = %e, "failed to send requested heartbeat");
                }
                continue;
            }

            GatewayEvent::HeartbeatAck => {
                if let Some(sent) = session.lock().await.heartbeat_sent_at.take() {
                    let rtt = sent.elapsed();
                    latency.set(rtt);
                    debug!(rtt_ms = rtt.as_millis() as u64, "heartbeat acknowledged");
                }
                continue;
            }

            GatewayEvent::Reconnect => {
                info!("gateway requested reconnect (op 7)");
                return DisconnectReason::ShouldResume;
            }

            GatewayEvent::InvalidSession(resumable) => {
                warn!(resumable, "session invalidated (op 9)");
                let wait = if *resumable { 2 } else { 3 };
                tokio::time::sleep(Duration::from_secs(wait)).await;
                return if *resumable {
                    DisconnectReason::ShouldResume
                } else {
                    DisconnectReason::ShouldReidentify
                };
            }

            _ => {}
        }

        if event_tx.send(event).await.is_err() {
            info!("event channel closed by consumer");
            return DisconnectReason::EventChannelClosed;
        }
    }

    info!("WebSocket stream ended");
    DisconnectReason::ShouldResume
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Append the API version and encoding if the URL doesn't carry them.
fn with_gateway_params(url: &str) -> String {
    if url.contains("v=10") {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&v=10&encoding=json", url)
    } else {
        format!("{}/?v=10&encoding=json", url.trim_end_matches('/'))
    }
}

/// Read the HELLO payload and return its heartbeat interval in ms.
async fn read_hello(stream: &mut WsStream) -> Result<u64, GatewayError> {
    let msg = tokio::time::timeout(HELLO_TIMEOUT, stream.next())
        .await
        .map_err(|_| GatewayError::HelloTimeout)?
        .ok_or(GatewayError::StreamEnded)??;

    let text = match msg {
        WsMessage::Text(t) => t,
        other => {
            return Err(GatewayError::Protocol(format!(
                "expected text message for HELLO, got {:?}",
                other
            )))
        }
    };

    parse_hello(&text)
}

fn parse_hello(text: &str) -> Result<u64, GatewayError> {
    let payload: GatewayPayload = serde_json::from_str(text)?;

    if payload.op != Opcode::Hello as u8 {
        return Err(GatewayError::Protocol(format!(
            "expected op 10 (HELLO), got op {}",
            payload.op
        )));
    }

    payload
        .d
        .as_ref()
        .and_then(|d| d.get("heartbeat_interval"))
        .and_then(|v| v.as_u64())
        .ok_or_else(|| GatewayError::Protocol("HELLO missing heartbeat_interval".to_string()))
}

/// Send a payload on the WebSocket, respecting the send rate limiter.
async fn send_payload<T: Serialize>(out: &Outbound, op: Opcode, d: T) -> Result<(), GatewayError> {
    loop {
        let delay = out.limiter.lock().await.delay_at(Instant::now());
        match delay {
            Some(d) => {
                debug!(
                    delay_ms = d.as_millis() as u64,
                    "gateway send rate-limited, waiting"
                );
                tokio::time::sleep(d).await;
            }
            None => break,
        }
    }
    out.limiter.lock().await.record_at(Instant::now());

    let text = serde_json::to_string(&OutboundPayload { op, d })?;
    out.sink.lock().await.send(WsMessage::Text(text)).await?;
    Ok(())
}

/// Exponential backoff with jitter, capped at 60 s. There is no attempt limit;
/// a long outage settles into one attempt a minute.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1000u64 * 2u64.saturating_pow(attempt.min(6));
    let jitter = (rand::random::<f64>() * 0.5 + 0.75) * base_ms as f64;
    Duration::from_millis(jitter.min(60_000.0) as u64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_allows_sends_under_budget() {
        let mut limiter = SendRateLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();
        for _ in 0..2 {
            assert!(limiter.delay_at(now).is_none());
            limiter.record_at(now);
        }
        assert!(limiter.delay_at(now).is_none());
    }

    #[test]
    fn limiter_delays_once_budget_is_spent() {
        let mut limiter = SendRateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();
        limiter.record_at(start);
        limiter.record_at(start);
        let delay = limiter
            .delay_at(start + Duration::from_secs(10))
            .expect("budget exhausted");
        assert_eq!(delay, Duration::from_secs(50));
        // Once the window rolls past the oldest send, we are clear again.
        assert!(limiter.delay_at(start + Duration::from_secs(61)).is_none());
    }

    #[test]
    fn backoff_is_bounded() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt);
            assert!(d <= Duration::from_secs(60), "attempt {attempt}: {d:?}");
            assert!(d >= Duration::from_millis(750));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn driver_keeps_reconnecting_through_long_outage() {
        use std::sync::atomic::AtomicUsize;

        // Accepts the TCP connection and drops it, so every handshake fails.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });

        let gw = connect(GatewayConfig {
            token: "t".to_string(),
            intents: Intents::GUILDS,
            shard: None,
            url: format!("ws://{addr}"),
        });

        tokio::time::timeout(Duration::from_secs(24 * 60 * 60), async {
            while attempts.load(Ordering::SeqCst) < 16 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        })
        .await
        .expect("driver stopped reconnecting");

        assert!(!gw.events.is_closed());
        assert!(!gw.driver_handle.is_finished());
        gw.driver_handle.abort();
    }

    #[test]
    fn backoff_settles_at_cap_for_late_attempts() {
        for attempt in [9, 50, 10_000, u32::MAX] {
            let d = backoff_delay(attempt);
            assert!(d >= Duration::from_secs(48), "attempt {attempt}: {d:?}");
            assert!(d <= Duration::from_secs(60), "attempt {attempt}: {d:?}");
        }
    }

    #[test]
    fn close_codes_map_to_actions() {
        assert_eq!(close_code_action(4004), DisconnectReason::Fatal);
        assert_eq!(close_code_action(4014), DisconnectReason::Fatal);
        assert_eq!(close_code_action(4009), DisconnectReason::ShouldReidentify);
        assert_eq!(close_code_action(1001), DisconnectReason::ShouldResume);
    }

    #[test]
    fn gateway_params_are_appended_once() {
        assert_eq!(with_gateway_params(DEFAULT_GATEWAY_URL), DEFAULT_GATEWAY_URL);
        assert_eq!(
            with_gateway_params("wss://resume.discord.gg"),
            "wss://resume.discord.gg/?v=10&encoding=json"
        );
        assert_eq!(
            with_gateway_params("wss://x?compress=0"),
            "wss://x?compress=0&v=10&encoding=json"
        );
    }

    #[test]
    fn hello_yields_heartbeat_interval() {
        let interval =
            parse_hello(r#"{"op":10,"d":{"heartbeat_interval":41250},"s":null,"t":null}"#)
                .expect("valid HELLO");
        assert_eq!(interval, 41250);
        assert!(parse_hello(r#"{"op":0,"d":{},"s":1,"t":"READY"}"#).is_err());
    }

    #[test]
    fn resume_requires_session_and_sequence() {
        let mut state = SessionState::default();
        assert!(state.resume_payload("t").is_none());
        state.session_id = Some("abc".to_string());
        assert!(state.resume_payload("t").is_none());
        state.sequence = Some(7);
        let resume = state.resume_payload("t").expect("resumable");
        assert_eq!(resume.seq, 7);
    }

    #[test]
    fn latency_is_unknown_until_first_ack() {
        let latency = Latency::default();
        assert!(latency.get().is_none());
        latency.set(Duration::from_millis(42));
        assert_eq!(latency.get(), Some(Duration::from_millis(42)));
    }
}
