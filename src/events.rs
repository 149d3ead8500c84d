//! Typed gateway events.
//!
//! Instead of matching on raw `(op, t, serde_json::Value)` tuples everywhere,
//! the gateway module deserialises dispatch payloads into this enum so the rest
//! of the bot can pattern-match on strongly-typed data.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::types::*;

// ---------------------------------------------------------------------------
// The top-level event enum
// ---------------------------------------------------------------------------

/// A fully-parsed event coming off the Discord gateway.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// We've successfully identified, the session is live.
    Ready(Box<ReadyEvent>),

    /// Session resumed after a reconnect.
    Resumed,

    /// A message was created in a channel we can see.
    MessageCreate(Box<Message>),

    /// Heartbeat ACK from the gateway (op 11).
    HeartbeatAck,

    /// The gateway is asking us to heartbeat immediately (op 1).
    HeartbeatRequest,

    /// Gateway told us to reconnect (op 7).
    Reconnect,

    /// Session has been invalidated (op 9). The inner bool indicates whether
    /// the session is resumable (`true`) or we must re-identify (`false`).
    InvalidSession(bool),

    /// An event we received but don't have a typed variant for.
    Unknown {
        event_name: Option<String>,
        op: u8,
    },
}

// ---------------------------------------------------------------------------
// Parsing from a raw GatewayPayload
// ---------------------------------------------------------------------------

impl GatewayEvent {
    /// Convert a raw [`GatewayPayload`] into a typed event.
    ///
    /// This never fails. Unrecognised or malformed events become
    /// [`GatewayEvent::Unknown`].
    pub fn from_payload(payload: GatewayPayload) -> Self {
        match payload.op {
            0 => Self::parse_dispatch(payload.t, payload.d),
            1 => GatewayEvent::HeartbeatRequest,
            7 => GatewayEvent::Reconnect,
            9 => {
                let resumable = payload
                    .d
                    .as_ref()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                GatewayEvent::InvalidSession(resumable)
            }
            11 => GatewayEvent::HeartbeatAck,
            op => GatewayEvent::Unknown {
                event_name: payload.t,
                op,
            },
        }
    }

    /// Parse an op-0 DISPATCH event by its `t` name.
    fn parse_dispatch(event_name: Option<String>, data: Option<serde_json::Value>) -> Self {
        let unknown = |event_name: Option<String>| GatewayEvent::Unknown { event_name, op: 0 };

        let Some(d) = data else {
            return unknown(event_name);
        };
        let Some(name) = event_name.as_deref() else {
            return unknown(None);
        };

        match name {
            "READY" => parse_typed::<ReadyEvent>(name, d)
                .map(|ready| GatewayEvent::Ready(Box::new(ready)))
                .unwrap_or_else(|| unknown(event_name.clone())),
            "RESUMED" => GatewayEvent::Resumed,
            "MESSAGE_CREATE" => parse_typed::<Message>(name, d)
                .map(|msg| GatewayEvent::MessageCreate(Box::new(msg)))
                .unwrap_or_else(|| unknown(event_name.clone())),
            _ => unknown(event_name.clone()),
        }
    }
}

fn parse_typed<T: DeserializeOwned>(name: &str, d: serde_json::Value) -> Option<T> {
    match serde_json::from_value::<T>(d) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(event = name, error = %e, "failed to parse dispatch payload");
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
    use serde_json::json;

    fn payload(op: u8, t: Option<&str>, d: Option<serde_json::Value>) -> GatewayPayload {
        GatewayPayload {
            op,
            d,
            s: Some(1),
            t: t.map(str::to_string),
        }
    }

    #[test]
    fn parses_ready() {
        let event = GatewayEvent::from_payload(payload(
            0,
            Some("READY"),
            Some(json!({
                "v": 10,
                "user": { "id": "1", "username": "saber", "discriminator": "0", "avatar": null, "bot": true, "global_name": null },
                "session_id": "abc",
                "resume_gateway_url": "wss://resume.example",
                "guilds": [{ "id": "5", "unavailable": true }],
                "application": { "id": "9", "flags": 0 }
            })),
        ));
        match event {
            GatewayEvent::Ready(ready) => {
                assert_eq!(ready.session_id, "abc");
                assert_eq!(ready.guilds.len(), 1);
                assert!(ready.user.bot);
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn parses_message_create() {
        let event = GatewayEvent::from_payload(payload(
            0,
            Some("MESSAGE_CREATE"),
            Some(json!({
                "id": "10",
                "channel_id": "20",
                "guild_id": "30",
                "author": { "id": "3", "username": "bob", "discriminator": "0", "avatar": null, "global_name": null },
                "content": "!update",
                "timestamp": "2024-01-01T00:00:00+00:00"
            })),
        ));
        assert!(matches!(event, GatewayEvent::MessageCreate(m) if m.content == "!update"));
    }

    #[test]
    fn malformed_dispatch_becomes_unknown() {
        let event =
            GatewayEvent::from_payload(payload(0, Some("MESSAGE_CREATE"), Some(json!({"id": 1}))));
        assert!(matches!(
            event,
            GatewayEvent::Unknown { event_name: Some(ref n), op: 0 } if n == "MESSAGE_CREATE"
        ));
    }

    #[test]
    fn control_opcodes_map_to_variants() {
        assert!(matches!(
            GatewayEvent::from_payload(payload(11, None, None)),
            GatewayEvent::HeartbeatAck
        ));
        assert!(matches!(
            GatewayEvent::from_payload(payload(1, None, None)),
            GatewayEvent::HeartbeatRequest
        ));
        assert!(matches!(
            GatewayEvent::from_payload(payload(7, None, None)),
            GatewayEvent::Reconnect
        ));
        assert!(matches!(
            GatewayEvent::from_payload(payload(9, None, Some(json!(true)))),
            GatewayEvent::InvalidSession(true)
        ));
        assert!(matches!(
            GatewayEvent::from_payload(payload(9, None, Some(json!(false)))),
            GatewayEvent::InvalidSession(false)
        ));
    }

    #[test]
    fn unhandled_dispatch_is_unknown() {
        let event = GatewayEvent::from_payload(payload(0, Some("TYPING_START"), Some(json!({}))));
        assert!(matches!(event, GatewayEvent::Unknown { op: 0, .. }));
    }
}
