//! Newline-delimited JSON wire format.
//!
//! ```json
//! {"type":"status","from":"ll-...","timestamp":1700000000000,"payload":{"status":"green","note":"ok"}}
//! ```
//!
//! There is no version field. A frame with an unknown `type` fails to
//! decode and is dropped by the receiver; unknown fields are ignored.

use std::time::{SystemTime, UNIX_EPOCH};

use lifeline_cells::GroupHeartbeat;
use serde::{Deserialize, Serialize};

use crate::{Result, Status, TransportError};

/// Current wall-clock time in unix millis.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Frame discriminator, serialized as the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Current status of the sender.
    Status,
    /// First frame on every connection; carries the sender's display name.
    Handshake,
    Ping,
    Pong,
    /// Per-cell heartbeat.
    GroupHeartbeat,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageKind::Status => "status",
            MessageKind::Handshake => "handshake",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::GroupHeartbeat => "group-heartbeat",
        };
        f.write_str(s)
    }
}

/// Frame body. Which fields are set depends on the [`MessageKind`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<GroupHeartbeat>,
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Sender's peer id.
    pub from: String,
    /// Send time, unix millis.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl WireMessage {
    fn new(kind: MessageKind, from: impl Into<String>, payload: Option<Payload>) -> Self {
        Self {
            kind,
            from: from.into(),
            timestamp: now_millis(),
            payload,
        }
    }

    pub fn status(
        from: impl Into<String>,
        status: Status,
        name: Option<String>,
        note: Option<String>,
    ) -> Self {
        Self::new(
            MessageKind::Status,
            from,
            Some(Payload {
                status: Some(status),
                name,
                note,
                heartbeat: None,
            }),
        )
    }

    pub fn handshake(from: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::new(
            MessageKind::Handshake,
            from,
            Some(Payload {
                name: Some(display_name.into()),
                ..Payload::default()
            }),
        )
    }

    pub fn ping(from: impl Into<String>) -> Self {
        Self::new(MessageKind::Ping, from, None)
    }

    pub fn pong(from: impl Into<String>) -> Self {
        Self::new(MessageKind::Pong, from, None)
    }

    pub fn group_heartbeat(from: impl Into<String>, heartbeat: GroupHeartbeat) -> Self {
        Self::new(
            MessageKind::GroupHeartbeat,
            from,
            Some(Payload {
                heartbeat: Some(heartbeat),
                ..Payload::default()
            }),
        )
    }

    pub fn payload_status(&self) -> Option<Status> {
        self.payload.as_ref().and_then(|p| p.status)
    }

    pub fn payload_name(&self) -> Option<&str> {
        self.payload.as_ref().and_then(|p| p.name.as_deref())
    }

    pub fn payload_note(&self) -> Option<&str> {
        self.payload.as_ref().and_then(|p| p.note.as_deref())
    }

    /// Encode as one newline-terminated line.
    pub fn encode_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line. Surrounding whitespace is ignored.
    pub fn decode_line(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(TransportError::Codec("empty frame".into()));
        }
        Ok(serde_json::from_str(trimmed)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_cells::{Capacity, GroupId};

    #[test]
    fn status_frame_shape() {
        let msg = WireMessage::status("ll-1", Status::Orange, None, Some("Missed check-in".into()));
        let json: serde_json::Value = serde_json::from_str(msg.encode_line().unwrap().trim()).unwrap();

        assert_eq!(json["type"], "status");
        assert_eq!(json["from"], "ll-1");
        assert!(json["timestamp"].is_u64());
        assert_eq!(json["payload"]["status"], "orange");
        assert_eq!(json["payload"]["note"], "Missed check-in");
        assert!(json["payload"].get("name").is_none());
    }

    #[test]
    fn encoded_frame_is_one_line() {
        let line = WireMessage::handshake("a", "Line\nBreak").encode_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn ping_has_no_payload() {
        let line = WireMessage::ping("a").encode_line().unwrap();
        assert!(!line.contains("payload"));
        let back = WireMessage::decode_line(&line).unwrap();
        assert_eq!(back.kind, MessageKind::Ping);
        assert!(back.payload.is_none());
    }

    #[test]
    fn decodes_frame_from_other_implementations() {
        let raw = r#"{"type":"status","from":"peer-x","timestamp":12,"payload":{"status":"red","name":"Sam","extra":1},"ttl":3}"#;
        let msg = WireMessage::decode_line(raw).unwrap();
        assert_eq!(msg.payload_status(), Some(Status::Red));
        assert_eq!(msg.payload_name(), Some("Sam"));
        assert_eq!(msg.payload_note(), None);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let raw = r#"{"type":"gossip","from":"peer-x","timestamp":12}"#;
        assert!(matches!(WireMessage::decode_line(raw), Err(TransportError::Codec(_))));
        assert!(matches!(WireMessage::decode_line("  \n"), Err(TransportError::Codec(_))));
    }

    #[test]
    fn group_heartbeat_kind_is_kebab_case() {
        let hb = GroupHeartbeat::new("a", GroupId::from_hex("ab"), 55.0, Capacity::FULL, 0);
        let msg = WireMessage::group_heartbeat("a", hb.clone());
        let line = msg.encode_line().unwrap();
        assert!(line.contains(r#""type":"group-heartbeat""#));

        let back = WireMessage::decode_line(&line).unwrap();
        assert_eq!(back.payload.and_then(|p| p.heartbeat), Some(hb));
        assert_eq!(MessageKind::GroupHeartbeat.to_string(), "group-heartbeat");
    }
}
