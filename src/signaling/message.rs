// Control messages relayed through the broker.
//
// Every payload is a JSON object tagged by `runtimeType`. Unknown tags and
// malformed payloads are rejected at decode time.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed signaling payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Signaling payload is not UTF-8")]
    NotUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged on the wire: `{"type": ..., "sdp": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        SessionDescription { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        SessionDescription { kind: SdpKind::Answer, sdp: sdp.into() }
    }

    pub fn rollback() -> Self {
        SessionDescription { kind: SdpKind::Rollback, sdp: String::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "runtimeType", rename_all = "camelCase")]
pub enum SignalingMessage {
    Offer {
        from: String,
        to: String,
        sdp: SessionDescription,
    },
    Answer {
        from: String,
        to: String,
        sdp: SessionDescription,
    },
    IceCandidate {
        from: String,
        to: String,
        candidate: IceCandidate,
    },
    ContactRequest {
        from: String,
        to: String,
        name: String,
    },
    ContactResponse {
        from: String,
        to: String,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ChatPresence {
        from: String,
        to: String,
        #[serde(rename = "isOpened")]
        is_opened: bool,
    },
    ContactDeleted {
        from: String,
        to: String,
    },
}

impl SignalingMessage {
    pub fn from(&self) -> &str {
        match self {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. }
            | SignalingMessage::ContactRequest { from, .. }
            | SignalingMessage::ContactResponse { from, .. }
            | SignalingMessage::ChatPresence { from, .. }
            | SignalingMessage::ContactDeleted { from, .. } => from,
        }
    }

    pub fn to(&self) -> &str {
        match self {
            SignalingMessage::Offer { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::IceCandidate { to, .. }
            | SignalingMessage::ContactRequest { to, .. }
            | SignalingMessage::ContactResponse { to, .. }
            | SignalingMessage::ChatPresence { to, .. }
            | SignalingMessage::ContactDeleted { to, .. } => to,
        }
    }

    /// The `runtimeType` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "iceCandidate",
            SignalingMessage::ContactRequest { .. } => "contactRequest",
            SignalingMessage::ContactResponse { .. } => "contactResponse",
            SignalingMessage::ChatPresence { .. } => "chatPresence",
            SignalingMessage::ContactDeleted { .. } => "contactDeleted",
        }
    }

    /// Display name carried by the message, if its type has one.
    pub fn display_name(&self) -> Option<&str> {
        match self {
            SignalingMessage::ContactRequest { name, .. } => Some(name),
            SignalingMessage::ContactResponse { name, .. } => name.as_deref(),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::NotUtf8)?;
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offer_uses_runtime_type_tag() {
        let msg = SignalingMessage::Offer {
            from: "ABC-123".into(),
            to: "XYZ-999".into(),
            sdp: SessionDescription::offer("v=0"),
        };
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"runtimeType": "offer", "from": "ABC-123", "to": "XYZ-999", "sdp": {"type": "offer", "sdp": "v=0"}})
        );
    }

    #[test]
    fn presence_and_candidate_field_names() {
        let presence = SignalingMessage::ChatPresence { from: "A".into(), to: "B".into(), is_opened: true };
        let value = serde_json::to_value(&presence).unwrap();
        assert_eq!(value["runtimeType"], "chatPresence");
        assert_eq!(value["isOpened"], true);

        let raw = br#"{"runtimeType":"iceCandidate","from":"A","to":"B",
            "candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        match SignalingMessage::decode(raw).unwrap() {
            SignalingMessage::IceCandidate { candidate, .. } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert!(candidate.username_fragment.is_none());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn contact_response_name_is_optional() {
        let raw = br#"{"runtimeType":"contactResponse","from":"A","to":"B","accepted":false}"#;
        let msg = SignalingMessage::decode(raw).unwrap();
        assert_eq!(msg.display_name(), None);
        assert_eq!(msg.kind(), "contactResponse");
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let raw = br#"{"runtimeType":"typingIndicator","from":"A","to":"B"}"#;
        assert!(matches!(SignalingMessage::decode(raw), Err(ProtocolError::Malformed(_))));
        assert!(SignalingMessage::decode(b"not json").is_err());
        assert!(matches!(SignalingMessage::decode(&[0xff, 0xfe]), Err(ProtocolError::NotUtf8)));
    }
}
