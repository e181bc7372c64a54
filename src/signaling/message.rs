use serde::{Deserialize, Serialize};
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description and its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpBundle {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SdpBundle {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One ICE candidate line with the media section it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateBundle {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// JSON messages exchanged with the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(CandidateBundle),
}

impl SignalingMessage {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<SdpBundle> for SignalingMessage {
    fn from(bundle: SdpBundle) -> Self {
        match bundle.sdp_type {
            SdpType::Offer => SignalingMessage::Offer { sdp: bundle.sdp },
            SdpType::Answer => SignalingMessage::Answer { sdp: bundle.sdp },
        }
    }
}

impl From<CandidateBundle> for SignalingMessage {
    fn from(bundle: CandidateBundle) -> Self {
        SignalingMessage::Candidate(bundle)
    }
}

/// A signaling payload tagged with its direction and the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    LocalDescription {
        session_id: String,
        bundle: SdpBundle,
    },
    LocalCandidate {
        session_id: String,
        bundle: CandidateBundle,
    },
    RemoteDescription {
        session_id: String,
        bundle: SdpBundle,
    },
    RemoteCandidate {
        session_id: String,
        bundle: CandidateBundle,
    },
}

impl SignalingEvent {
    /// Wraps a message received from the network.
    pub fn remote(message: SignalingMessage, session_id: String) -> Self {
        match message {
            SignalingMessage::Offer { sdp } => SignalingEvent::RemoteDescription {
                session_id,
                bundle: SdpBundle::offer(sdp),
            },
            SignalingMessage::Answer { sdp } => SignalingEvent::RemoteDescription {
                session_id,
                bundle: SdpBundle::answer(sdp),
            },
            SignalingMessage::Candidate(bundle) => SignalingEvent::RemoteCandidate {
                session_id,
                bundle,
            },
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SignalingEvent::LocalDescription { session_id, .. }
            | SignalingEvent::LocalCandidate { session_id, .. }
            | SignalingEvent::RemoteDescription { session_id, .. }
            | SignalingEvent::RemoteCandidate { session_id, .. } => session_id,
        }
    }

    /// The wire message for a locally produced event.
    pub fn outbound_message(&self) -> Option<SignalingMessage> {
        match self {
            SignalingEvent::LocalDescription { bundle, .. } => Some(bundle.clone().into()),
            SignalingEvent::LocalCandidate { bundle, .. } => Some(bundle.clone().into()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format() {
        let offer = SignalingMessage::from(SdpBundle::offer("v=0\r\n"));
        assert_eq!(
            serde_json::to_value(&offer).unwrap(),
            json!({"type": "offer", "sdp": "v=0\r\n"})
        );

        let candidate = SignalingMessage::from(CandidateBundle {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 5000 typ host".to_owned(),
            sdp_mid: Some("0".to_owned()),
            sdp_mline_index: Some(0),
        });
        assert_eq!(
            serde_json::to_value(&candidate).unwrap(),
            json!({
                "type": "candidate",
                "candidate": "candidate:1 1 udp 2130706431 192.0.2.1 5000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            })
        );
    }

    #[test]
    fn parses_incoming_messages() {
        let answer = SignalingMessage::from_json(r#"{"type":"answer","sdp":"v=0"}"#).unwrap();
        assert_eq!(
            SignalingEvent::remote(answer, "s".to_owned()),
            SignalingEvent::RemoteDescription {
                session_id: "s".to_owned(),
                bundle: SdpBundle::answer("v=0"),
            }
        );

        let candidate =
            SignalingMessage::from_json(r#"{"type":"candidate","candidate":"candidate:1"}"#)
                .unwrap();
        match candidate {
            SignalingMessage::Candidate(bundle) => {
                assert_eq!(bundle.sdp_mid, None);
                assert_eq!(bundle.sdp_mline_index, None);
            }
            other => panic!("unexpected message {:?}", other),
        }

        assert!(SignalingMessage::from_json(r#"{"type":"bye"}"#).is_err());
        assert!(SignalingMessage::from_json("not json").is_err());
    }

    #[test]
    fn only_local_events_go_out() {
        let local = SignalingEvent::LocalDescription {
            session_id: "s".to_owned(),
            bundle: SdpBundle::offer("v=0"),
        };
        assert_eq!(local.session_id(), "s");
        assert_eq!(
            local.outbound_message(),
            Some(SignalingMessage::Offer {
                sdp: "v=0".to_owned()
            })
        );
        let remote = SignalingEvent::remote(
            SignalingMessage::Answer {
                sdp: "v=0".to_owned(),
            },
            "s".to_owned(),
        );
        assert_eq!(remote.outbound_message(), None);
    }
}
