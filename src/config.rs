use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use webrtc::{
    api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP8, MIME_TYPE_VP9},
    ice_transport::ice_server::RTCIceServer,
    peer_connection::configuration::RTCConfiguration,
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
};

use crate::error::Error;

pub const DEFAULT_STUN_URI: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8000";

/// One ICE server entry. STUN servers leave `username` and `password` empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub uri: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl IceServerConfig {
    pub fn stun(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            username: String::new(),
            password: String::new(),
        }
    }

    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: vec![self.uri.clone()],
            username: self.username.clone(),
            credential: self.password.clone(),
            ..Default::default()
        }
    }
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self::stun(DEFAULT_STUN_URI)
    }
}

/// Builds the [`RTCConfiguration`] handed to the peer connection.
pub fn rtc_configuration(ice_servers: &[IceServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers.iter().map(IceServerConfig::to_rtc).collect(),
        ..Default::default()
    }
}

/// Capture loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Frames per second. Values below 1 are treated as 1.
    pub target_fps: u32,
    /// Where [`crate::frame_dump::FrameDumpSink`] writes a requested frame.
    pub dump_path: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_fps: 30,
            dump_path: PathBuf::from("frame.yuv"),
        }
    }
}

/// Video codec negotiated for the desktop track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    VP8,
    VP9,
    H264,
}

impl VideoCodec {
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => MIME_TYPE_VP8,
            VideoCodec::VP9 => MIME_TYPE_VP9,
            VideoCodec::H264 => MIME_TYPE_H264,
        }
    }

    pub fn capability(&self) -> RTCRtpCodecCapability {
        let sdp_fmtp_line = match self {
            VideoCodec::H264 => {
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            }
            VideoCodec::VP9 => "profile-id=0",
            VideoCodec::VP8 => "",
        };
        RTCRtpCodecCapability {
            mime_type: self.mime_type().to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: sdp_fmtp_line.to_owned(),
            rtcp_feedback: vec![],
        }
    }
}

/// Per-session settings for [`crate::session::Session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub capture: CaptureConfig,
    pub codec: VideoCodec,
    /// Outbound ceiling in bits per second, applied at init when set.
    pub max_bitrate_bps: Option<u32>,
    /// Liveness poll interval in milliseconds.
    pub stats_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            codec: VideoCodec::default(),
            max_bitrate_bps: Some(3_000_000),
            stats_interval_ms: 1000,
        }
    }
}

/// Top level configuration of a push client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushClientConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub session: SessionConfig,
}

impl Default for PushClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_owned(),
            ice_servers: vec![IceServerConfig::default()],
            session: SessionConfig::default(),
        }
    }
}

impl PushClientConfig {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }
}
