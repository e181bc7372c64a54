use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tokio::sync::{watch, RwLock};
use webrtc::{
    peer_connection::{peer_connection_state::RTCPeerConnectionState, RTCPeerConnection},
    stats::StatsReportType,
};

use crate::signaling::message::{CandidateBundle, SdpBundle};

/// Called with a local description and the session id that produced it.
pub type OnLocalSdpFn = Box<dyn Fn(SdpBundle, String) + Send + Sync>;
/// Called with a gathered local candidate and the session id that produced it.
pub type OnLocalCandidateFn = Box<dyn Fn(CandidateBundle, String) + Send + Sync>;

/// Connection state of a session, mirrored from the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States that stop the liveness poller.
    pub fn is_down(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

/// Counters of one outbound video RTP stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboundVideoStats {
    pub ssrc: u32,
    pub bytes_sent: u64,
    pub packets_sent: u64,
}

/// Read-only view of a connection used by [`crate::liveness::LivenessMonitor`].
#[async_trait]
pub trait StatsSource: Send + Sync + std::fmt::Debug {
    fn connection_state(&self) -> ConnectionState;

    async fn outbound_video_stats(&self) -> Vec<OutboundVideoStats>;
}

/// [`StatsSource`] backed by the session's peer connection.
#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct PeerStatsSource {
    #[derivative(Debug = "ignore")]
    peer_connection: Arc<RwLock<Option<Arc<RTCPeerConnection>>>>,
    state: watch::Receiver<ConnectionState>,
}

impl PeerStatsSource {
    pub(crate) fn new(
        peer_connection: Arc<RwLock<Option<Arc<RTCPeerConnection>>>>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            peer_connection,
            state,
        }
    }
}

#[async_trait]
impl StatsSource for PeerStatsSource {
    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn outbound_video_stats(&self) -> Vec<OutboundVideoStats> {
        let pc = match self.peer_connection.read().await.as_ref() {
            Some(pc) => pc.clone(),
            None => return vec![],
        };
        let report = pc.get_stats().await;
        report
            .reports
            .values()
            .filter_map(|stats| match stats {
                StatsReportType::OutboundRTP(outbound) if outbound.kind == "video" => {
                    Some(OutboundVideoStats {
                        ssrc: outbound.ssrc,
                        bytes_sent: outbound.bytes_sent,
                        packets_sent: outbound.packets_sent,
                    })
                }
                _ => None,
            })
            .collect()
    }
}
