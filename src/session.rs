use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use derivative::Derivative;
use enclose::enc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use uuid::Uuid;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        APIBuilder,
    },
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    interceptor::registry::Registry,
    peer_connection::{
        offer_answer_options::RTCOfferOptions, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_transceiver_direction::RTCRtpTransceiverDirection, RTCRtpTransceiverInit,
    },
    track::track_local::TrackLocal,
};

use crate::{
    broadcaster::SinkWants,
    capturer::ScreenCapturer,
    config::{rtc_configuration, IceServerConfig, SessionConfig},
    encoder::VideoEncoder,
    error::{Error, InitErrorKind, NegotiationErrorKind},
    frame_dump::FrameDumpSink,
    frame_source::FrameSource,
    liveness::LivenessMonitor,
    local_track::LocalVideoTrack,
    signaling::{
        message::{CandidateBundle, SdpBundle},
        sdp,
    },
    transport::{ConnectionState, OnLocalCandidateFn, OnLocalSdpFn, PeerStatsSource},
};

#[derive(Debug)]
pub(crate) enum SessionEvent {
    ConnectionStateChanged(ConnectionState),
    Closed,
}

/// Media handed to a session at construction and consumed by [`Session::init`].
#[derive(Debug)]
struct PendingMedia {
    capturer: Box<dyn ScreenCapturer>,
    encoder: Box<dyn VideoEncoder>,
}

/// One push session: a send-only desktop video track negotiated with one remote peer.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Session {
    pub id: String,
    config: SessionConfig,
    media: std::sync::Mutex<Option<PendingMedia>>,
    #[derivative(Debug = "ignore")]
    peer_connection: Arc<RwLock<Option<Arc<RTCPeerConnection>>>>,
    video_track: RwLock<Option<Arc<LocalVideoTrack>>>,
    frame_source: Mutex<Option<Arc<FrameSource>>>,
    frame_dump: Arc<FrameDumpSink>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    state_receiver: watch::Receiver<ConnectionState>,
    liveness: Arc<LivenessMonitor>,
    closing: Arc<AtomicBool>,
    session_event_sender: mpsc::UnboundedSender<SessionEvent>,
    #[derivative(Debug = "ignore")]
    on_local_sdp_fn: Arc<Mutex<OnLocalSdpFn>>,
    #[derivative(Debug = "ignore")]
    on_local_candidate_fn: Arc<Mutex<OnLocalCandidateFn>>,
}

impl Session {
    /// Creates an idle session. Nothing touches the network or the display until [`Session::init`].
    pub fn new(
        config: SessionConfig,
        capturer: Box<dyn ScreenCapturer>,
        encoder: Box<dyn VideoEncoder>,
    ) -> Arc<Session> {
        let id = Uuid::new_v4().to_string();
        let peer_connection = Arc::new(RwLock::new(None));
        let (state_sender, state_receiver) = watch::channel(ConnectionState::New);
        let stats_source = PeerStatsSource::new(peer_connection.clone(), state_receiver.clone());
        let liveness = Arc::new(LivenessMonitor::new(id.clone(), Arc::new(stats_source)));
        let closing = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel::<SessionEvent>();

        {
            let id = id.clone();
            let interval = Duration::from_millis(config.stats_interval_ms);
            tokio::spawn(enc!((liveness, closing) async move {
                Session::session_event_loop(id, rx, state_sender, liveness, closing, interval)
                    .await;
            }));
        }

        let frame_dump = Arc::new(FrameDumpSink::new(config.capture.dump_path.clone()));

        tracing::debug!("Session {} is created", id);

        Arc::new(Session {
            id,
            config,
            media: std::sync::Mutex::new(Some(PendingMedia { capturer, encoder })),
            peer_connection,
            video_track: RwLock::new(None),
            frame_source: Mutex::new(None),
            frame_dump,
            pending_candidates: Mutex::new(Vec::new()),
            state_receiver,
            liveness,
            closing,
            session_event_sender: tx,
            on_local_sdp_fn: Arc::new(Mutex::new(Box::new(|_, _| {}))),
            on_local_candidate_fn: Arc::new(Mutex::new(Box::new(|_, _| {}))),
        })
    }

    /// Builds the peer connection, attaches the desktop track, starts capture and sends the first offer.
    ///
    /// On failure everything created so far is torn down. An offer failure is only logged.
    pub async fn init(&self, ice_servers: &[IceServerConfig]) -> Result<(), Error> {
        if self.peer_connection.read().await.is_some() {
            return Err(Error::new_init(
                format!("Session {} is already initialized", self.id),
                InitErrorKind::AlreadyInitializedError,
            ));
        }
        let media = match self.media.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(PendingMedia { capturer, encoder }) = media else {
            return Err(Error::new_init(
                format!("Session {} has no capturer or encoder left", self.id),
                InitErrorKind::MediaNotProvidedError,
            ));
        };

        if let Err(err) = self.build(ice_servers, capturer, encoder).await {
            tracing::error!("Session {} failed to initialize: {}", self.id, err);
            let _ = self.release().await;
            return Err(err);
        }
        tracing::info!("Session {} is initialized", self.id);

        // Offer failures are logged by create_offer and leave the session usable.
        let _ = self.create_offer(false).await;
        Ok(())
    }

    async fn build(
        &self,
        ice_servers: &[IceServerConfig],
        capturer: Box<dyn ScreenCapturer>,
        encoder: Box<dyn VideoEncoder>,
    ) -> Result<(), Error> {
        let peer_connection = Self::generate_peer_connection(ice_servers).await?;
        *self.peer_connection.write().await = Some(peer_connection.clone());
        self.ice_state_hooks(&peer_connection);

        let frame_source = Arc::new(FrameSource::new(capturer, self.config.capture.target_fps));
        frame_source
            .broadcaster()
            .add_sink(self.frame_dump.clone(), SinkWants::default());
        *self.frame_source.lock().await = Some(frame_source.clone());

        let track = Arc::new(LocalVideoTrack::new(
            frame_source.clone(),
            encoder,
            self.config.codec,
        ));
        *self.video_track.write().await = Some(track.clone());

        let transceiver = peer_connection
            .add_transceiver_from_track(
                track.track() as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| {
                Error::new_init(
                    format!("Failed to attach video track: {}", e),
                    InitErrorKind::TrackAttachError,
                )
            })?;
        track.bind_sender(transceiver.sender().await);

        if let Some(bps) = self.config.max_bitrate_bps {
            self.set_max_bitrate(bps).await;
        }

        frame_source.start()?;
        Ok(())
    }

    async fn generate_peer_connection(
        ice_servers: &[IceServerConfig],
    ) -> Result<Arc<RTCPeerConnection>, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(|e| {
            Error::new_init(
                format!("Failed to register codecs: {}", e),
                InitErrorKind::ApiBuildError,
            )
        })?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            Error::new_init(
                format!("Failed to register interceptors: {}", e),
                InitErrorKind::ApiBuildError,
            )
        })?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api
            .new_peer_connection(rtc_configuration(ice_servers))
            .await
            .map_err(|e| {
                Error::new_init(
                    format!("Failed to create peer connection: {}", e),
                    InitErrorKind::PeerConnectionError,
                )
            })?;
        Ok(Arc::new(peer_connection))
    }

    fn ice_state_hooks(&self, peer: &Arc<RTCPeerConnection>) {
        let id = self.id.clone();
        let event_sender = self.session_event_sender.clone();
        peer.on_peer_connection_state_change(Box::new(enc!((id, event_sender) move |state: RTCPeerConnectionState| {
            tracing::info!("Session {} peer connection state changed: {}", id, state);
            let _ = event_sender.send(SessionEvent::ConnectionStateChanged(state.into()));
            Box::pin(async {})
        })));

        let on_local_candidate = self.on_local_candidate_fn.clone();
        peer.on_ice_candidate(Box::new(enc!((id) move |candidate: Option<RTCIceCandidate>| {
            Box::pin(enc!((id, on_local_candidate) async move {
                let Some(candidate) = candidate else {
                    tracing::debug!("Session {} finished gathering candidates", id);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        tracing::debug!("Session {} local candidate: {}", id, init.candidate);
                        let bundle = CandidateBundle {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        };
                        let locked = on_local_candidate.lock().await;
                        (locked)(bundle, id);
                    }
                    Err(err) => {
                        tracing::error!("Session {} failed to serialize candidate: {}", id, err);
                    }
                }
            }))
        })));
    }

    async fn session_event_loop(
        id: String,
        mut event_receiver: mpsc::UnboundedReceiver<SessionEvent>,
        state_sender: watch::Sender<ConnectionState>,
        liveness: Arc<LivenessMonitor>,
        closing: Arc<AtomicBool>,
        interval: Duration,
    ) {
        tracing::debug!("Session {} event loop has started", id);

        while let Some(event) = event_receiver.recv().await {
            match event {
                SessionEvent::ConnectionStateChanged(state) => {
                    state_sender.send_replace(state);
                    if state == ConnectionState::Connected {
                        if closing.load(Ordering::Acquire) {
                            continue;
                        }
                        liveness.start(interval).await;
                    } else if state.is_down() {
                        liveness.stop().await;
                    }
                }
                SessionEvent::Closed => {
                    liveness.stop().await;
                    state_sender.send_replace(ConnectionState::Closed);
                    break;
                }
            }
        }

        tracing::debug!("Session {} event loop has finished", id);
    }

    async fn connected_peer(&self) -> Result<Arc<RTCPeerConnection>, Error> {
        self.peer_connection.read().await.clone().ok_or_else(|| {
            Error::new_negotiation(
                format!("Session {} is not initialized", self.id),
                NegotiationErrorKind::NotInitializedError,
            )
        })
    }

    /// Creates an offer, applies it locally and hands it to the `on_local_sdp` callback.
    pub async fn create_offer(&self, ice_restart: bool) -> Result<(), Error> {
        let pc = self.connected_peer().await?;
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = pc.create_offer(options).await.map_err(|e| {
            tracing::error!("Session {} failed to create offer: {}", self.id, e);
            Error::new_negotiation(
                format!("Failed to create offer: {}", e),
                NegotiationErrorKind::OfferError,
            )
        })?;
        pc.set_local_description(offer.clone()).await.map_err(|e| {
            tracing::error!("Session {} failed to set local description: {}", self.id, e);
            Error::new_negotiation(
                format!("Failed to set local description: {}", e),
                NegotiationErrorKind::OfferError,
            )
        })?;
        let sdp = match pc.local_description().await {
            Some(local) => local.sdp,
            None => offer.sdp,
        };
        tracing::debug!("Session {} created offer, ice_restart={}", self.id, ice_restart);

        let locked = self.on_local_sdp_fn.lock().await;
        (locked)(SdpBundle::offer(sdp), self.id.clone());
        Ok(())
    }

    /// Applies the remote answer. Text that does not parse leaves the session untouched.
    pub async fn set_remote_answer(&self, sdp: &str) -> Result<(), Error> {
        let pc = self.connected_peer().await?;
        let answer = sdp::parse_remote_answer(sdp).inspect_err(|err| {
            tracing::error!("Session {} rejected remote answer: {}", self.id, err);
        })?;

        let mut pendings = self.pending_candidates.lock().await;
        pc.set_remote_description(answer).await.map_err(|e| {
            tracing::error!("Session {} failed to set remote answer: {}", self.id, e);
            Error::new_negotiation(
                format!("Failed to set remote description: {}", e),
                NegotiationErrorKind::RemoteDescriptionError,
            )
        })?;
        tracing::debug!("Session {} set remote answer", self.id);

        for candidate in pendings.drain(..) {
            tracing::debug!("Adding pending ICE candidate: {:#?}", candidate);
            if let Err(err) = pc.add_ice_candidate(candidate).await {
                tracing::error!("failed to add_ice_candidate: {}", err);
            }
        }
        Ok(())
    }

    /// Applies one remote candidate. Candidates that arrive before the answer are queued in order.
    pub async fn add_remote_ice_candidate(
        &self,
        candidate: &str,
        mline_index: u16,
        mid: &str,
    ) -> Result<(), Error> {
        sdp::validate_candidate(candidate).inspect_err(|err| {
            tracing::error!("Session {} rejected remote candidate: {}", self.id, err);
        })?;
        let pc = self.connected_peer().await?;
        let init = RTCIceCandidateInit {
            candidate: candidate.to_owned(),
            sdp_mid: Some(mid.to_owned()),
            sdp_mline_index: Some(mline_index),
            username_fragment: None,
        };

        let mut pendings = self.pending_candidates.lock().await;
        if pc.remote_description().await.is_some() {
            tracing::debug!("Adding ICE candidate for {:#?}", init);
            pc.add_ice_candidate(init).await.map_err(|e| {
                Error::new_negotiation(
                    format!("Failed to add ICE candidate: {}", e),
                    NegotiationErrorKind::InvalidCandidateError,
                )
            })?;
        } else {
            tracing::debug!("Pending ICE candidate for {:#?}", init);
            pendings.push(init);
        }
        Ok(())
    }

    /// Sets the outbound ceiling of the video sender. Returns `false` before a sender exists.
    pub async fn set_max_bitrate(&self, bps: u32) -> bool {
        match self.video_track.read().await.as_ref() {
            Some(track) => {
                tracing::debug!("Session {} max bitrate={}", self.id, bps);
                track.set_max_bitrate(bps);
                true
            }
            None => false,
        }
    }

    /// Writes the next captured frame to the configured dump path. Returns `false` before capture exists.
    pub async fn request_frame_dump(&self) -> bool {
        if self.frame_source.lock().await.is_none() {
            return false;
        }
        tracing::debug!("Session {} frame dump to {}", self.id, self.frame_dump.path().display());
        self.frame_dump.request_dump();
        true
    }

    /// Starts the outbound stats poller. Does nothing while it is already running.
    ///
    /// The poller is also started when the connection reaches `connected` and stopped when it goes down.
    pub async fn start_stats_polling(&self, interval: Duration) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        self.liveness.start(interval).await;
    }

    pub async fn stop_stats_polling(&self) {
        self.liveness.stop().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_receiver.borrow()
    }

    /// Subscribes to connection state changes.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_receiver.clone()
    }

    pub fn is_sending_video(&self) -> bool {
        self.liveness.is_sending()
    }

    pub fn is_polling(&self) -> bool {
        self.liveness.is_polling()
    }

    pub async fn local_description(&self) -> Option<RTCSessionDescription> {
        let pc = self.peer_connection.read().await.clone()?;
        pc.local_description().await
    }

    pub async fn remote_description(&self) -> Option<RTCSessionDescription> {
        let pc = self.peer_connection.read().await.clone()?;
        pc.remote_description().await
    }

    pub async fn video_track(&self) -> Option<Arc<LocalVideoTrack>> {
        self.video_track.read().await.clone()
    }

    #[cfg(test)]
    pub(crate) async fn pending_candidates_len(&self) -> usize {
        self.pending_candidates.lock().await.len()
    }

    // Hooks
    /// Set callback function called with every local description this session produces.
    pub async fn on_local_sdp(&self, f: OnLocalSdpFn) {
        let mut callback = self.on_local_sdp_fn.lock().await;
        *callback = f;
    }

    /// Set callback function called with every local ICE candidate this session gathers.
    pub async fn on_local_candidate(&self, f: OnLocalCandidateFn) {
        let mut callback = self.on_local_candidate_fn.lock().await;
        *callback = f;
    }

    /// Stops the liveness poller, closes the peer connection, then stops capture.
    pub async fn close(&self) -> Result<(), Error> {
        self.closing.store(true, Ordering::Release);
        self.liveness.stop().await;
        let result = self.release().await;
        let _ = self.session_event_sender.send(SessionEvent::Closed);
        tracing::info!("Session {} is closed", self.id);
        result
    }

    async fn release(&self) -> Result<(), Error> {
        if let Some(track) = self.video_track.write().await.take() {
            track.close();
        }
        let mut result = Ok(());
        if let Some(pc) = self.peer_connection.write().await.take() {
            if let Err(err) = pc.close().await {
                tracing::error!("Session {} failed to close peer connection: {}", self.id, err);
                result = Err(err.into());
            }
        }
        self.pending_candidates.lock().await.clear();
        if let Some(frame_source) = self.frame_source.lock().await.take() {
            let stopped = tokio::task::spawn_blocking(move || frame_source.stop()).await;
            if let Err(err) = stopped {
                tracing::error!("Session {} failed to stop capture: {}", self.id, err);
            }
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.session_event_sender.send(SessionEvent::Closed);
        tracing::debug!("Session {} is dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{InitError, NegotiationError},
        testing::{init_tracing, EncoderLog, FakeCapturer, FakeEncoder},
    };
    use webrtc::{
        rtcp::{packet::Packet, payload_feedbacks::picture_loss_indication::PictureLossIndication},
        track::track_remote::TrackRemote,
    };

    fn new_session() -> Arc<Session> {
        init_tracing();
        let (encoder, _log) = FakeEncoder::new("video/VP8");
        let config = SessionConfig {
            stats_interval_ms: 20,
            ..Default::default()
        };
        Session::new(config, Box::new(FakeCapturer::new(64, 48)), Box::new(encoder))
    }

    async fn init_with_offer(session: &Arc<Session>) -> SdpBundle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .on_local_sdp(Box::new(move |bundle, _id| {
                let _ = tx.send(bundle);
            }))
            .await;
        session.init(&[]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn negotiation_kind(err: &Error) -> Option<NegotiationErrorKind> {
        match err {
            Error::NegotiationError(NegotiationError { kind, .. }) => Some(*kind),
            _ => None,
        }
    }

    #[tokio::test]
    async fn init_emits_sendonly_video_offer() {
        let session = new_session();
        let offer = init_with_offer(&session).await;
        assert_eq!(offer.sdp_type, crate::signaling::message::SdpType::Offer);
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("a=sendonly"));
        assert_eq!(sdp::video_section_count(&offer.sdp).unwrap(), 1);

        let track = session.video_track().await.unwrap();
        assert!(track.frame_source().is_running());
        assert_eq!(track.max_bitrate(), Some(3_000_000));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn init_twice_is_rejected() {
        let session = new_session();
        init_with_offer(&session).await;
        let err = session.init(&[]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InitError(InitError {
                kind: InitErrorKind::AlreadyInitializedError,
                ..
            })
        ));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_init_is_unwound() {
        let session = new_session();
        let err = session
            .init(&[IceServerConfig::stun("not a uri")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InitError(_)), "{}", err);
        assert!(session.video_track().await.is_none());
        assert!(session.local_description().await.is_none());
        assert!(!session.set_max_bitrate(1_000_000).await);
        assert!(session.create_offer(false).await.is_err());
    }

    #[tokio::test]
    async fn operations_before_init() {
        let session = new_session();
        assert!(!session.set_max_bitrate(2_000_000).await);
        let err = session.create_offer(false).await.unwrap_err();
        assert_eq!(
            negotiation_kind(&err),
            Some(NegotiationErrorKind::NotInitializedError)
        );
        assert_eq!(session.connection_state(), ConnectionState::New);
        assert!(!session.is_sending_video());
    }

    #[tokio::test]
    async fn malformed_answer_keeps_descriptions() {
        let session = new_session();
        let offer = init_with_offer(&session).await;

        let err = session.set_remote_answer("garbage").await.unwrap_err();
        assert_eq!(
            negotiation_kind(&err),
            Some(NegotiationErrorKind::InvalidSdpError)
        );
        assert!(session.remote_description().await.is_none());
        assert_eq!(session.local_description().await.unwrap().sdp, offer.sdp);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn candidates_are_validated_and_queued() {
        let session = new_session();
        init_with_offer(&session).await;

        let err = session
            .add_remote_ice_candidate("candidate:nonsense", 0, "0")
            .await
            .unwrap_err();
        assert_eq!(
            negotiation_kind(&err),
            Some(NegotiationErrorKind::InvalidCandidateError)
        );

        let candidate = "candidate:1387637174 1 udp 2122260223 192.0.2.1 61764 typ host";
        session.add_remote_ice_candidate(candidate, 0, "0").await.unwrap();
        session.add_remote_ice_candidate(candidate, 0, "0").await.unwrap();
        assert_eq!(session.pending_candidates_len().await, 2);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn ice_restart_produces_new_offer() {
        let session = new_session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .on_local_sdp(Box::new(move |bundle, id| {
                let _ = tx.send((bundle, id));
            }))
            .await;
        session.init(&[]).await.unwrap();
        let (_first, id) = rx.recv().await.unwrap();
        assert_eq!(id, session.id);

        session.create_offer(true).await.unwrap();
        let (second, _) = rx.recv().await.unwrap();
        assert!(second.sdp.contains("m=video"));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn liveness_follows_connection_state() {
        let session = new_session();
        assert!(!session.is_polling());

        session
            .session_event_sender
            .send(SessionEvent::ConnectionStateChanged(ConnectionState::Connecting))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!session.is_polling());

        session
            .session_event_sender
            .send(SessionEvent::ConnectionStateChanged(ConnectionState::Connected))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        assert!(session.is_polling());
        // No peer connection, so no stats.
        assert!(!session.is_sending_video());

        session
            .session_event_sender
            .send(SessionEvent::ConnectionStateChanged(ConnectionState::Closed))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!session.is_polling());
    }

    #[tokio::test]
    async fn frame_dump_writes_next_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.yuv");
        let (encoder, _log) = FakeEncoder::new("video/VP8");
        let mut config = SessionConfig::default();
        config.capture.dump_path = path.clone();
        let session = Session::new(config, Box::new(FakeCapturer::new(64, 48)), Box::new(encoder));
        assert!(!session.request_frame_dump().await);

        init_with_offer(&session).await;
        assert!(session.request_frame_dump().await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        session.close().await.unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), 64 * 48 * 3 / 2);
    }

    #[tokio::test]
    async fn close_stops_everything() {
        let session = new_session();
        init_with_offer(&session).await;
        let track = session.video_track().await.unwrap();
        let frame_source = track.frame_source();
        drop(track);

        session.close().await.unwrap();
        assert!(!frame_source.is_running());
        assert!(!session.is_polling());
        assert!(session.video_track().await.is_none());
        let mut state = session.state_watch();
        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == ConnectionState::Closed),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn stats_polling_start_is_idempotent() {
        let session = new_session();
        session.start_stats_polling(Duration::from_millis(10)).await;
        session.start_stats_polling(Duration::from_millis(10)).await;
        assert!(session.is_polling());

        session.stop_stats_polling().await;
        assert!(!session.is_polling());
        session.stop_stats_polling().await;

        session.start_stats_polling(Duration::from_millis(10)).await;
        assert!(session.is_polling());
        session.close().await.unwrap();
        assert!(!session.is_polling());
        session.start_stats_polling(Duration::from_millis(10)).await;
        assert!(!session.is_polling());
    }

    #[tokio::test]
    async fn queued_connected_event_does_not_outlive_close() {
        let session = new_session();
        init_with_offer(&session).await;
        session
            .session_event_sender
            .send(SessionEvent::ConnectionStateChanged(ConnectionState::Connected))
            .unwrap();
        session.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!session.is_polling());
    }

    /// Negotiates with a second in-process peer over loopback. Returns the session, the remote
    /// peer and the encoder log once the connection is up.
    async fn connect_loopback() -> (
        Arc<Session>,
        Arc<RTCPeerConnection>,
        Arc<std::sync::Mutex<EncoderLog>>,
        mpsc::UnboundedReceiver<u32>,
    ) {
        init_tracing();
        let (encoder, log) = FakeEncoder::new("video/VP8");
        let config = SessionConfig {
            stats_interval_ms: 50,
            ..Default::default()
        };
        let session = Session::new(config, Box::new(FakeCapturer::new(64, 48)), Box::new(encoder));
        let (offer_tx, mut offer_rx) = mpsc::unbounded_channel();
        session
            .on_local_sdp(Box::new(move |bundle, _| {
                let _ = offer_tx.send(bundle);
            }))
            .await;
        let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel();
        session
            .on_local_candidate(Box::new(move |bundle, _| {
                let _ = candidate_tx.send(bundle);
            }))
            .await;
        session.init(&[]).await.unwrap();
        let offer = offer_rx.recv().await.unwrap();

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).unwrap();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let remote = Arc::new(api.new_peer_connection(Default::default()).await.unwrap());

        let (ssrc_tx, ssrc_rx) = mpsc::unbounded_channel();
        remote.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let _ = ssrc_tx.send(track.ssrc());
            Box::pin(async move {
                while track.read_rtp().await.is_ok() {}
            })
        }));

        remote
            .set_remote_description(RTCSessionDescription::offer(offer.sdp).unwrap())
            .await
            .unwrap();
        let answer = remote.create_answer(None).await.unwrap();
        let mut gathered = remote.gathering_complete_promise().await;
        remote.set_local_description(answer).await.unwrap();
        let _ = gathered.recv().await;
        let answer = remote.local_description().await.unwrap();

        // The answer carries the remote candidates, ours trickle through the callback.
        tokio::spawn(enc!((remote) async move {
            while let Some(bundle) = candidate_rx.recv().await {
                let _ = remote
                    .add_ice_candidate(RTCIceCandidateInit {
                        candidate: bundle.candidate,
                        sdp_mid: bundle.sdp_mid,
                        sdp_mline_index: bundle.sdp_mline_index,
                        username_fragment: None,
                    })
                    .await;
            }
        }));
        session.set_remote_answer(&answer.sdp).await.unwrap();

        let mut state = session.state_watch();
        tokio::time::timeout(
            Duration::from_secs(10),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        (session, remote, log, ssrc_rx)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loopback_reports_video_sending() {
        let (session, remote, _log, _ssrc) = connect_loopback().await;
        assert!(wait_until(|| session.is_polling()).await);
        assert!(wait_until(|| session.is_sending_video()).await);
        assert!(session.liveness.snapshot().bytes_sent > 0);

        session.close().await.unwrap();
        assert!(!session.is_sending_video());
        remote.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn picture_loss_forces_key_frame() {
        let (session, remote, log, mut ssrc_rx) = connect_loopback().await;
        let media_ssrc = tokio::time::timeout(Duration::from_secs(5), ssrc_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let before = log.lock().unwrap().key_frames;
        let pli: Box<dyn Packet + Send + Sync> = Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        });
        remote.write_rtcp(&[pli]).await.unwrap();
        assert!(wait_until(|| log.lock().unwrap().key_frames > before).await);

        session.close().await.unwrap();
        remote.close().await.unwrap();
    }
}
