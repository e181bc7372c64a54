use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, Mutex, RwLock},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};
use uuid::Uuid;

use crate::{
    error::{Error, SignalingErrorKind},
    session::Session,
    signaling::message::{SdpType, SignalingEvent, SignalingMessage},
};

/// Media id used for remote candidates that do not name one.
pub const DEFAULT_CANDIDATE_MID: &str = "0";

/// Websocket client that carries descriptions and candidates between a [`Session`] and a signaling server.
///
/// Local events are queued as [`SignalingEvent`]s and written by [`SignalingGateway::run`], so the
/// session callbacks never wait on the network.
#[derive(Debug)]
pub struct SignalingGateway {
    pub id: String,
    url: String,
    event_sender: mpsc::UnboundedSender<SignalingEvent>,
    event_receiver: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    session: RwLock<Option<Arc<Session>>>,
}

impl SignalingGateway {
    pub fn new(url: impl Into<String>) -> Self {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let url = url.into();
        tracing::debug!("SignalingGateway {} is created, url={}", id, url);
        Self {
            id,
            url,
            event_sender: tx,
            event_receiver: Mutex::new(Some(rx)),
            session: RwLock::new(None),
        }
    }

    /// Routes the session's local descriptions and candidates through this gateway.
    pub async fn attach(&self, session: Arc<Session>) {
        let sender = self.event_sender.clone();
        session
            .on_local_sdp(Box::new(move |bundle, session_id| {
                let _ = sender.send(SignalingEvent::LocalDescription { session_id, bundle });
            }))
            .await;
        let sender = self.event_sender.clone();
        session
            .on_local_candidate(Box::new(move |bundle, session_id| {
                let _ = sender.send(SignalingEvent::LocalCandidate { session_id, bundle });
            }))
            .await;
        *self.session.write().await = Some(session);
    }

    pub fn event_sender(&self) -> mpsc::UnboundedSender<SignalingEvent> {
        self.event_sender.clone()
    }

    /// Connects to the configured URL and exchanges messages until the server closes the socket.
    pub async fn run(&self) -> Result<(), Error> {
        let (stream, _response) = connect_async(self.url.as_str()).await.map_err(|e| {
            Error::new_signaling(
                format!("Failed to connect to {}: {}", self.url, e),
                SignalingErrorKind::ConnectionError,
            )
        })?;
        tracing::info!("SignalingGateway {} connected to {}", self.id, self.url);
        self.run_with_stream(stream).await
    }

    /// Same as [`SignalingGateway::run`] over an already established websocket.
    pub async fn run_with_stream<S>(&self, stream: WebSocketStream<S>) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut events = self.event_receiver.lock().await.take().ok_or_else(|| {
            Error::new_signaling(
                format!("SignalingGateway {} is already running", self.id),
                SignalingErrorKind::ChannelClosedError,
            )
        })?;
        let result = self.message_loop(stream, &mut events).await;
        *self.event_receiver.lock().await = Some(events);
        result
    }

    async fn message_loop<S>(
        &self,
        stream: WebSocketStream<S>,
        events: &mut mpsc::UnboundedReceiver<SignalingEvent>,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut ws_sender, mut ws_receiver) = stream.split();

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return Err(Error::new_signaling(
                            "Signaling event channel is closed".to_owned(),
                            SignalingErrorKind::ChannelClosedError,
                        ));
                    };
                    let Some(message) = event.outbound_message() else {
                        self.dispatch(event).await;
                        continue;
                    };
                    let json = message.to_json()?;
                    tracing::debug!("SignalingGateway {} send: {}", self.id, json);
                    ws_sender.send(Message::Text(json)).await?;
                }
                message = ws_receiver.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(err) = self.handle_incoming(&text).await {
                                tracing::warn!("SignalingGateway {} ignored message: {}", self.id, err);
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!("SignalingGateway {} closed by server: {:?}", self.id, frame);
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::error!("SignalingGateway {} websocket error: {}", self.id, err);
                            return Err(err.into());
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Parses one message from the server and hands it to the attached session.
    pub(crate) async fn handle_incoming(&self, raw: &str) -> Result<(), Error> {
        let message = SignalingMessage::from_json(raw).map_err(|e| {
            Error::new_signaling(
                format!("Invalid signaling message {:?}: {}", raw, e),
                SignalingErrorKind::InvalidMessageError,
            )
        })?;
        let session_id = match self.session.read().await.as_ref() {
            Some(session) => session.id.clone(),
            None => String::new(),
        };
        self.dispatch(SignalingEvent::remote(message, session_id))
            .await;
        Ok(())
    }

    async fn dispatch(&self, event: SignalingEvent) {
        let Some(session) = self.session.read().await.clone() else {
            tracing::warn!("SignalingGateway {} has no session for {:?}", self.id, event);
            return;
        };
        let result = match event {
            SignalingEvent::RemoteDescription { bundle, .. } => match bundle.sdp_type {
                SdpType::Answer => session.set_remote_answer(&bundle.sdp).await,
                SdpType::Offer => {
                    tracing::warn!("SignalingGateway {} ignored remote offer", self.id);
                    Ok(())
                }
            },
            SignalingEvent::RemoteCandidate { bundle, .. } => {
                session
                    .add_remote_ice_candidate(
                        &bundle.candidate,
                        bundle.sdp_mline_index.unwrap_or(0),
                        bundle
                            .sdp_mid
                            .as_deref()
                            .unwrap_or(DEFAULT_CANDIDATE_MID),
                    )
                    .await
            }
            _ => Ok(()),
        };
        if let Err(err) = result {
            tracing::error!("SignalingGateway {} failed to apply remote message: {}", self.id, err);
        }
    }
}

impl Drop for SignalingGateway {
    fn drop(&mut self) {
        tracing::debug!("SignalingGateway {} is dropped", self.id);
    }
}
