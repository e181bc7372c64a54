use strum_macros::Display;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    InitError(#[from] InitError),
    #[error(transparent)]
    NegotiationError(#[from] NegotiationError),
    #[error(transparent)]
    MediaError(#[from] MediaError),
    #[error(transparent)]
    SignalingError(#[from] SignalingError),
}

impl Error {
    pub fn new_init(message: String, kind: InitErrorKind) -> Error {
        Error::InitError(InitError { kind, message })
    }

    pub fn new_negotiation(message: String, kind: NegotiationErrorKind) -> Error {
        Error::NegotiationError(NegotiationError { kind, message })
    }

    pub fn new_media(message: String, kind: MediaErrorKind) -> Error {
        Error::MediaError(MediaError { kind, message })
    }

    pub fn new_signaling(message: String, kind: SignalingErrorKind) -> Error {
        Error::SignalingError(SignalingError { kind, message })
    }
}

/// Failures while building the peer connection or attaching media. Fatal to `init`.
#[derive(ThisError, Debug)]
#[error("{kind}: {message}")]
pub struct InitError {
    pub kind: InitErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum InitErrorKind {
    ApiBuildError,
    PeerConnectionError,
    TrackAttachError,
    AlreadyInitializedError,
    MediaNotProvidedError,
}

/// A rejected offer, answer or candidate. The session keeps its previous state.
#[derive(ThisError, Debug)]
#[error("{kind}: {message}")]
pub struct NegotiationError {
    pub kind: NegotiationErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum NegotiationErrorKind {
    NotInitializedError,
    OfferError,
    InvalidSdpError,
    InvalidCandidateError,
    RemoteDescriptionError,
}

#[derive(ThisError, Debug)]
#[error("{kind}: {message}")]
pub struct MediaError {
    pub kind: MediaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MediaErrorKind {
    ConvertError,
    EncodeError,
    DumpError,
}

#[derive(ThisError, Debug)]
#[error("{kind}: {message}")]
pub struct SignalingError {
    pub kind: SignalingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SignalingErrorKind {
    ConnectionError,
    InvalidMessageError,
    ChannelClosedError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind() {
        let err = Error::new_negotiation(
            "unexpected token".to_owned(),
            NegotiationErrorKind::InvalidSdpError,
        );
        assert_eq!(err.to_string(), "InvalidSdpError: unexpected token");
        assert!(matches!(
            err,
            Error::NegotiationError(NegotiationError {
                kind: NegotiationErrorKind::InvalidSdpError,
                ..
            })
        ));
    }
}
