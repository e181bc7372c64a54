use webrtc::{
    ice::candidate::candidate_base::unmarshal_candidate,
    peer_connection::sdp::session_description::RTCSessionDescription,
};
use webrtc_sdp::{media_type::SdpMediaValue, parse_sdp, SdpSession};

use crate::error::{Error, NegotiationErrorKind};

/// Parses a remote answer, rejecting text that is not a session description.
pub fn parse_remote_answer(sdp: &str) -> Result<RTCSessionDescription, Error> {
    parse_session(sdp)?;
    RTCSessionDescription::answer(sdp.to_owned()).map_err(|e| {
        Error::new_negotiation(
            format!("Failed to parse remote answer: {}", e),
            NegotiationErrorKind::InvalidSdpError,
        )
    })
}

fn parse_session(sdp: &str) -> Result<SdpSession, Error> {
    if sdp.trim().is_empty() {
        return Err(Error::new_negotiation(
            "Remote SDP is empty".to_string(),
            NegotiationErrorKind::InvalidSdpError,
        ));
    }
    parse_sdp(sdp, false).map_err(|e| {
        Error::new_negotiation(
            format!("Failed to parse remote SDP: {}", e),
            NegotiationErrorKind::InvalidSdpError,
        )
    })
}

/// Number of video media sections in `sdp`.
pub fn video_section_count(sdp: &str) -> Result<usize, Error> {
    let session = parse_session(sdp)?;
    Ok(session
        .media
        .iter()
        .filter(|m| matches!(m.get_type(), SdpMediaValue::Video))
        .count())
}

/// Checks that `candidate` is a valid ICE candidate line, with or without the `candidate:` prefix.
pub fn validate_candidate(candidate: &str) -> Result<(), Error> {
    let raw = candidate.trim();
    let raw = raw.strip_prefix("a=").unwrap_or(raw);
    let raw = raw.strip_prefix("candidate:").unwrap_or(raw);
    if raw.is_empty() {
        return Err(Error::new_negotiation(
            "ICE candidate is empty".to_string(),
            NegotiationErrorKind::InvalidCandidateError,
        ));
    }
    unmarshal_candidate(raw).map(|_| ()).map_err(|e| {
        Error::new_negotiation(
            format!("Failed to parse ICE candidate {:?}: {}", candidate, e),
            NegotiationErrorKind::InvalidCandidateError,
        )
    })
}
