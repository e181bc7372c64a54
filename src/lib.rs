#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # screencast-push
//! One-way screen sharing over WebRTC. The desktop is captured on a dedicated thread, converted to
//! I420, fanned out to video sinks and sent on a single send-only video track. This crate does not
//! render anything and does not receive media.
//!
//! A [`session::Session`] owns the peer connection. Wire it to a signaling server with
//! [`signaling::gateway::SignalingGateway`], or drive `set_remote_answer` and
//! `add_remote_ice_candidate` yourself.

/// Fan-out of captured frames to video sinks.
pub mod broadcaster;
/// Platform capture seam.
pub mod capturer;
/// Configuration for [`session::Session`] and [`signaling::gateway::SignalingGateway`].
pub mod config;
pub mod convert;
/// Codec seam used by the outgoing track.
pub mod encoder;
pub mod error;
pub mod frame;
pub mod frame_dump;
/// Capture thread that paces frames at the target rate.
pub mod frame_source;
/// Detects whether video bytes are actually leaving the peer connection.
pub mod liveness;
/// The send-only video track.
pub mod local_track;
/// Offer/answer, ICE and connection state for one peer connection.
pub mod session;
pub mod signaling;
pub mod transport;

#[cfg(test)]
mod testing;
