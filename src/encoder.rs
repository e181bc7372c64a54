use bytes::Bytes;

use crate::{error::Error, frame::VideoFrame};

#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// One complete access unit in the track's codec.
    pub data: Bytes,
    pub key_frame: bool,
    /// Capture time of the source frame.
    pub timestamp_us: i64,
}

/// The codec used to compress frames before they are written to the track.
///
/// Runs on the track's sample writer task, never on the capture thread.
pub trait VideoEncoder: Send + std::fmt::Debug {
    /// Must match the mime type of the negotiated codec, e.g. `video/VP8`.
    fn mime_type(&self) -> &str;

    /// Returns `Ok(None)` when the encoder buffered the frame or chose to skip it.
    fn encode(
        &mut self,
        frame: &VideoFrame,
        force_key_frame: bool,
    ) -> Result<Option<EncodedFrame>, Error>;

    /// Ceiling for the outbound bitrate in bits per second. `0` removes the ceiling.
    fn set_max_bitrate(&mut self, bps: u32);
}
