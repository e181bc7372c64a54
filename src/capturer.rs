use bytes::Bytes;

/// One raw capture in BGRA byte order.
#[derive(Debug, Clone)]
pub struct DesktopFrame {
    pub width: u32,
    pub height: u32,
    /// Bytes per row, at least `width * 4`.
    pub stride: usize,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSource {
    pub id: u64,
    pub title: String,
}

#[derive(Debug)]
pub enum CaptureResult {
    Success(DesktopFrame),
    /// Nothing usable this tick, try again on the next one.
    TemporaryError,
    PermanentError,
}

/// The platform display-capture primitive.
///
/// Implementations are moved onto the capture thread, so they must be `Send`.
pub trait ScreenCapturer: Send + std::fmt::Debug {
    fn source_list(&mut self) -> Vec<CaptureSource>;

    fn select_source(&mut self, id: u64) -> bool;

    fn capture_frame(&mut self) -> CaptureResult;
}
