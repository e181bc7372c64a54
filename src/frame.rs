use std::{
    sync::{Arc, OnceLock},
    time::Instant,
};

use bytes::Bytes;

/// Planar 4:2:0 image. Y, U and V planes are stored back to back in one allocation,
/// with chroma planes subsampled by two in both directions (rounded up).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I420Buffer {
    width: u32,
    height: u32,
    data: Bytes,
}

impl I420Buffer {
    pub(crate) fn from_planes(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), Self::buffer_size(width, height));
        Self {
            width,
            height,
            data: Bytes::from(data),
        }
    }

    pub fn buffer_size(width: u32, height: u32) -> usize {
        let (cw, ch) = Self::chroma_dimensions(width, height);
        (width as usize * height as usize) + 2 * (cw * ch)
    }

    pub fn chroma_dimensions(width: u32, height: u32) -> (usize, usize) {
        (width.div_ceil(2) as usize, height.div_ceil(2) as usize)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride_y(&self) -> usize {
        self.width as usize
    }

    pub fn stride_uv(&self) -> usize {
        self.width.div_ceil(2) as usize
    }

    fn y_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn uv_len(&self) -> usize {
        let (cw, ch) = Self::chroma_dimensions(self.width, self.height);
        cw * ch
    }

    pub fn y(&self) -> &[u8] {
        &self.data[..self.y_len()]
    }

    pub fn u(&self) -> &[u8] {
        let start = self.y_len();
        &self.data[start..start + self.uv_len()]
    }

    pub fn v(&self) -> &[u8] {
        let start = self.y_len() + self.uv_len();
        &self.data[start..start + self.uv_len()]
    }

    /// All three planes, tightly packed.
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }
}

/// A converted capture frame. Cloning shares the pixel buffer.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub buffer: Arc<I420Buffer>,
    /// Monotonic capture time in microseconds, see [`time_micros`].
    pub timestamp_us: i64,
}

impl VideoFrame {
    pub fn new(buffer: I420Buffer, timestamp_us: i64) -> Self {
        Self {
            width: buffer.width(),
            height: buffer.height(),
            buffer: Arc::new(buffer),
            timestamp_us,
        }
    }
}

/// Microseconds elapsed on a process-wide monotonic clock.
pub fn time_micros() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as i64
}
