//! Fakes for the capture and codec seams.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::{
    capturer::{CaptureResult, CaptureSource, DesktopFrame, ScreenCapturer},
    encoder::{EncodedFrame, VideoEncoder},
    error::Error,
    frame::VideoFrame,
    transport::{ConnectionState, OutboundVideoStats, StatsSource},
};

/// Installs a fmt subscriber filtered by `RUST_LOG`. Later calls are no-ops.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Always returns the same grey image, after replaying an optional script of results.
#[derive(Debug)]
pub(crate) struct FakeCapturer {
    frame: DesktopFrame,
    script: VecDeque<CaptureResult>,
    pub selected: Arc<Mutex<Option<u64>>>,
}

impl FakeCapturer {
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width as usize * 4;
        Self {
            frame: DesktopFrame {
                width,
                height,
                stride,
                data: Bytes::from(vec![0x80u8; stride * height as usize]),
            },
            script: VecDeque::new(),
            selected: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_script(mut self, script: Vec<CaptureResult>) -> Self {
        self.script = script.into();
        self
    }
}

impl ScreenCapturer for FakeCapturer {
    fn source_list(&mut self) -> Vec<CaptureSource> {
        vec![
            CaptureSource {
                id: 1,
                title: "primary".to_owned(),
            },
            CaptureSource {
                id: 2,
                title: "secondary".to_owned(),
            },
        ]
    }

    fn select_source(&mut self, id: u64) -> bool {
        *self.selected.lock().unwrap() = Some(id);
        true
    }

    fn capture_frame(&mut self) -> CaptureResult {
        self.script
            .pop_front()
            .unwrap_or_else(|| CaptureResult::Success(self.frame.clone()))
    }
}

#[derive(Debug, Default)]
pub(crate) struct EncoderLog {
    pub frames: usize,
    pub key_frames: usize,
    pub max_bitrate: Option<u32>,
}

/// Emits the Y plane length as payload. Every frame it is forced to encode is a key frame.
#[derive(Debug)]
pub(crate) struct FakeEncoder {
    pub log: Arc<Mutex<EncoderLog>>,
    mime_type: String,
}

impl FakeEncoder {
    pub fn new(mime_type: &str) -> (Self, Arc<Mutex<EncoderLog>>) {
        let log = Arc::new(Mutex::new(EncoderLog::default()));
        (
            Self {
                log: log.clone(),
                mime_type: mime_type.to_owned(),
            },
            log,
        )
    }
}

impl VideoEncoder for FakeEncoder {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn encode(
        &mut self,
        frame: &VideoFrame,
        force_key_frame: bool,
    ) -> Result<Option<EncodedFrame>, Error> {
        let mut log = self.log.lock().unwrap();
        let key_frame = force_key_frame || log.frames == 0;
        log.frames += 1;
        if key_frame {
            log.key_frames += 1;
        }
        Ok(Some(EncodedFrame {
            data: Bytes::from((frame.buffer.y().len() as u32).to_be_bytes().to_vec()),
            key_frame,
            timestamp_us: frame.timestamp_us,
        }))
    }

    fn set_max_bitrate(&mut self, bps: u32) {
        self.log.lock().unwrap().max_bitrate = (bps != 0).then_some(bps);
    }
}

/// Stats for a single video stream whose byte counter grows on each query while `growing` is set.
#[derive(Debug)]
pub(crate) struct FakeStatsSource {
    state: Mutex<ConnectionState>,
    bytes_sent: AtomicU64,
    growing: AtomicBool,
    queries: AtomicUsize,
}

impl FakeStatsSource {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state: Mutex::new(state),
            bytes_sent: AtomicU64::new(0),
            growing: AtomicBool::new(false),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn set_growing(&self, growing: bool) {
        self.growing.store(growing, Ordering::SeqCst);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatsSource for FakeStatsSource {
    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn outbound_video_stats(&self) -> Vec<OutboundVideoStats> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.growing.load(Ordering::SeqCst) {
            self.bytes_sent.fetch_add(1000, Ordering::SeqCst);
        }
        let bytes_sent = self.bytes_sent.load(Ordering::SeqCst);
        vec![OutboundVideoStats {
            ssrc: 1,
            bytes_sent,
            packets_sent: bytes_sent / 1000,
        }]
    }
}
