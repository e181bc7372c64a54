use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use derivative::Derivative;
use uuid::Uuid;

use crate::{
    broadcaster::TrackBroadcaster,
    capturer::{CaptureResult, CaptureSource, ScreenCapturer},
    convert,
    error::Error,
    frame::{time_micros, VideoFrame},
};

/// Runs the capture loop on a dedicated thread and publishes converted frames.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct FrameSource {
    pub id: String,
    source: Option<CaptureSource>,
    interval: Duration,
    #[derivative(Debug = "ignore")]
    capturer: Arc<Mutex<Box<dyn ScreenCapturer>>>,
    broadcaster: Arc<TrackBroadcaster>,
    running: Arc<AtomicBool>,
    produced: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FrameSource {
    /// Selects the first source reported by `capturer`. Frame rates below 1 are raised to 1.
    pub fn new(mut capturer: Box<dyn ScreenCapturer>, target_fps: u32) -> Self {
        let id = Uuid::new_v4().to_string();
        let source = capturer.source_list().into_iter().next();
        match &source {
            Some(s) => {
                if !capturer.select_source(s.id) {
                    tracing::warn!("FrameSource {} could not select source {}", id, s.id);
                }
            }
            None => tracing::warn!("FrameSource {} has no capture source", id),
        }
        let fps = target_fps.max(1);

        tracing::debug!("FrameSource {} is created, fps={}, source={:?}", id, fps, source);

        Self {
            id,
            source,
            interval: Duration::from_micros(1_000_000 / fps as u64),
            capturer: Arc::new(Mutex::new(capturer)),
            broadcaster: Arc::new(TrackBroadcaster::new()),
            running: Arc::new(AtomicBool::new(false)),
            produced: Arc::new(AtomicU64::new(0)),
            handle: Mutex::new(None),
        }
    }

    pub fn broadcaster(&self) -> Arc<TrackBroadcaster> {
        self.broadcaster.clone()
    }

    pub fn source(&self) -> Option<&CaptureSource> {
        self.source.as_ref()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of frames handed to the broadcaster since creation.
    pub fn frames_produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// Starts the capture thread. Calling it while running does nothing.
    pub fn start(&self) -> Result<(), Error> {
        let mut handle = match self.handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if handle.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);

        let id = self.id.clone();
        let interval = self.interval;
        let capturer = self.capturer.clone();
        let broadcaster = self.broadcaster.clone();
        let running = self.running.clone();
        let produced = self.produced.clone();
        let spawned = thread::Builder::new()
            .name("screen-capture".to_owned())
            .spawn(move || {
                Self::capture_loop(id, interval, capturer, broadcaster, running, produced)
            });
        match spawned {
            Ok(h) => {
                *handle = Some(h);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                Err(err.into())
            }
        }
    }

    /// Stops the capture thread and waits for it to exit. No frame is distributed afterwards.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::error!("FrameSource {} capture thread panicked", self.id);
            }
        }
    }

    fn capture_loop(
        id: String,
        interval: Duration,
        capturer: Arc<Mutex<Box<dyn ScreenCapturer>>>,
        broadcaster: Arc<TrackBroadcaster>,
        running: Arc<AtomicBool>,
        produced: Arc<AtomicU64>,
    ) {
        tracing::debug!("FrameSource {} capture loop has started", id);

        while running.load(Ordering::Acquire) {
            let started = Instant::now();
            if let Some(frame) = Self::capture_once(&id, &capturer) {
                broadcaster.distribute(&frame);
                produced.fetch_add(1, Ordering::Relaxed);
            }

            let deadline = started + interval;
            while running.load(Ordering::Acquire) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::park_timeout(deadline - now);
            }
        }

        tracing::debug!("FrameSource {} capture loop has finished", id);
    }

    fn capture_once(id: &str, capturer: &Mutex<Box<dyn ScreenCapturer>>) -> Option<VideoFrame> {
        let result = match capturer.lock() {
            Ok(mut c) => c.capture_frame(),
            Err(_) => return None,
        };
        let desktop = match result {
            CaptureResult::Success(frame) => frame,
            other => {
                tracing::trace!("FrameSource {} skipped tick: {:?}", id, other);
                return None;
            }
        };
        if desktop.width == 0 || desktop.height == 0 {
            tracing::trace!("FrameSource {} discarded empty frame", id);
            return None;
        }
        match convert::bgra_to_i420(&desktop.data, desktop.stride, desktop.width, desktop.height)
        {
            Ok(buffer) => Some(VideoFrame::new(buffer, time_micros())),
            Err(err) => {
                tracing::trace!("FrameSource {} failed to convert frame: {}", id, err);
                None
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
        tracing::debug!("FrameSource {} is dropped", self.id);
    }
}
