use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use uuid::Uuid;

use crate::frame::VideoFrame;

/// A consumer of converted frames. `on_frame` runs on the capture thread.
pub trait VideoSink: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    fn on_frame(&self, frame: &VideoFrame);
}

/// What a sink asks the broadcaster for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkWants {
    /// Upper bound on delivered frames per second. `None` delivers every frame.
    pub max_framerate_fps: Option<u32>,
}

#[derive(Debug)]
struct SinkEntry {
    sink: Arc<dyn VideoSink>,
    wants: SinkWants,
    last_delivered_us: Option<i64>,
}

impl SinkEntry {
    fn accepts(&self, timestamp_us: i64) -> bool {
        match (self.wants.max_framerate_fps, self.last_delivered_us) {
            (Some(fps), Some(last)) if fps > 0 => {
                // Allow 10% jitter so a sink asking for the capture rate gets every frame.
                let min_gap = 900_000 / fps as i64;
                timestamp_us - last >= min_gap
            }
            (Some(0), _) => false,
            _ => true,
        }
    }
}

/// Synchronous fan-out of frames to registered sinks, in registration order.
#[derive(Debug, Default)]
pub struct TrackBroadcaster {
    sinks: Mutex<Vec<SinkEntry>>,
}

impl TrackBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sink`, or replaces its wants when a sink with the same id is already registered.
    pub fn add_sink(&self, sink: Arc<dyn VideoSink>, wants: SinkWants) {
        let Ok(mut sinks) = self.sinks.lock() else {
            tracing::error!("TrackBroadcaster sink list is poisoned");
            return;
        };
        if let Some(entry) = sinks.iter_mut().find(|e| e.sink.id() == sink.id()) {
            tracing::debug!("TrackBroadcaster update sink id={} wants={:?}", sink.id(), wants);
            entry.wants = wants;
            return;
        }
        tracing::debug!("TrackBroadcaster add sink id={} wants={:?}", sink.id(), wants);
        sinks.push(SinkEntry {
            sink,
            wants,
            last_delivered_us: None,
        });
    }

    pub fn remove_sink(&self, id: &str) {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.retain(|e| e.sink.id() != id);
            tracing::debug!("TrackBroadcaster remove sink id={}", id);
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Delivers `frame` to every sink on the calling thread.
    pub fn distribute(&self, frame: &VideoFrame) {
        let targets: Vec<Arc<dyn VideoSink>> = {
            let Ok(mut sinks) = self.sinks.lock() else {
                return;
            };
            sinks
                .iter_mut()
                .filter_map(|entry| {
                    if entry.accepts(frame.timestamp_us) {
                        entry.last_delivered_us = Some(frame.timestamp_us);
                        Some(entry.sink.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };
        for sink in targets {
            sink.on_frame(frame);
        }
    }
}

/// Single-slot sink: keeps only the newest frame and never blocks the capture thread.
#[derive(Debug)]
pub struct LatestFrameSink {
    id: String,
    slot: watch::Sender<Option<VideoFrame>>,
}

impl LatestFrameSink {
    pub fn new() -> (Arc<Self>, watch::Receiver<Option<VideoFrame>>) {
        let (slot, receiver) = watch::channel(None);
        let sink = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            slot,
        });
        (sink, receiver)
    }
}

impl VideoSink for LatestFrameSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_frame(&self, frame: &VideoFrame) {
        // Overwrites an unread frame.
        self.slot.send_replace(Some(frame.clone()));
    }
}
