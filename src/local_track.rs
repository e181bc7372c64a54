use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, SystemTime};

use derivative::Derivative;
use enclose::enc;
use tokio::sync::{mpsc, watch};
use webrtc::{
    media::Sample,
    rtcp::payload_feedbacks::{
        full_intra_request::FullIntraRequest, picture_loss_indication::PictureLossIndication,
    },
    rtp_transceiver::rtp_sender::RTCRtpSender,
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};

use crate::{
    broadcaster::{LatestFrameSink, SinkWants, VideoSink},
    config::VideoCodec,
    encoder::VideoEncoder,
    frame::VideoFrame,
    frame_source::FrameSource,
};

pub const TRACK_ID: &str = "video";
pub const STREAM_ID: &str = "desktop";

/// The desktop video sender: takes frames from a [`FrameSource`], encodes them and writes samples.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct LocalVideoTrack {
    pub id: String,
    track: Arc<TrackLocalStaticSample>,
    frame_source: Arc<FrameSource>,
    sink_id: String,
    max_bitrate: Arc<AtomicU32>,
    key_frame_requested: Arc<AtomicBool>,
    samples_written: Arc<AtomicU64>,
    closed_sender: mpsc::UnboundedSender<()>,
}

impl LocalVideoTrack {
    pub(crate) fn new(
        frame_source: Arc<FrameSource>,
        encoder: Box<dyn VideoEncoder>,
        codec: VideoCodec,
    ) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            codec.capability(),
            TRACK_ID.to_owned(),
            STREAM_ID.to_owned(),
        ));
        let id = track.id().to_owned();
        if encoder.mime_type() != codec.mime_type() {
            tracing::warn!(
                "LocalVideoTrack id={} encoder produces {} but track negotiates {}",
                id,
                encoder.mime_type(),
                codec.mime_type()
            );
        }

        let (sink, frames) = LatestFrameSink::new();
        let sink_id = sink.id().to_owned();
        frame_source
            .broadcaster()
            .add_sink(sink, SinkWants::default());

        let max_bitrate = Arc::new(AtomicU32::new(0));
        let key_frame_requested = Arc::new(AtomicBool::new(false));
        let samples_written = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let default_duration = frame_source.interval();

        tokio::spawn(enc!((id, track, max_bitrate, key_frame_requested, samples_written) async move {
            Self::sample_writer_loop(
                id,
                track,
                encoder,
                frames,
                rx,
                max_bitrate,
                key_frame_requested,
                samples_written,
                default_duration,
            )
            .await;
        }));

        tracing::debug!("LocalVideoTrack id={} mime_type={} is created", id, codec.mime_type());

        Self {
            id,
            track,
            frame_source,
            sink_id,
            max_bitrate,
            key_frame_requested,
            samples_written,
            closed_sender: tx,
        }
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn frame_source(&self) -> Arc<FrameSource> {
        self.frame_source.clone()
    }

    /// Ceiling applied to the encoder before the next frame. `0` means unlimited.
    pub fn set_max_bitrate(&self, bps: u32) {
        self.max_bitrate.store(bps, Ordering::Release);
    }

    pub fn max_bitrate(&self) -> Option<u32> {
        match self.max_bitrate.load(Ordering::Acquire) {
            0 => None,
            bps => Some(bps),
        }
    }

    pub fn request_key_frame(&self) {
        self.key_frame_requested.store(true, Ordering::Release);
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written.load(Ordering::Relaxed)
    }

    /// Reads RTCP from the sender so interceptors keep running, and turns PLI/FIR into key frame requests.
    pub(crate) fn bind_sender(&self, sender: Arc<RTCRtpSender>) {
        let id = self.id.clone();
        let key_frame_requested = self.key_frame_requested.clone();
        let closed = self.closed_sender.clone();
        tokio::spawn(async move {
            Self::rtcp_event_loop(id, sender, key_frame_requested, closed).await;
        });
    }

    pub(crate) fn close(&self) {
        self.frame_source.broadcaster().remove_sink(&self.sink_id);
        let _ = self.closed_sender.send(());
    }

    #[allow(clippy::too_many_arguments)]
    async fn sample_writer_loop(
        id: String,
        track: Arc<TrackLocalStaticSample>,
        mut encoder: Box<dyn VideoEncoder>,
        mut frames: watch::Receiver<Option<VideoFrame>>,
        mut closed: mpsc::UnboundedReceiver<()>,
        max_bitrate: Arc<AtomicU32>,
        key_frame_requested: Arc<AtomicBool>,
        samples_written: Arc<AtomicU64>,
        default_duration: Duration,
    ) {
        tracing::debug!("LocalVideoTrack id={} sample writer loop has started", id);

        let mut applied_bitrate = 0;
        let mut last_timestamp_us: Option<i64> = None;

        loop {
            tokio::select! {
                _ = closed.recv() => {
                    break;
                }
                changed = frames.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let Some(frame) = frames.borrow_and_update().clone() else {
                        continue;
                    };

                    let bps = max_bitrate.load(Ordering::Acquire);
                    if bps != applied_bitrate {
                        tracing::debug!("LocalVideoTrack id={} max bitrate={}", id, bps);
                        encoder.set_max_bitrate(bps);
                        applied_bitrate = bps;
                    }

                    let force = key_frame_requested.swap(false, Ordering::AcqRel);
                    let encoded = match encoder.encode(&frame, force) {
                        Ok(Some(encoded)) => encoded,
                        Ok(None) => continue,
                        Err(err) => {
                            tracing::error!("LocalVideoTrack id={} failed to encode frame: {}", id, err);
                            continue;
                        }
                    };

                    let duration = match last_timestamp_us {
                        Some(last) if encoded.timestamp_us > last => {
                            Duration::from_micros((encoded.timestamp_us - last) as u64)
                        }
                        _ => default_duration,
                    };
                    last_timestamp_us = Some(encoded.timestamp_us);

                    tracing::trace!(
                        "LocalVideoTrack id={} write sample size={} key_frame={} duration={:?}",
                        id,
                        encoded.data.len(),
                        encoded.key_frame,
                        duration
                    );
                    let sample = Sample {
                        data: encoded.data,
                        timestamp: SystemTime::now(),
                        duration,
                        ..Default::default()
                    };
                    match track.write_sample(&sample).await {
                        Ok(()) => {
                            samples_written.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            tracing::error!("LocalVideoTrack id={} failed to write sample: {}", id, err);
                        }
                    }
                }
            }
        }

        tracing::debug!("LocalVideoTrack id={} sample writer loop has finished", id);
    }

    async fn rtcp_event_loop(
        id: String,
        sender: Arc<RTCRtpSender>,
        key_frame_requested: Arc<AtomicBool>,
        closed: mpsc::UnboundedSender<()>,
    ) {
        tracing::debug!("LocalVideoTrack id={} RTCP event loop has started", id);

        loop {
            if closed.is_closed() {
                break;
            }
            match sender.read_rtcp().await {
                Ok((packets, _attr)) => {
                    for packet in packets.iter() {
                        let any = packet.as_any();
                        if any.downcast_ref::<PictureLossIndication>().is_some()
                            || any.downcast_ref::<FullIntraRequest>().is_some()
                        {
                            tracing::debug!("LocalVideoTrack id={} key frame requested by remote", id);
                            key_frame_requested.store(true, Ordering::Release);
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!("LocalVideoTrack id={} RTCP reader stopped: {}", id, err);
                    break;
                }
            }
        }

        tracing::debug!("LocalVideoTrack id={} RTCP event loop has finished", id);
    }
}

impl Drop for LocalVideoTrack {
    fn drop(&mut self) {
        self.close();
        tracing::debug!("LocalVideoTrack id={} is dropped", self.id);
    }
}
