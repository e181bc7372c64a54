use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use derivative::Derivative;
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::transport::{ConnectionState, OutboundVideoStats, StatsSource};

/// Last observed counters of the outbound video stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboundSnapshot {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub sending: bool,
}

impl OutboundSnapshot {
    /// Compares the busiest video stream against the previous sample and stores it.
    /// Without any video stream the stored counters are kept.
    pub fn observe(&mut self, streams: &[OutboundVideoStats]) -> bool {
        match streams.iter().max_by_key(|s| s.bytes_sent) {
            Some(best) => {
                self.sending = best.bytes_sent > self.bytes_sent;
                self.bytes_sent = best.bytes_sent;
                self.packets_sent = best.packets_sent;
            }
            None => self.sending = false,
        }
        self.sending
    }

    pub fn mark_idle(&mut self) {
        self.sending = false;
    }
}

#[derive(Debug)]
struct Poller {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Polls outbound RTP counters to tell whether video is actually leaving the host.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct LivenessMonitor {
    id: String,
    #[derivative(Debug = "ignore")]
    source: Arc<dyn StatsSource>,
    snapshot: Arc<std::sync::Mutex<OutboundSnapshot>>,
    sending: Arc<AtomicBool>,
    polling: Arc<AtomicBool>,
    poller: Mutex<Option<Poller>>,
}

impl LivenessMonitor {
    pub fn new(id: String, source: Arc<dyn StatsSource>) -> Self {
        Self {
            id,
            source,
            snapshot: Arc::new(std::sync::Mutex::new(OutboundSnapshot::default())),
            sending: Arc::new(AtomicBool::new(false)),
            polling: Arc::new(AtomicBool::new(false)),
            poller: Mutex::new(None),
        }
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> OutboundSnapshot {
        self.snapshot.lock().map(|s| *s).unwrap_or_default()
    }

    /// Starts polling every `interval`. Does nothing if a poll loop is already running.
    pub async fn start(&self, interval: Duration) {
        let mut poller = self.poller.lock().await;
        if poller.is_some() {
            return;
        }
        if let Ok(mut snapshot) = self.snapshot.lock() {
            *snapshot = OutboundSnapshot::default();
        }
        self.sending.store(false, Ordering::Release);

        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(Self::poll_loop(
            self.id.clone(),
            interval.max(Duration::from_millis(1)),
            self.source.clone(),
            self.snapshot.clone(),
            self.sending.clone(),
            stopped,
        ));
        *poller = Some(Poller { stop, handle });
        self.polling.store(true, Ordering::Release);
        tracing::debug!("LivenessMonitor {} started, interval={:?}", self.id, interval);
    }

    /// Stops the poll loop and waits for it to finish. Safe to call when not started.
    pub async fn stop(&self) {
        let mut poller = self.poller.lock().await;
        if let Some(Poller { stop, handle }) = poller.take() {
            let _ = stop.send(());
            if let Err(err) = handle.await {
                tracing::error!("LivenessMonitor {} poll loop failed: {}", self.id, err);
            }
            tracing::debug!("LivenessMonitor {} stopped", self.id);
        }
        self.sending.store(false, Ordering::Release);
        self.polling.store(false, Ordering::Release);
    }

    async fn poll_loop(
        id: String,
        interval: Duration,
        source: Arc<dyn StatsSource>,
        snapshot: Arc<std::sync::Mutex<OutboundSnapshot>>,
        sending: Arc<AtomicBool>,
        mut stopped: oneshot::Receiver<()>,
    ) {
        tracing::debug!("LivenessMonitor {} poll loop has started", id);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut stopped => break,
                _ = ticker.tick() => {
                    Self::poll_once(&id, source.as_ref(), &snapshot, &sending).await;
                }
            }
        }

        tracing::debug!("LivenessMonitor {} poll loop has finished", id);
    }

    async fn poll_once(
        id: &str,
        source: &dyn StatsSource,
        snapshot: &std::sync::Mutex<OutboundSnapshot>,
        sending: &AtomicBool,
    ) {
        let state = source.connection_state();
        if state != ConnectionState::Connected {
            if let Ok(mut s) = snapshot.lock() {
                s.mark_idle();
            }
            sending.store(false, Ordering::Release);
            tracing::trace!("LivenessMonitor {} skipped poll, state={}", id, state);
            return;
        }

        let streams = source.outbound_video_stats().await;
        let Ok(mut s) = snapshot.lock() else {
            return;
        };
        let now_sending = s.observe(&streams);
        if sending.swap(now_sending, Ordering::AcqRel) != now_sending {
            tracing::info!(
                "LivenessMonitor {} video sending={} bytes_sent={} packets_sent={}",
                id,
                now_sending,
                s.bytes_sent,
                s.packets_sent
            );
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        if let Ok(mut poller) = self.poller.try_lock() {
            if let Some(p) = poller.take() {
                let _ = p.stop.send(());
            }
        }
        tracing::debug!("LivenessMonitor {} is dropped", self.id);
    }
}
