//! Quality metrics loop
//!
//! Once per tick every live session's outbound video counters are read and
//! the latest local frame is compared with the frame currently rendered for
//! that peer. Each read runs under its own timeout so one slow or failing
//! session never holds up the others.
//!
//! Byte counters are reported both as the raw cumulative value and as the
//! delta since the previous sample for the same peer. The first sample for
//! a peer measures its delta from zero.

use crate::config::RoomConfig;
use crate::identity::PeerId;
use crate::media::{Frame, FrameGrabber, NoRemoteFrames, RemoteFrameSource};
use crate::registry::SessionRegistry;
use crate::session::PeerSession;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Fidelity reported for pixel-identical frames
pub const MAX_FIDELITY: f64 = 100.0;

/// Upper bound of the target bitrate control
pub const MAX_TARGET_BITRATE_KBPS: u32 = 100_000;

const K1: f64 = 0.01;
const K2: f64 = 0.03;
const DYNAMIC_RANGE: f64 = 255.0;

/// PSNR over the R, G and B channels
///
/// Saturates at [`MAX_FIDELITY`] for identical frames. `None` when the
/// frames differ in size.
pub fn psnr(a: &Frame, b: &Frame) -> Option<f64> {
    if !a.same_dimensions(b) || a.data.len() != b.data.len() || a.data.is_empty() {
        return None;
    }
    let mut sum = 0.0f64;
    for (pa, pb) in a.data.chunks_exact(4).zip(b.data.chunks_exact(4)) {
        for channel in 0..3 {
            let diff = f64::from(pa[channel]) - f64::from(pb[channel]);
            sum += diff * diff;
        }
    }
    let mse = sum / (a.pixel_count() * 3) as f64;
    if mse == 0.0 {
        return Some(MAX_FIDELITY);
    }
    let score = 10.0 * (DYNAMIC_RANGE * DYNAMIC_RANGE / mse).log10();
    Some(score.min(MAX_FIDELITY))
}

/// SSIM over luma, with the whole frame as one window
pub fn ssim(a: &Frame, b: &Frame) -> Option<f64> {
    if !a.same_dimensions(b) || a.data.len() != b.data.len() || a.data.is_empty() {
        return None;
    }
    let la = luma(a);
    let lb = luma(b);
    let n = la.len() as f64;

    let mean_a = la.iter().sum::<f64>() / n;
    let mean_b = lb.iter().sum::<f64>() / n;
    let (mut var_a, mut var_b, mut cov) = (0.0, 0.0, 0.0);
    for (x, y) in la.iter().zip(&lb) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        var_a += dx * dx;
        var_b += dy * dy;
        cov += dx * dy;
    }
    var_a /= n;
    var_b /= n;
    cov /= n;

    let c1 = (K1 * DYNAMIC_RANGE).powi(2);
    let c2 = (K2 * DYNAMIC_RANGE).powi(2);
    let numerator = (2.0 * mean_a * mean_b + c1) * (2.0 * cov + c2);
    let denominator = (mean_a * mean_a + mean_b * mean_b + c1) * (var_a + var_b + c2);
    Some(numerator / denominator)
}

fn luma(frame: &Frame) -> Vec<f64> {
    frame
        .data
        .chunks_exact(4)
        .map(|p| 0.299 * f64::from(p[0]) + 0.587 * f64::from(p[1]) + 0.114 * f64::from(p[2]))
        .collect()
}

/// One measurement for one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
    /// Peer measured
    pub peer: PeerId,
    /// Configured target bitrate
    pub target_bitrate_kbps: u32,
    /// Cumulative outbound video bytes
    pub bytes_sent: u64,
    /// Bytes since this peer's previous sample
    pub bytes_sent_delta: u64,
    /// Outbound rate over that interval; absent on a peer's first sample
    pub throughput_kbps: Option<f64>,
    /// Frame width
    pub frame_width: Option<u32>,
    /// Frame height
    pub frame_height: Option<u32>,
    /// PSNR, when both frames were available and comparable
    pub fidelity: Option<f64>,
    /// SSIM, when both frames were available and comparable
    pub similarity: Option<f64>,
}

/// Bounded rolling sequence of samples, oldest evicted first
#[derive(Debug, Clone)]
pub struct QualityHistory {
    samples: VecDeque<QualitySample>,
    capacity: usize,
}

impl QualityHistory {
    /// Empty history holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append, evicting the oldest sample past capacity
    pub fn push(&mut self, sample: QualitySample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Samples oldest first
    pub fn samples(&self) -> Vec<QualitySample> {
        self.samples.iter().cloned().collect()
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<&QualitySample> {
        self.samples.back()
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

struct MonitorInner {
    history: RwLock<QualityHistory>,
    last_bytes: Mutex<HashMap<PeerId, (u64, Instant)>>,
    target_bitrate: AtomicU32,
    stats_timeout: Duration,
    local_frames: RwLock<Option<Arc<dyn FrameGrabber>>>,
    remote_frames: RwLock<Arc<dyn RemoteFrameSource>>,
    samples_tx: broadcast::Sender<QualitySample>,
}

/// Periodic sampler of session quality
pub struct QualityMonitor {
    inner: Arc<MonitorInner>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QualityMonitor {
    /// Monitor with tick period, timeout, history size and target from config
    pub fn new(config: &RoomConfig) -> Self {
        let (samples_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            inner: Arc::new(MonitorInner {
                history: RwLock::new(QualityHistory::new(config.metrics_history)),
                last_bytes: Mutex::new(HashMap::new()),
                target_bitrate: AtomicU32::new(
                    config.target_bitrate_kbps.min(MAX_TARGET_BITRATE_KBPS),
                ),
                stats_timeout: config.stats_timeout(),
                local_frames: RwLock::new(None),
                remote_frames: RwLock::new(Arc::new(NoRemoteFrames)),
                samples_tx,
            }),
            interval: config.metrics_interval(),
            task: Mutex::new(None),
        }
    }

    /// Source of the latest local frame
    pub fn set_local_frames(&self, grabber: Option<Arc<dyn FrameGrabber>>) {
        *self.inner.local_frames.write() = grabber;
    }

    /// Source of remote frames
    pub fn set_remote_frames(&self, source: Arc<dyn RemoteFrameSource>) {
        *self.inner.remote_frames.write() = source;
    }

    /// Receive samples as they are produced
    pub fn subscribe(&self) -> broadcast::Receiver<QualitySample> {
        self.inner.samples_tx.subscribe()
    }

    /// Rolling history, oldest first
    pub fn history(&self) -> Vec<QualitySample> {
        self.inner.history.read().samples()
    }

    /// Current target bitrate
    pub fn target_bitrate(&self) -> u32 {
        self.inner.target_bitrate.load(Ordering::Relaxed)
    }

    /// Set the target bitrate, clamped to the control's range; returns the applied value
    pub fn set_target_bitrate(&self, kbps: u32) -> u32 {
        let kbps = kbps.min(MAX_TARGET_BITRATE_KBPS);
        self.inner.target_bitrate.store(kbps, Ordering::Relaxed);
        tracing::debug!(target_bitrate_kbps = kbps, "Target bitrate updated");
        kbps
    }

    /// Forget the counter baseline of a removed peer
    pub fn forget(&self, peer: &PeerId) {
        self.inner.last_bytes.lock().remove(peer);
    }

    /// Sample every session once
    pub async fn tick(&self, sessions: &[Arc<PeerSession>]) -> Vec<QualitySample> {
        self.inner.tick(sessions).await
    }

    /// Start the periodic loop over the registry's sessions
    ///
    /// Returns `false` if the loop was already running.
    pub fn start(&self, registry: Arc<SessionRegistry>) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }
        let inner = Arc::clone(&self.inner);
        let period = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let sessions = registry.sessions();
                if !sessions.is_empty() {
                    inner.tick(&sessions).await;
                }
            }
        }));
        tracing::info!(interval_ms = period.as_millis(), "Quality monitor started");
        true
    }

    /// Stop the loop; history stays readable
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::info!("Quality monitor stopped");
        }
    }

    /// Whether the loop is running
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl MonitorInner {
    async fn tick(&self, sessions: &[Arc<PeerSession>]) -> Vec<QualitySample> {
        let local_frame = self.local_frames.read().as_ref().and_then(|g| g.grab());
        let reads = sessions
            .iter()
            .map(|session| self.sample(session, local_frame.as_ref()));
        let samples: Vec<QualitySample> = futures::future::join_all(reads)
            .await
            .into_iter()
            .flatten()
            .collect();

        {
            let mut history = self.history.write();
            for sample in &samples {
                history.push(sample.clone());
            }
        }
        for sample in &samples {
            let _ = self.samples_tx.send(sample.clone());
        }
        tracing::trace!(sessions = sessions.len(), samples = samples.len(), "Quality tick");
        samples
    }

    async fn sample(
        &self,
        session: &PeerSession,
        local_frame: Option<&Frame>,
    ) -> Option<QualitySample> {
        let peer = session.peer();
        let stats = match tokio::time::timeout(self.stats_timeout, session.get_stats()).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                tracing::debug!(
                    peer = %peer,
                    error = %e,
                    "Skipping quality sample, stats unavailable"
                );
                return None;
            }
            Err(_) => {
                tracing::warn!(
                    peer = %peer,
                    timeout_ms = self.stats_timeout.as_millis(),
                    "Skipping quality sample, stats read timed out"
                );
                return None;
            }
        };

        let video = stats.outbound_video();
        let bytes_sent = video.map(|v| v.bytes_sent).unwrap_or(0);
        let now = Instant::now();
        let previous = self.last_bytes.lock().insert(peer.clone(), (bytes_sent, now));
        let (bytes_sent_delta, throughput_kbps) = match previous {
            Some((last, at)) => {
                let delta = bytes_sent.saturating_sub(last);
                let secs = now.duration_since(at).as_secs_f64();
                let rate = (secs > 0.0).then(|| delta as f64 * 8.0 / 1000.0 / secs);
                (delta, rate)
            }
            None => (bytes_sent, None),
        };

        let frame_width = video.and_then(|v| v.frame_width).or(local_frame.map(|f| f.width));
        let frame_height = video.and_then(|v| v.frame_height).or(local_frame.map(|f| f.height));

        let remote_frame = self.remote_frames.read().capture(peer);
        let (fidelity, similarity) = match (local_frame, remote_frame.as_ref()) {
            (Some(local), Some(remote)) => (psnr(local, remote), ssim(local, remote)),
            _ => (None, None),
        };

        Some(QualitySample {
            timestamp: Utc::now(),
            peer: peer.clone(),
            target_bitrate_kbps: self.target_bitrate.load(Ordering::Relaxed),
            bytes_sent,
            bytes_sent_delta,
            throughput_kbps,
            frame_width,
            frame_height,
            fidelity,
            similarity,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackNetwork;
    use crate::media::{LocalMedia, LocalStream, LocalTrack};
    use crate::session::SessionOptions;
    use crate::types::TrackKind;
    use tokio::sync::mpsc;

    fn gradient(width: u32, height: u32, offset: u8) -> Frame {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = ((x + y) as u8).wrapping_add(offset);
                data.extend_from_slice(&[v, v / 2, 255 - v, 255]);
            }
        }
        Frame::new(width, height, data).unwrap()
    }

    async fn connected_session(network: &Arc<LoopbackNetwork>, peer: &str) -> Arc<PeerSession> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let camera = LocalTrack::with_id("cam", TrackKind::Video);
        let media = LocalMedia::new(LocalStream::new(vec![camera]));
        let session = Arc::new(PeerSession::new(
            PeerId::new(peer),
            true,
            media,
            SessionOptions::default(),
            tx,
        ));
        session.connect(&network.factory("local"), None).await.unwrap();
        session
    }

    #[test]
    fn test_psnr_identical_saturates() {
        let frame = gradient(16, 16, 0);
        assert_eq!(psnr(&frame, &frame.clone()), Some(MAX_FIDELITY));
    }

    #[test]
    fn test_psnr_known_value() {
        let a = Frame::solid(4, 4, [100, 100, 100, 255]);
        let b = Frame::solid(4, 4, [110, 110, 110, 255]);
        // mse = 100
        let expected = 10.0 * (255.0f64 * 255.0 / 100.0).log10();
        assert!((psnr(&a, &b).unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_scores_none_on_mismatch() {
        let a = gradient(16, 16, 0);
        let b = gradient(8, 32, 0);
        assert_eq!(psnr(&a, &b), None);
        assert_eq!(ssim(&a, &b), None);
    }

    #[test]
    fn test_ssim_ranges() {
        let a = gradient(32, 32, 0);
        assert!((ssim(&a, &a).unwrap() - 1.0).abs() < 1e-12);
        let shifted = gradient(32, 32, 40);
        let score = ssim(&a, &shifted).unwrap();
        assert!(score < 1.0);
        assert!(psnr(&a, &shifted).unwrap() < MAX_FIDELITY);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = QualityHistory::new(3);
        for i in 0..5u64 {
            history.push(QualitySample {
                timestamp: Utc::now(),
                peer: PeerId::new("p"),
                target_bitrate_kbps: 500,
                bytes_sent: i,
                bytes_sent_delta: 0,
                throughput_kbps: None,
                frame_width: None,
                frame_height: None,
                fidelity: None,
                similarity: None,
            });
        }
        let kept: Vec<u64> = history.samples().iter().map(|s| s.bytes_sent).collect();
        assert_eq!(kept, vec![2, 3, 4]);
        assert_eq!(history.latest().unwrap().bytes_sent, 4);
    }

    #[test]
    fn test_target_bitrate_clamped() {
        let monitor = QualityMonitor::new(&RoomConfig::default());
        assert_eq!(monitor.target_bitrate(), 500);
        assert_eq!(monitor.set_target_bitrate(250_000), MAX_TARGET_BITRATE_KBPS);
        assert_eq!(monitor.target_bitrate(), MAX_TARGET_BITRATE_KBPS);
    }

    #[tokio::test]
    async fn test_failing_session_does_not_block_others() {
        let network = LoopbackNetwork::new();
        let good = connected_session(&network, "good").await;
        let bad = connected_session(&network, "bad").await;
        let slow = connected_session(&network, "slow").await;
        let local = PeerId::new("local");
        network
            .transport(&local, &PeerId::new("bad"))
            .unwrap()
            .set_stats_failure(true);
        network
            .transport(&local, &PeerId::new("slow"))
            .unwrap()
            .set_stats_delay(Some(Duration::from_secs(5)));

        let config = RoomConfig {
            stats_timeout_ms: 50,
            ..RoomConfig::default()
        };
        let monitor = QualityMonitor::new(&config);
        let started = Instant::now();
        let samples = monitor.tick(&[good, bad, slow]).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].peer, PeerId::new("good"));
        assert_eq!(monitor.history().len(), 1);
    }

    #[tokio::test]
    async fn test_frames_feed_scores() {
        struct Fixed(Frame);
        impl FrameGrabber for Fixed {
            fn grab(&self) -> Option<Frame> {
                Some(self.0.clone())
            }
        }
        impl RemoteFrameSource for Fixed {
            fn capture(&self, _peer: &PeerId) -> Option<Frame> {
                Some(self.0.clone())
            }
        }

        let network = LoopbackNetwork::new();
        let session = connected_session(&network, "b").await;
        let monitor = QualityMonitor::new(&RoomConfig::default());
        let frame = gradient(8, 8, 3);
        monitor.set_local_frames(Some(Arc::new(Fixed(frame.clone()))));
        monitor.set_remote_frames(Arc::new(Fixed(frame)));
        let mut rx = monitor.subscribe();

        let samples = monitor.tick(&[session]).await;
        assert_eq!(samples[0].fidelity, Some(MAX_FIDELITY));
        assert!((samples[0].similarity.unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(rx.recv().await.unwrap(), samples[0]);
    }
}
