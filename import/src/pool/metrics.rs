//! Transfer metrics for the connection pool.
//!
//! Live counters are cumulative for the process lifetime. A ring of samples
//! (60 seconds worth, taken every 5 seconds) backs instantaneous speed
//! calculation over a 10-second window. Persisted offsets carry totals across
//! restarts; `reset` zeroes the visible totals by negating the offsets.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How long the ring looks back.
const RING_WINDOW: Duration = Duration::from_secs(60);
/// Interval between ring samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
/// Window the speed calculation reaches back over.
const SPEED_WINDOW: Duration = Duration::from_secs(10);
/// Interval between offset-file flushes.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Cumulative transfer totals. Also the shape of the persisted offset file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub bytes_downloaded: i64,
    pub bytes_uploaded: i64,
    pub articles_downloaded: i64,
    pub articles_posted: i64,
    pub errors: i64,
    #[serde(default)]
    pub per_provider_errors: HashMap<String, i64>,
}

impl Totals {
    fn negated(&self) -> Totals {
        Totals {
            bytes_downloaded: -self.bytes_downloaded,
            bytes_uploaded: -self.bytes_uploaded,
            articles_downloaded: -self.articles_downloaded,
            articles_posted: -self.articles_posted,
            errors: -self.errors,
            per_provider_errors: self
                .per_provider_errors
                .iter()
                .map(|(k, v)| (k.clone(), -v))
                .collect(),
        }
    }

    fn plus(&self, other: &Totals) -> Totals {
        let mut per_provider_errors = self.per_provider_errors.clone();
        for (k, v) in &other.per_provider_errors {
            *per_provider_errors.entry(k.clone()).or_default() += v;
        }
        Totals {
            bytes_downloaded: self.bytes_downloaded + other.bytes_downloaded,
            bytes_uploaded: self.bytes_uploaded + other.bytes_uploaded,
            articles_downloaded: self.articles_downloaded + other.articles_downloaded,
            articles_posted: self.articles_posted + other.articles_posted,
            errors: self.errors + other.errors,
            per_provider_errors,
        }
    }
}

/// Point-in-time view handed to callers.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub totals: Totals,
    /// Bytes per second over the calculation window.
    pub download_speed: f64,
    pub upload_speed: f64,
}

#[derive(Clone, Debug)]
struct Sample {
    at: Instant,
    bytes_downloaded: i64,
    bytes_uploaded: i64,
}

pub struct MetricsTracker {
    bytes_downloaded: AtomicI64,
    bytes_uploaded: AtomicI64,
    articles_downloaded: AtomicI64,
    articles_posted: AtomicI64,
    errors: AtomicI64,
    per_provider_errors: Mutex<HashMap<String, i64>>,

    // Lock order: ring before offsets, always.
    ring: Mutex<VecDeque<Sample>>,
    offsets: Mutex<Totals>,

    offsets_path: Option<PathBuf>,
}

impl Default for MetricsTracker {
    fn default() -> Self {
        MetricsTracker {
            bytes_downloaded: AtomicI64::new(0),
            bytes_uploaded: AtomicI64::new(0),
            articles_downloaded: AtomicI64::new(0),
            articles_posted: AtomicI64::new(0),
            errors: AtomicI64::new(0),
            per_provider_errors: Mutex::new(HashMap::new()),
            ring: Mutex::new(VecDeque::new()),
            offsets: Mutex::new(Totals::default()),
            offsets_path: None,
        }
    }
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker whose offsets load from (and flush to) `path`. A missing or
    /// unreadable file starts from zero offsets.
    pub fn with_persistence(path: PathBuf) -> Self {
        let stored = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Totals>(&bytes) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "ignoring malformed metrics offsets");
                    Totals::default()
                }
            },
            Err(_) => Totals::default(),
        };

        let tracker = MetricsTracker {
            offsets_path: Some(path),
            ..Default::default()
        };
        *tracker.offsets.lock() = stored;
        tracker
    }

    pub fn record_download(&self, bytes: i64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_article_downloaded(&self) {
        self.articles_downloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: i64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_article_posted(&self) {
        self.articles_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, provider: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self
            .per_provider_errors
            .lock()
            .entry(provider.to_string())
            .or_default() += 1;
    }

    fn live_totals(&self) -> Totals {
        Totals {
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            articles_downloaded: self.articles_downloaded.load(Ordering::Relaxed),
            articles_posted: self.articles_posted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            per_provider_errors: self.per_provider_errors.lock().clone(),
        }
    }

    /// Push a ring sample stamped `now` and drop samples older than the ring
    /// window.
    pub fn sample(&self) {
        self.sample_at(Instant::now());
    }

    fn sample_at(&self, now: Instant) {
        let mut ring = self.ring.lock();
        ring.push_back(Sample {
            at: now,
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
        });
        while let Some(front) = ring.front() {
            if now.duration_since(front.at) > RING_WINDOW {
                ring.pop_front();
            } else {
                break;
            }
        }
    }

    /// Visible totals (live counters plus persisted offsets) and speeds.
    pub fn snapshot(&self) -> Snapshot {
        let (download_speed, upload_speed) = self.speeds_at(Instant::now());
        let live = self.live_totals();
        let offsets = self.offsets.lock();
        Snapshot {
            totals: live.plus(&offsets),
            download_speed,
            upload_speed,
        }
    }

    fn speeds_at(&self, now: Instant) -> (f64, f64) {
        let ring = self.ring.lock();

        // The sample closest to `now - SPEED_WINDOW` without being after it.
        let target = now.checked_sub(SPEED_WINDOW);
        let baseline = target.and_then(|target| {
            ring.iter()
                .filter(|s| s.at <= target)
                .max_by_key(|s| s.at)
                .cloned()
        });

        match baseline {
            Some(sample) => {
                let dt = now.duration_since(sample.at).as_secs_f64();
                if dt <= 0.0 {
                    return (0.0, 0.0);
                }
                let dl = self.bytes_downloaded.load(Ordering::Relaxed) - sample.bytes_downloaded;
                let ul = self.bytes_uploaded.load(Ordering::Relaxed) - sample.bytes_uploaded;
                (dl as f64 / dt, ul as f64 / dt)
            }
            None => (0.0, 0.0),
        }
    }

    /// Zero the visible totals: offsets become the negation of the live
    /// counters, so `snapshot` reads all-zero until new traffic arrives.
    pub fn reset(&self) {
        let live = self.live_totals();
        {
            let mut offsets = self.offsets.lock();
            *offsets = live.negated();
        }
        self.flush();
    }

    /// Persist current visible totals as the next start's offsets.
    pub fn flush(&self) {
        let Some(path) = &self.offsets_path else {
            return;
        };
        let totals = {
            let live = self.live_totals();
            let offsets = self.offsets.lock();
            live.plus(&offsets)
        };
        match serde_json::to_vec_pretty(&totals) {
            Ok(bytes) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(path, bytes) {
                    warn!(path = %path.display(), err = %e, "failed to flush metrics offsets");
                }
            }
            Err(e) => warn!(err = %e, "failed to serialize metrics offsets"),
        }
    }

    pub fn shutdown(&self) {
        self.flush();
    }
}

/// Background sampler: rings every 5 s, flushes offsets every 60 s. Abort the
/// returned handle (or let the runtime wind down) to stop; call
/// [MetricsTracker::shutdown] for the final flush.
pub fn spawn_sampler(tracker: Arc<MetricsTracker>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let ticks_per_flush = (FLUSH_INTERVAL.as_secs() / SAMPLE_INTERVAL.as_secs()).max(1);
        let mut ticks: u64 = 0;
        loop {
            ticker.tick().await;
            tracker.sample();
            ticks += 1;
            if ticks % ticks_per_flush == 0 {
                debug!("flushing metrics offsets");
                tracker.flush();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reset_zeroes_snapshot() {
        let tracker = MetricsTracker::new();
        tracker.record_download(1000);
        tracker.record_article_downloaded();
        tracker.record_error("news.example.com");

        tracker.reset();
        let snap = tracker.snapshot();
        assert_eq!(0, snap.totals.bytes_downloaded);
        assert_eq!(0, snap.totals.articles_downloaded);
        assert_eq!(0, snap.totals.errors);
        assert_eq!(
            Some(&0),
            snap.totals.per_provider_errors.get("news.example.com")
        );

        // New traffic counts from zero again.
        tracker.record_download(250);
        assert_eq!(250, tracker.snapshot().totals.bytes_downloaded);
    }

    #[test]
    fn speed_uses_sample_closest_to_window_start() {
        let tracker = MetricsTracker::new();
        let t0 = Instant::now();

        tracker.sample_at(t0); // 0 bytes
        tracker.record_download(5_000);
        tracker.sample_at(t0 + Duration::from_secs(5)); // 5000 bytes
        tracker.record_download(5_000);
        tracker.sample_at(t0 + Duration::from_secs(10)); // 10000 bytes
        tracker.record_download(2_000); // live: 12000

        // now = t0+15s; window start t0+5s; baseline is the t0+5s sample
        // (closest not-after), not the t0 one.
        let (dl, _) = tracker.speeds_at(t0 + Duration::from_secs(15));
        assert_eq!(700.0, dl); // (12000 - 5000) / 10s
    }

    #[test]
    fn speed_without_old_enough_sample_is_zero() {
        let tracker = MetricsTracker::new();
        let t0 = Instant::now();
        tracker.record_download(1_000);
        tracker.sample_at(t0);
        let (dl, ul) = tracker.speeds_at(t0 + Duration::from_secs(2));
        assert_eq!((0.0, 0.0), (dl, ul));
    }

    #[test]
    fn ring_trims_to_window() {
        let tracker = MetricsTracker::new();
        let t0 = Instant::now();
        for i in 0..30 {
            tracker.sample_at(t0 + Duration::from_secs(i * 5));
        }
        // 60s window at 5s cadence keeps 13 samples (inclusive bounds).
        assert_eq!(13, tracker.ring.lock().len());
    }

    #[test]
    fn offsets_persist_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics.json");

        let tracker = MetricsTracker::with_persistence(path.clone());
        tracker.record_download(4096);
        tracker.record_article_downloaded();
        tracker.flush();

        let restarted = MetricsTracker::with_persistence(path);
        let snap = restarted.snapshot();
        assert_eq!(4096, snap.totals.bytes_downloaded);
        assert_eq!(1, snap.totals.articles_downloaded);
    }

    #[test]
    fn reset_survives_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics.json");

        let tracker = MetricsTracker::with_persistence(path.clone());
        tracker.record_download(4096);
        tracker.reset();

        let restarted = MetricsTracker::with_persistence(path);
        assert_eq!(0, restarted.snapshot().totals.bytes_downloaded);
    }
}
