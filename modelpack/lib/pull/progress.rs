use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often the render ticker repaints the progress line.
const RENDER_INTERVAL: Duration = Duration::from_millis(200);

/// How many samples the speed tracker keeps in its rolling window.
const SPEED_WINDOW: usize = 10;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A concurrent byte counter for one pull.
///
/// `done` is clamped to `[0, total]` whenever the total is known; a total of
/// zero means unknown. The counter is shared across the blob workers of one
/// pull and is not reused across pulls.
#[derive(Debug, Default)]
pub struct Progress {
    done: AtomicI64,
    total: AtomicI64,
    speed: SpeedTracker,
}

/// A point-in-time view of a progress counter, shaped for the `/progress`
/// endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    /// Bytes accounted so far.
    pub done: i64,

    /// Total expected bytes; zero when unknown.
    pub total: i64,

    /// Whole-number percentage, zero when the total is unknown.
    pub percent: i64,
}

/// A rolling-window sampler deriving transfer speed and ETA from byte counts.
#[derive(Debug, Default)]
pub struct SpeedTracker {
    samples: Mutex<VecDeque<(Instant, i64)>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Progress {
    /// Creates a counter with a known total; pass zero when the total is not
    /// yet known.
    pub fn new(total: i64) -> Self {
        Self {
            done: AtomicI64::new(0),
            total: AtomicI64::new(total),
            speed: SpeedTracker::default(),
        }
    }

    /// The total expected bytes; zero means unknown.
    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Sets the total. Set once at pull start, read thereafter.
    pub fn set_total(&self, total: i64) {
        self.total.store(total, Ordering::Relaxed);
    }

    /// Bytes accounted so far.
    pub fn done(&self) -> i64 {
        self.done.load(Ordering::Relaxed)
    }

    /// Advances the counter by `n` bytes. Negative deltas roll accounting
    /// back (used when a ranged download is restarted from scratch); the
    /// result is clamped to `[0, total]`.
    pub fn add(&self, n: i64) {
        let new_value = self.done.fetch_add(n, Ordering::Relaxed) + n;
        let total = self.total();
        if new_value < 0 {
            self.done.store(0, Ordering::Relaxed);
        } else if total > 0 && new_value > total {
            self.done.store(total, Ordering::Relaxed);
        }
    }

    /// Sets the counter to `n`, clamped to `[0, total]`.
    pub fn set_done(&self, n: i64) {
        let total = self.total();
        let mut value = n.max(0);
        if total > 0 && value > total {
            value = total;
        }
        self.done.store(value, Ordering::Relaxed);
    }

    /// Takes a snapshot for display or the progress endpoint.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let total = self.total();
        let mut done = self.done();
        if total > 0 && done > total {
            done = total;
        }
        let percent = if total > 0 { done * 100 / total } else { 0 };
        ProgressSnapshot {
            done,
            total,
            percent,
        }
    }

    /// Spawns the render ticker: every 200ms, when a total is known, a
    /// single-line progress display is written to stderr. The task exits when
    /// `cancel` fires, painting one final line.
    pub fn start_render(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let progress = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RENDER_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        progress.render();
                        break;
                    }
                    _ = ticker.tick() => progress.render(),
                }
            }
        })
    }

    fn render(&self) {
        let snapshot = self.snapshot();
        if snapshot.total <= 0 {
            return;
        }
        self.speed.record(snapshot.done);
        let rate = match self.speed.speed() {
            0 => String::new(),
            speed => format!(" {}", format_speed(speed)),
        };
        eprint!(
            "Downloading: {} / {} ({}%){}\r",
            human_bytes(snapshot.done),
            human_bytes(snapshot.total),
            snapshot.percent,
            rate
        );
    }
}

impl std::io::Write for &Progress {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.add(buf.len() as i64);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SpeedTracker {
    /// Records the cumulative byte count at the current instant, keeping the
    /// window bounded.
    pub fn record(&self, bytes: i64) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.push_back((Instant::now(), bytes));
        while samples.len() > SPEED_WINDOW {
            samples.pop_front();
        }
    }

    /// Current speed in bytes per second across the window, zero when there
    /// is not enough data.
    pub fn speed(&self) -> i64 {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let (Some(first), Some(last)) = (samples.front(), samples.back()) else {
            return 0;
        };
        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        if samples.len() < 2 || elapsed == 0.0 {
            return 0;
        }
        ((last.1 - first.1) as f64 / elapsed) as i64
    }

    /// Estimated time to completion, `None` while the speed is unknown or
    /// nothing remains.
    pub fn eta(&self, total: i64, downloaded: i64) -> Option<Duration> {
        let speed = self.speed();
        if speed <= 0 || total <= 0 {
            return None;
        }
        let remaining = total - downloaded;
        if remaining <= 0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed as f64))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Formats a byte count for display, e.g. `1.50 MiB`.
pub fn human_bytes(n: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = 1024 * KB;
    const GB: i64 = 1024 * MB;

    match n {
        n if n >= GB => format!("{:.2} GiB", n as f64 / GB as f64),
        n if n >= MB => format!("{:.2} MiB", n as f64 / MB as f64),
        n if n >= KB => format!("{:.2} KiB", n as f64 / KB as f64),
        n => format!("{n} B"),
    }
}

/// Formats a transfer speed for display, e.g. `2.1 MiB/s`.
pub fn format_speed(bytes_per_second: i64) -> String {
    format!("{}/s", human_bytes(bytes_per_second))
}

/// Formats a duration as compact hours/minutes/seconds.
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_add_clamps_to_total() {
        let progress = Progress::new(100);
        progress.add(60);
        progress.add(60);
        assert_eq!(progress.done(), 100);
    }

    #[test]
    fn test_add_negative_rolls_back() {
        let progress = Progress::new(100);
        progress.add(40);
        progress.add(-15);
        assert_eq!(progress.done(), 25);
        progress.add(-100);
        assert_eq!(progress.done(), 0);
    }

    #[test]
    fn test_unknown_total_never_clamps() {
        let progress = Progress::new(0);
        progress.add(1_000_000);
        assert_eq!(progress.done(), 1_000_000);
        assert_eq!(progress.snapshot().percent, 0);
    }

    #[test]
    fn test_set_done_clamps() {
        let progress = Progress::new(50);
        progress.set_done(80);
        assert_eq!(progress.done(), 50);
        progress.set_done(-3);
        assert_eq!(progress.done(), 0);
    }

    #[test]
    fn test_snapshot_percent() {
        let progress = Progress::new(200);
        progress.add(50);
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.done, 50);
        assert_eq!(snapshot.total, 200);
        assert_eq!(snapshot.percent, 25);
    }

    #[test]
    fn test_writer_advances_counter() {
        let progress = Progress::new(0);
        let mut sink = &progress;
        sink.write_all(b"hello").unwrap();
        assert_eq!(progress.done(), 5);
    }

    #[test]
    fn test_speed_tracker_needs_two_samples() {
        let tracker = SpeedTracker::default();
        assert_eq!(tracker.speed(), 0);
        tracker.record(0);
        assert_eq!(tracker.speed(), 0);
    }

    #[test]
    fn test_speed_tracker_window_is_bounded() {
        let tracker = SpeedTracker::default();
        for i in 0..100 {
            tracker.record(i);
        }
        let samples = tracker.samples.lock().unwrap();
        assert_eq!(samples.len(), SPEED_WINDOW);
    }

    #[test]
    fn test_eta_none_without_speed() {
        let tracker = SpeedTracker::default();
        assert!(tracker.eta(100, 10).is_none());
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.00 MiB");
        assert_eq!(human_bytes(5 * 1024 * 1024 * 1024), "5.00 GiB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(7265)), "2h 1m");
    }
}
