//! Progress accounting and notification pacing
//!
//! Independent of bandwidth throttling: this only decides how often a
//! progress notification is worth sending.

use brd_types::ProgressSnapshot;
use tokio::time::{Duration, Instant};

/// Pacing window for progress notifications
#[derive(Debug, Clone, Copy)]
struct NotifyWindow {
    recorded_time: Instant,
    /// Bytes between the last two notifications
    window_bytes: u64,
    previous_cumulative: u64,
}

/// Byte counters for one attempt
#[derive(Debug)]
pub struct ProgressTracker {
    id: String,
    filename: String,
    total: u64,
    downloaded: u64,
    interval: Duration,
    window: NotifyWindow,
    last_notified: Option<u64>,
}

impl ProgressTracker {
    pub fn new(id: impl Into<String>, interval: Duration) -> Self {
        Self {
            id: id.into(),
            filename: String::new(),
            total: 0,
            downloaded: 0,
            interval,
            window: NotifyWindow {
                recorded_time: Instant::now(),
                window_bytes: 0,
                previous_cumulative: 0,
            },
            last_notified: None,
        }
    }

    /// Start counting a new attempt. `total` is 0 when unknown.
    pub fn begin(&mut self, total: u64, filename: impl Into<String>) {
        self.reset();
        self.total = total;
        self.filename = filename.into();
        self.window.recorded_time = Instant::now();
    }

    pub fn reset(&mut self) {
        self.filename.clear();
        self.total = 0;
        self.downloaded = 0;
        self.window = NotifyWindow {
            recorded_time: Instant::now(),
            window_bytes: 0,
            previous_cumulative: 0,
        };
        self.last_notified = None;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Percentage downloaded, `None` while the total is unknown
    pub fn percentage(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some((self.downloaded as f64 / self.total as f64) * 100.0)
    }

    /// Count `bytes` and return a snapshot when a notification is due: once
    /// per interval, and always on the chunk that completes a known total.
    pub fn record(&mut self, bytes: u64) -> Option<ProgressSnapshot> {
        if bytes == 0 {
            return None;
        }
        self.downloaded += bytes;

        let reached_total = self.total > 0 && self.downloaded >= self.total;
        if reached_total || self.window.recorded_time.elapsed() >= self.interval {
            return Some(self.mark_notified());
        }
        None
    }

    /// Final snapshot at end of stream, unless the last notification already
    /// reported the final count.
    pub fn finish(&mut self) -> Option<ProgressSnapshot> {
        if self.last_notified == Some(self.downloaded) {
            return None;
        }
        Some(self.mark_notified())
    }

    fn mark_notified(&mut self) -> ProgressSnapshot {
        self.window.recorded_time = Instant::now();
        self.window.window_bytes = self.downloaded - self.window.previous_cumulative;
        self.window.previous_cumulative = self.downloaded;
        self.last_notified = Some(self.downloaded);
        self.snapshot()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            id: self.id.clone(),
            total: self.total,
            downloaded: self.downloaded,
            progress: self.percentage(),
            window_bytes: self.window.window_bytes,
            filename: self.filename.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_notifications_respect_interval() {
        let mut tracker = ProgressTracker::new("t", Duration::from_millis(500));
        tracker.begin(10_000, "f.bin");

        let mut emitted_at = Vec::new();
        let start = Instant::now();
        for _ in 0..20 {
            tokio::time::advance(Duration::from_millis(100)).await;
            if tracker.record(100).is_some() {
                emitted_at.push(start.elapsed());
            }
        }

        assert_eq!(emitted_at.len(), 4);
        for pair in emitted_at.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_chunk_always_notifies() {
        let mut tracker = ProgressTracker::new("t", Duration::from_secs(60));
        tracker.begin(300, "f.bin");

        assert!(tracker.record(100).is_none());
        assert!(tracker.record(100).is_none());
        let last = tracker.record(100).expect("final chunk must notify");
        assert_eq!(last.progress, Some(100.0));
        assert_eq!(last.window_bytes, 300);
        assert!(tracker.finish().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_total_reports_no_percentage() {
        let mut tracker = ProgressTracker::new("t", Duration::from_secs(60));
        tracker.begin(0, "f.bin");

        assert!(tracker.record(512).is_none());
        assert_eq!(tracker.percentage(), None);

        let last = tracker.finish().expect("end of stream must notify");
        assert_eq!(last.downloaded, 512);
        assert_eq!(last.progress, None);
    }

    #[tokio::test]
    async fn test_zero_byte_chunks_are_ignored() {
        let mut tracker = ProgressTracker::new("t", Duration::ZERO);
        assert!(tracker.record(0).is_none());
        assert_eq!(tracker.downloaded(), 0);
    }
}
