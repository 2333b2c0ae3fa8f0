//! Pacing stage between the response body and the temporary file
//!
//! Every chunk is forwarded to the sink as soon as it arrives. The limiter then
//! compares the time the transferred bytes should have taken at the configured
//! budget with the time actually elapsed, and asks the caller to stop pulling
//! from upstream for the difference. Bytes are never buffered, dropped or
//! duplicated; delivery is only delayed.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{Duration, Instant};

/// What the upstream should do after a chunk went through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Keep reading
    Flow,
    /// Stop reading, resume after the given delay
    Pause(Duration),
}

/// Bandwidth pacer working on a bytes-per-millisecond budget
#[derive(Debug)]
pub struct RateLimiter {
    /// Budget in bytes per millisecond (`None` = unlimited)
    bytes_per_ms: Option<f64>,
    /// Bytes counted since `window_start`
    window_bytes: u64,
    window_start: Instant,
    /// Bytes forwarded over the limiter's lifetime
    total_bytes: u64,
}

impl RateLimiter {
    /// Create a limiter for `kb_per_sec` kilobytes per second (0 = unlimited)
    pub fn new(kb_per_sec: u64) -> Self {
        let mut limiter = Self {
            bytes_per_ms: None,
            window_bytes: 0,
            window_start: Instant::now(),
            total_bytes: 0,
        };
        limiter.set_limit(kb_per_sec);
        limiter
    }

    /// Change the budget. Restarts the pacing window.
    pub fn set_limit(&mut self, kb_per_sec: u64) {
        self.bytes_per_ms = (kb_per_sec > 0).then(|| (kb_per_sec as f64 * 1024.0) / 1000.0);
        self.restart_window();
    }

    /// Start counting the budget afresh from now. Time spent while the
    /// upstream was held (a user pause) must not count as elapsed budget.
    pub fn restart_window(&mut self) {
        self.window_bytes = 0;
        self.window_start = Instant::now();
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_ms.is_none()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Account for `bytes` that were just forwarded and decide whether the
    /// upstream must pause.
    pub fn record(&mut self, bytes: usize) -> Pacing {
        self.window_bytes += bytes as u64;
        self.total_bytes += bytes as u64;

        let Some(budget) = self.bytes_per_ms else {
            return Pacing::Flow;
        };

        let assumed_ms = self.window_bytes as f64 / budget;
        let elapsed_ms = self.window_start.elapsed().as_secs_f64() * 1000.0;
        let lag_ms = assumed_ms - elapsed_ms;

        if lag_ms > 0.0 {
            Pacing::Pause(Duration::from_secs_f64(lag_ms / 1000.0))
        } else {
            Pacing::Flow
        }
    }

    /// Write `chunk` to `sink`, then report the pacing decision.
    ///
    /// The caller owns the pause: it must not pull the next chunk before the
    /// returned delay has elapsed.
    pub async fn forward<W>(&mut self, chunk: &[u8], sink: &mut W) -> std::io::Result<Pacing>
    where
        W: AsyncWrite + Unpin,
    {
        sink.write_all(chunk).await?;
        Ok(self.record(chunk.len()))
    }

    /// Signal end-of-stream downstream.
    pub async fn finish<W>(&mut self, sink: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        sink.flush().await?;
        sink.shutdown().await
    }
}
