//! Transfer progress tracking
//!
//! Logs throughput every N MB of a download attempt and a summary when the
//! attempt completes.

use std::time::Instant;

use super::bytes_to_mb;
use crate::{log_debug, log_info};

pub struct ProgressTracker {
    /// Label for log lines (usually the destination file name)
    label: String,
    module: &'static str,
    /// 0 when the server did not send a length
    total_bytes: u64,
    processed_bytes: u64,
    start_time: Instant,
    last_log_time: Instant,
    last_log_bytes: u64,
    log_interval_bytes: u64,
}

impl ProgressTracker {
    pub fn new(label: &str, module: &'static str, total_bytes: u64, log_interval_mb: u64) -> Self {
        let now = Instant::now();
        Self {
            label: label.to_string(),
            module,
            total_bytes,
            processed_bytes: 0,
            start_time: now,
            last_log_time: now,
            last_log_bytes: 0,
            log_interval_bytes: log_interval_mb * 1024 * 1024,
        }
    }

    /// Record `bytes_added`; logs when an interval boundary is crossed
    pub fn update(&mut self, bytes_added: u64) {
        self.processed_bytes += bytes_added;

        if self.log_interval_bytes == 0 {
            return;
        }

        let current_interval = self.processed_bytes / self.log_interval_bytes;
        let last_interval = self.last_log_bytes / self.log_interval_bytes;
        if current_interval <= last_interval {
            return;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_log_time).as_secs_f64();
        let speed_mbps = if elapsed > 0.0 {
            bytes_to_mb(self.processed_bytes - self.last_log_bytes) / elapsed
        } else {
            0.0
        };
        self.last_log_time = now;
        self.last_log_bytes = self.processed_bytes;

        if self.total_bytes > 0 {
            log_debug!(
                self.module,
                "{}: {:.1} MB / {:.1} MB ({:.1}%) @ {:.1} MB/s",
                self.label,
                bytes_to_mb(self.processed_bytes),
                bytes_to_mb(self.total_bytes),
                self.processed_bytes as f64 / self.total_bytes as f64 * 100.0,
                speed_mbps
            );
        } else {
            log_debug!(
                self.module,
                "{}: {:.1} MB @ {:.1} MB/s",
                self.label,
                bytes_to_mb(self.processed_bytes),
                speed_mbps
            );
        }
    }

    /// Log the completion summary
    pub fn finish(&self) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let total_mb = bytes_to_mb(self.processed_bytes);
        let avg_speed = if elapsed > 0.0 { total_mb / elapsed } else { 0.0 };

        log_info!(
            self.module,
            "{} complete: {} bytes in {:.1}s (avg {:.2} MB/s)",
            self.label,
            self.processed_bytes,
            elapsed,
            avg_speed
        );
    }
}
