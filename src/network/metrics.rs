use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Number of slots kept in the rolling window (12 hours of one-minute slots).
pub const BLOCK_TIME_WINDOW_SIZE: usize = 60 * 12;
/// Blocks per slot: one minute of blocks at two blocks per second.
pub const BLOCK_COUNT_PER_SLOT: u32 = 2 * 60;
pub const PRINT_SYNC_INFO_INTERVAL: Duration = Duration::from_secs(10);

/// Sync throughput statistics for one connection.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    block_counter: u32,
    total_bytes: u64,
    slot_start: Option<Instant>,
    /// (bytes, duration) per completed slot, oldest first.
    window: VecDeque<(u64, Duration)>,
    last_report: Option<Instant>,
}

/// Snapshot of sync speed, logged periodically while blocks are ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub blocks_per_sec: f64,
    pub kb_per_sec: f64,
    pub block_num: u32,
    /// Blocks left until the peer's advertised head, with the estimated time.
    pub remaining: Option<(u32, Duration)>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Accounts one ingested block. The first block only starts the clock.
    pub fn record_block(&mut self, block_size: usize, now: Instant) {
        let Some(start) = self.slot_start else {
            self.slot_start = Some(now);
            return;
        };

        self.block_counter += 1;
        self.total_bytes += block_size as u64;

        if self.block_counter == BLOCK_COUNT_PER_SLOT {
            self.window.push_back((self.total_bytes, now.duration_since(start)));
            if self.window.len() > BLOCK_TIME_WINDOW_SIZE {
                self.window.pop_front();
            }
            self.block_counter = 0;
            self.total_bytes = 0;
            self.slot_start = Some(now);
        }
    }

    /// Blocks per second and kilobytes per second over the window.
    pub fn throughput(&self) -> Option<(f64, f64)> {
        let (bytes, secs) = self
            .window
            .iter()
            .fold((0u64, 0f64), |(b, t), (bytes, d)| (b + bytes, t + d.as_secs_f64()));
        if self.window.is_empty() || secs <= 0.0 {
            return None;
        }
        let blocks = (self.window.len() as u64 * u64::from(BLOCK_COUNT_PER_SLOT)) as f64;
        Some((blocks / secs, bytes as f64 / secs / 1024.0))
    }

    /// Returns a report at most once per [`PRINT_SYNC_INFO_INTERVAL`].
    pub fn report(&mut self, now: Instant, block_num: u32, remote_head: Option<u32>) -> Option<SyncReport> {
        let last = *self.last_report.get_or_insert(now);
        if now.duration_since(last) < PRINT_SYNC_INFO_INTERVAL {
            return None;
        }
        self.last_report = Some(now);

        let (blocks_per_sec, kb_per_sec) = self.throughput()?;
        let remaining = remote_head
            .filter(|head| *head > block_num)
            .map(|head| {
                let left = head - block_num;
                (left, Duration::from_secs_f64(f64::from(left) / blocks_per_sec))
            });
        Some(SyncReport {
            blocks_per_sec,
            kb_per_sec,
            block_num,
            remaining,
        })
    }
}

/// Formats a duration as `DDd:HHh:MMm:SSs`, dropping leading zero units down to minutes.
pub fn format_eta(eta: Duration) -> String {
    let total = eta.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    if days > 0 {
        format!("{:02}d:{:02}h:{:02}m:{:02}s", days, hours, minutes, seconds)
    } else if hours > 0 {
        format!("{:02}h:{:02}m:{:02}s", hours, minutes, seconds)
    } else {
        format!("{:02}m:{:02}s", minutes, seconds)
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remaining {
            Some((blocks, eta)) => write!(
                f,
                "in sync, estimated remaining time: {}, {:.1} b/s, {:.1} KB/s, current block num: {}, remaining blocks: {}",
                format_eta(eta),
                self.blocks_per_sec,
                self.kb_per_sec,
                self.block_num,
                blocks
            ),
            None => write!(
                f,
                "block speed: {:.1} b/s, {:.1} KB/s, current block num: {}",
                self.blocks_per_sec, self.kb_per_sec, self.block_num
            ),
        }
    }
}
