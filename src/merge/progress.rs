//! Progress counters and cancellation tokens shared with the scheduler.

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, Ordering};

use crate::part::FuturePart;

/// Merge-list entry: live counters for one running merge, plus its per-task
/// cancellation flag. Written by the task thread, read concurrently by
/// introspection.
#[derive(Debug, Default)]
pub struct MergeProgress {
    total_rows_count: u64,
    total_size_bytes_compressed: u64,
    rows_read: AtomicU64,
    rows_written: AtomicU64,
    bytes_read_uncompressed: AtomicU64,
    bytes_written_uncompressed: AtomicU64,
    columns_written: AtomicU64,
    progress_bits: AtomicU64,
    is_cancelled: AtomicBool,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct MergeProgressSnapshot {
    pub total_rows_count: u64,
    pub total_size_bytes_compressed: u64,
    pub rows_read: u64,
    pub rows_written: u64,
    pub bytes_read_uncompressed: u64,
    pub bytes_written_uncompressed: u64,
    pub columns_written: u64,
    pub progress: f64,
}

impl MergeProgress {
    pub fn new(total_rows_count: u64, total_size_bytes_compressed: u64) -> Self {
        Self {
            total_rows_count,
            total_size_bytes_compressed,
            ..Default::default()
        }
    }

    pub fn for_future_part(future_part: &FuturePart) -> Self {
        Self::new(future_part.total_rows(), future_part.total_bytes_on_disk())
    }

    pub fn total_rows_count(&self) -> u64 {
        self.total_rows_count
    }

    pub fn total_size_bytes_compressed(&self) -> u64 {
        self.total_size_bytes_compressed
    }

    pub fn add_rows_read(&self, rows: u64) {
        self.rows_read.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read.load(Ordering::Relaxed)
    }

    pub fn add_rows_written(&self, rows: u64) {
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    pub fn add_bytes_read_uncompressed(&self, bytes: u64) {
        self.bytes_read_uncompressed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_written_uncompressed(&self, bytes: u64) {
        self.bytes_written_uncompressed
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_columns_written(&self, columns: u64) {
        self.columns_written.store(columns, Ordering::Relaxed);
    }

    pub fn add_columns_written(&self, columns: u64) {
        self.columns_written.fetch_add(columns, Ordering::Relaxed);
    }

    pub fn set_progress(&self, fraction: f64) {
        self.progress_bits
            .store(fraction.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress_bits.load(Ordering::Relaxed))
    }

    pub fn cancel(&self) {
        self.is_cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MergeProgressSnapshot {
        MergeProgressSnapshot {
            total_rows_count: self.total_rows_count,
            total_size_bytes_compressed: self.total_size_bytes_compressed,
            rows_read: self.rows_read.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            bytes_read_uncompressed: self.bytes_read_uncompressed.load(Ordering::Relaxed),
            bytes_written_uncompressed: self.bytes_written_uncompressed.load(Ordering::Relaxed),
            columns_written: self.columns_written.load(Ordering::Relaxed),
            progress: self.progress(),
        }
    }
}

/// Counting blocker: holding any [`ActionLock`] cancels the guarded action
/// class for as long as the lock lives.
#[derive(Debug, Default)]
pub struct ActionBlocker {
    blockers: AtomicIsize,
}

impl ActionBlocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.blockers.load(Ordering::Relaxed) > 0
    }

    pub fn cancel(&self) -> ActionLock<'_> {
        self.blockers.fetch_add(1, Ordering::Relaxed);
        ActionLock { blocker: self }
    }
}

/// RAII guard returned by [`ActionBlocker::cancel`].
#[derive(Debug)]
pub struct ActionLock<'a> {
    blocker: &'a ActionBlocker,
}

impl Drop for ActionLock<'_> {
    fn drop(&mut self) {
        self.blocker.blockers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Disk reservation shared with the scheduler; shrunk as the merge advances.
#[derive(Debug)]
pub struct Reservation {
    size: AtomicU64,
}

impl Reservation {
    pub fn new(bytes: u64) -> Self {
        Self {
            size: AtomicU64::new(bytes),
        }
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn update(&self, bytes: u64) {
        self.size.store(bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocker_cancels_while_lock_held() {
        let blocker = ActionBlocker::new();
        assert!(!blocker.is_cancelled());
        {
            let _lock = blocker.cancel();
            assert!(blocker.is_cancelled());
            let _second = blocker.cancel();
            assert!(blocker.is_cancelled());
        }
        assert!(!blocker.is_cancelled());
    }

    #[test]
    fn progress_fraction_round_trips() {
        let progress = MergeProgress::new(100, 1000);
        progress.set_progress(0.25);
        assert!((progress.progress() - 0.25).abs() < f64::EPSILON);
        progress.set_progress(7.0);
        assert!((progress.progress() - 1.0).abs() < f64::EPSILON);
    }
}
