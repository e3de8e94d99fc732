//! Completion and channel statistics
//!
//! Lock-free counters, one cache-line-aligned block per poller thread so
//! workers never share a line. The same events are mirrored to the
//! `metrics` facade for whatever recorder the process installs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-worker completion counters (cache-line aligned)
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub polls: AtomicU64,
    pub empty_polls: AtomicU64,
    pub completions: AtomicU64,
    pub failed_completions: AtomicU64,
    pub bytes: AtomicU64,
    pub handler_misses: AtomicU64,
    pub handler_errors: AtomicU64,
}

impl WorkerStats {
    #[inline(always)]
    pub fn record_poll(&self, drained: usize) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        if drained == 0 {
            self.empty_polls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub fn record_completion(&self, byte_len: u32, success: bool) {
        self.completions.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(byte_len as u64, Ordering::Relaxed);
        if !success {
            self.failed_completions.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub fn record_miss(&self) {
        self.handler_misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fabric.poller.handler_misses").increment(1);
    }

    #[inline(always)]
    pub fn record_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fabric.poller.handler_errors").increment(1);
    }

    pub fn snapshot(&self) -> PollerStatsSnapshot {
        PollerStatsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            failed_completions: self.failed_completions.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            handler_misses: self.handler_misses.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

/// Poller stats snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStatsSnapshot {
    pub polls: u64,
    pub empty_polls: u64,
    pub completions: u64,
    pub failed_completions: u64,
    pub bytes: u64,
    pub handler_misses: u64,
    pub handler_errors: u64,
}

impl PollerStatsSnapshot {
    /// Share of polls that drained at least one completion
    pub fn busy_ratio(&self) -> f64 {
        if self.polls == 0 {
            return 0.0;
        }
        (self.polls - self.empty_polls) as f64 / self.polls as f64
    }

    fn add(&mut self, other: &PollerStatsSnapshot) {
        self.polls += other.polls;
        self.empty_polls += other.empty_polls;
        self.completions += other.completions;
        self.failed_completions += other.failed_completions;
        self.bytes += other.bytes;
        self.handler_misses += other.handler_misses;
        self.handler_errors += other.handler_errors;
    }
}

/// Stats across all poller workers
#[derive(Debug)]
pub struct PollerStats {
    workers: Vec<WorkerStats>,
}

impl PollerStats {
    pub fn new(num_workers: usize) -> Self {
        Self {
            workers: (0..num_workers).map(|_| WorkerStats::default()).collect(),
        }
    }

    pub fn worker(&self, idx: usize) -> Option<&WorkerStats> {
        self.workers.get(idx)
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn total(&self) -> PollerStatsSnapshot {
        let mut total = PollerStatsSnapshot::default();
        for worker in &self.workers {
            total.add(&worker.snapshot());
        }
        total
    }
}

/// Per-channel counters
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub sends_posted: AtomicU64,
    pub recvs_posted: AtomicU64,
    pub items_extracted: AtomicU64,
    pub transfers_started: AtomicU64,
    pub transfers_completed: AtomicU64,
    pub packets_acked: AtomicU64,
}

impl ChannelStats {
    #[inline(always)]
    pub fn record_send(&self, n: u64) {
        self.sends_posted.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("fabric.channel.sends").increment(n);
    }

    #[inline(always)]
    pub fn record_recv(&self, n: u64) {
        self.recvs_posted.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("fabric.channel.recvs").increment(n);
    }

    #[inline(always)]
    pub fn record_extract(&self) {
        self.items_extracted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_transfer_start(&self) {
        self.transfers_started.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fabric.transfer.started").increment(1);
    }

    #[inline(always)]
    pub fn record_packet_ack(&self, completed_transfer: bool) {
        self.packets_acked.fetch_add(1, Ordering::Relaxed);
        if completed_transfer {
            self.transfers_completed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("fabric.transfer.completed").increment(1);
        }
    }

    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            sends_posted: self.sends_posted.load(Ordering::Relaxed),
            recvs_posted: self.recvs_posted.load(Ordering::Relaxed),
            items_extracted: self.items_extracted.load(Ordering::Relaxed),
            transfers_started: self.transfers_started.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            packets_acked: self.packets_acked.load(Ordering::Relaxed),
        }
    }
}

/// Channel stats snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStatsSnapshot {
    pub sends_posted: u64,
    pub recvs_posted: u64,
    pub items_extracted: u64,
    pub transfers_started: u64,
    pub transfers_completed: u64,
    pub packets_acked: u64,
}
