// Copyright (c) Facebook, Inc. and its affiliates.
use oc_bench_intf::LatencyStat;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Running latency statistics kept privately by the touching thread.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LatencyAcc {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: u64,
    pub errors: u64,
}

impl LatencyAcc {
    pub fn record(&mut self, lat: f64) {
        if self.count == 0 {
            self.min = lat;
            self.max = lat;
        } else {
            self.min = self.min.min(lat);
            self.max = self.max.max(lat);
        }
        // Cumulative average, loses precision once count gets very large.
        self.avg = (self.avg * self.count as f64 + lat) / (self.count + 1) as f64;
        self.count += 1;
    }

    pub fn error(&mut self) {
        self.errors += 1;
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }
}

/// Latency statistics published by a single worker and read by the
/// controller. The controller can't clear the fields directly. Instead it
/// raises the reset flag and the worker starts over on its next sample.
#[derive(Debug, Default)]
pub struct LatencyStats {
    reset: AtomicBool,
    min: AtomicU64,
    max: AtomicU64,
    avg: AtomicU64,
    count: AtomicU64,
    errors: AtomicU64,
}

impl LatencyStats {
    pub fn request_reset(&self) {
        self.reset.store(true, Ordering::Relaxed);
    }

    /// Worker side. Consume a pending reset request.
    pub fn take_reset(&self) -> bool {
        self.reset.swap(false, Ordering::Relaxed)
    }

    pub fn publish(&self, acc: &LatencyAcc) {
        self.min.store(acc.min.to_bits(), Ordering::Relaxed);
        self.max.store(acc.max.to_bits(), Ordering::Relaxed);
        self.avg.store(acc.avg.to_bits(), Ordering::Relaxed);
        self.count.store(acc.count, Ordering::Relaxed);
        self.errors.store(acc.errors, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencyStat {
        LatencyStat {
            min: f64::from_bits(self.min.load(Ordering::Relaxed)),
            max: f64::from_bits(self.max.load(Ordering::Relaxed)),
            avg: f64::from_bits(self.avg.load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LatencyAcc, LatencyStats};

    #[test]
    fn test_latency_acc() {
        let mut acc = LatencyAcc::default();
        for lat in &[4.0, 2.0, 9.0] {
            acc.record(*lat);
        }
        acc.error();
        assert_eq!(acc.min, 2.0);
        assert_eq!(acc.max, 9.0);
        assert_eq!(acc.avg, 5.0);
        assert_eq!(acc.count, 3);
        assert_eq!(acc.errors, 1);

        acc.reset();
        acc.record(7.0);
        assert_eq!((acc.min, acc.max, acc.avg, acc.count), (7.0, 7.0, 7.0, 1));
    }

    #[test]
    fn test_latency_stats_reset_flag() {
        let stats = LatencyStats::default();
        let mut acc = LatencyAcc::default();
        acc.record(3.0);
        stats.publish(&acc);
        assert_eq!(stats.snapshot().count, 1);
        assert_eq!(stats.snapshot().avg, 3.0);

        assert!(!stats.take_reset());
        stats.request_reset();
        assert!(stats.take_reset());
        assert!(!stats.take_reset());

        // A request right after a take isn't lost.
        stats.request_reset();
        stats.request_reset();
        assert!(stats.take_reset());
        assert!(!stats.take_reset());
    }
}
