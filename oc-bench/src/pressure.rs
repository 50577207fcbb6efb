// Copyright (c) Facebook, Inc. and its affiliates.

//! The pressure loop grows the page pool round by round and measures how
//! the background workers fare while the allocation is in progress and over
//! a fixed window afterwards.
use anyhow::{bail, Result};
use log::{debug, info};
use oc_bench_intf::{Baseline, PeriodStat, RoundReport};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use oc_util::*;

use super::metrics::{MemUsage, MetricSource, SwapInTracker};
use super::reporter::Reporter;
use super::workers::{Counts, WorkerKind, Workers};

/// Why the pressure loop stopped without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// Anon plus used swap reached the configured share of physical memory.
    MemoryCeiling,
    /// The next increment wouldn't fit in the page budget.
    BudgetExhausted,
    /// The allocator returned fewer pages than requested.
    AllocationShort,
    /// SIGINT or SIGTERM.
    Interrupted,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Termination::MemoryCeiling => "Used memory reached the ceiling, exiting",
            Termination::BudgetExhausted => "Too many pages allocated, exiting",
            Termination::AllocationShort => "Failed to allocate all requested pages, exiting",
            Termination::Interrupted => "Interrupted, exiting",
        })
    }
}

#[derive(Clone, Debug)]
pub struct PressureConfig {
    /// Page budget for the whole pool.
    pub max_pages: usize,
    /// Bytes added to the pool each round.
    pub inc_bytes: usize,
    /// Stop after the round which observes this much used memory.
    pub max_used_pct: f64,
    pub work_window: Duration,
}

/// Baseline scaled from the nominal window to `elapsed_ms`.
pub fn adjusted_baseline(baseline: u64, elapsed_ms: f64, nominal_ms: f64) -> f64 {
    baseline as f64 * (elapsed_ms / nominal_ms)
}

/// `counter` as % of the baseline scaled to `elapsed_ms`. 0 if there's
/// nothing to compare against.
pub fn normalized_pct(counter: u64, baseline: u64, elapsed_ms: f64, nominal_ms: f64) -> f64 {
    if baseline == 0 || nominal_ms <= 0.0 {
        return 0.0;
    }
    let adjusted = adjusted_baseline(baseline, elapsed_ms, nominal_ms);
    if adjusted <= 0.0 {
        return 0.0;
    }
    TO_PCT * counter as f64 / adjusted
}

fn period_stat(counts: &Counts, baseline: &Baseline, elapsed_ms: f64, swapins: u64) -> PeriodStat {
    let nominal = baseline.nominal_ms();
    PeriodStat {
        cpu_pct: normalized_pct(counts.cpu, baseline.cpu, elapsed_ms, nominal),
        random_pct: normalized_pct(counts.random, baseline.random, elapsed_ms, nominal),
        recent_pct: normalized_pct(counts.recent, baseline.recent, elapsed_ms, nominal),
        swapins,
    }
}

/// Every started worker needs a positive baseline or normalization is
/// meaningless.
pub fn verify_baseline(workers: &Workers, baseline: &Baseline) -> Result<()> {
    for kind in WorkerKind::ALL.iter() {
        let val = match kind {
            WorkerKind::Cpu => baseline.cpu,
            WorkerKind::Random => baseline.random,
            WorkerKind::Recent => baseline.recent,
        };
        if workers.is_started(*kind) && val == 0 {
            bail!("Calibration failed, {} baseline is zero", kind.name());
        }
    }
    if baseline.nominal_ms() <= 0.0 {
        bail!("Calibration window is empty");
    }
    Ok(())
}

fn budget_exhausted(pool: &PagePool, inc_bytes: usize, max_pages: usize) -> bool {
    pool.len() + pool.pages_for(inc_bytes) > max_pages
}

pub fn run(
    workers: &Workers,
    src: &mut dyn MetricSource,
    reporter: &mut dyn Reporter,
    baseline: &Baseline,
    cfg: &PressureConfig,
) -> Result<Termination> {
    verify_baseline(workers, baseline)?;

    let pool: &Arc<PagePool> = workers.pool();
    let inc_pages = pool.pages_for(cfg.inc_bytes);
    if inc_pages == 0 {
        bail!(
            "Per-round increment of {} bytes is smaller than a page",
            cfg.inc_bytes
        );
    }
    let mut swap_in = SwapInTracker::default();

    // Workers paused for calibration run from here on. Give them a quantum
    // to notice before the first allocation window opens.
    if workers.resume_started() && wait_prog_state(workers.quantum()) == ProgState::Exiting {
        return Ok(Termination::Interrupted);
    }

    info!(
        "pressure: Growing by {} pages per round, budget {} pages, ceiling {}%",
        inc_pages, cfg.max_pages, cfg.max_used_pct
    );

    let mut round: u32 = 0;
    loop {
        if prog_exiting() {
            return Ok(Termination::Interrupted);
        }
        if budget_exhausted(pool, cfg.inc_bytes, cfg.max_pages) {
            return Ok(Termination::BudgetExhausted);
        }

        // Allocation period
        workers.reset_all();
        swap_in.delta(src);
        let alloc_start = monotonic_raw()?;
        let nr_allocated = pool.alloc_pages(cfg.inc_bytes);
        let alloc_end = monotonic_raw()?;
        let alloc_counts = workers.counts();
        let alloc_ms = elapsed_ms(alloc_start, alloc_end)?;
        let alloc_swapins = swap_in.delta(src);

        if nr_allocated < inc_pages {
            info!(
                "pressure: Allocated only {} of {} pages in round {}",
                nr_allocated, inc_pages, round
            );
            return Ok(Termination::AllocationShort);
        }

        let usage = MemUsage::read(src)?;

        // Measure period
        workers.reset_all();
        workers.reset_latency();
        let ticks_before = src.cpu_ticks()?;
        let measure_start = monotonic_raw()?;
        if wait_prog_state(cfg.work_window) == ProgState::Exiting {
            return Ok(Termination::Interrupted);
        }
        let measure_counts = workers.counts();
        let measure_end = monotonic_raw()?;
        let ticks = src.cpu_ticks()?.since(&ticks_before);
        let measure_ms = elapsed_ms(measure_start, measure_end)?;
        let measure_swapins = swap_in.delta(src);

        let rep = RoundReport {
            round,
            used_pct: usage.used_pct(),
            anon_pct: usage.anon_pct(),
            swap_pct: usage.swap_pct(),
            measure: period_stat(&measure_counts, baseline, measure_ms, measure_swapins),
            ticks,
            alloc_ms,
            alloc: period_stat(&alloc_counts, baseline, alloc_ms, alloc_swapins),
            nr_pages: pool.len(),
            random_lat: workers.latency(),
        };
        debug!("pressure: {:?}", &rep);
        reporter.round(&rep)?;

        if rep.used_pct >= cfg.max_used_pct {
            return Ok(Termination::MemoryCeiling);
        }
        round += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::tests::{meminfo, FakeMetrics};
    use crate::reporter::tests::RecordingReporter;
    use crate::workers::tests::{test_cfg, test_pool, PG};

    fn test_pressure_cfg(max_pages: usize, inc_pages: usize) -> PressureConfig {
        PressureConfig {
            max_pages,
            inc_bytes: inc_pages * PG,
            max_used_pct: 120.0,
            work_window: Duration::from_millis(10),
        }
    }

    fn idle_baseline() -> Baseline {
        Baseline {
            window_ms: 10.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_normalization() {
        assert_eq!(adjusted_baseline(1000, 2500.0, 5000.0), 500.0);
        assert_eq!(normalized_pct(300, 1000, 2500.0, 5000.0), 60.0);

        let once = adjusted_baseline(700, 1200.0, 5000.0);
        let twice = adjusted_baseline(700, 2400.0, 5000.0);
        assert_eq!(twice, 2.0 * once);

        for ms in &[0.0, 1.0, 2500.0, 90000.0] {
            assert_eq!(normalized_pct(0, 1000, *ms, 5000.0), 0.0);
        }
        assert_eq!(normalized_pct(300, 0, 2500.0, 5000.0), 0.0);
        assert_eq!(normalized_pct(300, 1000, 0.0, 5000.0), 0.0);
    }

    #[test]
    fn test_budget_exhausted() {
        let workers = Workers::new(test_pool(95), test_cfg(false));
        let mut src = FakeMetrics::new(vec![meminfo(1_000_000, 100_000, 0, 0)]);
        let mut reporter = RecordingReporter::default();

        let term = run(
            &workers,
            &mut src,
            &mut reporter,
            &idle_baseline(),
            &test_pressure_cfg(100, 10),
        )
        .unwrap();
        assert_eq!(term, Termination::BudgetExhausted);
        assert_eq!(workers.pool().len(), 95);
        assert!(reporter.rounds.is_empty());
    }

    #[test]
    fn test_memory_ceiling_ends_run() {
        let workers = Workers::new(test_pool(1), test_cfg(false));
        let mut src = FakeMetrics::new(vec![
            meminfo(1_000_000, 500_000, 0, 0),
            meminfo(1_000_000, 900_000, 200_000, 100_000),
            meminfo(1_000_000, 900_000, 500_000, 200_000),
            meminfo(1_000_000, 100_000, 0, 0),
        ]);
        src.swap_ins = Some(0);
        let mut reporter = RecordingReporter::default();

        let term = run(
            &workers,
            &mut src,
            &mut reporter,
            &idle_baseline(),
            &test_pressure_cfg(1000, 4),
        )
        .unwrap();
        assert_eq!(term, Termination::MemoryCeiling);

        let rounds = &reporter.rounds;
        assert_eq!(rounds.len(), 3);
        assert_eq!(rounds[0].used_pct, 50.0);
        assert_eq!(rounds[1].used_pct, 100.0);
        assert_eq!(rounds[2].used_pct, 120.0);
        assert_eq!(rounds[2].swap_pct, 30.0);
        assert_eq!(rounds[2].round, 2);
        assert_eq!(rounds[2].nr_pages, 1 + 3 * 4);
        assert_eq!(workers.pool().len(), 1 + 3 * 4);
        assert_eq!(rounds[0].ticks.user, 10);
        assert_eq!(rounds[0].measure.swapins, 5);
        assert_eq!(rounds[0].alloc.swapins, 5);
        assert_eq!(rounds[0].measure.cpu_pct, 0.0);
        assert!(rounds[0].random_lat.is_none());
    }

    #[test]
    fn test_allocation_short_ends_run() {
        // The pool holds 1024 pages, the budget allows more.
        let workers = Workers::new(test_pool(1000), test_cfg(false));
        let mut src = FakeMetrics::new(vec![meminfo(1_000_000, 100_000, 0, 0)]);
        let mut reporter = RecordingReporter::default();

        let term = run(
            &workers,
            &mut src,
            &mut reporter,
            &idle_baseline(),
            &test_pressure_cfg(4096, 16),
        )
        .unwrap();
        assert_eq!(term, Termination::AllocationShort);
        assert_eq!(reporter.rounds.len(), 1);
        assert_eq!(workers.pool().len(), 1024);
    }

    #[test]
    fn test_zero_baseline_aborts() {
        let mut workers = Workers::new(test_pool(4), test_cfg(false));
        workers.start(WorkerKind::Recent).unwrap();
        let mut src = FakeMetrics::new(vec![meminfo(1_000_000, 100_000, 0, 0)]);
        let mut reporter = RecordingReporter::default();
        let baseline = Baseline {
            recent: 0,
            window_ms: 10.0,
            ..Default::default()
        };

        assert!(run(
            &workers,
            &mut src,
            &mut reporter,
            &baseline,
            &test_pressure_cfg(100, 1)
        )
        .is_err());
        assert!(reporter.rounds.is_empty());
        assert_eq!(workers.pool().len(), 4);
        workers.stop();
    }

    #[test]
    fn test_sub_page_increment_rejected() {
        let workers = Workers::new(test_pool(1), test_cfg(false));
        let mut src = FakeMetrics::new(vec![meminfo(1_000_000, 100_000, 0, 0)]);
        let mut reporter = RecordingReporter::default();
        let mut cfg = test_pressure_cfg(100, 1);
        cfg.inc_bytes = PG - 1;

        assert!(run(&workers, &mut src, &mut reporter, &idle_baseline(), &cfg).is_err());
        assert!(reporter.rounds.is_empty());
        assert_eq!(workers.pool().len(), 1);
    }

    #[test]
    fn test_metric_failure_is_fatal() {
        let workers = Workers::new(test_pool(1), test_cfg(false));
        let mut src = FakeMetrics::new(vec![meminfo(1_000_000, 100_000, 0, 0)]);
        src.fail_ticks = true;
        let mut reporter = RecordingReporter::default();

        assert!(run(
            &workers,
            &mut src,
            &mut reporter,
            &idle_baseline(),
            &test_pressure_cfg(100, 1)
        )
        .is_err());
        assert!(reporter.rounds.is_empty());
    }
}
