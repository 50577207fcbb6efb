// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::info;
use oc_bench_intf::Baseline;
use std::time::Duration;

use oc_util::*;

use super::pressure::verify_baseline;
use super::workers::{WorkerKind, Workers};

#[derive(Clone, Debug)]
pub struct CalibrateConfig {
    pub work_window: Duration,
    pub cpu: bool,
    pub random: bool,
    pub recent: bool,
    /// Pages allocated before the page workers are calibrated.
    pub batch_bytes: usize,
}

fn measure(workers: &mut Workers, kind: WorkerKind, window: Duration) -> Result<u64> {
    workers.start(kind)?;
    workers.reset(kind);
    if wait_prog_state(window) == ProgState::Exiting {
        bail!("Interrupted while calibrating {} worker", kind.name());
    }
    let count = workers.read(kind);
    info!("calibrate: {} baseline {}", kind.name(), count);
    Ok(count)
}

/// Measure each enabled worker alone over one work window. The CPU and
/// random workers are left paused, the recent worker keeps running.
pub fn calibrate(workers: &mut Workers, cfg: &CalibrateConfig) -> Result<Baseline> {
    let mut bl = Baseline {
        window_ms: cfg.work_window.as_nanos() as f64 / 1_000_000.0,
        ..Default::default()
    };

    if cfg.cpu {
        bl.cpu = measure(workers, WorkerKind::Cpu, cfg.work_window)?;
        workers.pause(WorkerKind::Cpu);
    }

    let pool = workers.pool().clone();
    let want = pool.pages_for(cfg.batch_bytes);
    let nr = pool.alloc_pages(cfg.batch_bytes);
    if nr < want {
        bail!("Failed to allocate calibration pages ({} of {})", nr, want);
    }

    if cfg.random {
        bl.random = measure(workers, WorkerKind::Random, cfg.work_window)?;
        workers.pause(WorkerKind::Random);
    }

    if cfg.recent {
        bl.recent = measure(workers, WorkerKind::Recent, cfg.work_window)?;
    }

    verify_baseline(workers, &bl)?;
    Ok(bl)
}
