// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, error, info, warn};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use oc_bench_intf::{Args, FULL_VERSION};
use oc_util::*;

mod calibrate;
mod latency;
mod metrics;
mod pressure;
mod reporter;
mod workers;

use calibrate::CalibrateConfig;
use metrics::{MemUsage, MetricSource, ProcMetrics};
use pressure::{PressureConfig, Termination};
use reporter::{Reporter, TableReporter};
use workers::{WorkerConfig, Workers};

/// Paused workers recheck their flag this often.
const PAUSE_QUANTUM: Duration = Duration::from_secs(1);

/// The pool may grow to this many times the number of physical pages.
const PAGE_BUDGET_MULT: usize = 2;

fn run(args: &Args) -> Result<()> {
    let mut metrics = ProcMetrics::new();
    let zswap_pct = metrics.zswap_max_pool_pct().unwrap_or(0);

    println!("Version {}", *FULL_VERSION);
    println!("zswap max pool pct {}", zswap_pct);

    let mut reporter = TableReporter::new(std::io::stdout(), args, &FULL_VERSION, zswap_pct);

    //
    // Size the pool and start calibrating.
    //
    let max_pages = nr_phys_pages() * PAGE_BUDGET_MULT;
    let pool = Arc::new(PagePool::new(*PAGE_SIZE, max_pages, args.fill)?);
    info!(
        "Page budget {} pages ({}), {} cpus, page size {}",
        max_pages,
        format_size(max_pages * *PAGE_SIZE),
        nr_cpus(),
        *PAGE_SIZE
    );

    let mut workers = Workers::new(
        pool.clone(),
        WorkerConfig {
            nr_cpus: nr_cpus(),
            quantum: PAUSE_QUANTUM,
            recent_window: args.recent_window_pages(),
            recent_mode: args.recent_mode,
            latency: args.latency,
        },
    );

    println!("Getting baseline numbers");
    let baseline = calibrate::calibrate(
        &mut workers,
        &CalibrateConfig {
            work_window: args.work_window(),
            cpu: !args.no_cpu,
            random: !args.no_random,
            recent: !args.no_recent,
            batch_bytes: args.recent_window_pages() * *PAGE_SIZE,
        },
    )?;
    reporter.calibrated(&baseline)?;

    //
    // Bring memory usage close to the limit before starting the rounds.
    //
    let usage = MemUsage::read(&mut metrics)?;
    let init_bytes = usage.init_alloc_size(args.init_pct);
    let inc_bytes = usage.inc_alloc_size(args.inc_pct);
    debug!("{:?} init={} inc={}", &usage, init_bytes, inc_bytes);

    println!("Allocating {}m of initial memory", init_bytes >> 20);
    let want = pool.pages_for(init_bytes);
    let nr = pool.alloc_pages(init_bytes);
    if nr < want {
        warn!("Allocated only {} of {} initial pages", nr, want);
        return reporter.finish(Termination::AllocationShort);
    }

    reporter.begin()?;

    let term = pressure::run(
        &workers,
        &mut metrics,
        &mut reporter,
        &baseline,
        &PressureConfig {
            max_pages,
            inc_bytes,
            max_used_pct: args.max_used_pct,
            work_window: args.work_window(),
        },
    )?;
    info!("Finished after {} pages ({})", pool.len(), &term);
    reporter.finish(term)
}

fn main() {
    let args_file = match Args::init_args_and_logging() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Failed to process arguments ({:#})", &e);
            exit(1);
        }
    };
    let args = &args_file.data;
    debug!("arguments: {:#?}", args);

    debug_assert!({
        warn!("Built with debug profile, measurements may be skewed");
        true
    });

    setup_prog_state();

    // Worker threads are left running and die with the process.
    if let Err(e) = run(args) {
        error!("{:#}", &e);
        exit(1);
    }
}
