// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Result};
use log::{debug, info};
use std::collections::HashMap;

use oc_util::sysstat::{self, SwapInSource, ANON_PAGES, MEM_TOTAL, SWAP_FREE, SWAP_TOTAL};
use oc_util::*;

/// Where the benchmark gets its system readings from. Memory values are in
/// kB, CPU ticks and swap-in counts are cumulative since boot.
pub trait MetricSource {
    fn meminfo(&mut self) -> Result<HashMap<String, u64>>;
    fn cpu_ticks(&mut self) -> Result<CpuTicks>;
    /// None if no swap-in counter is available.
    fn swap_in_count(&mut self) -> Option<u64>;
    fn zswap_max_pool_pct(&mut self) -> Option<u32>;
}

/// Reads /proc, sysfs and debugfs.
pub struct ProcMetrics {
    swap_in: Option<SwapInSource>,
}

impl ProcMetrics {
    pub fn new() -> Self {
        let swap_in = SwapInSource::detect();
        match swap_in {
            Some(SwapInSource::FrontswapLoads) => info!("metrics: Using frontswap loads for swap-ins"),
            Some(SwapInSource::Pswpin) => info!("metrics: Using pswpin for swap-ins"),
            None => info!("metrics: No swap-in counter available, reporting 0"),
        }
        Self { swap_in }
    }
}

impl MetricSource for ProcMetrics {
    fn meminfo(&mut self) -> Result<HashMap<String, u64>> {
        sysstat::read_meminfo()
    }

    fn cpu_ticks(&mut self) -> Result<CpuTicks> {
        sysstat::read_cpu_ticks()
    }

    fn swap_in_count(&mut self) -> Option<u64> {
        self.swap_in.as_ref().and_then(|src| src.read())
    }

    fn zswap_max_pool_pct(&mut self) -> Option<u32> {
        sysstat::read_zswap_max_pool_pct()
    }
}

/// The subset of meminfo the benchmark cares about, in kB.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemUsage {
    pub total: u64,
    pub anon: u64,
    pub swap_total: u64,
    pub swap_free: u64,
}

impl MemUsage {
    pub fn from_meminfo(map: &HashMap<String, u64>) -> Result<Self> {
        let get = |key: &str| {
            map.get(key)
                .copied()
                .ok_or_else(|| anyhow!("{:?} missing from meminfo", key))
        };
        let usage = Self {
            total: get(MEM_TOTAL)?,
            anon: get(ANON_PAGES)?,
            swap_total: get(SWAP_TOTAL)?,
            swap_free: get(SWAP_FREE)?,
        };
        if usage.total == 0 {
            bail!("{} is zero", MEM_TOTAL);
        }
        Ok(usage)
    }

    pub fn read(src: &mut dyn MetricSource) -> Result<Self> {
        Self::from_meminfo(&src.meminfo()?)
    }

    pub fn swap_used(&self) -> u64 {
        self.swap_total.saturating_sub(self.swap_free)
    }

    /// Anon plus swapped out memory.
    pub fn used(&self) -> u64 {
        self.anon + self.swap_used()
    }

    fn pct_of_total(&self, kb: u64) -> f64 {
        kb as f64 * TO_PCT / self.total as f64
    }

    pub fn used_pct(&self) -> f64 {
        self.pct_of_total(self.used())
    }

    pub fn anon_pct(&self) -> f64 {
        self.pct_of_total(self.anon)
    }

    pub fn swap_pct(&self) -> f64 {
        self.pct_of_total(self.swap_used())
    }

    /// Bytes to allocate before the first round, `init_pct`% of the memory
    /// which isn't in use yet. 1k if usage already exceeds the total.
    pub fn init_alloc_size(&self, init_pct: f64) -> usize {
        let used = self.used();
        if used > self.total {
            1024
        } else {
            ((self.total - used) as f64 * init_pct / TO_PCT) as usize * 1024
        }
    }

    /// Bytes to allocate each round, `inc_pct`% of the total.
    pub fn inc_alloc_size(&self, inc_pct: f64) -> usize {
        (self.total as f64 * inc_pct / TO_PCT) as usize * 1024
    }
}

/// Turns the cumulative swap-in counter into per-period deltas.
#[derive(Debug, Default)]
pub struct SwapInTracker {
    last: Option<u64>,
}

impl SwapInTracker {
    /// Swap-ins since the previous call. The first call and calls without
    /// a counter return 0.
    pub fn delta(&mut self, src: &mut dyn MetricSource) -> u64 {
        match src.swap_in_count() {
            Some(now) => {
                let delta = match self.last {
                    Some(last) => now.saturating_sub(last),
                    None => 0,
                };
                self.last = Some(now);
                delta
            }
            None => {
                if self.last.take().is_some() {
                    debug!("metrics: Swap-in counter disappeared");
                }
                0
            }
        }
    }
}
