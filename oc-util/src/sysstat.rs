// Copyright (c) Facebook, Inc. and its affiliates.

//! Raw readers for the kernel memory, CPU and swap accounting files.
//!
//! Parsing is split from reading so that the formats can be tested without
//! the files being present. All memory values are in kB as reported by the
//! kernel.
use anyhow::{bail, Context, Result};
use log::{debug, trace};
use scan_fmt::scan_fmt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

use super::{read_flat_keyed_file, read_one_line};

pub const MEMINFO_PATH: &str = "/proc/meminfo";
pub const STAT_PATH: &str = "/proc/stat";
pub const VMSTAT_PATH: &str = "/proc/vmstat";
pub const FRONTSWAP_LOADS_PATH: &str = "/sys/kernel/debug/frontswap/loads";
pub const ZSWAP_MAX_POOL_PCT_PATH: &str = "/sys/module/zswap/parameters/max_pool_percent";

pub const MEM_TOTAL: &str = "MemTotal";
pub const ANON_PAGES: &str = "AnonPages";
pub const SWAP_TOTAL: &str = "SwapTotal";
pub const SWAP_FREE: &str = "SwapFree";

fn squash_whitespace(line: &str) -> String {
    line.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Parse /proc/meminfo content into a key -> kB map. Lines which don't
/// follow the "Key: value [kB]" format are skipped.
pub fn parse_meminfo(input: &str) -> HashMap<String, u64> {
    let mut map = HashMap::new();
    for line in input.lines() {
        if let Ok((key, val)) = scan_fmt!(&squash_whitespace(line), "{}: {d}", String, u64) {
            map.insert(key, val);
        }
    }
    map
}

pub fn read_meminfo() -> Result<HashMap<String, u64>> {
    let buf = fs::read_to_string(MEMINFO_PATH).with_context(|| format!("Reading {}", MEMINFO_PATH))?;
    let map = parse_meminfo(&buf);
    if map.is_empty() {
        bail!("No entries found in {}", MEMINFO_PATH);
    }
    Ok(map)
}

/// Cumulative CPU time since boot in USER_HZ ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTicks {
    pub user: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
}

impl CpuTicks {
    /// Ticks accumulated since `prev`. Counters which went backwards (CPU
    /// hot-unplug) contribute zero instead of wrapping.
    pub fn since(&self, prev: &CpuTicks) -> CpuTicks {
        CpuTicks {
            user: self.user.saturating_sub(prev.user),
            system: self.system.saturating_sub(prev.system),
            idle: self.idle.saturating_sub(prev.idle),
            iowait: self.iowait.saturating_sub(prev.iowait),
        }
    }
}

/// Parse the aggregate "cpu" line of /proc/stat. nice is folded into user,
/// and irq and softirq into system.
pub fn parse_cpu_ticks(input: &str) -> Result<CpuTicks> {
    for line in input.lines() {
        if !line.starts_with("cpu ") {
            continue;
        }
        let (user, nice, system, idle, iowait, irq, softirq) = scan_fmt!(
            &squash_whitespace(line),
            "cpu {d} {d} {d} {d} {d} {d} {d}",
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
            u64
        )
        .with_context(|| format!("Parsing {:?}", line))?;
        return Ok(CpuTicks {
            user: user + nice,
            system: system + irq + softirq,
            idle,
            iowait,
        });
    }
    bail!("Aggregate cpu line not found")
}

pub fn read_cpu_ticks() -> Result<CpuTicks> {
    let buf = fs::read_to_string(STAT_PATH).with_context(|| format!("Reading {}", STAT_PATH))?;
    parse_cpu_ticks(&buf).with_context(|| format!("Parsing {}", STAT_PATH))
}

/// Where swap-in counts come from. frontswap loads are what zswap hits
/// show up as, pswpin is the generic fallback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapInSource {
    FrontswapLoads,
    Pswpin,
}

impl SwapInSource {
    pub fn detect() -> Option<Self> {
        let src = if read_frontswap_loads().is_some() {
            Some(SwapInSource::FrontswapLoads)
        } else if read_pswpin().is_some() {
            Some(SwapInSource::Pswpin)
        } else {
            None
        };
        debug!("sysstat: swap-in source {:?}", &src);
        src
    }

    pub fn read(&self) -> Option<u64> {
        match self {
            SwapInSource::FrontswapLoads => read_frontswap_loads(),
            SwapInSource::Pswpin => read_pswpin(),
        }
    }
}

pub fn read_frontswap_loads() -> Option<u64> {
    match read_one_line(FRONTSWAP_LOADS_PATH) {
        Ok(line) => line.trim().parse::<u64>().ok(),
        Err(e) => {
            trace!("sysstat: {} unavailable ({:?})", FRONTSWAP_LOADS_PATH, &e);
            None
        }
    }
}

pub fn read_pswpin() -> Option<u64> {
    read_flat_keyed_file(VMSTAT_PATH)
        .ok()
        .and_then(|map| map.get("pswpin").copied())
}

/// zswap's max_pool_percent, None if zswap isn't built in or loaded.
pub fn read_zswap_max_pool_pct() -> Option<u32> {
    read_one_line(ZSWAP_MAX_POOL_PCT_PATH)
        .ok()
        .and_then(|line| line.trim().parse::<u32>().ok())
}
