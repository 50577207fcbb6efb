// Copyright (c) Facebook, Inc. and its affiliates.
use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::UNIX_EPOCH;

use oc_util::*;

const BASELINE_DOC: &str = "\
//  baseline.cpu: Summed CPU worker iterations over one work window
//  baseline.random: Random page touches over one work window
//  baseline.recent: Recent page touches over one work window
//  baseline.window_ms: Work window length in msecs
";

/// Unloaded throughput of each worker kind. Disabled workers stay at zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub cpu: u64,
    pub random: u64,
    pub recent: u64,
    pub window_ms: f64,
}

impl Baseline {
    pub fn nominal_ms(&self) -> f64 {
        self.window_ms
    }
}

/// Per-touch latency of the random page worker over one measure window,
/// in microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStat {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: u64,
    pub errors: u64,
}

/// Worker throughput over one period as % of the time-scaled baseline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodStat {
    pub cpu_pct: f64,
    pub random_pct: f64,
    pub recent_pct: f64,
    pub swapins: u64,
}

const ROUND_DOC: &str = "\
//  rounds[].round: Pressure round index starting from 0
//  rounds[].used_pct: Anon plus used swap as % of physical memory
//  rounds[].anon_pct: Anon as % of physical memory
//  rounds[].swap_pct: Used swap as % of physical memory
//  rounds[].measure: Worker throughput and swap-ins over the measure window
//  rounds[].ticks: CPU ticks over the measure window
//  rounds[].alloc_ms: Duration of the allocation
//  rounds[].alloc: Worker throughput and swap-ins while allocating
//  rounds[].nr_pages: Pages in the pool after the allocation
//  rounds[].random_lat: Random touch latencies in usecs if enabled
";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundReport {
    pub round: u32,
    pub used_pct: f64,
    pub anon_pct: f64,
    pub swap_pct: f64,
    pub measure: PeriodStat,
    pub ticks: CpuTicks,
    pub alloc_ms: f64,
    pub alloc: PeriodStat,
    pub nr_pages: usize,
    pub random_lat: Option<LatencyStat>,
}

const REPORT_DOC_HEADER: &str = "\
//
// oc-bench run report
//
//  timestamp: The time this report was last updated at
//  version: oc-bench version
//  zswap_max_pool_pct: zswap max_pool_percent, 0 if zswap isn't available
//  fill: Page fill policy
//  termination: Why the run ended, null while in progress
";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Report {
    pub timestamp: DateTime<Local>,
    pub version: String,
    pub zswap_max_pool_pct: u32,
    pub fill: FillPolicy,
    pub baseline: Baseline,
    pub rounds: Vec<RoundReport>,
    pub termination: Option<String>,
}

impl Default for Report {
    fn default() -> Self {
        Self {
            timestamp: DateTime::from(UNIX_EPOCH),
            version: String::new(),
            zswap_max_pool_pct: 0,
            fill: Default::default(),
            baseline: Default::default(),
            rounds: vec![],
            termination: None,
        }
    }
}

impl JsonLoad for Report {}

impl JsonSave for Report {
    fn preamble() -> Option<String> {
        Some(REPORT_DOC_HEADER.to_string() + BASELINE_DOC + ROUND_DOC + "//\n")
    }
}

#[cfg(test)]
mod tests {
    use super::{Baseline, Report, RoundReport};
    use oc_util::JsonSave;

    #[test]
    fn test_report_json() {
        let mut rep = Report::default();
        rep.baseline = Baseline {
            cpu: 1000,
            random: 200,
            recent: 300,
            window_ms: 5000.0,
        };
        assert_eq!(rep.baseline.nominal_ms(), 5000.0);
        rep.rounds.push(RoundReport {
            round: 3,
            nr_pages: 42,
            ..Default::default()
        });
        rep.termination = Some("memory ceiling".into());

        let json = rep.as_json().unwrap();
        assert!(json.starts_with("//\n// oc-bench run report"));
        let body: String = json
            .lines()
            .filter(|l| !l.trim_start().starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");
        let parsed: Report = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.baseline, rep.baseline);
        assert_eq!(parsed.rounds, rep.rounds);
        assert_eq!(parsed.termination.as_deref(), Some("memory ceiling"));
    }
}
