// Copyright (c) Facebook, Inc. and its affiliates.
use oc_util::*;

pub mod args;
pub mod report;

pub use args::{Args, RecentMode};
pub use report::{Baseline, LatencyStat, PeriodStat, Report, RoundReport};

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
    pub static ref FULL_VERSION: String = full_version(*VERSION);
}
