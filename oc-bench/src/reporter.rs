// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use chrono::prelude::*;
use oc_bench_intf::{Args, Baseline, Report, RoundReport};
use std::io::Write;

use oc_util::*;

use super::pressure::Termination;

pub trait Reporter {
    fn calibrated(&mut self, baseline: &Baseline) -> Result<()>;
    fn begin(&mut self) -> Result<()>;
    fn round(&mut self, rep: &RoundReport) -> Result<()>;
    fn finish(&mut self, term: Termination) -> Result<()>;
}

const TABLE_HEADER: &str = "\
               |                     Measure Period                        |              Alloc Period                 |
total|used|swap| CPU |  MEMORY |  MEMORY |  swap   | user| sys | idle| iowt| alloc | CPU |  MEMORY |  MEMORY |  swap   |
 mem | mem| mem|     |  random |  recent |  ins    |     |     |     |     |  time |     |  random |  recent |  ins    |
------------------------------------------------------------------------------------------------------------------------";

pub fn format_row(rep: &RoundReport) -> String {
    format!(
        " {:3.0} | {:2.0} | {:2.0} | {:3.0} | {:7.3} | {:7.3} | {:7} |{:4} |{:4} |{:4} |{:4} | {:5.0} | {:3.0} | {:7.3} | {:7.3} | {:7} |",
        rep.used_pct,
        rep.anon_pct,
        rep.swap_pct,
        rep.measure.cpu_pct,
        rep.measure.random_pct,
        rep.measure.recent_pct,
        rep.measure.swapins,
        rep.ticks.user,
        rep.ticks.system,
        rep.ticks.idle,
        rep.ticks.iowait,
        rep.alloc_ms,
        rep.alloc.cpu_pct,
        rep.alloc.random_pct,
        rep.alloc.recent_pct,
        rep.alloc.swapins,
    )
}

/// Prints the results as a table on `out` and mirrors them into the JSON
/// report file if one was requested.
pub struct TableReporter<W: Write> {
    out: W,
    fill: FillPolicy,
    recent_pages: u32,
    work_time: u32,
    report_file: JsonReportFile<Report>,
}

impl<W: Write> TableReporter<W> {
    pub fn new(out: W, args: &Args, version: &str, zswap_max_pool_pct: u32) -> Self {
        let mut report_file = JsonReportFile::<Report>::new(args.report.as_ref());
        report_file.data.version = version.to_string();
        report_file.data.zswap_max_pool_pct = zswap_max_pool_pct;
        report_file.data.fill = args.fill;

        Self {
            out,
            fill: args.fill,
            recent_pages: args.recent_pages,
            work_time: args.work_time,
            report_file,
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.report_file.data.timestamp = DateTime::from(std::time::SystemTime::now());
        self.report_file.commit()
    }
}

impl<W: Write> Reporter for TableReporter<W> {
    fn calibrated(&mut self, bl: &Baseline) -> Result<()> {
        writeln!(
            self.out,
            "Baseline CPU {} MEM random {} recent {}",
            bl.cpu, bl.random, bl.recent
        )?;
        self.out.flush()?;
        self.report_file.data.baseline = *bl;
        self.commit()
    }

    fn begin(&mut self) -> Result<()> {
        writeln!(self.out, "{}", self.fill.describe())?;
        writeln!(self.out, "All mem units % of total physical mem")?;
        writeln!(self.out, "CPU and MEMORY units % of baseline measurement")?;
        writeln!(self.out, "Allocation time units ms")?;
        writeln!(self.out, "Alloc period is when new memory is being allocated")?;
        writeln!(
            self.out,
            "Recent page testing {}k most recently allocated pages",
            self.recent_pages
        )?;
        writeln!(
            self.out,
            "Measure period is {} secs sleep delay to measure counters",
            self.work_time
        )?;
        writeln!(self.out)?;
        writeln!(self.out, "{}", TABLE_HEADER)?;
        self.out.flush()?;
        Ok(())
    }

    fn round(&mut self, rep: &RoundReport) -> Result<()> {
        writeln!(self.out, "{}", format_row(rep))?;
        if let Some(lat) = rep.random_lat.as_ref() {
            writeln!(
                self.out,
                "      random touch latency (usecs) min {:.3} avg {:.3} max {:.3} count {} errors {}",
                lat.min, lat.avg, lat.max, lat.count, lat.errors
            )?;
        }
        self.out.flush()?;
        self.report_file.data.rounds.push(rep.clone());
        self.commit()
            .with_context(|| format!("Updating report for round {}", rep.round))
    }

    fn finish(&mut self, term: Termination) -> Result<()> {
        writeln!(self.out, "{}", term)?;
        self.out.flush()?;
        self.report_file.data.termination = Some(format!("{:?}", term));
        self.commit()
    }
}
