// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use clap::{App, AppSettings, ArgMatches};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use oc_util::*;

lazy_static::lazy_static! {
    static ref ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "    --no-cpu                  'Do not test CPU throughput'
                 --no-random               'Do not test random page accesses'
                 --no-recent               'Do not test recently allocated page accesses'
             -f, --fill=[POLICY]           'Fill new pages with random data: none, half or full (default: {dfl_fill})'
             -w, --work-time=[SECS]        'Measurement window, also the baseline window (default: {dfl_work_time}s)'
             -r, --recent-pages=[K]        'Touch the K*1024 most recently allocated pages (default: {dfl_recent_pages})'
                 --recent-mode=[MODE]      'Recent page access order: sweep or random (default: {dfl_recent_mode})'
             -m, --max-used=[PCT]          'Stop once anon+swap reaches PCT% of physical memory (default: {dfl_max_used})'
             -i, --inc-pct=[PCT]           'Grow the pool by PCT% of physical memory each round (default: {dfl_inc_pct})'
                 --init-pct=[PCT]          'Allocate PCT% of free memory before the first round (default: {dfl_init_pct})'
             -l, --latency                 'Track random page touch latencies'
             -R, --report=[FILE]           'Record the run in a JSON report file'
             -a, --args=[FILE]             'Load base command line arguments from FILE'
                 --total-memory=[SIZE]     'Override total memory detection'
                 --nr-cpus=[NR]            'Override cpu count detection'
             -v...                         'Sets the level of verbosity'",
            dfl_fill = format!("{:?}", dfl.fill).to_lowercase(),
            dfl_work_time = dfl.work_time,
            dfl_recent_pages = dfl.recent_pages,
            dfl_recent_mode = dfl.recent_mode.name(),
            dfl_max_used = dfl.max_used_pct,
            dfl_inc_pct = dfl.inc_pct,
            dfl_init_pct = dfl.init_pct,
        )
    };
}

const ABOUT: &str = "\
Grow anonymous memory towards and past the physical memory size while CPU
and page touching workers run in the background. Each round reports the
workers' throughput as a percentage of their unloaded baseline, both while
memory is being allocated and over a fixed window afterwards.";

const ARGS_DOC: &str = "\
//
// oc-bench command line arguments
//
// This file provides the base values for a subset of command line arguments.
// They can be overridden from command line.
//
";

/// How the recent-page worker walks the recently allocated window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecentMode {
    /// Touch the window page by page, restarting at its beginning.
    Sweep,
    /// Touch uniformly random pages inside the window.
    Random,
}

impl RecentMode {
    pub fn name(&self) -> &'static str {
        match self {
            RecentMode::Sweep => "sweep",
            RecentMode::Random => "random",
        }
    }
}

impl FromStr for RecentMode {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        Ok(match input {
            "sweep" => RecentMode::Sweep,
            "random" => RecentMode::Random,
            _ => bail!("unknown recent mode {:?}, expected sweep or random", input),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub no_cpu: bool,
    pub no_random: bool,
    pub no_recent: bool,
    pub fill: FillPolicy,
    pub work_time: u32,
    pub recent_pages: u32,
    pub recent_mode: RecentMode,
    pub max_used_pct: f64,
    pub inc_pct: f64,
    pub init_pct: f64,
    pub latency: bool,
    pub report: Option<String>,

    #[serde(skip)]
    pub verbosity: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            no_cpu: false,
            no_random: false,
            no_recent: false,
            fill: FillPolicy::Half,
            work_time: 5,
            recent_pages: 64,
            recent_mode: RecentMode::Sweep,
            max_used_pct: 120.0,
            inc_pct: 1.0,
            init_pct: 80.0,
            latency: false,
            report: None,
            verbosity: 0,
        }
    }
}

fn parse_or_exit<T>(matches: &ArgMatches, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    matches.value_of(name).map(|v| match v.parse::<T>() {
        Ok(v) => v,
        Err(e) => clap::Error::value_validation_auto(format!(
            "Invalid value {:?} for --{}: {}",
            v, name, e
        ))
        .exit(),
    })
}

fn positive_or_exit<T>(v: T, name: &str) -> T
where
    T: PartialOrd + Default + Display,
{
    if v <= T::default() {
        clap::Error::value_validation_auto(format!("--{} must be positive, got {}", name, v))
            .exit();
    }
    v
}

impl Args {
    #[allow(dangerous_implicit_autorefs)]
    pub fn app() -> App<'static, 'static> {
        App::new("oc-bench")
            .version((*super::FULL_VERSION).as_str())
            .author(clap::crate_authors!("\n"))
            .about(ABOUT)
            .args_from_usage(&ARGS_STR)
            .setting(AppSettings::UnifiedHelpMessage)
            .setting(AppSettings::DeriveDisplayOrder)
    }

    pub fn work_window(&self) -> Duration {
        Duration::from_secs(self.work_time as u64)
    }

    pub fn recent_window_pages(&self) -> usize {
        self.recent_pages as usize * 1024
    }
}

impl JsonLoad for Args {}

impl JsonSave for Args {
    fn preamble() -> Option<String> {
        Some(ARGS_DOC.to_string())
    }
}

impl JsonArgs for Args {
    fn match_cmdline() -> ArgMatches<'static> {
        Self::app().get_matches()
    }

    fn verbosity(matches: &ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn system_configuration_overrides(matches: &ArgMatches) -> (Option<usize>, Option<usize>) {
        (
            matches.value_of("total-memory").map(|v| match parse_size(v) {
                Ok(v) => v as usize,
                Err(e) => clap::Error::value_validation_auto(format!(
                    "Invalid value {:?} for --total-memory: {}",
                    v, e
                ))
                .exit(),
            }),
            parse_or_exit::<usize>(matches, "nr-cpus"),
        )
    }

    fn process_cmdline(&mut self, matches: &ArgMatches) -> bool {
        let mut updated_base = false;

        if matches.is_present("no-cpu") {
            self.no_cpu = true;
            updated_base = true;
        }
        if matches.is_present("no-random") {
            self.no_random = true;
            updated_base = true;
        }
        if matches.is_present("no-recent") {
            self.no_recent = true;
            updated_base = true;
        }
        if matches.is_present("latency") {
            self.latency = true;
            updated_base = true;
        }

        if let Some(v) = parse_or_exit::<FillPolicy>(matches, "fill") {
            self.fill = v;
            updated_base = true;
        }
        if let Some(v) = parse_or_exit::<u32>(matches, "work-time") {
            self.work_time = positive_or_exit(v, "work-time");
            updated_base = true;
        }
        if let Some(v) = parse_or_exit::<u32>(matches, "recent-pages") {
            self.recent_pages = positive_or_exit(v, "recent-pages");
            updated_base = true;
        }
        if let Some(v) = parse_or_exit::<RecentMode>(matches, "recent-mode") {
            self.recent_mode = v;
            updated_base = true;
        }
        if let Some(v) = parse_or_exit::<f64>(matches, "max-used") {
            self.max_used_pct = positive_or_exit(v, "max-used");
            updated_base = true;
        }
        if let Some(v) = parse_or_exit::<f64>(matches, "inc-pct") {
            self.inc_pct = positive_or_exit(v, "inc-pct");
            updated_base = true;
        }
        if let Some(v) = parse_or_exit::<f64>(matches, "init-pct") {
            self.init_pct = v.max(0.0).min(100.0);
            updated_base = true;
        }
        if let Some(v) = matches.value_of("report") {
            self.report = if v.len() > 0 {
                Some(v.to_string())
            } else {
                None
            };
            updated_base = true;
        }

        self.verbosity = Self::verbosity(matches);

        updated_base
    }
}

#[cfg(test)]
mod tests {
    use super::{Args, RecentMode};
    use oc_util::{FillPolicy, JsonArgs};

    fn parse(argv: &[&str]) -> (Args, bool) {
        let matches = Args::app().get_matches_from(argv.to_vec());
        let mut args = Args::default();
        let updated = args.process_cmdline(&matches);
        (args, updated)
    }

    #[test]
    fn test_defaults() {
        let (args, updated) = parse(&["oc-bench"]);
        assert!(!updated);
        assert!(!args.no_cpu && !args.no_random && !args.no_recent);
        assert_eq!(args.fill, FillPolicy::Half);
        assert_eq!(args.work_time, 5);
        assert_eq!(args.recent_window_pages(), 64 * 1024);
        assert_eq!(args.recent_mode, RecentMode::Sweep);
        assert_eq!(args.max_used_pct, 120.0);
    }

    #[test]
    fn test_flags() {
        let (args, updated) = parse(&[
            "oc-bench",
            "--no-cpu",
            "--no-recent",
            "--fill=full",
            "-w",
            "2",
            "--recent-pages=8",
            "--recent-mode=random",
            "--max-used=150",
            "--latency",
            "-vv",
        ]);
        assert!(updated);
        assert!(args.no_cpu && !args.no_random && args.no_recent);
        assert!(args.latency);
        assert_eq!(args.fill, FillPolicy::Full);
        assert_eq!(args.work_window(), std::time::Duration::from_secs(2));
        assert_eq!(args.recent_window_pages(), 8 * 1024);
        assert_eq!(args.recent_mode, RecentMode::Random);
        assert_eq!(args.max_used_pct, 150.0);
        assert_eq!(args.verbosity, 2);
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(Args::app()
            .get_matches_from_safe(vec!["oc-bench", "-nocpu"])
            .is_err());
        let help = Args::app()
            .get_matches_from_safe(vec!["oc-bench", "--help"])
            .unwrap_err();
        assert_eq!(help.kind, clap::ErrorKind::HelpDisplayed);
    }
}
