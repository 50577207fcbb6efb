// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use log::info;
use scan_fmt::scan_fmt;
use simplelog as sl;
use std::collections::HashMap;
use std::fmt::Write as FmtWrite;
use std::fs;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;
use std::sync::{atomic, Condvar, Mutex};
use std::time::Duration;

pub mod json_file;
pub mod page_pool;
pub mod sysstat;

pub use json_file::{
    JsonArgs, JsonArgsHelper, JsonConfigFile, JsonLoad, JsonReportFile, JsonSave,
};
pub use page_pool::{FillPolicy, PagePool};
pub use sysstat::CpuTicks;

pub const TO_MSEC: f64 = 1000.0;
pub const TO_PCT: f64 = 100.0;

lazy_static::lazy_static! {
    pub static ref TOTAL_SYSTEM_MEMORY: usize = {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        sys.total_memory() as usize
    };
    pub static ref NR_SYSTEM_CPUS: usize = ::num_cpus::get();
    static ref TOTAL_MEMORY: atomic::AtomicUsize = atomic::AtomicUsize::new(0);
    static ref NR_CPUS: atomic::AtomicUsize = atomic::AtomicUsize::new(0);
    pub static ref PAGE_SIZE: usize = ::page_size::get();
}

pub fn total_memory() -> usize {
    match TOTAL_MEMORY.load(atomic::Ordering::Relaxed) {
        0 => *TOTAL_SYSTEM_MEMORY,
        v => v,
    }
}

pub fn nr_cpus() -> usize {
    match NR_CPUS.load(atomic::Ordering::Relaxed) {
        0 => *NR_SYSTEM_CPUS,
        v => v,
    }
}

/// Number of physical pages, honoring the total memory override.
pub fn nr_phys_pages() -> usize {
    total_memory() / *PAGE_SIZE
}

pub fn override_system_configuration(total_memory: Option<usize>, nr_cpus: Option<usize>) {
    let total_memory = total_memory.unwrap_or(0);
    let nr_cpus = nr_cpus.unwrap_or(0);

    TOTAL_MEMORY.store(total_memory, atomic::Ordering::Relaxed);
    NR_CPUS.store(nr_cpus, atomic::Ordering::Relaxed);

    let mut buf = String::new();
    if total_memory > 0 {
        write!(
            buf,
            " memory={}->{}",
            format_size(*TOTAL_SYSTEM_MEMORY),
            format_size(total_memory)
        )
        .unwrap();
    }
    if nr_cpus > 0 {
        write!(buf, " cpus={}->{}", *NR_SYSTEM_CPUS, nr_cpus).unwrap();
    }
    if buf.len() > 0 {
        info!("System configuration overrides:{}", &buf);
    }
}

pub fn full_version(semver: &str) -> String {
    let mut ver = semver.to_string();
    if let Some(sha) = option_env!("VERGEN_GIT_SHA") {
        ver += &format!(" {}", &sha[0..sha.len().min(7)]);
        if let Some("true") = option_env!("VERGEN_GIT_DIRTY") {
            ver += "-dirty";
        }
    }
    if let Some(triple) = option_env!("VERGEN_CARGO_TARGET_TRIPLE") {
        ver += &format!(" {}", triple);
    }
    ver
}

pub fn format_size<T>(size: T) -> String
where
    T: num::ToPrimitive,
{
    let format_size_helper = |size: u64, shift: u32, suffix: &str| -> Option<String> {
        let unit: u64 = 1 << shift;

        if (size as f64 / unit as f64) < 99.95 {
            Some(format!(
                "{:.1}{}",
                (size as f64 / unit as f64).max(0.1),
                suffix
            ))
        } else if (size as f64 / unit as f64) < 1024.0 {
            Some(format!("{:.0}{}", size as f64 / unit as f64, suffix))
        } else {
            None
        }
    };

    let size = size.to_u64().unwrap();

    if size == 0 {
        "0".to_string()
    } else if size < 9999 {
        format!("{}", size)
    } else {
        format_size_helper(size, 10, "K")
            .or_else(|| format_size_helper(size, 20, "M"))
            .or_else(|| format_size_helper(size, 30, "G"))
            .or_else(|| format_size_helper(size, 40, "P"))
            .or_else(|| format_size_helper(size, 50, "E"))
            .unwrap_or_else(|| "INF".into())
    }
}

pub fn parse_size(input: &str) -> Result<u64> {
    lazy_static::lazy_static! {
        static ref UNITS: HashMap<char, u32> = [
            ('B', 0),
            ('K', 10),
            ('M', 20),
            ('G', 30),
            ('T', 40),
            ('P', 50),
            ('E', 60),
        ].iter().cloned().collect();
    }

    let parse_num = |num: &str, shift: u32| -> Result<u64> {
        Ok(if num.contains(".") {
            (num.parse::<f64>()? * (2u64.pow(shift) as f64)).round() as u64
        } else {
            num.parse::<u64>()? * (1 << shift)
        })
    };

    let mut num = String::new();
    let mut sum = 0;
    for ch in input.chars() {
        let ch = ch.to_ascii_uppercase();
        match ch {
            '_' => continue,
            ch if UNITS.contains_key(&ch) => {
                sum += parse_num(num.trim(), UNITS[&ch])?;
                num.clear();
            }
            ch => num.push(ch),
        }
    }
    if num.trim().len() > 0 {
        sum += parse_num(num.trim(), 0)?;
    }
    Ok(sum)
}

pub fn read_one_line<P: AsRef<Path>>(path: P) -> Result<String> {
    let f = fs::OpenOptions::new().read(true).open(path)?;
    let r = BufReader::new(f);
    Ok(r.lines().next().ok_or(anyhow!("File empty"))??)
}

/// Read a "KEY VALUE" per line file such as /proc/vmstat.
pub fn read_flat_keyed_file<P: AsRef<Path>>(path: P) -> Result<HashMap<String, u64>> {
    let f = fs::OpenOptions::new().read(true).open(path)?;
    let r = BufReader::new(f);
    let mut map = HashMap::new();

    for line in r.lines().filter_map(Result::ok) {
        if let Ok((key, val)) = scan_fmt!(&line, "{} {d}", String, u64) {
            map.insert(key, val);
        }
    }
    Ok(map)
}

/// Read CLOCK_MONOTONIC_RAW. Unlike `Instant`, failures are reported
/// instead of panicking.
pub fn monotonic_raw() -> Result<Duration> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts) } != 0 {
        bail!(
            "Failed to read CLOCK_MONOTONIC_RAW ({:?})",
            std::io::Error::last_os_error()
        );
    }
    Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}

/// Milliseconds elapsed between two `monotonic_raw()` readings.
pub fn elapsed_ms(before: Duration, after: Duration) -> Result<f64> {
    let dur = after
        .checked_sub(before)
        .context("Monotonic clock went backwards")?;
    Ok(dur.as_secs_f64() * TO_MSEC)
}

pub fn init_logging(verbosity: u32) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    } else {
        let sl_level = match verbosity {
            0 | 1 => sl::LevelFilter::Info,
            2 => sl::LevelFilter::Debug,
            _ => sl::LevelFilter::Trace,
        };
        let mut lcfg = sl::ConfigBuilder::new();
        lcfg.set_time_level(sl::LevelFilter::Off)
            .set_location_level(sl::LevelFilter::Off)
            .set_target_level(sl::LevelFilter::Off)
            .set_thread_level(sl::LevelFilter::Off);
        if !console::user_attended_stderr()
            || sl::TermLogger::init(
                sl_level,
                lcfg.build(),
                sl::TerminalMode::Stderr,
                sl::ColorChoice::Auto,
            )
            .is_err()
        {
            sl::SimpleLogger::init(sl_level, lcfg.build()).unwrap();
        }
    }
}

lazy_static::lazy_static! {
    static ref PROG_EXITING: Mutex<bool> = Mutex::new(false);
    static ref PROG_WAITQ: Condvar = Condvar::new();
}

pub fn setup_prog_state() {
    ctrlc::set_handler(move || {
        info!("SIGINT/TERM received, exiting...");
        set_prog_exiting();
    })
    .expect("Error setting term handler");
}

pub fn set_prog_exiting() {
    *PROG_EXITING.lock().unwrap() = true;
    PROG_WAITQ.notify_all();
}

pub fn prog_exiting() -> bool {
    *PROG_EXITING.lock().unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgState {
    Running,
    Exiting,
}

/// Sleep for `dur` unless the program starts exiting in the meantime.
pub fn wait_prog_state(dur: Duration) -> ProgState {
    let deadline = std::time::Instant::now() + dur;
    let mut exiting = PROG_EXITING.lock().unwrap();
    loop {
        if *exiting {
            return ProgState::Exiting;
        }
        let now = std::time::Instant::now();
        if now >= deadline {
            return ProgState::Running;
        }
        exiting = PROG_WAITQ.wait_timeout(exiting, deadline - now).unwrap().0;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    #[test]
    fn test_parse_size() {
        for pair in &[
            (4404019, "4.2m"),
            (2164785152, "2G_16.5M"),
            (1659790359820, "1.5t  9.8  G   248281"),
        ] {
            let result = super::parse_size(pair.1).unwrap();
            assert_eq!(pair.0, result);
            println!("{} -> {} ({})", pair.1, result, pair.0);
        }
    }

    #[test]
    fn test_format_size() {
        for pair in &[
            (0u64, "0"),
            (4096, "4096"),
            (65536, "64.0K"),
            (3 << 30, "3.0G"),
        ] {
            assert_eq!(super::format_size(pair.0), pair.1);
        }
    }

    #[test]
    fn test_monotonic_raw() {
        let before = super::monotonic_raw().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let after = super::monotonic_raw().unwrap();
        let ms = super::elapsed_ms(before, after).unwrap();
        println!("elapsed {:.3}ms", ms);
        assert!(ms >= 15.0);
        assert!(super::elapsed_ms(after, before).is_err());
    }

    #[test]
    fn test_wait_prog_state_times_out() {
        let started = std::time::Instant::now();
        assert_eq!(
            super::wait_prog_state(Duration::from_millis(30)),
            super::ProgState::Running
        );
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
