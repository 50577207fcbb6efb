// Copyright (c) Facebook, Inc. and its affiliates.

//! Background workers whose throughput is measured against memory pressure.
//!
//! Each worker owns exactly one counter and is the only thread which writes
//! it. The controller owns the pause flags and "zeroes" a counter by
//! recording its current value as the new base, so no store from the
//! controller can race with a worker increment. Workers run until the
//! process exits.
use anyhow::{Context, Result};
use crossbeam::utils::CachePadded;
use log::{debug, info};
use oc_bench_intf::{LatencyStat, RecentMode};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, sleep, JoinHandle};
use std::time::Duration;

use oc_util::*;

use super::latency::{LatencyAcc, LatencyStats};

/// CPU worker spins this many iterations per counter increment.
pub const CPU_BATCH: u32 = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerKind {
    Cpu,
    Random,
    Recent,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 3] = [WorkerKind::Cpu, WorkerKind::Random, WorkerKind::Recent];

    fn idx(&self) -> usize {
        match self {
            WorkerKind::Cpu => 0,
            WorkerKind::Random => 1,
            WorkerKind::Recent => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerKind::Cpu => "cpu",
            WorkerKind::Random => "random",
            WorkerKind::Recent => "recent",
        }
    }
}

#[derive(Debug, Default)]
struct Counter {
    count: AtomicU64,
    base: AtomicU64,
}

impl Counter {
    /// Worker side. A plain store, the worker is the only writer.
    fn publish(&self, count: u64) {
        self.count.store(count, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.base
            .store(self.count.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    fn read(&self) -> u64 {
        self.count
            .load(Ordering::Relaxed)
            .saturating_sub(self.base.load(Ordering::Relaxed))
    }
}

/// Counter values since the last reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub cpu: u64,
    pub random: u64,
    pub recent: u64,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub nr_cpus: usize,
    /// How long a paused worker sleeps before checking its flag again.
    pub quantum: Duration,
    pub recent_window: usize,
    pub recent_mode: RecentMode,
    pub latency: bool,
}

struct Shared {
    pool: Arc<PagePool>,
    cfg: WorkerConfig,
    cpu: Vec<CachePadded<Counter>>,
    random: CachePadded<Counter>,
    recent: CachePadded<Counter>,
    paused: [CachePadded<AtomicBool>; 3],
    exit: AtomicBool,
    random_lat: Option<LatencyStats>,
}

impl Shared {
    fn paused(&self, kind: WorkerKind) -> bool {
        self.paused[kind.idx()].load(Ordering::Relaxed)
    }

    fn exiting(&self) -> bool {
        self.exit.load(Ordering::Relaxed)
    }

    /// Returns false once the worker should exit. Sleeps one quantum while
    /// `kind` is paused.
    fn wait_while_paused(&self, kind: WorkerKind) -> bool {
        while self.paused(kind) {
            if self.exiting() {
                return false;
            }
            sleep(self.cfg.quantum);
        }
        !self.exiting()
    }
}

/// Uniformly random page index in `[0, len)`, None if the pool is empty.
pub fn random_index<R: Rng>(rng: &mut R, len: usize) -> Option<usize> {
    match len {
        0 => None,
        len => Some(rng.gen_range(0..len)),
    }
}

/// Picks pages among the `window` most recently allocated ones.
#[derive(Debug)]
pub struct RecentCursor {
    mode: RecentMode,
    window: usize,
    next: usize,
}

impl RecentCursor {
    pub fn new(mode: RecentMode, window: usize) -> Self {
        Self {
            mode,
            window,
            // Start past the end so that the first sweep begins at the
            // window start.
            next: usize::MAX,
        }
    }

    /// Next page index to touch given the current pool length. Sweeping
    /// walks forward and jumps back to the window start after passing the
    /// end of the pool.
    pub fn next<R: Rng>(&mut self, rng: &mut R, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let lo = len.saturating_sub(self.window);
        match self.mode {
            RecentMode::Sweep => {
                if self.next >= len {
                    self.next = lo;
                }
                let idx = self.next;
                self.next += 1;
                Some(idx)
            }
            RecentMode::Random => Some(rng.gen_range(lo..len)),
        }
    }
}

fn touch_val(count: u64) -> u8 {
    (count % 0xff) as u8
}

fn cpu_worker(shared: Arc<Shared>, slot: usize) {
    let counter = &shared.cpu[slot];
    let mut countdown = CPU_BATCH;
    let mut count = 0;

    while shared.wait_while_paused(WorkerKind::Cpu) {
        countdown = black_box(countdown - 1);
        if countdown == 0 {
            countdown = CPU_BATCH;
            count += 1;
            counter.publish(count);
        }
    }
}

fn random_worker(shared: Arc<Shared>) {
    let mut rng = SmallRng::from_entropy();
    let mut lat = LatencyAcc::default();
    let mut count = 0;

    while shared.wait_while_paused(WorkerKind::Random) {
        let idx = match random_index(&mut rng, shared.pool.len()) {
            Some(v) => v,
            None => {
                sleep(shared.cfg.quantum);
                continue;
            }
        };

        match shared.random_lat.as_ref() {
            None => {
                shared.pool.touch(idx, touch_val(count));
            }
            Some(stats) => {
                if stats.take_reset() {
                    lat.reset();
                }
                let before = monotonic_raw();
                shared.pool.touch(idx, touch_val(count));
                let after = monotonic_raw();
                match (before, after) {
                    (Ok(before), Ok(after)) => match elapsed_ms(before, after) {
                        Ok(ms) => lat.record(ms * TO_MSEC),
                        Err(_) => lat.error(),
                    },
                    _ => lat.error(),
                }
                stats.publish(&lat);
            }
        }

        count += 1;
        shared.random.publish(count);
    }
}

fn recent_worker(shared: Arc<Shared>) {
    let mut rng = SmallRng::from_entropy();
    let mut cursor = RecentCursor::new(shared.cfg.recent_mode, shared.cfg.recent_window);
    let mut count = 0;

    while shared.wait_while_paused(WorkerKind::Recent) {
        let idx = match cursor.next(&mut rng, shared.pool.len()) {
            Some(v) => v,
            None => {
                sleep(shared.cfg.quantum);
                continue;
            }
        };
        shared.pool.touch(idx, touch_val(count));
        count += 1;
        shared.recent.publish(count);
    }
}

pub struct Workers {
    shared: Arc<Shared>,
    started: [bool; 3],
    jhs: Vec<JoinHandle<()>>,
}

impl Workers {
    pub fn new(pool: Arc<PagePool>, cfg: WorkerConfig) -> Self {
        let nr_cpus = cfg.nr_cpus.max(1);
        let random_lat = match cfg.latency {
            true => Some(LatencyStats::default()),
            false => None,
        };
        Self {
            shared: Arc::new(Shared {
                pool,
                cpu: (0..nr_cpus).map(|_| Default::default()).collect(),
                random: Default::default(),
                recent: Default::default(),
                paused: Default::default(),
                exit: AtomicBool::new(false),
                random_lat,
                cfg,
            }),
            started: [false; 3],
            jhs: vec![],
        }
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.shared.pool
    }

    pub fn quantum(&self) -> Duration {
        self.shared.cfg.quantum
    }

    pub fn is_started(&self, kind: WorkerKind) -> bool {
        self.started[kind.idx()]
    }

    fn spawn<F>(&mut self, name: String, work: F) -> Result<()>
    where
        F: FnOnce(Arc<Shared>) + Send + 'static,
    {
        let shared = self.shared.clone();
        let jh = thread::Builder::new()
            .name(name.clone())
            .spawn(move || work(shared))
            .with_context(|| format!("Spawning worker thread {:?}", &name))?;
        self.jhs.push(jh);
        Ok(())
    }

    /// Start the worker threads of `kind` unpaused. One CPU worker is
    /// started per CPU.
    pub fn start(&mut self, kind: WorkerKind) -> Result<()> {
        if self.is_started(kind) {
            return Ok(());
        }
        self.resume(kind);
        match kind {
            WorkerKind::Cpu => {
                let nr = self.shared.cpu.len();
                for slot in 0..nr {
                    self.spawn(format!("oc-cpu-{}", slot), move |sh| cpu_worker(sh, slot))?;
                }
                info!("workers: Started {} CPU workers", nr);
            }
            WorkerKind::Random => {
                self.spawn("oc-random".into(), random_worker)?;
                info!("workers: Started random page worker");
            }
            WorkerKind::Recent => {
                self.spawn("oc-recent".into(), recent_worker)?;
                info!(
                    "workers: Started recent page worker ({} pages, {})",
                    self.shared.cfg.recent_window,
                    self.shared.cfg.recent_mode.name()
                );
            }
        }
        self.started[kind.idx()] = true;
        Ok(())
    }

    pub fn pause(&self, kind: WorkerKind) {
        debug!("workers: Pausing {}", kind.name());
        self.shared.paused[kind.idx()].store(true, Ordering::Relaxed);
    }

    pub fn resume(&self, kind: WorkerKind) {
        self.shared.paused[kind.idx()].store(false, Ordering::Relaxed);
    }

    /// Unpause every started worker. Returns whether any was paused.
    pub fn resume_started(&self) -> bool {
        let mut resumed = false;
        for kind in WorkerKind::ALL.iter() {
            if self.is_started(*kind) && self.shared.paused(*kind) {
                debug!("workers: Resuming {}", kind.name());
                self.resume(*kind);
                resumed = true;
            }
        }
        resumed
    }

    pub fn reset(&self, kind: WorkerKind) {
        match kind {
            WorkerKind::Cpu => self.shared.cpu.iter().for_each(|c| c.reset()),
            WorkerKind::Random => self.shared.random.reset(),
            WorkerKind::Recent => self.shared.recent.reset(),
        }
    }

    pub fn reset_all(&self) {
        for kind in WorkerKind::ALL.iter() {
            self.reset(*kind);
        }
    }

    /// Counter value since the last reset, summed over all CPU workers for
    /// `WorkerKind::Cpu`.
    pub fn read(&self, kind: WorkerKind) -> u64 {
        match kind {
            WorkerKind::Cpu => self.shared.cpu.iter().map(|c| c.read()).sum(),
            WorkerKind::Random => self.shared.random.read(),
            WorkerKind::Recent => self.shared.recent.read(),
        }
    }

    pub fn counts(&self) -> Counts {
        Counts {
            cpu: self.read(WorkerKind::Cpu),
            random: self.read(WorkerKind::Random),
            recent: self.read(WorkerKind::Recent),
        }
    }

    pub fn reset_latency(&self) {
        if let Some(stats) = self.shared.random_lat.as_ref() {
            stats.request_reset();
        }
    }

    pub fn latency(&self) -> Option<LatencyStat> {
        self.shared.random_lat.as_ref().map(|stats| stats.snapshot())
    }

    /// Stop and join all workers. Production runs never call this and
    /// leave the threads to die with the process.
    #[cfg(test)]
    pub fn stop(self) {
        self.shared.exit.store(true, Ordering::Relaxed);
        for jh in self.jhs {
            jh.join().unwrap();
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub const PG: usize = 4096;

    pub fn test_cfg(latency: bool) -> WorkerConfig {
        WorkerConfig {
            nr_cpus: 2,
            quantum: Duration::from_millis(2),
            recent_window: 8,
            recent_mode: RecentMode::Sweep,
            latency,
        }
    }

    pub fn test_pool(nr_pages: usize) -> Arc<PagePool> {
        let pool = Arc::new(PagePool::new(PG, 1024, FillPolicy::None).unwrap());
        assert_eq!(pool.alloc_pages(nr_pages * PG), nr_pages);
        pool
    }

    #[test]
    fn test_random_index_bounds() {
        let mut rng = SmallRng::seed_from_u64(7);
        assert_eq!(random_index(&mut rng, 0), None);
        for len in 1..64 {
            for _ in 0..256 {
                assert!(random_index(&mut rng, len).unwrap() < len);
            }
        }
    }

    #[test]
    fn test_recent_cursor_sweep() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut cur = RecentCursor::new(RecentMode::Sweep, 4);
        assert_eq!(cur.next(&mut rng, 0), None);

        let seq: Vec<usize> = (0..6).map(|_| cur.next(&mut rng, 10).unwrap()).collect();
        assert_eq!(seq, vec![6, 7, 8, 9, 6, 7]);

        // The pool grew, keep walking into the new pages.
        let seq: Vec<usize> = (0..4).map(|_| cur.next(&mut rng, 12).unwrap()).collect();
        assert_eq!(seq, vec![8, 9, 10, 11]);
        assert_eq!(cur.next(&mut rng, 12), Some(8));

        // Window larger than the pool clamps at zero.
        let mut cur = RecentCursor::new(RecentMode::Sweep, 100);
        let seq: Vec<usize> = (0..4).map(|_| cur.next(&mut rng, 3).unwrap()).collect();
        assert_eq!(seq, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_recent_cursor_random() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut cur = RecentCursor::new(RecentMode::Random, 16);
        for _ in 0..1000 {
            let idx = cur.next(&mut rng, 100).unwrap();
            assert!(idx >= 84 && idx < 100);
        }
        for _ in 0..100 {
            assert!(cur.next(&mut rng, 5).unwrap() < 5);
        }
    }

    #[test]
    fn test_counter_reset() {
        let c = Counter::default();
        c.publish(10);
        assert_eq!(c.read(), 10);
        c.reset();
        assert_eq!(c.read(), 0);
        c.publish(13);
        assert_eq!(c.read(), 3);
    }

    #[test]
    fn test_workers_pause_resume() {
        let _ = ::env_logger::try_init();
        let pool = test_pool(32);
        let mut workers = Workers::new(pool.clone(), test_cfg(true));

        for kind in WorkerKind::ALL.iter() {
            workers.start(*kind).unwrap();
        }
        sleep(Duration::from_millis(50));
        let counts = workers.counts();
        assert!(counts.cpu > 0 && counts.random > 0 && counts.recent > 0);
        let lat = workers.latency().unwrap();
        assert!(lat.count > 0);
        assert!(lat.min <= lat.avg && lat.avg <= lat.max);

        workers.pause(WorkerKind::Cpu);
        workers.pause(WorkerKind::Random);
        // Let the workers notice the flags before taking the base.
        sleep(Duration::from_millis(20));
        workers.reset_all();
        sleep(Duration::from_millis(30));
        let counts = workers.counts();
        assert_eq!(counts.cpu, 0);
        assert_eq!(counts.random, 0);
        assert!(counts.recent > 0);

        assert!(workers.resume_started());
        assert!(!workers.resume_started());
        sleep(Duration::from_millis(30));
        assert!(workers.read(WorkerKind::Cpu) > 0);
        assert!(workers.read(WorkerKind::Random) > 0);

        assert_eq!(pool.len(), 32);
        workers.stop();
    }
}
