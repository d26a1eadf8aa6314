// SPDX-License-Identifier: GPL-2.0
//
// inputboostd: dispatch queues and their workers.
//
// Two independent capacity-1 queues, one per boost kind, each drained by
// one dedicated worker thread. The size-1 slot is what coalesces input
// bursts: while a request is pending, further requests of that kind are
// dropped, and the worker simply runs the latest accepted one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{info, warn};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::boost::BoostEngine;

/// Classification of a boost request. Each kind owns a queue, a worker and
/// a configured reset duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostKind {
    Generic,
    PowerKey,
}

impl BoostKind {
    const fn worker_name(self) -> &'static str {
        match self {
            BoostKind::Generic => "boost-worker",
            BoostKind::PowerKey => "powerkey-boost-worker",
        }
    }
}

/// A queued unit of work: apply one boost of this kind now. No payload
/// beyond the kind; a pending request already says everything a fresher
/// event could add.
#[derive(Debug, Clone, Copy)]
pub struct BoostRequest {
    pub kind: BoostKind,
}

pub struct DispatchQueue {
    kind: BoostKind,
    tx: Sender<BoostRequest>,
}

impl DispatchQueue {
    /// Non-blocking check used before enqueuing.
    pub fn is_pending(&self) -> bool {
        self.tx.is_full()
    }

    /// Non-blocking enqueue. Returns false when a request of this kind is
    /// already pending, which callers treat as success: the pending
    /// request covers this event too.
    pub fn enqueue(&self) -> bool {
        match self.tx.try_send(BoostRequest { kind: self.kind }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

pub struct Dispatcher {
    generic: DispatchQueue,
    powerkey: DispatchQueue,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Create both queues and their workers. A worker that cannot be
    /// created is fatal: half a dispatch pipeline must not run.
    pub fn spawn(engine: Arc<BoostEngine>, worker_cpus: &[usize], rt_priority: i32) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));

        let (generic_tx, generic_rx) = bounded::<BoostRequest>(1);
        let (powerkey_tx, powerkey_rx) = bounded::<BoostRequest>(1);

        let workers = vec![
            spawn_worker(
                BoostKind::Generic,
                generic_rx,
                Arc::clone(&engine),
                Arc::clone(&shutdown),
                worker_cpus.to_vec(),
                rt_priority,
            )?,
            spawn_worker(
                BoostKind::PowerKey,
                powerkey_rx,
                Arc::clone(&engine),
                Arc::clone(&shutdown),
                worker_cpus.to_vec(),
                rt_priority,
            )?,
        ];

        Ok(Self {
            generic: DispatchQueue {
                kind: BoostKind::Generic,
                tx: generic_tx,
            },
            powerkey: DispatchQueue {
                kind: BoostKind::PowerKey,
                tx: powerkey_tx,
            },
            shutdown,
            workers,
        })
    }

    pub fn queue(&self, kind: BoostKind) -> &DispatchQueue {
        match kind {
            BoostKind::Generic => &self.generic,
            BoostKind::PowerKey => &self.powerkey,
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn spawn_worker(
    kind: BoostKind,
    rx: Receiver<BoostRequest>,
    engine: Arc<BoostEngine>,
    shutdown: Arc<AtomicBool>,
    cpus: Vec<usize>,
    rt_priority: i32,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(kind.worker_name().to_string())
        .spawn(move || {
            apply_worker_scheduling(kind.worker_name(), &cpus, rt_priority);
            worker_loop(rx, engine, shutdown);
        })
        .with_context(|| format!("failed to create {}", kind.worker_name()))
}

fn worker_loop(rx: Receiver<BoostRequest>, engine: Arc<BoostEngine>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(request) => engine.activate(request.kind),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Issuing a boost must itself be low latency: request SCHED_FIFO and pin
/// the worker onto the housekeeping CPUs. Failures are logged and the
/// worker keeps running at normal priority.
fn apply_worker_scheduling(name: &str, cpus: &[usize], rt_priority: i32) {
    let param = libc::sched_param {
        sched_priority: rt_priority,
    };
    // SAFETY: pid 0 targets the calling thread; param outlives the call.
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        warn!(
            "{}: failed to set SCHED_FIFO: {}",
            name,
            std::io::Error::last_os_error()
        );
    }

    if cpus.is_empty() {
        return;
    }
    let mut set = CpuSet::new();
    let mut any = false;
    for &cpu in cpus {
        match set.set(cpu) {
            Ok(()) => any = true,
            Err(err) => warn!("{}: cannot pin to CPU {}: {}", name, cpu, err),
        }
    }
    if any {
        if let Err(err) = sched_setaffinity(Pid::from_raw(0), &set) {
            warn!("{}: failed to set CPU affinity: {}", name, err);
        } else {
            info!("{}: pinned to CPUs {:?}", name, cpus);
        }
    }
}

/// Parse a comma-separated CPU list with ranges, e.g. "0-3,8".
pub fn parse_cpu_list(optarg: &str) -> Result<Vec<usize>, String> {
    if optarg
        .chars()
        .any(|c| !c.is_ascii_digit() && c != '-' && c != ',' && !c.is_whitespace())
    {
        return Err("Invalid character in CPU list".to_string());
    }

    let mut cpus = Vec::new();
    let mut seen = HashSet::new();
    for token in optarg.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((start_str, end_str)) = token.split_once('-') {
            let start = start_str
                .trim()
                .parse::<usize>()
                .map_err(|_| "Invalid range start".to_string())?;
            let end = end_str
                .trim()
                .parse::<usize>()
                .map_err(|_| "Invalid range end".to_string())?;
            if start > end {
                return Err(format!("Invalid CPU range: {}-{}", start, end));
            }
            for cpu in start..=end {
                if seen.insert(cpu) {
                    cpus.push(cpu);
                }
            }
        } else {
            let cpu = token
                .parse::<usize>()
                .map_err(|_| format!("Invalid CPU: {}", token))?;
            if seen.insert(cpu) {
                cpus.push(cpu);
            }
        }
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Tunables, TunablesHandle};
    use crate::provider::MockBoost;
    use crate::stats::Counters;

    fn test_dispatcher(mock: Arc<MockBoost>) -> Dispatcher {
        let engine = Arc::new(
            BoostEngine::spawn(
                "top-app",
                mock,
                TunablesHandle::new(Tunables::default()),
                Counters::new(),
            )
            .unwrap(),
        );
        Dispatcher::spawn(engine, &[], 2).unwrap()
    }

    #[test]
    fn enqueue_wakes_worker() {
        let mock = Arc::new(MockBoost::new());
        let dispatcher = test_dispatcher(Arc::clone(&mock));

        assert!(dispatcher.queue(BoostKind::Generic).enqueue());
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while mock.applies.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "worker never ran");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(mock.applies.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn saturated_queue_drops_and_never_grows() {
        // A slow provider keeps the worker busy with the first request so
        // the second occupies the slot and the third has nowhere to go.
        let mock = Arc::new(MockBoost::with_delay(Duration::from_millis(150)));
        let dispatcher = test_dispatcher(Arc::clone(&mock));
        let queue = dispatcher.queue(BoostKind::Generic);

        assert!(queue.enqueue());
        // Let the worker pull the first request and block in apply().
        thread::sleep(Duration::from_millis(50));
        assert!(queue.enqueue());
        assert!(queue.is_pending());
        assert!(!queue.enqueue());
        assert!(!queue.enqueue());

        // Only the two accepted requests ever reach the provider.
        thread::sleep(Duration::from_millis(500));
        assert_eq!(mock.applies.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn kinds_do_not_block_each_other() {
        let mock = Arc::new(MockBoost::with_delay(Duration::from_millis(100)));
        let dispatcher = test_dispatcher(Arc::clone(&mock));

        assert!(dispatcher.queue(BoostKind::Generic).enqueue());
        thread::sleep(Duration::from_millis(30));
        // The generic worker is busy; the power-key queue must still accept.
        assert!(dispatcher.queue(BoostKind::PowerKey).enqueue());

        thread::sleep(Duration::from_millis(400));
        assert_eq!(mock.applies.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn parses_single_cpu() {
        assert_eq!(parse_cpu_list("3").unwrap(), vec![3]);
    }

    #[test]
    fn parses_range_and_single() {
        let mut v = parse_cpu_list("0-2,5").unwrap();
        v.sort();
        assert_eq!(v, vec![0, 1, 2, 5]);
    }

    #[test]
    fn rejects_bad_chars() {
        assert!(parse_cpu_list("0-2,a").is_err());
    }
}
