// SPDX-License-Identifier: GPL-2.0
//
// inputboostd: input-driven scheduling boost daemon.
//
// Watches input devices and briefly raises the scheduling priority share
// of a named domain (e.g. the "top-app" cgroup) whenever the user
// interacts, reverting automatically after a bounded window. Input
// delivery is never blocked: boosting is strictly best effort.

mod boost;
mod config;
mod control;
mod debounce;
mod device;
mod dispatch;
mod provider;
mod stats;

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use evdev::EventType;
use inotify::{EventMask, Inotify, WatchMask};
use log::{debug, info, warn};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use rustc_hash::FxHashSet;

use crate::boost::BoostEngine;
use crate::config::{Tunables, TunablesHandle, TunablesWatcher};
use crate::control::{ControlContext, ControlServer};
use crate::debounce::Debouncer;
use crate::device::DeviceClass;
use crate::dispatch::{parse_cpu_list, Dispatcher};
use crate::provider::UclampBoost;
use crate::stats::Counters;

pub const DAEMON_NAME: &str = "inputboostd";

const EPOLL_TIMEOUT_MS: u16 = 100;
const MAX_EVENTS_PER_FD: usize = 512;
/// epoll tag for the /dev/input hotplug watch.
const HOTPLUG_TAG: u64 = u64::MAX - 1;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "inputboostd",
    version,
    disable_version_flag = true,
    about = "Boost a scheduling domain on user input, revert after a bounded window."
)]
struct Opts {
    /// Scheduling domain the boost applies to.
    #[clap(long, default_value = "top-app")]
    domain: String,

    /// cgroup v2 hierarchy root the domain lives under.
    #[clap(long, default_value = "/sys/fs/cgroup")]
    cgroup_root: PathBuf,

    /// Boost magnitude handed to the provider. 0 disables boosting.
    #[clap(short = 'b', long, default_value = "30")]
    boost_magnitude: u32,

    /// Generic input boost duration in milliseconds. 0 disables boosting.
    #[clap(long, default_value = "80")]
    boost_duration_ms: u64,

    /// Power/wake key boost duration in milliseconds.
    #[clap(long, default_value = "300")]
    powerkey_boost_duration_ms: u64,

    /// Minimum spacing between two accepted input events in microseconds.
    #[clap(long, default_value = "100000")]
    min_input_interval_us: u64,

    /// JSON file with runtime tunables. Loaded at startup when present and
    /// reloaded whenever it is rewritten, overriding the flags above.
    #[clap(long)]
    tunables_file: Option<PathBuf>,

    /// CPUs the boost workers are pinned to (comma-separated, ranges OK).
    #[clap(long, default_value = "0-3")]
    worker_cpus: String,

    /// SCHED_FIFO priority for the boost workers (1-99).
    #[clap(long, default_value = "2")]
    rt_priority: i32,

    /// Control socket path. An empty value disables the socket.
    #[clap(long, default_value = "/run/inputboostd.sock")]
    control_socket: PathBuf,

    /// Print the metrics block at this interval in seconds (0=off).
    #[clap(long, default_value = "0")]
    stats_interval_secs: u64,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Print version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,
}

/// Cached per-device info, resolved once at registration and indexed by fd
/// so the hot path never looks anything up.
#[derive(Debug, Clone, Copy)]
struct DeviceInfo {
    idx: usize,
    class: DeviceClass,
}

struct Daemon {
    counters: Arc<Counters>,
    _tunables_watcher: Option<TunablesWatcher>,
    control: Option<ControlServer>,
    debouncer: Arc<Debouncer>,
    dispatcher: Arc<Dispatcher>,
    engine: Arc<BoostEngine>,
    input_devs: Vec<Option<evdev::Device>>,
    input_fd_info: Vec<Option<DeviceInfo>>,
    registered_fds: FxHashSet<i32>,
    epoll: Epoll,
    hotplug: Option<Inotify>,
    stats_interval: Option<Duration>,
}

impl Daemon {
    fn init(opts: &Opts) -> Result<Self> {
        info!("{} {}", DAEMON_NAME, env!("CARGO_PKG_VERSION"));
        info!(
            "options: {}",
            std::env::args().collect::<Vec<_>>().join(" ")
        );

        // CLI flags are the baseline; the tunables file, when present,
        // overrides them and keeps doing so while the daemon runs.
        let mut initial = Tunables {
            boost_magnitude: opts.boost_magnitude,
            boost_duration_ms: opts.boost_duration_ms,
            powerkey_boost_duration_ms: opts.powerkey_boost_duration_ms,
            min_input_interval_us: opts.min_input_interval_us,
        };
        if let Some(ref path) = opts.tunables_file {
            if path.exists() {
                initial = config::load_from_file(path)?;
            }
        }
        let tunables = TunablesHandle::new(initial);
        let _tunables_watcher = match opts.tunables_file {
            Some(ref path) => Some(TunablesWatcher::spawn(path.clone(), tunables.clone())?),
            None => None,
        };

        let counters = Counters::new();
        let provider = Arc::new(UclampBoost::new(opts.cgroup_root.clone()));
        let engine = Arc::new(BoostEngine::spawn(
            opts.domain.clone(),
            provider,
            tunables.clone(),
            Arc::clone(&counters),
        )?);

        let worker_cpus = parse_cpu_list(&opts.worker_cpus)
            .map_err(|err| anyhow::anyhow!("invalid --worker-cpus: {}", err))?;
        let rt_priority = opts.rt_priority.clamp(1, 99);
        // Workers and queues are all-or-nothing: a failure here aborts
        // startup instead of leaving boosting half-functional.
        let dispatcher = Arc::new(Dispatcher::spawn(
            Arc::clone(&engine),
            &worker_cpus,
            rt_priority,
        )?);
        let debouncer = Arc::new(Debouncer::new(tunables.clone(), Arc::clone(&counters)));

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| anyhow::anyhow!(e))?;

        // Watch /dev/input so devices that appear later get registered too.
        let hotplug = match Inotify::init() {
            Ok(inotify) => match inotify.watches().add("/dev/input", WatchMask::CREATE) {
                Ok(_) => {
                    let fd = inotify.as_raw_fd();
                    // SAFETY: the Inotify instance owns the fd and lives in
                    // the daemon; the BorrowedFd is scoped to this call.
                    let bfd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
                    match epoll.add(bfd, EpollEvent::new(EpollFlags::EPOLLIN, HOTPLUG_TAG)) {
                        Ok(()) => Some(inotify),
                        Err(err) => {
                            warn!("hotplug watch disabled: {}", err);
                            None
                        }
                    }
                }
                Err(err) => {
                    warn!("hotplug watch disabled: {}", err);
                    None
                }
            },
            Err(err) => {
                warn!("hotplug watch disabled: {}", err);
                None
            }
        };

        let control = if opts.control_socket.as_os_str().is_empty() {
            None
        } else {
            match ControlServer::spawn(
                opts.control_socket.clone(),
                ControlContext {
                    debouncer: Arc::clone(&debouncer),
                    dispatcher: Arc::clone(&dispatcher),
                    counters: Arc::clone(&counters),
                    engine: Arc::clone(&engine),
                },
            ) {
                Ok(server) => Some(server),
                Err(err) => {
                    warn!("control socket disabled: {:#}", err);
                    None
                }
            }
        };

        let mut daemon = Self {
            counters,
            _tunables_watcher,
            control,
            debouncer,
            dispatcher,
            engine,
            input_devs: Vec::new(),
            input_fd_info: Vec::new(),
            registered_fds: FxHashSet::default(),
            epoll,
            hotplug,
            stats_interval: match opts.stats_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        };
        daemon.scan_devices();
        Ok(daemon)
    }

    fn scan_devices(&mut self) {
        if let Ok(dir) = std::fs::read_dir("/dev/input") {
            for entry in dir.flatten() {
                let path = entry.path();
                let is_event_node = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with("event"));
                if is_event_node {
                    self.register_device(&path);
                }
            }
        }
        info!("watching {} input devices", self.registered_fds.len());
    }

    fn register_device(&mut self, path: &Path) {
        let dev = match evdev::Device::open(path) {
            Ok(dev) => dev,
            Err(err) => {
                debug!("skipping {}: {}", path.display(), err);
                return;
            }
        };
        let class = match device::classify_device(&dev) {
            Some(class) => class,
            None => return,
        };
        let fd = dev.as_raw_fd();
        if fd < 0 || self.registered_fds.contains(&fd) {
            return;
        }

        // O_NONBLOCK so a dying device cannot stall the event loop.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags >= 0 {
                let _ = libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }

        // SAFETY: the device owns the fd and stays alive until disconnect
        // or teardown; the BorrowedFd is scoped to this add call (evdev
        // 0.12 does not implement AsFd).
        let bfd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        if let Err(err) = self
            .epoll
            .add(bfd, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
        {
            warn!("failed to register {} with epoll: {}", path.display(), err);
            return;
        }

        info!(
            "registered {:?} device '{}' (fd {})",
            class,
            dev.name().unwrap_or("unknown"),
            fd
        );
        let idx = self.input_devs.len();
        if (fd as usize) >= self.input_fd_info.len() {
            self.input_fd_info.resize(fd as usize + 1, None);
        }
        self.input_fd_info[fd as usize] = Some(DeviceInfo { idx, class });
        self.registered_fds.insert(fd);
        self.input_devs.push(Some(dev));
    }

    fn unregister_fd(&mut self, fd: i32) {
        let info = match self.input_fd_info.get(fd as usize).and_then(|slot| *slot) {
            Some(info) => info,
            None => return,
        };
        self.input_fd_info[fd as usize] = None;
        self.registered_fds.remove(&fd);
        // SAFETY: the fd is still open here; the device drop below closes
        // it. Scoped to this delete call.
        let bfd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let _ = self.epoll.delete(bfd);
        if let Some(slot) = self.input_devs.get_mut(info.idx) {
            *slot = None;
        }
        info!("{:?} device on fd {} went away", info.class, fd);
        // The event source is gone: drop any boost it caused, regardless
        // of timer state.
        self.engine.deactivate();
    }

    fn drain_device(&mut self, fd: i32) {
        let info = match self.input_fd_info.get(fd as usize).and_then(|slot| *slot) {
            Some(info) => info,
            None => return,
        };
        let mut gone = false;
        if let Some(Some(dev)) = self.input_devs.get_mut(info.idx) {
            match dev.fetch_events() {
                Ok(iter) => {
                    let mut event_count = 0;
                    for event in iter {
                        event_count += 1;
                        if event_count > MAX_EVENTS_PER_FD {
                            break;
                        }
                        // SYN markers are not input activity.
                        if event.event_type() == EventType::SYNCHRONIZATION {
                            continue;
                        }
                        self.debouncer.on_event(
                            &self.dispatcher,
                            event.event_type(),
                            event.code(),
                            event.value(),
                        );
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    debug!("fetch_events on fd {} failed: {}", fd, err);
                    gone = true;
                }
            }
        }
        if gone {
            self.unregister_fd(fd);
        }
    }

    fn drain_hotplug(&mut self) {
        let mut fresh: Vec<PathBuf> = Vec::new();
        if let Some(ref mut inotify) = self.hotplug {
            let mut buffer = [0u8; 4096];
            match inotify.read_events(&mut buffer) {
                Ok(events) => {
                    for event in events {
                        if event.mask.contains(EventMask::ISDIR) {
                            continue;
                        }
                        if let Some(name) = event.name {
                            if name.to_str().map_or(false, |n| n.starts_with("event")) {
                                fresh.push(Path::new("/dev/input").join(name));
                            }
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => warn!("hotplug watch error: {}", err),
            }
        }
        for path in fresh {
            self.register_device(&path);
        }
    }

    fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let mut events = [EpollEvent::empty(); 64];
        let mut last_summary = Instant::now();
        let mut last_stats_print = Instant::now();
        let mut prev_metrics = self.counters.snapshot(false);

        while !shutdown.load(Ordering::Relaxed) {
            match self.epoll.wait(&mut events, Some(EPOLL_TIMEOUT_MS)) {
                Ok(0) => {}
                Ok(n) => {
                    for i in 0..n {
                        let tag = events[i].data();
                        if tag == HOTPLUG_TAG {
                            self.drain_hotplug();
                            continue;
                        }
                        let fd = tag as i32;
                        let flags = events[i].events();
                        if flags.contains(EpollFlags::EPOLLHUP)
                            || flags.contains(EpollFlags::EPOLLERR)
                        {
                            self.unregister_fd(fd);
                            continue;
                        }
                        self.drain_device(fd);
                    }
                }
                Err(err) if err == nix::errno::Errno::EINTR => continue,
                Err(err) => {
                    warn!("epoll_wait failed: {}", err);
                    break;
                }
            }

            if last_summary.elapsed() >= Duration::from_secs(10) {
                last_summary = Instant::now();
                let cur = self.counters.snapshot(self.engine.is_active());
                let delta = cur.delta(&prev_metrics);
                if delta.has_activity() {
                    info!(
                        "activity: seen={} debounced={} pending_drop={} applied={} expired={}",
                        delta.events_seen,
                        delta.events_debounced,
                        delta.events_dropped_pending,
                        delta.boosts_applied,
                        delta.resets_expired
                    );
                }
                prev_metrics = cur;
            }

            if let Some(interval) = self.stats_interval {
                if last_stats_print.elapsed() >= interval {
                    last_stats_print = Instant::now();
                    let cur = self.counters.snapshot(self.engine.is_active());
                    let _ = cur.format(&mut std::io::stdout());
                }
            }
        }

        info!("event loop exited, cleaning up");
        // Teardown unregisters every event source; an active boost must
        // not outlive the daemon.
        self.engine.deactivate();
        drop(self.control.take());
        Ok(())
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        for &fd in &self.registered_fds {
            // SAFETY: fds in registered_fds are still owned by devices in
            // input_devs, which drop after this. Cleanup path, errors
            // ignored.
            let bfd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            let _ = self.epoll.delete(bfd);
        }
        self.registered_fds.clear();
        self.input_fd_info.clear();
        self.input_devs.clear();
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!("{} {}", DAEMON_NAME, env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_offset_to_local()
        .expect("Failed to set local time offset")
        .set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let mut daemon = Daemon::init(&opts)?;
    daemon.run(shutdown)
}
