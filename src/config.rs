// SPDX-License-Identifier: GPL-2.0
//
// Runtime tunables with hot reload from a JSON file.

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use inotify::{EventMask, Inotify, WatchMask};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::dispatch::BoostKind;

/// Knobs that may change while the daemon runs. Consumers load a snapshot
/// at each decision point instead of caching fields at startup, so edits to
/// the tunables file take effect on the next input event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Boost strength handed to the provider. Zero disables boosting.
    pub boost_magnitude: u32,
    /// How long a generic input boost stays active. Zero disables boosting.
    pub boost_duration_ms: u64,
    /// How long a power/wake key boost stays active.
    pub powerkey_boost_duration_ms: u64,
    /// Minimum spacing between two accepted input events.
    pub min_input_interval_us: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            boost_magnitude: 30,
            boost_duration_ms: 80,
            powerkey_boost_duration_ms: 300,
            min_input_interval_us: 100_000,
        }
    }
}

impl Tunables {
    pub fn boosting_disabled(&self) -> bool {
        self.boost_magnitude == 0 || self.boost_duration_ms == 0
    }

    pub fn duration_ms(&self, kind: BoostKind) -> u64 {
        match kind {
            BoostKind::Generic => self.boost_duration_ms,
            BoostKind::PowerKey => self.powerkey_boost_duration_ms,
        }
    }
}

/// Shared handle to the live tunables snapshot.
#[derive(Clone)]
pub struct TunablesHandle {
    inner: Arc<ArcSwap<Tunables>>,
}

impl TunablesHandle {
    pub fn new(initial: Tunables) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    pub fn load(&self) -> Arc<Tunables> {
        self.inner.load_full()
    }

    pub fn store(&self, tunables: Tunables) {
        self.inner.store(Arc::new(tunables));
    }
}

pub fn load_from_file(path: &std::path::Path) -> Result<Tunables> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read tunables file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse tunables file {}", path.display()))
}

/// Watches the tunables file and swaps in a new snapshot whenever it is
/// rewritten.
pub struct TunablesWatcher {
    shutdown: Arc<AtomicBool>,
    _thread: Option<JoinHandle<()>>,
}

impl TunablesWatcher {
    pub fn spawn(path: PathBuf, handle: TunablesHandle) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name("tunables-watch".to_string())
            .spawn(move || watch_loop(path, handle, thread_shutdown))
            .context("failed to spawn tunables watcher thread")?;

        Ok(Self {
            shutdown,
            _thread: Some(thread),
        })
    }
}

impl Drop for TunablesWatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self._thread.take() {
            let _ = handle.join();
        }
    }
}

fn watch_loop(path: PathBuf, handle: TunablesHandle, shutdown: Arc<AtomicBool>) {
    // Watch the parent directory: editors and config tools usually replace
    // the file instead of writing it in place, which would orphan a watch
    // on the file itself.
    let dir = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path.file_name().map(|n| n.to_os_string());

    let mut inotify = match Inotify::init() {
        Ok(inotify) => {
            // Non-blocking reads so the thread can notice shutdown.
            let fd = inotify.as_raw_fd();
            let ok = unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                flags != -1 && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != -1
            };
            if !ok {
                warn!("tunables: failed to set inotify non-blocking, reload disabled");
                None
            } else {
                match inotify.watches().add(
                    &dir,
                    WatchMask::CLOSE_WRITE | WatchMask::MOVED_TO | WatchMask::CREATE,
                ) {
                    Ok(_) => Some(inotify),
                    Err(err) => {
                        warn!(
                            "tunables: failed to watch {}: {}, reload disabled",
                            dir.display(),
                            err
                        );
                        None
                    }
                }
            }
        }
        Err(err) => {
            warn!("tunables: failed to init inotify: {}, reload disabled", err);
            None
        }
    };

    while !shutdown.load(Ordering::Relaxed) {
        let mut touched = false;
        if let Some(ref mut inotify_instance) = inotify {
            let mut buffer = [0u8; 4096];
            match inotify_instance.read_events(&mut buffer) {
                Ok(events) => {
                    for event in events {
                        if event.mask.contains(EventMask::ISDIR) {
                            continue;
                        }
                        if let (Some(name), Some(expected)) = (event.name, file_name.as_ref()) {
                            if name == expected.as_os_str() {
                                touched = true;
                            }
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    warn!("tunables: inotify error: {}, reload disabled", err);
                    inotify = None;
                }
            }
        } else {
            break;
        }

        if touched {
            match load_from_file(&path) {
                Ok(tunables) => {
                    if *handle.load() != tunables {
                        info!("tunables: reloaded {:?}", tunables);
                        handle.store(tunables);
                    }
                }
                // Keep the previous snapshot on a bad edit.
                Err(err) => warn!("tunables: reload failed: {:#}", err),
            }
        }

        thread::sleep(Duration::from_millis(200));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_module_params() {
        let t = Tunables::default();
        assert_eq!(t.boost_magnitude, 30);
        assert_eq!(t.boost_duration_ms, 80);
        assert_eq!(t.powerkey_boost_duration_ms, 300);
        assert_eq!(t.min_input_interval_us, 100_000);
        assert!(!t.boosting_disabled());
    }

    #[test]
    fn zero_magnitude_or_duration_disables() {
        let mut t = Tunables::default();
        t.boost_magnitude = 0;
        assert!(t.boosting_disabled());

        let mut t = Tunables::default();
        t.boost_duration_ms = 0;
        assert!(t.boosting_disabled());
    }

    #[test]
    fn duration_follows_kind() {
        let t = Tunables::default();
        assert_eq!(t.duration_ms(BoostKind::Generic), 80);
        assert_eq!(t.duration_ms(BoostKind::PowerKey), 300);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let t: Tunables = serde_json::from_str(r#"{"boost_magnitude": 50}"#).unwrap();
        assert_eq!(t.boost_magnitude, 50);
        assert_eq!(t.boost_duration_ms, 80);
    }

    #[test]
    fn watcher_picks_up_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunables.json");
        std::fs::write(&path, serde_json::to_string(&Tunables::default()).unwrap()).unwrap();

        let handle = TunablesHandle::new(Tunables::default());
        let _watcher = TunablesWatcher::spawn(path.clone(), handle.clone()).unwrap();

        // Give the watcher a moment to arm before rewriting.
        std::thread::sleep(Duration::from_millis(300));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(br#"{"boost_magnitude": 77}"#).unwrap();
        drop(file);

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        loop {
            if handle.load().boost_magnitude == 77 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "watcher never observed the rewrite"
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}
