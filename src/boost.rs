// SPDX-License-Identifier: GPL-2.0
//
// inputboostd: boost state machine.
//
// Owns the single per-domain boost session and the deferred reset that
// reverts it. All transitions run under one session lock, including the
// provider calls, so an expiry can never interleave with a fresh
// activation for the same domain and the two dispatch workers serialize
// here when they target the same domain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::config::TunablesHandle;
use crate::dispatch::BoostKind;
use crate::provider::{BoostOps, BoostToken};
use crate::stats::Counters;

/// Upper bound on one timer park, so the timer thread notices shutdown
/// even with no reset armed.
const TIMER_PARK: Duration = Duration::from_millis(200);

/// The one session per domain. Mutated in place on every transition,
/// never duplicated.
#[derive(Debug, Default)]
struct BoostSession {
    magnitude: u32,
    token: Option<BoostToken>,
    active: bool,
    /// Deadline of the pending deferred reset. Activation overwrites it
    /// under the lock, which is what cancels a stale reset: the timer
    /// re-reads it under the same lock before firing.
    reset_deadline: Option<Instant>,
}

struct Shared {
    session: Mutex<BoostSession>,
    timer_cv: Condvar,
}

pub struct BoostEngine {
    domain: String,
    provider: Arc<dyn BoostOps>,
    tunables: TunablesHandle,
    counters: Arc<Counters>,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

impl BoostEngine {
    pub fn spawn(
        domain: impl Into<String>,
        provider: Arc<dyn BoostOps>,
        tunables: TunablesHandle,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        let domain = domain.into();
        let shared = Arc::new(Shared {
            session: Mutex::new(BoostSession::default()),
            timer_cv: Condvar::new(),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let timer = {
            let shared = Arc::clone(&shared);
            let provider = Arc::clone(&provider);
            let counters = Arc::clone(&counters);
            let shutdown = Arc::clone(&shutdown);
            let domain = domain.clone();
            thread::Builder::new()
                .name("boost-reset-timer".to_string())
                .spawn(move || timer_loop(shared, provider, domain, counters, shutdown))
                .context("failed to spawn boost reset timer thread")?
        };

        Ok(Self {
            domain,
            provider,
            tunables,
            counters,
            shared,
            shutdown,
            timer: Some(timer),
        })
    }

    /// Apply a boost of the given kind, superseding whatever is active.
    /// Runs in worker context and may block on the session lock and the
    /// provider; it never runs on the input-delivery path.
    pub fn activate(&self, kind: BoostKind) {
        let tunables = self.tunables.load();
        if tunables.boosting_disabled() {
            return;
        }
        let magnitude = tunables.boost_magnitude;
        let duration = Duration::from_millis(tunables.duration_ms(kind));

        let mut session = self.shared.session.lock().unwrap();

        // Cancel any pending reset first. The timer only fires while
        // holding this lock, so from here on the old deadline is dead.
        session.reset_deadline = None;

        // Unwind an interrupted boost cleanly before reapplying.
        if session.active {
            if let Some(token) = session.token.take() {
                self.provider.remove(&self.domain, token);
            }
            session.active = false;
            self.counters.boosts_replaced.fetch_add(1, Ordering::Relaxed);
        }

        match self.provider.apply(&self.domain, magnitude) {
            Ok(token) => {
                session.magnitude = magnitude;
                session.token = Some(token);
                session.active = true;
                session.reset_deadline = Some(Instant::now() + duration);
                self.counters.boosts_applied.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "boost '{}' active for {}ms ({:?})",
                    self.domain,
                    duration.as_millis(),
                    kind
                );
                self.shared.timer_cv.notify_one();
            }
            Err(err) => {
                // No reset is armed for a boost that never took effect.
                self.counters.boosts_failed.fetch_add(1, Ordering::Relaxed);
                warn!("boost apply failed for '{}': {:#}", self.domain, err);
            }
        }
    }

    /// Drop any active boost immediately, regardless of timer state. Used
    /// when the event source goes away and at daemon teardown.
    pub fn deactivate(&self) {
        let mut session = self.shared.session.lock().unwrap();
        session.reset_deadline = None;
        if session.active {
            if let Some(token) = session.token.take() {
                self.provider.remove(&self.domain, token);
            }
            session.active = false;
            self.counters.disconnect_resets.fetch_add(1, Ordering::Relaxed);
            info!(
                "boost '{}' (magnitude {}) deactivated on disconnect",
                self.domain, session.magnitude
            );
        }
        self.shared.timer_cv.notify_one();
    }

    pub fn is_active(&self) -> bool {
        self.shared.session.lock().unwrap().active
    }
}

impl Drop for BoostEngine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.shared.timer_cv.notify_all();
        if let Some(handle) = self.timer.take() {
            let _ = handle.join();
        }
    }
}

fn timer_loop(
    shared: Arc<Shared>,
    provider: Arc<dyn BoostOps>,
    domain: String,
    counters: Arc<Counters>,
    shutdown: Arc<AtomicBool>,
) {
    let mut session = shared.session.lock().unwrap();
    while !shutdown.load(Ordering::Relaxed) {
        let park = match session.reset_deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    session.reset_deadline = None;
                    if session.active {
                        let token = session.token.take();
                        session.active = false;
                        if let Some(token) = token {
                            provider.remove(&domain, token);
                        }
                        counters.resets_expired.fetch_add(1, Ordering::Relaxed);
                        debug!("boost '{}' expired", domain);
                    }
                    continue;
                }
                (deadline - now).min(TIMER_PARK)
            }
            None => TIMER_PARK,
        };
        let (guard, _) = shared.timer_cv.wait_timeout(session, park).unwrap();
        session = guard;
    }
}
