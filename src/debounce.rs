// SPDX-License-Identifier: GPL-2.0
//
// inputboostd: input debounce gate and classifier.
//
// This is the only code on the input-delivery path. It must never block,
// never allocate per event, and never surface an error: every failure
// mode is a silent drop, because a missed boost only costs latency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use evdev::EventType;
use once_cell::sync::Lazy;

use crate::config::TunablesHandle;
use crate::device;
use crate::dispatch::{BoostKind, Dispatcher};
use crate::stats::Counters;

/// Process-wide monotonic clock base.
static CLOCK_BASE: Lazy<Instant> = Lazy::new(Instant::now);

/// Sentinel for "no event accepted yet".
const NEVER: u64 = u64::MAX;

pub fn now_us() -> u64 {
    CLOCK_BASE.elapsed().as_micros() as u64
}

pub struct Debouncer {
    /// Monotonic µs timestamp of the last accepted event.
    last_input_us: AtomicU64,
    tunables: TunablesHandle,
    counters: Arc<Counters>,
}

impl Debouncer {
    pub fn new(tunables: TunablesHandle, counters: Arc<Counters>) -> Self {
        Self {
            last_input_us: AtomicU64::new(NEVER),
            tunables,
            counters,
        }
    }

    /// Raw input hook, one call per event delivered by the event loop.
    pub fn on_event(&self, dispatcher: &Dispatcher, event_type: EventType, code: u16, value: i32) {
        // Zero-delta relative events are polling noise, not user activity.
        if event_type == EventType::RELATIVE && value == 0 {
            return;
        }
        let kind = device::classify_event(event_type, code);
        self.trigger(dispatcher, kind);
    }

    /// Boost injector for collaborators outside the input path (the
    /// control socket's `boost` command). Same gate, always generic.
    pub fn external_boost_trigger(&self, dispatcher: &Dispatcher) {
        self.counters.external_triggers.fetch_add(1, Ordering::Relaxed);
        self.trigger(dispatcher, BoostKind::Generic);
    }

    fn trigger(&self, dispatcher: &Dispatcher, kind: BoostKind) {
        self.counters.events_seen.fetch_add(1, Ordering::Relaxed);

        let tunables = self.tunables.load();
        if tunables.boosting_disabled() {
            return;
        }

        let now = now_us();
        if !self.accept_at(now, tunables.min_input_interval_us) {
            self.counters.events_debounced.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let queue = dispatcher.queue(kind);
        if queue.is_pending() {
            // A fresher activation is already on its way; this event adds
            // nothing. The debounce clock is left untouched on this path.
            self.counters.events_dropped_pending.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if queue.enqueue() {
            match kind {
                BoostKind::Generic => {
                    self.counters.generic_enqueued.fetch_add(1, Ordering::Relaxed)
                }
                BoostKind::PowerKey => {
                    self.counters.powerkey_enqueued.fetch_add(1, Ordering::Relaxed)
                }
            };
            self.last_input_us.store(now, Ordering::Relaxed);
        }
    }

    fn accept_at(&self, now_us: u64, interval_us: u64) -> bool {
        let last = self.last_input_us.load(Ordering::Relaxed);
        last == NEVER || now_us.saturating_sub(last) >= interval_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boost::BoostEngine;
    use crate::config::Tunables;
    use crate::provider::{BoostOps, MockBoost};

    fn test_stack(tunables: Tunables) -> (Arc<MockBoost>, Dispatcher, Debouncer) {
        let mock = Arc::new(MockBoost::new());
        let counters = Counters::new();
        let handle = TunablesHandle::new(tunables);
        let engine = Arc::new(
            BoostEngine::spawn(
                "top-app",
                Arc::clone(&mock) as Arc<dyn BoostOps>,
                handle.clone(),
                Arc::clone(&counters),
            )
            .unwrap(),
        );
        let dispatcher = Dispatcher::spawn(engine, &[], 2).unwrap();
        let debouncer = Debouncer::new(handle, counters);
        (mock, dispatcher, debouncer)
    }

    #[test]
    fn events_inside_window_are_dropped() {
        let d = Debouncer::new(TunablesHandle::new(Tunables::default()), Counters::new());
        assert!(d.accept_at(0, 100_000));
        d.last_input_us.store(0, Ordering::Relaxed);
        assert!(!d.accept_at(50_000, 100_000));
        assert!(!d.accept_at(99_999, 100_000));
        assert!(d.accept_at(100_000, 100_000));
        assert!(d.accept_at(250_000, 100_000));
    }

    #[test]
    fn first_event_is_always_accepted() {
        let d = Debouncer::new(TunablesHandle::new(Tunables::default()), Counters::new());
        assert!(d.accept_at(1, 100_000));
    }

    #[test]
    fn burst_coalesces_to_one_enqueue() {
        let (mock, dispatcher, debouncer) = test_stack(Tunables::default());

        // Two touch events 10ms apart: the second is inside the debounce
        // window and must cause no second apply.
        debouncer.on_event(&dispatcher, EventType::ABSOLUTE, 53, 120);
        std::thread::sleep(std::time::Duration::from_millis(10));
        debouncer.on_event(&dispatcher, EventType::ABSOLUTE, 53, 130);

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(mock.applies.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disabled_config_never_enqueues() {
        let mut tunables = Tunables::default();
        tunables.boost_magnitude = 0;
        let (mock, dispatcher, debouncer) = test_stack(tunables);

        for _ in 0..50 {
            debouncer.on_event(&dispatcher, EventType::ABSOLUTE, 53, 120);
        }
        debouncer.external_boost_trigger(&dispatcher);

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(mock.applies.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn external_trigger_goes_through_the_same_gate() {
        let (mock, dispatcher, debouncer) = test_stack(Tunables::default());

        debouncer.external_boost_trigger(&dispatcher);
        // Inside the debounce window: dropped.
        debouncer.external_boost_trigger(&dispatcher);

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(mock.applies.load(Ordering::SeqCst), 1);
    }
}
