// SPDX-License-Identifier: GPL-2.0
//
// inputboostd: counters for the event-to-boost pipeline.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use serde::{Deserialize, Serialize};

/// Live counters bumped from the hot paths. Plain relaxed atomics; readers
/// take a snapshot, they never see a consistent cut and do not need one.
#[derive(Debug, Default)]
pub struct Counters {
    pub events_seen: AtomicU64,
    pub events_debounced: AtomicU64,
    pub events_dropped_pending: AtomicU64,
    pub generic_enqueued: AtomicU64,
    pub powerkey_enqueued: AtomicU64,
    pub external_triggers: AtomicU64,
    pub boosts_applied: AtomicU64,
    pub boosts_failed: AtomicU64,
    pub boosts_replaced: AtomicU64,
    pub resets_expired: AtomicU64,
    pub disconnect_resets: AtomicU64,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self, boost_active: bool) -> Metrics {
        Metrics {
            events_seen: self.events_seen.load(Ordering::Relaxed),
            events_debounced: self.events_debounced.load(Ordering::Relaxed),
            events_dropped_pending: self.events_dropped_pending.load(Ordering::Relaxed),
            generic_enqueued: self.generic_enqueued.load(Ordering::Relaxed),
            powerkey_enqueued: self.powerkey_enqueued.load(Ordering::Relaxed),
            external_triggers: self.external_triggers.load(Ordering::Relaxed),
            boosts_applied: self.boosts_applied.load(Ordering::Relaxed),
            boosts_failed: self.boosts_failed.load(Ordering::Relaxed),
            boosts_replaced: self.boosts_replaced.load(Ordering::Relaxed),
            resets_expired: self.resets_expired.load(Ordering::Relaxed),
            disconnect_resets: self.disconnect_resets.load(Ordering::Relaxed),
            boost_active: boost_active as u64,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub events_seen: u64,
    pub events_debounced: u64,
    pub events_dropped_pending: u64,
    pub generic_enqueued: u64,
    pub powerkey_enqueued: u64,
    pub external_triggers: u64,
    pub boosts_applied: u64,
    pub boosts_failed: u64,
    pub boosts_replaced: u64,
    pub resets_expired: u64,
    pub disconnect_resets: u64,
    pub boost_active: u64,
}

impl Metrics {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let accepted = self.generic_enqueued + self.powerkey_enqueued;
        let accept_pct = if self.events_seen > 0 {
            (accepted as f64) * 100.0 / (self.events_seen as f64)
        } else {
            0.0
        };

        let now = Local::now();
        writeln!(w, "┌─ {} {} ─", crate::DAEMON_NAME, now.format("%H:%M:%S"))?;
        writeln!(
            w,
            "│ ev {:>7}  deb {:>6}  pend {:>6}  acc {:>6} ({:>4.1}%)",
            self.events_seen, self.events_debounced, self.events_dropped_pending, accepted, accept_pct
        )?;
        writeln!(
            w,
            "│ q: gen {:>6}  pwr {:>6}  ext {:>6}",
            self.generic_enqueued, self.powerkey_enqueued, self.external_triggers
        )?;
        writeln!(
            w,
            "│ boost: apl {:>5}  rep {:>5}  fail {:>4}  exp {:>5}  disc {:>4}  {}",
            self.boosts_applied,
            self.boosts_replaced,
            self.boosts_failed,
            self.resets_expired,
            self.disconnect_resets,
            if self.boost_active != 0 { "ON" } else { "off" }
        )?;
        writeln!(w, "└─")?;
        Ok(())
    }

    pub fn delta(&self, prev: &Self) -> Self {
        Self {
            events_seen: self.events_seen.saturating_sub(prev.events_seen),
            events_debounced: self.events_debounced.saturating_sub(prev.events_debounced),
            events_dropped_pending: self
                .events_dropped_pending
                .saturating_sub(prev.events_dropped_pending),
            generic_enqueued: self.generic_enqueued.saturating_sub(prev.generic_enqueued),
            powerkey_enqueued: self.powerkey_enqueued.saturating_sub(prev.powerkey_enqueued),
            external_triggers: self.external_triggers.saturating_sub(prev.external_triggers),
            boosts_applied: self.boosts_applied.saturating_sub(prev.boosts_applied),
            boosts_failed: self.boosts_failed.saturating_sub(prev.boosts_failed),
            boosts_replaced: self.boosts_replaced.saturating_sub(prev.boosts_replaced),
            resets_expired: self.resets_expired.saturating_sub(prev.resets_expired),
            disconnect_resets: self.disconnect_resets.saturating_sub(prev.disconnect_resets),
            boost_active: self.boost_active, // live flag, not delta
        }
    }

    pub fn has_activity(&self) -> bool {
        self.events_seen != 0
            || self.external_triggers != 0
            || self.boosts_applied != 0
            || self.resets_expired != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_includes_numbers() {
        let m = Metrics {
            events_seen: 120,
            events_debounced: 40,
            generic_enqueued: 10,
            powerkey_enqueued: 2,
            boosts_applied: 12,
            boost_active: 1,
            ..Default::default()
        };
        let mut out = Vec::new();
        m.format(&mut out).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("120"));
        assert!(s.contains("ON"));
    }

    #[test]
    fn delta_subtracts_counters_but_keeps_live_flag() {
        let prev = Metrics {
            events_seen: 100,
            boosts_applied: 8,
            ..Default::default()
        };
        let cur = Metrics {
            events_seen: 150,
            boosts_applied: 11,
            boost_active: 1,
            ..Default::default()
        };
        let d = cur.delta(&prev);
        assert_eq!(d.events_seen, 50);
        assert_eq!(d.boosts_applied, 3);
        assert_eq!(d.boost_active, 1);
        assert!(d.has_activity());
    }

    #[test]
    fn snapshot_reflects_counters() {
        let counters = Counters::new();
        counters.events_seen.fetch_add(3, Ordering::Relaxed);
        counters.boosts_applied.fetch_add(1, Ordering::Relaxed);
        let m = counters.snapshot(true);
        assert_eq!(m.events_seen, 3);
        assert_eq!(m.boosts_applied, 1);
        assert_eq!(m.boost_active, 1);
    }
}
