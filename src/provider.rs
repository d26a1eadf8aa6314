// SPDX-License-Identifier: GPL-2.0
//
// Boost provider seam: apply a scheduling boost to a named domain, hand
// back a token, and restore the previous state on removal.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use log::{debug, warn};

/// Opaque handle for one applied boost instance. Carries what is needed to
/// undo exactly this application and nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoostToken {
    slot: u64,
    restore: String,
}

pub trait BoostOps: Send + Sync {
    /// Raise the domain's priority share by `magnitude`. Failures are
    /// non-fatal to callers; no boost state may be recorded for a failed
    /// apply.
    fn apply(&self, domain: &str, magnitude: u32) -> Result<BoostToken>;

    /// Best-effort removal. Errors are logged inside the provider and not
    /// surfaced.
    fn remove(&self, domain: &str, token: BoostToken);
}

/// Boost provider backed by cgroup v2 `cpu.uclamp.min`. A domain name maps
/// to a cgroup directory under the configured root; applying a boost writes
/// the magnitude as the minimum utilization clamp and the token remembers
/// the value it replaced.
pub struct UclampBoost {
    cgroup_root: PathBuf,
    next_slot: AtomicU64,
}

impl UclampBoost {
    pub fn new(cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            next_slot: AtomicU64::new(0),
        }
    }

    fn knob_path(&self, domain: &str) -> PathBuf {
        self.cgroup_root.join(domain).join("cpu.uclamp.min")
    }
}

impl BoostOps for UclampBoost {
    fn apply(&self, domain: &str, magnitude: u32) -> Result<BoostToken> {
        let path = self.knob_path(domain);
        let prev = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        fs::write(&path, format!("{}\n", magnitude))
            .with_context(|| format!("failed to write {}", path.display()))?;

        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        debug!("boost slot {} applied to '{}' (uclamp.min {})", slot, domain, magnitude);
        Ok(BoostToken {
            slot,
            restore: prev.trim().to_string(),
        })
    }

    fn remove(&self, domain: &str, token: BoostToken) {
        let path = self.knob_path(domain);
        if let Err(err) = fs::write(&path, format!("{}\n", token.restore)) {
            warn!(
                "failed to restore '{}' after boost slot {}: {}",
                domain, token.slot, err
            );
        } else {
            debug!("boost slot {} removed from '{}'", token.slot, domain);
        }
    }
}

#[cfg(test)]
pub struct MockBoost {
    pub applies: AtomicU64,
    pub removes: AtomicU64,
    pub active: std::sync::atomic::AtomicI64,
    pub max_active: std::sync::atomic::AtomicI64,
    pub last_magnitude: AtomicU64,
    fail_apply: std::sync::atomic::AtomicBool,
    apply_delay: std::time::Duration,
    next_slot: AtomicU64,
}

#[cfg(test)]
impl MockBoost {
    pub fn new() -> Self {
        Self::with_delay(std::time::Duration::ZERO)
    }

    pub fn with_delay(apply_delay: std::time::Duration) -> Self {
        Self {
            applies: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            active: std::sync::atomic::AtomicI64::new(0),
            max_active: std::sync::atomic::AtomicI64::new(0),
            last_magnitude: AtomicU64::new(0),
            fail_apply: std::sync::atomic::AtomicBool::new(false),
            apply_delay,
            next_slot: AtomicU64::new(0),
        }
    }

    pub fn failing() -> Self {
        let mock = Self::new();
        mock.fail_apply.store(true, Ordering::SeqCst);
        mock
    }
}

#[cfg(test)]
impl BoostOps for MockBoost {
    fn apply(&self, _domain: &str, magnitude: u32) -> Result<BoostToken> {
        if !self.apply_delay.is_zero() {
            std::thread::sleep(self.apply_delay);
        }
        self.applies.fetch_add(1, Ordering::SeqCst);
        if self.fail_apply.load(Ordering::SeqCst) {
            anyhow::bail!("injected apply failure");
        }
        self.last_magnitude.store(magnitude as u64, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        Ok(BoostToken {
            slot: self.next_slot.fetch_add(1, Ordering::SeqCst),
            restore: "0".to_string(),
        })
    }

    fn remove(&self, _domain: &str, _token: BoostToken) {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uclamp_paths_are_per_domain() {
        let provider = UclampBoost::new("/sys/fs/cgroup");
        assert_eq!(
            provider.knob_path("top-app"),
            PathBuf::from("/sys/fs/cgroup/top-app/cpu.uclamp.min")
        );
    }

    #[test]
    fn uclamp_apply_restores_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let domain_dir = dir.path().join("top-app");
        fs::create_dir(&domain_dir).unwrap();
        let knob = domain_dir.join("cpu.uclamp.min");
        fs::write(&knob, "12\n").unwrap();

        let provider = UclampBoost::new(dir.path());
        let token = provider.apply("top-app", 30).unwrap();
        assert_eq!(fs::read_to_string(&knob).unwrap().trim(), "30");

        provider.remove("top-app", token);
        assert_eq!(fs::read_to_string(&knob).unwrap().trim(), "12");
    }

    #[test]
    fn uclamp_apply_fails_without_cgroup() {
        let dir = tempfile::tempdir().unwrap();
        let provider = UclampBoost::new(dir.path());
        assert!(provider.apply("missing", 30).is_err());
    }
}
