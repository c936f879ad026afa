//! Resource ledger: admission budget and eviction policy.
//!
//! Tracks the declared cost of every non-unloaded model against a hard
//! ceiling on resident bytes and resident model slots. Reservation and
//! admission are one atomic region so two concurrent large loads cannot
//! both be admitted off a stale reading.

use std::collections::HashSet;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;

/// Budget configuration for the ledger.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Ceiling on the summed declared cost of resident models.
    pub max_resident_bytes: u64,
    /// Ceiling on the number of resident models.
    pub max_resident_models: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_resident_bytes: 8 * 1024 * 1024 * 1024, // 8 GiB
            max_resident_models: 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(
        "budget exhausted: {needed_bytes} bytes requested, {available_bytes} available \
         ({used_slots}/{max_slots} slots in use)"
    )]
    BudgetExhausted {
        needed_bytes: u64,
        available_bytes: u64,
        used_slots: usize,
        max_slots: usize,
    },
}

/// A resident model as seen by the eviction policy.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub name: String,
    pub refcount: u32,
    pub last_used: Instant,
    pub loaded_at: Instant,
}

#[derive(Debug, Default)]
struct LedgerInner {
    used_bytes: u64,
    used_slots: usize,
}

/// Process-wide admission ledger.
pub struct ResourceLedger {
    config: LedgerConfig,
    inner: Mutex<LedgerInner>,
}

impl ResourceLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Whether `cost_bytes` more would fit right now. Advisory only; use
    /// [`try_reserve`](Self::try_reserve) for the actual admission.
    pub fn can_admit(&self, cost_bytes: u64) -> bool {
        let inner = self.inner.lock();
        inner.used_bytes + cost_bytes <= self.config.max_resident_bytes
            && inner.used_slots < self.config.max_resident_models
    }

    /// Admission check and reservation in one critical section.
    pub fn try_reserve(&self, cost_bytes: u64) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        let fits_bytes = inner.used_bytes + cost_bytes <= self.config.max_resident_bytes;
        let fits_slot = inner.used_slots < self.config.max_resident_models;
        if !fits_bytes || !fits_slot {
            return Err(LedgerError::BudgetExhausted {
                needed_bytes: cost_bytes,
                available_bytes: self
                    .config
                    .max_resident_bytes
                    .saturating_sub(inner.used_bytes),
                used_slots: inner.used_slots,
                max_slots: self.config.max_resident_models,
            });
        }
        inner.used_bytes += cost_bytes;
        inner.used_slots += 1;
        Ok(())
    }

    /// Return a reservation. Called only after the owning model's unload
    /// has been confirmed by its adapter (or its load failed).
    pub fn release(&self, cost_bytes: u64) {
        let mut inner = self.inner.lock();
        inner.used_bytes = inner.used_bytes.saturating_sub(cost_bytes);
        inner.used_slots = inner.used_slots.saturating_sub(1);
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    pub fn used_slots(&self) -> usize {
        self.inner.lock().used_slots
    }

    /// Pick the eviction victim among `candidates`: least recently used of
    /// the refcount-0 instances not in `excluding`, ties broken by the
    /// earliest load time. Returns `None` when nothing is evictable.
    ///
    /// Deliberately not cost-aware: observed workloads are bounded by
    /// concurrency, not single outliers.
    pub fn pick_eviction_candidate(
        &self,
        candidates: impl IntoIterator<Item = EvictionCandidate>,
        excluding: &HashSet<String>,
    ) -> Option<String> {
        candidates
            .into_iter()
            .filter(|c| c.refcount == 0 && !excluding.contains(&c.name))
            .min_by_key(|c| (c.last_used, c.loaded_at))
            .map(|c| c.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn candidate(name: &str, refcount: u32, used_ago: u64, loaded_ago: u64) -> EvictionCandidate {
        // Anchor in the future; subtracting from a fresh monotonic clock
        // can underflow.
        let base = Instant::now() + Duration::from_secs(7200);
        EvictionCandidate {
            name: name.to_string(),
            refcount,
            last_used: base - Duration::from_secs(used_ago),
            loaded_at: base - Duration::from_secs(loaded_ago),
        }
    }

    #[test]
    fn test_reserve_and_release_round_trip() {
        let ledger = ResourceLedger::new(LedgerConfig {
            max_resident_bytes: 100,
            max_resident_models: 2,
        });

        ledger.try_reserve(60).unwrap();
        assert_eq!(ledger.used_bytes(), 60);
        assert_eq!(ledger.used_slots(), 1);

        ledger.release(60);
        assert_eq!(ledger.used_bytes(), 0);
        assert_eq!(ledger.used_slots(), 0);
    }

    #[test]
    fn test_reserve_rejects_over_byte_budget() {
        let ledger = ResourceLedger::new(LedgerConfig {
            max_resident_bytes: 100,
            max_resident_models: 4,
        });

        ledger.try_reserve(80).unwrap();
        let err = ledger.try_reserve(30).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::BudgetExhausted {
                needed_bytes: 30,
                available_bytes: 20,
                ..
            }
        ));
        // The failed attempt must not leak a partial reservation.
        assert_eq!(ledger.used_bytes(), 80);
        assert_eq!(ledger.used_slots(), 1);
    }

    #[test]
    fn test_reserve_rejects_over_slot_budget() {
        let ledger = ResourceLedger::new(LedgerConfig {
            max_resident_bytes: 1_000,
            max_resident_models: 1,
        });

        ledger.try_reserve(10).unwrap();
        assert!(ledger.try_reserve(10).is_err());
        assert!(!ledger.can_admit(10));
    }

    #[test]
    fn test_release_saturates_at_zero() {
        let ledger = ResourceLedger::new(LedgerConfig::default());
        ledger.release(1_000);
        assert_eq!(ledger.used_bytes(), 0);
        assert_eq!(ledger.used_slots(), 0);
    }

    #[test]
    fn test_eviction_picks_least_recently_used() {
        let ledger = ResourceLedger::new(LedgerConfig::default());
        let picked = ledger.pick_eviction_candidate(
            vec![
                candidate("fresh", 0, 1, 100),
                candidate("stale", 0, 50, 100),
            ],
            &HashSet::new(),
        );
        assert_eq!(picked.as_deref(), Some("stale"));
    }

    #[test]
    fn test_eviction_skips_pinned_and_excluded() {
        let ledger = ResourceLedger::new(LedgerConfig::default());
        let excluding: HashSet<String> = ["wanted".to_string()].into();

        let picked = ledger.pick_eviction_candidate(
            vec![
                candidate("pinned", 2, 90, 100),
                candidate("wanted", 0, 80, 100),
                candidate("idle", 0, 10, 100),
            ],
            &excluding,
        );
        assert_eq!(picked.as_deref(), Some("idle"));

        let none = ledger.pick_eviction_candidate(vec![candidate("pinned", 1, 90, 100)], &excluding);
        assert!(none.is_none());
    }

    #[test]
    fn test_eviction_tie_broken_by_oldest_load() {
        let ledger = ResourceLedger::new(LedgerConfig::default());
        let base = Instant::now() + Duration::from_secs(7200);
        let same_used = base - Duration::from_secs(30);

        let picked = ledger.pick_eviction_candidate(
            vec![
                EvictionCandidate {
                    name: "younger".to_string(),
                    refcount: 0,
                    last_used: same_used,
                    loaded_at: base - Duration::from_secs(60),
                },
                EvictionCandidate {
                    name: "older".to_string(),
                    refcount: 0,
                    last_used: same_used,
                    loaded_at: base - Duration::from_secs(600),
                },
            ],
            &HashSet::new(),
        );
        assert_eq!(picked.as_deref(), Some("older"));
    }
}
