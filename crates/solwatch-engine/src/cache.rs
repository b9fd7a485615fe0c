//! Last-known balance cache, keyed by (public key, mint).
//!
//! The cache is the only mutable state shared across reconciliation workers.
//! Each (key, mint) read-modify-write happens under the dashmap entry lock,
//! so concurrent workers handling different keys never contend on the same
//! entry. A global gap epoch invalidates all entries at once: entries written
//! before the most recent gap are treated as absent for diffing.

use {
    dashmap::{mapref::entry::Entry as MapEntry, DashMap},
    rust_decimal::Decimal,
    std::sync::atomic::{AtomicU64, Ordering},
    solwatch_store::CachedBalanceRow,
};

#[derive(Debug, Clone, Copy)]
struct Entry {
    balance: Decimal,
    slot: u64,
    epoch: u64,
}

/// Outcome of observing one account snapshot against the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    /// No usable prior value: first observation, or first after a gap.
    /// The cache now holds the observed value.
    Baseline,
    /// Balance differs from the cached value. `applied` is false when the
    /// snapshot's slot is older than the cached slot, in which case the cache
    /// kept the newer value and the delta is history-only.
    Delta { old: Decimal, applied: bool },
    /// Balance matches the cached value.
    Unchanged,
    /// The snapshot was dispatched before the most recent gap but a newer
    /// post-gap value is already cached. Its continuity is lost; it must
    /// produce neither a delta nor a baseline.
    Stale,
}

pub struct BalanceCache {
    entries: DashMap<(String, String), Entry>,
    gap_epoch: AtomicU64,
}

impl BalanceCache {
    pub fn new() -> Self {
        Self { entries: DashMap::new(), gap_epoch: AtomicU64::new(0) }
    }

    /// Seed from persisted history at startup. Hydrated entries belong to the
    /// current epoch: persisted state is continuous with the history it came
    /// from.
    pub fn hydrate(&self, rows: Vec<CachedBalanceRow>) {
        let epoch = self.gap_epoch.load(Ordering::Acquire);
        for row in rows {
            self.entries.insert(
                (row.public_key, row.mint_address),
                Entry { balance: row.balance, slot: row.slot as u64, epoch },
            );
        }
    }

    /// Invalidate all cached values for diffing. Called on a `Gap` event.
    pub fn mark_gap(&self) {
        self.gap_epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Epoch to stamp on an update at dispatch time. The dispatcher reads
    /// this before queueing each update so that snapshots already in flight
    /// when a gap lands keep their pre-gap epoch.
    pub fn current_epoch(&self) -> u64 {
        self.gap_epoch.load(Ordering::Acquire)
    }

    /// Observe a snapshot dispatched at `epoch`, updating the cache per the
    /// slot-ordering rule: the cached value is only overwritten when `slot`
    /// is at least the cached slot, except across a gap where the newer
    /// epoch always wins.
    pub fn observe(
        &self,
        epoch: u64,
        public_key: &str,
        mint: &str,
        balance: Decimal,
        slot: u64,
    ) -> Observed {
        let key = (public_key.to_string(), mint.to_string());

        let mut entry = match self.entries.entry(key) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry { balance, slot, epoch });
                return Observed::Baseline;
            }
            MapEntry::Occupied(occupied) => occupied,
        };

        let cached = *entry.get();
        if cached.epoch < epoch {
            entry.insert(Entry { balance, slot, epoch });
            return Observed::Baseline;
        }
        if cached.epoch > epoch {
            return Observed::Stale;
        }

        if balance == cached.balance {
            if slot >= cached.slot {
                entry.insert(Entry { balance, slot, epoch });
            }
            return Observed::Unchanged;
        }

        let applied = slot >= cached.slot;
        if applied {
            entry.insert(Entry { balance, slot, epoch });
        }
        Observed::Delta { old: cached.balance, applied }
    }

    /// Last-known balance for a pair, ignoring entries staled by a gap.
    pub fn last_known(&self, public_key: &str, mint: &str) -> Option<(Decimal, u64)> {
        let epoch = self.gap_epoch.load(Ordering::Acquire);
        self.entries
            .get(&(public_key.to_string(), mint.to_string()))
            .filter(|e| e.epoch == epoch)
            .map(|e| (e.balance, e.slot))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for BalanceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "K1";
    const MINT: &str = "11111111111111111111111111111112";

    #[test]
    fn first_observation_is_baseline() {
        let cache = BalanceCache::new();
        assert_eq!(cache.observe(cache.current_epoch(), KEY, MINT, Decimal::from(100), 10), Observed::Baseline);
        assert_eq!(cache.last_known(KEY, MINT), Some((Decimal::from(100), 10)));
    }

    #[test]
    fn delta_against_cached_value() {
        let cache = BalanceCache::new();
        cache.observe(cache.current_epoch(), KEY, MINT, Decimal::from(100), 10);
        assert_eq!(
            cache.observe(cache.current_epoch(), KEY, MINT, Decimal::from(150), 11),
            Observed::Delta { old: Decimal::from(100), applied: true }
        );
        assert_eq!(cache.last_known(KEY, MINT), Some((Decimal::from(150), 11)));
    }

    #[test]
    fn out_of_order_older_slot_does_not_overwrite() {
        let cache = BalanceCache::new();
        cache.observe(cache.current_epoch(), KEY, MINT, Decimal::from(150), 11);
        let observed = cache.observe(cache.current_epoch(), KEY, MINT, Decimal::from(100), 10);
        assert_eq!(observed, Observed::Delta { old: Decimal::from(150), applied: false });
        // Cache still holds the highest-slot value.
        assert_eq!(cache.last_known(KEY, MINT), Some((Decimal::from(150), 11)));
    }

    #[test]
    fn equal_slot_overwrites() {
        let cache = BalanceCache::new();
        cache.observe(cache.current_epoch(), KEY, MINT, Decimal::from(100), 10);
        assert_eq!(
            cache.observe(cache.current_epoch(), KEY, MINT, Decimal::from(120), 10),
            Observed::Delta { old: Decimal::from(100), applied: true }
        );
        assert_eq!(cache.last_known(KEY, MINT), Some((Decimal::from(120), 10)));
    }

    #[test]
    fn unchanged_balance_advances_slot_only() {
        let cache = BalanceCache::new();
        cache.observe(cache.current_epoch(), KEY, MINT, Decimal::from(100), 10);
        assert_eq!(cache.observe(cache.current_epoch(), KEY, MINT, Decimal::from(100), 12), Observed::Unchanged);
        assert_eq!(cache.last_known(KEY, MINT), Some((Decimal::from(100), 12)));
    }

    #[test]
    fn gap_resets_to_baseline_even_for_cached_keys() {
        let cache = BalanceCache::new();
        cache.observe(cache.current_epoch(), KEY, MINT, Decimal::from(100), 10);
        cache.mark_gap();

        assert_eq!(cache.last_known(KEY, MINT), None);
        // Post-gap snapshot is a baseline, not a delta, and wins regardless
        // of slot ordering against the stale entry.
        assert_eq!(cache.observe(cache.current_epoch(), KEY, MINT, Decimal::from(40), 8), Observed::Baseline);
        assert_eq!(cache.last_known(KEY, MINT), Some((Decimal::from(40), 8)));
    }

    #[test]
    fn in_flight_pre_gap_snapshot_keeps_its_epoch() {
        let cache = BalanceCache::new();
        // Snapshot dispatched before the gap, processed after it: it must
        // not be stamped with the post-gap epoch.
        let pre_gap = cache.current_epoch();
        cache.mark_gap();
        assert_eq!(
            cache.observe(pre_gap, KEY, MINT, Decimal::from(100), 10),
            Observed::Baseline
        );

        // The first genuinely post-gap snapshot is a baseline, not a delta
        // against the pre-gap value.
        assert_eq!(
            cache.observe(cache.current_epoch(), KEY, MINT, Decimal::from(400), 20),
            Observed::Baseline
        );
        assert_eq!(cache.last_known(KEY, MINT), Some((Decimal::from(400), 20)));
    }

    #[test]
    fn pre_gap_snapshot_after_post_gap_baseline_is_stale() {
        let cache = BalanceCache::new();
        let pre_gap = cache.current_epoch();
        cache.mark_gap();
        cache.observe(cache.current_epoch(), KEY, MINT, Decimal::from(400), 20);

        // Late pre-gap snapshot: continuity is lost, nothing to diff.
        assert_eq!(
            cache.observe(pre_gap, KEY, MINT, Decimal::from(100), 10),
            Observed::Stale
        );
        assert_eq!(cache.last_known(KEY, MINT), Some((Decimal::from(400), 20)));
    }

    #[test]
    fn hydrate_seeds_current_epoch() {
        let cache = BalanceCache::new();
        cache.hydrate(vec![CachedBalanceRow {
            public_key: KEY.into(),
            mint_address: MINT.into(),
            balance: Decimal::from(70),
            slot: 5,
        }]);
        assert_eq!(
            cache.observe(cache.current_epoch(), KEY, MINT, Decimal::from(90), 6),
            Observed::Delta { old: Decimal::from(70), applied: true }
        );
    }
}
