//! Fingerprint-keyed subscription bookkeeping.
//!
//! Subscribing twice under one fingerprint returns the same buffer and bumps
//! the reference count; records only leave the registry on an explicit
//! cleanup pass, and never while referenced or on the perpetual allow-list.
//! Generic over the buffer handle so the accounting is testable without a
//! browser.

use rustc_hash::{FxHashMap, FxHashSet};

pub struct SubscriptionRecord<B> {
    pub buffer: B,
    pub ref_count: i32,
}

pub struct SubscriptionRegistry<B> {
    subs: FxHashMap<String, SubscriptionRecord<B>>,
    perpetual: FxHashSet<String>,
}

impl<B: Clone> SubscriptionRegistry<B> {
    pub fn new() -> Self {
        Self {
            subs: FxHashMap::default(),
            perpetual: FxHashSet::default(),
        }
    }

    /// Register one subscriber under a fingerprint. Returns the (stable)
    /// buffer and whether this call created the record.
    pub fn subscribe(&mut self, fingerprint: &str, make_buffer: impl FnOnce() -> B) -> (B, bool) {
        if let Some(record) = self.subs.get_mut(fingerprint) {
            record.ref_count += 1;
            return (record.buffer.clone(), false);
        }
        let buffer = make_buffer();
        self.subs.insert(
            fingerprint.to_string(),
            SubscriptionRecord {
                buffer: buffer.clone(),
                ref_count: 1,
            },
        );
        (buffer, true)
    }

    /// Drop one subscriber. The record stays until cleanup().
    pub fn unsubscribe(&mut self, fingerprint: &str) -> bool {
        match self.subs.get_mut(fingerprint) {
            Some(record) => {
                record.ref_count -= 1;
                true
            }
            None => false,
        }
    }

    /// Exempt a fingerprint from automatic cleanup.
    pub fn mark_perpetual(&mut self, fingerprint: &str) {
        self.perpetual.insert(fingerprint.to_string());
    }

    pub fn ref_count(&self, fingerprint: &str) -> Option<i32> {
        self.subs.get(fingerprint).map(|r| r.ref_count)
    }

    pub fn buffer(&self, fingerprint: &str) -> Option<B> {
        self.subs.get(fingerprint).map(|r| r.buffer.clone())
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.subs.contains_key(fingerprint)
    }

    /// Remove every unreferenced, non-perpetual record and hand the removed
    /// entries back so the caller can tear down the worker side.
    pub fn cleanup(&mut self) -> Vec<(String, B)> {
        let doomed: Vec<String> = self
            .subs
            .iter()
            .filter(|(fp, record)| record.ref_count <= 0 && !self.perpetual.contains(*fp))
            .map(|(fp, _)| fp.clone())
            .collect();

        doomed
            .into_iter()
            .filter_map(|fp| self.subs.remove(&fp).map(|record| (fp, record.buffer)))
            .collect()
    }
}

impl<B: Clone> Default for SubscriptionRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counter() -> (Cell<u32>, impl Fn(&Cell<u32>) -> u32) {
        (Cell::new(0), |c: &Cell<u32>| {
            c.set(c.get() + 1);
            c.get()
        })
    }

    #[test]
    fn resubscribe_returns_the_same_buffer() {
        let mut reg: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        let (allocs, next) = counter();

        let (first, created) = reg.subscribe("feed", || next(&allocs));
        assert!(created);
        let (second, created) = reg.subscribe("feed", || next(&allocs));
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(allocs.get(), 1);
        assert_eq!(reg.ref_count("feed"), Some(2));
    }

    #[test]
    fn refcount_tracks_subs_minus_unsubs() {
        let mut reg: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        for _ in 0..3 {
            reg.subscribe("feed", || 1);
        }
        for _ in 0..2 {
            assert!(reg.unsubscribe("feed"));
        }
        assert_eq!(reg.ref_count("feed"), Some(1));
        assert!(!reg.unsubscribe("ghost"));
    }

    #[test]
    fn cleanup_only_removes_unreferenced_records() {
        let mut reg: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        reg.subscribe("live", || 1);
        reg.subscribe("dead", || 2);
        reg.unsubscribe("dead");

        let removed = reg.cleanup();
        assert_eq!(removed, vec![("dead".to_string(), 2)]);
        assert!(reg.contains("live"));
        assert!(!reg.contains("dead"));
    }

    #[test]
    fn perpetual_records_survive_cleanup() {
        let mut reg: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        reg.subscribe("pinned", || 1);
        reg.mark_perpetual("pinned");
        reg.unsubscribe("pinned");

        assert!(reg.cleanup().is_empty());
        assert!(reg.contains("pinned"));

        // A second unsubscribe/cleanup round still cannot evict it.
        reg.unsubscribe("pinned");
        assert!(reg.cleanup().is_empty());
        assert_eq!(reg.ref_count("pinned"), Some(-1));
    }

    #[test]
    fn full_dedup_cycle() {
        let mut reg: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        reg.subscribe("feed", || 1);
        reg.subscribe("feed", || 2);
        reg.unsubscribe("feed");

        // Still referenced: cleanup keeps it.
        assert!(reg.cleanup().is_empty());
        assert_eq!(reg.ref_count("feed"), Some(1));

        reg.unsubscribe("feed");
        let removed = reg.cleanup();
        assert_eq!(removed.len(), 1);
        assert!(!reg.contains("feed"));
    }
}
