//! Pending-allocation accounting.
//!
//! The orchestrator learns about a new stream only when the started event
//! arrives; until then, N concurrent selections would all see the same load
//! and pile onto one engine. This map counts streams this process has placed
//! but not yet announced, and the whole filter-sort-pick step runs inside
//! its critical section so concurrent selections serialize on it.

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct PendingAllocations {
    map: Mutex<HashMap<String, u32>>,
}

impl PendingAllocations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a pick over the current pending counts and, when it yields a
    /// container id, count the allocation before any other selection can
    /// observe the map.
    pub fn allocate_with<F>(&self, pick: F) -> Option<String>
    where
        F: FnOnce(&HashMap<String, u32>) -> Option<String>,
    {
        let mut map = self.map.lock();
        let chosen = pick(&map)?;
        *map.entry(chosen.clone()).or_insert(0) += 1;
        Some(chosen)
    }

    /// Count an allocation directly (provisioned engines skip the pick).
    pub fn note(&self, container_id: &str) {
        let mut map = self.map.lock();
        *map.entry(container_id.to_string()).or_insert(0) += 1;
    }

    /// Release one allocation. Never goes negative; empty entries are dropped.
    pub fn release(&self, container_id: &str) {
        let mut map = self.map.lock();
        if let Some(count) = map.get_mut(container_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(container_id);
            }
        }
    }

    pub fn count(&self, container_id: &str) -> u32 {
        self.map.lock().get(container_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.map.lock().values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_counts_and_release_balances() {
        let pending = PendingAllocations::new();
        let chosen = pending.allocate_with(|map| {
            assert!(map.is_empty());
            Some("e1".to_string())
        });
        assert_eq!(chosen.as_deref(), Some("e1"));
        assert_eq!(pending.count("e1"), 1);

        pending.release("e1");
        assert_eq!(pending.count("e1"), 0);
        assert_eq!(pending.total(), 0);
    }

    #[test]
    fn release_never_goes_negative() {
        let pending = PendingAllocations::new();
        pending.release("e1");
        pending.release("e1");
        assert_eq!(pending.count("e1"), 0);
        pending.note("e1");
        assert_eq!(pending.count("e1"), 1);
    }

    #[test]
    fn failed_pick_allocates_nothing() {
        let pending = PendingAllocations::new();
        assert_eq!(pending.allocate_with(|_| None), None);
        assert_eq!(pending.total(), 0);
    }

    #[test]
    fn pick_observes_earlier_allocations() {
        let pending = PendingAllocations::new();
        pending.note("e1");
        pending.note("e1");
        let seen = pending.allocate_with(|map| {
            assert_eq!(map.get("e1"), Some(&2));
            Some("e2".to_string())
        });
        assert_eq!(seen.as_deref(), Some("e2"));
        assert_eq!(pending.count("e1"), 2);
        assert_eq!(pending.count("e2"), 1);
    }
}
