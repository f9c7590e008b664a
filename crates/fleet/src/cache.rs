//! TTL-bounded cache of the orchestrator's engine list.

use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::models::Engine;

#[derive(Debug)]
struct CachedList {
    fetched_at: Instant,
    engines: Vec<Engine>,
}

#[derive(Debug)]
pub struct EngineCache {
    ttl: Duration,
    inner: RwLock<Option<CachedList>>,
}

impl EngineCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(None),
        }
    }

    /// Fresh copy of the cached list, or `None` when absent or stale.
    pub fn get(&self) -> Option<Vec<Engine>> {
        let guard = self.inner.read();
        let cached = guard.as_ref()?;
        if cached.fetched_at.elapsed() >= self.ttl {
            return None;
        }
        Some(cached.engines.clone())
    }

    pub fn put(&self, engines: Vec<Engine>) {
        *self.inner.write() = Some(CachedList {
            fetched_at: Instant::now(),
            engines,
        });
    }

    pub fn invalidate(&self) {
        *self.inner.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(id: &str) -> Engine {
        serde_json::from_value(serde_json::json!({
            "container_id": id, "host": "10.0.0.1", "port": 6878
        }))
        .unwrap()
    }

    #[test]
    fn fresh_entries_hit() {
        let cache = EngineCache::new(Duration::from_secs(5));
        assert!(cache.get().is_none());
        cache.put(vec![engine("e1")]);
        let hit = cache.get().unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].container_id, "e1");
    }

    #[test]
    fn stale_entries_miss() {
        let cache = EngineCache::new(Duration::from_millis(10));
        cache.put(vec![engine("e1")]);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get().is_none());
    }

    #[test]
    fn invalidate_clears() {
        let cache = EngineCache::new(Duration::from_secs(5));
        cache.put(vec![engine("e1")]);
        cache.invalidate();
        assert!(cache.get().is_none());
    }
}
