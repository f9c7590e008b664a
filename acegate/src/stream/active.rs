//! Registry of streams currently flowing through this process, read by the
//! status endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use fleet::StreamKey;

pub struct ActiveStreamInfo {
    pub key: StreamKey,
    pub container_id: String,
    pub started_at: DateTime<Utc>,
    pub bytes: Arc<AtomicU64>,
}

/// Point-in-time view of one active stream.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveStreamSnapshot {
    pub stream_id: String,
    pub key: String,
    pub container_id: String,
    pub started_at: DateTime<Utc>,
    pub bytes_copied: u64,
}

#[derive(Default)]
pub struct ActiveStreams {
    map: Mutex<HashMap<String, ActiveStreamInfo>>,
}

impl ActiveStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, stream_id: String, info: ActiveStreamInfo) {
        self.map.lock().insert(stream_id, info);
    }

    pub fn remove(&self, stream_id: &str) {
        self.map.lock().remove(stream_id);
    }

    pub fn count(&self) -> usize {
        self.map.lock().len()
    }

    pub fn find_by_key(&self, key: &StreamKey) -> Option<ActiveStreamSnapshot> {
        let map = self.map.lock();
        map.iter()
            .find(|(_, info)| &info.key == key)
            .map(|(stream_id, info)| ActiveStreamSnapshot {
                stream_id: stream_id.clone(),
                key: info.key.to_string(),
                container_id: info.container_id.clone(),
                started_at: info.started_at,
                bytes_copied: info.bytes.load(Ordering::Relaxed),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(key: StreamKey) -> ActiveStreamInfo {
        ActiveStreamInfo {
            key,
            container_id: "e1".to_string(),
            started_at: Utc::now(),
            bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    #[test]
    fn insert_lookup_remove() {
        let active = ActiveStreams::new();
        let key = StreamKey::Id("content-1".to_string());
        active.insert("s1".to_string(), info(key.clone()));
        assert_eq!(active.count(), 1);

        let snapshot = active.find_by_key(&key).unwrap();
        assert_eq!(snapshot.stream_id, "s1");
        assert_eq!(snapshot.container_id, "e1");

        active.remove("s1");
        assert_eq!(active.count(), 0);
        assert!(active.find_by_key(&key).is_none());
    }

    #[test]
    fn snapshot_sees_live_byte_count() {
        let active = ActiveStreams::new();
        let key = StreamKey::Infohash("c0ffee".to_string());
        let entry = info(key.clone());
        let bytes = entry.bytes.clone();
        active.insert("s1".to_string(), entry);

        bytes.fetch_add(4096, Ordering::Relaxed);
        assert_eq!(active.find_by_key(&key).unwrap().bytes_copied, 4096);
    }
}
