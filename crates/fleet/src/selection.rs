//! Engine selection policy.
//!
//! Pure ranking over candidates whose started-stream counts have already
//! been fetched; the caller runs [`pick`] inside the pending-allocations
//! critical section so the load it computes cannot be raced.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::Engine;

/// An engine that passed the circuit-breaker filter, with the started-stream
/// count the orchestrator reported for it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub engine: Engine,
    pub started: u32,
}

/// Composite ordering key: healthy first, VPN-forwarded first, least loaded
/// first, coldest (least recently streamed-from) first, container id as the
/// total tie-break.
fn rank(candidate: &Candidate, load: u32) -> (bool, bool, u32, Option<DateTime<Utc>>, String) {
    (
        !candidate.engine.is_healthy(),
        !candidate.engine.p2p_forwarded,
        load,
        // None sorts before Some: an engine never streamed from is coldest.
        candidate.engine.last_stream_usage,
        candidate.engine.container_id.clone(),
    )
}

/// Choose the best engine with headroom, or `None` when every candidate is
/// at `max_streams` once pending allocations are counted.
pub fn pick<'a>(
    candidates: &'a [Candidate],
    pending: &HashMap<String, u32>,
    max_streams: u32,
) -> Option<&'a Candidate> {
    candidates
        .iter()
        .filter_map(|candidate| {
            let pending_count = pending
                .get(&candidate.engine.container_id)
                .copied()
                .unwrap_or(0);
            let load = candidate.started.saturating_add(pending_count);
            (load < max_streams).then_some((candidate, load))
        })
        .min_by_key(|(candidate, load)| rank(candidate, *load))
        .map(|(candidate, _)| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn engine(id: &str, healthy: bool, forwarded: bool, last_usage_secs: Option<i64>) -> Engine {
        serde_json::from_value(serde_json::json!({
            "container_id": id,
            "host": format!("10.0.0.{}", id.len()),
            "port": 6878,
            "health": if healthy { "healthy" } else { "unhealthy" },
            "p2p_forwarded": forwarded,
            "last_stream_usage": last_usage_secs
                .map(|s| Utc.timestamp_opt(s, 0).unwrap().to_rfc3339()),
        }))
        .unwrap()
    }

    fn candidate(engine: Engine, started: u32) -> Candidate {
        Candidate { engine, started }
    }

    #[test]
    fn healthy_beats_unhealthy() {
        let candidates = vec![
            candidate(engine("sick", false, true, None), 0),
            candidate(engine("fine", true, false, None), 0),
        ];
        let chosen = pick(&candidates, &HashMap::new(), 2).unwrap();
        assert_eq!(chosen.engine.container_id, "fine");
    }

    #[test]
    fn forwarded_breaks_health_tie() {
        let candidates = vec![
            candidate(engine("plain", true, false, None), 0),
            candidate(engine("fwd", true, true, None), 0),
        ];
        let chosen = pick(&candidates, &HashMap::new(), 2).unwrap();
        assert_eq!(chosen.engine.container_id, "fwd");
    }

    #[test]
    fn lower_load_wins_over_forwarding_ties() {
        let candidates = vec![
            candidate(engine("busy", true, true, None), 1),
            candidate(engine("idle", true, true, None), 0),
        ];
        let chosen = pick(&candidates, &HashMap::new(), 2).unwrap();
        assert_eq!(chosen.engine.container_id, "idle");
    }

    #[test]
    fn pending_counts_toward_load() {
        let candidates = vec![
            candidate(engine("a", true, true, None), 0),
            candidate(engine("b", true, true, None), 0),
        ];
        let mut pending = HashMap::new();
        pending.insert("a".to_string(), 1u32);
        let chosen = pick(&candidates, &pending, 2).unwrap();
        assert_eq!(chosen.engine.container_id, "b");
    }

    #[test]
    fn coldest_engine_preferred_on_equal_load() {
        let candidates = vec![
            candidate(engine("warm", true, true, Some(2_000)), 0),
            candidate(engine("cold", true, true, Some(1_000)), 0),
            candidate(engine("never", true, true, None), 0),
        ];
        let chosen = pick(&candidates, &HashMap::new(), 2).unwrap();
        assert_eq!(chosen.engine.container_id, "never");
    }

    #[test]
    fn container_id_is_total_tiebreak() {
        let candidates = vec![
            candidate(engine("bb", true, true, Some(100)), 0),
            candidate(engine("aa", true, true, Some(100)), 0),
        ];
        let chosen = pick(&candidates, &HashMap::new(), 2).unwrap();
        assert_eq!(chosen.engine.container_id, "aa");
    }

    #[test]
    fn full_engines_filtered_out() {
        let candidates = vec![
            candidate(engine("full", true, true, None), 2),
            candidate(engine("half", true, false, None), 1),
        ];
        let chosen = pick(&candidates, &HashMap::new(), 2).unwrap();
        assert_eq!(chosen.engine.container_id, "half");

        let all_full = vec![candidate(engine("full", true, true, None), 2)];
        assert!(pick(&all_full, &HashMap::new(), 2).is_none());
    }

    #[test]
    fn pending_alone_can_fill_an_engine() {
        let candidates = vec![candidate(engine("a", true, true, None), 0)];
        let mut pending = HashMap::new();
        pending.insert("a".to_string(), 1u32);
        assert!(pick(&candidates, &pending, 1).is_none());
    }
}
