//! Per-engine circuit breaker and in-flight concurrency limiter.
//!
//! Keeps the proxy from hammering an engine that keeps failing session
//! opens. The breaker opens after a run of consecutive failures and admits a
//! single probe once the cooldown elapses; the probe's outcome closes or
//! reopens it. There is no separate half-open state to track.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Max in-flight session starts per engine before admission is refused.
    pub max_concurrent_per_engine: u32,
    /// Consecutive failures that open the circuit.
    pub fail_threshold: u32,
    /// How long an open circuit refuses attempts before a probe is admitted.
    pub cooldown: Duration,
    /// Entries untouched this long are evicted by the periodic cleanup.
    pub idle_eviction: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_engine: 5,
            fail_threshold: 3,
            cooldown: Duration::from_secs(60),
            idle_eviction: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct EngineErrorState {
    consecutive_failures: u32,
    total_failures: u64,
    total_attempts: u64,
    active_attempts: u32,
    circuit_open: bool,
    circuit_opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    last_touched: Instant,
}

impl EngineErrorState {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            total_failures: 0,
            total_attempts: 0,
            active_attempts: 0,
            circuit_open: false,
            circuit_opened_at: None,
            last_failure: None,
            last_touched: Instant::now(),
        }
    }
}

/// Snapshot of one engine's error state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineHealth {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_attempts: u64,
    pub circuit_open: bool,
}

pub struct EngineFailureTracker {
    cfg: TrackerConfig,
    engines: Mutex<HashMap<String, EngineErrorState>>,
}

impl EngineFailureTracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self {
            cfg,
            engines: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TrackerConfig::default())
    }

    /// Admit an attempt unless the engine already has the maximum number of
    /// session starts in flight. Admission increments the in-flight and
    /// total-attempt counters; callers must pair it with `release_attempt`.
    pub fn record_attempt(&self, container_id: &str) -> bool {
        let mut engines = self.engines.lock();
        let state = engines
            .entry(container_id.to_string())
            .or_insert_with(EngineErrorState::new);
        state.last_touched = Instant::now();
        if state.active_attempts >= self.cfg.max_concurrent_per_engine {
            return false;
        }
        state.active_attempts += 1;
        state.total_attempts += 1;
        true
    }

    pub fn release_attempt(&self, container_id: &str) {
        let mut engines = self.engines.lock();
        if let Some(state) = engines.get_mut(container_id) {
            state.active_attempts = state.active_attempts.saturating_sub(1);
            state.last_touched = Instant::now();
        }
    }

    pub fn record_success(&self, container_id: &str) {
        let mut engines = self.engines.lock();
        if let Some(state) = engines.get_mut(container_id) {
            let was_open = state.circuit_open;
            state.consecutive_failures = 0;
            state.circuit_open = false;
            state.circuit_opened_at = None;
            state.last_touched = Instant::now();
            if was_open {
                debug!(container_id, "circuit closed after successful attempt");
            }
        }
    }

    pub fn record_failure(&self, container_id: &str, reason: &str) {
        let mut engines = self.engines.lock();
        let state = engines
            .entry(container_id.to_string())
            .or_insert_with(EngineErrorState::new);
        let now = Instant::now();
        state.consecutive_failures += 1;
        state.total_failures += 1;
        state.last_failure = Some(now);
        state.last_touched = now;
        if state.consecutive_failures >= self.cfg.fail_threshold {
            // Re-stamping on every failure past the threshold restarts the
            // cooldown after a failed half-open probe.
            state.circuit_open = true;
            state.circuit_opened_at = Some(now);
            warn!(
                container_id,
                consecutive = state.consecutive_failures,
                reason,
                "engine circuit open"
            );
        }
    }

    /// Whether a new attempt against this engine should be made at all.
    /// After the cooldown the circuit is effectively half-open: the attempt
    /// is admitted and its outcome decides the new state.
    pub fn can_attempt(&self, container_id: &str) -> (bool, Option<String>) {
        let engines = self.engines.lock();
        let Some(state) = engines.get(container_id) else {
            return (true, None);
        };
        if !state.circuit_open {
            return (true, None);
        }
        let Some(opened_at) = state.circuit_opened_at else {
            return (true, None);
        };
        let elapsed = opened_at.elapsed();
        if elapsed < self.cfg.cooldown {
            let remaining = self.cfg.cooldown - elapsed;
            return (
                false,
                Some(format!(
                    "circuit open for {}s more after {} consecutive failures",
                    remaining.as_secs(),
                    state.consecutive_failures
                )),
            );
        }
        (true, None)
    }

    pub fn health(&self, container_id: &str) -> EngineHealth {
        let engines = self.engines.lock();
        engines
            .get(container_id)
            .map(|state| EngineHealth {
                consecutive_failures: state.consecutive_failures,
                total_failures: state.total_failures,
                total_attempts: state.total_attempts,
                circuit_open: state.circuit_open,
            })
            .unwrap_or_default()
    }

    /// Evict entries untouched for longer than the eviction window.
    pub fn cleanup(&self) {
        let mut engines = self.engines.lock();
        let before = engines.len();
        engines.retain(|_, state| state.last_touched.elapsed() < self.cfg.idle_eviction);
        let evicted = before - engines.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle engine error states");
        }
    }

    /// Run `cleanup` every minute until the token is cancelled.
    pub fn spawn_cleanup(self: &std::sync::Arc<Self>, token: CancellationToken) {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tracker.cleanup(),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_concurrent: u32, threshold: u32, cooldown: Duration) -> EngineFailureTracker {
        EngineFailureTracker::new(TrackerConfig {
            max_concurrent_per_engine: max_concurrent,
            fail_threshold: threshold,
            cooldown,
            idle_eviction: Duration::from_secs(600),
        })
    }

    #[test]
    fn admission_rejects_exactly_at_cap() {
        let t = tracker(2, 3, Duration::from_secs(60));
        assert!(t.record_attempt("e1"));
        assert!(t.record_attempt("e1"));
        assert!(!t.record_attempt("e1"));
        t.release_attempt("e1");
        assert!(t.record_attempt("e1"));
    }

    #[test]
    fn circuit_opens_at_threshold() {
        let t = tracker(5, 3, Duration::from_secs(60));
        t.record_failure("e1", "refused");
        t.record_failure("e1", "refused");
        assert!(t.can_attempt("e1").0);
        t.record_failure("e1", "refused");
        let (ok, reason) = t.can_attempt("e1");
        assert!(!ok);
        assert!(reason.unwrap().contains("circuit open"));
        assert!(t.health("e1").circuit_open);
    }

    #[test]
    fn success_resets_consecutive_and_closes_circuit() {
        let t = tracker(5, 2, Duration::from_secs(60));
        t.record_failure("e1", "refused");
        t.record_failure("e1", "refused");
        assert!(!t.can_attempt("e1").0);
        t.record_success("e1");
        assert!(t.can_attempt("e1").0);
        let health = t.health("e1");
        assert_eq!(health.consecutive_failures, 0);
        assert!(!health.circuit_open);
        assert_eq!(health.total_failures, 2);
    }

    #[test]
    fn cooldown_admits_half_open_probe() {
        let t = tracker(5, 1, Duration::from_millis(20));
        t.record_failure("e1", "refused");
        assert!(!t.can_attempt("e1").0);
        std::thread::sleep(Duration::from_millis(30));
        // Cooldown elapsed: probe admitted even though the circuit is open.
        assert!(t.can_attempt("e1").0);
        // Failed probe re-stamps the cooldown.
        t.record_failure("e1", "refused again");
        assert!(!t.can_attempt("e1").0);
    }

    #[test]
    fn half_open_success_closes() {
        let t = tracker(5, 1, Duration::from_millis(10));
        t.record_failure("e1", "refused");
        std::thread::sleep(Duration::from_millis(20));
        assert!(t.can_attempt("e1").0);
        t.record_success("e1");
        assert!(!t.health("e1").circuit_open);
    }

    #[test]
    fn unknown_engine_is_admitted() {
        let t = tracker(5, 3, Duration::from_secs(60));
        assert!(t.can_attempt("never-seen").0);
        assert_eq!(t.health("never-seen"), EngineHealth::default());
    }

    #[test]
    fn cleanup_evicts_idle_entries() {
        let t = EngineFailureTracker::new(TrackerConfig {
            max_concurrent_per_engine: 5,
            fail_threshold: 3,
            cooldown: Duration::from_secs(60),
            idle_eviction: Duration::from_millis(10),
        });
        t.record_failure("e1", "refused");
        std::thread::sleep(Duration::from_millis(20));
        t.cleanup();
        assert_eq!(t.health("e1"), EngineHealth::default());
    }
}
