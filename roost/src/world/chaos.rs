//! Chaos fault injection for simulation worlds.
//!
//! Failure decisions are layered: an active injected event matching the
//! operation kind always fires, then typed rules matching the path or URL
//! fire with their own probability, then the global failure rate applies.
//! The generator is seedable so chaotic runs can be reproduced.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use crate::glob;

/// A typed fault rule.
#[derive(Debug, Clone)]
pub struct ChaosRule {
    /// file_read_fail | file_write_fail | network_timeout | network_fail
    pub rule_type: String,
    pub pattern: String,
    pub probability: f64,
}

struct Inner {
    enabled: bool,
    failure_rate: f64,
    latency_min_ms: u64,
    latency_max_ms: u64,
    rules: Vec<ChaosRule>,
    active_events: HashSet<String>,
    event_params: HashMap<String, Value>,
    rng: StdRng,
    failures_injected: u64,
    latency_injected: u64,
}

/// Pseudorandom fault injector for one world.
pub struct ChaosEngine {
    inner: Mutex<Inner>,
}

impl Default for ChaosEngine {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                enabled: false,
                failure_rate: 0.0,
                latency_min_ms: 0,
                latency_max_ms: 0,
                rules: Vec::new(),
                active_events: HashSet::new(),
                event_params: HashMap::new(),
                rng: StdRng::from_entropy(),
                failures_injected: 0,
                latency_injected: 0,
            }),
        }
    }
}

impl ChaosEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a JSON configuration:
    /// `{"enabled": bool, "failure_rate": f64, "seed": u64,
    ///   "latency": {"min_ms", "max_ms"},
    ///   "rules": [{"type", "path_pattern"|"url_pattern"|"pattern",
    ///              "probability"}]}`.
    pub fn configure(&self, config: &Value) {
        let mut inner = self.inner.lock().unwrap();

        inner.enabled = config.get("enabled").and_then(|e| e.as_bool()).unwrap_or(false);
        inner.failure_rate = config
            .get("failure_rate")
            .and_then(|r| r.as_f64())
            .unwrap_or(0.0);

        if let Some(seed) = config.get("seed").and_then(|s| s.as_u64()) {
            inner.rng = StdRng::seed_from_u64(seed);
        }

        if let Some(latency) = config.get("latency").and_then(|l| l.as_object()) {
            inner.latency_min_ms = latency.get("min_ms").and_then(|v| v.as_u64()).unwrap_or(0);
            inner.latency_max_ms = latency.get("max_ms").and_then(|v| v.as_u64()).unwrap_or(0);
        }

        inner.rules.clear();
        if let Some(rules) = config.get("rules").and_then(|r| r.as_array()) {
            for rule in rules {
                let pattern = rule
                    .get("path_pattern")
                    .or_else(|| rule.get("url_pattern"))
                    .or_else(|| rule.get("pattern"))
                    .and_then(|p| p.as_str())
                    .unwrap_or("*");
                inner.rules.push(ChaosRule {
                    rule_type: rule.get("type").and_then(|t| t.as_str()).unwrap_or("").to_string(),
                    pattern: pattern.to_string(),
                    probability: rule.get("probability").and_then(|p| p.as_f64()).unwrap_or(0.0),
                });
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    /// Should a file read of `path` fail?
    pub fn should_fail_read(&self, path: &str) -> bool {
        self.should_fail_op(&["disk_fail"], &["file_read_fail"], path)
    }

    /// Should a file write to `path` fail?
    pub fn should_fail_write(&self, path: &str) -> bool {
        self.should_fail_op(&["disk_full", "disk_fail"], &["file_write_fail"], path)
    }

    /// Should a network request to `url` fail?
    pub fn should_fail_network(&self, url: &str) -> bool {
        self.should_fail_op(
            &["network_partition"],
            &["network_timeout", "network_fail"],
            url,
        )
    }

    fn should_fail_op(&self, events: &[&str], rule_types: &[&str], target: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return false;
        }

        if events.iter().any(|e| inner.active_events.contains(*e)) {
            inner.failures_injected += 1;
            return true;
        }

        let matching: Vec<f64> = inner
            .rules
            .iter()
            .filter(|rule| rule_types.contains(&rule.rule_type.as_str()))
            .filter(|rule| glob::matches(target, &rule.pattern))
            .map(|rule| rule.probability)
            .collect();
        for probability in matching {
            if roll(&mut inner.rng, probability) {
                inner.failures_injected += 1;
                tracing::debug!(target, "chaos rule fired");
                return true;
            }
        }

        let rate = inner.failure_rate;
        if roll(&mut inner.rng, rate) {
            inner.failures_injected += 1;
            return true;
        }
        false
    }

    /// Latency to inject before the operation, in milliseconds.
    pub fn latency_ms(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return 0;
        }

        if inner.active_events.contains("slow_io") {
            let latency = inner
                .event_params
                .get("slow_io")
                .and_then(|p| p.get("slow_io_latency_ms"))
                .and_then(|v| v.as_u64())
                .unwrap_or(1000);
            inner.latency_injected += 1;
            return latency;
        }

        if inner.latency_max_ms == 0 {
            return 0;
        }
        if inner.latency_min_ms >= inner.latency_max_ms {
            return inner.latency_min_ms;
        }
        let (min, max) = (inner.latency_min_ms, inner.latency_max_ms);
        let latency = inner.rng.gen_range(min..=max);
        if latency > 0 {
            inner.latency_injected += 1;
        }
        latency
    }

    /// Activate a named chaos event (disk_fail, disk_full,
    /// network_partition, slow_io).
    pub fn inject_event(&self, event_type: &str, params: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.active_events.insert(event_type.to_string());
        inner.event_params.insert(event_type.to_string(), params);
        tracing::info!(event = event_type, "chaos event injected");
    }

    pub fn clear_events(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.active_events.clear();
        inner.event_params.clear();
    }

    pub fn metrics(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let mut events: Vec<&String> = inner.active_events.iter().collect();
        events.sort();
        json!({
            "enabled": inner.enabled,
            "failure_rate": inner.failure_rate,
            "rule_count": inner.rules.len(),
            "active_events": events,
            "failures_injected": inner.failures_injected,
            "latency_injected": inner.latency_injected,
        })
    }

    pub fn to_json(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let rules: Vec<Value> = inner
            .rules
            .iter()
            .map(|rule| {
                json!({
                    "type": rule.rule_type,
                    "pattern": rule.pattern,
                    "probability": rule.probability,
                })
            })
            .collect();
        let mut events: Vec<&String> = inner.active_events.iter().collect();
        events.sort();
        json!({
            "enabled": inner.enabled,
            "failure_rate": inner.failure_rate,
            "latency": {"min_ms": inner.latency_min_ms, "max_ms": inner.latency_max_ms},
            "rules": rules,
            "active_events": events,
            "event_params": inner.event_params,
        })
    }

    pub fn from_json(&self, snapshot: &Value) {
        self.configure(snapshot);
        let mut inner = self.inner.lock().unwrap();
        inner.active_events = snapshot
            .get("active_events")
            .and_then(|e| e.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|e| e.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(params) = snapshot.get("event_params").and_then(|p| p.as_object()) {
            inner.event_params = params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        }
    }
}

fn roll(rng: &mut StdRng, probability: f64) -> bool {
    if probability <= 0.0 {
        return false;
    }
    if probability >= 1.0 {
        return true;
    }
    rng.gen_bool(probability)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_engine_never_fails() {
        let chaos = ChaosEngine::new();
        chaos.configure(&json!({"enabled": false, "failure_rate": 1.0}));
        assert!(!chaos.should_fail_read("/any"));
        assert!(!chaos.should_fail_write("/any"));
        assert!(!chaos.should_fail_network("https://any"));
        assert_eq!(chaos.latency_ms(), 0);
    }

    #[test]
    fn active_disk_fail_forces_read_and_write_failures() {
        let chaos = ChaosEngine::new();
        chaos.configure(&json!({"enabled": true}));
        chaos.inject_event("disk_fail", json!({}));

        assert!(chaos.should_fail_read("/etc/hosts"));
        assert!(chaos.should_fail_write("/tmp/x"));
        assert!(!chaos.should_fail_network("https://x"));
    }

    #[test]
    fn disk_full_only_affects_writes() {
        let chaos = ChaosEngine::new();
        chaos.configure(&json!({"enabled": true}));
        chaos.inject_event("disk_full", json!({}));

        assert!(!chaos.should_fail_read("/etc/hosts"));
        assert!(chaos.should_fail_write("/tmp/x"));
    }

    #[test]
    fn network_partition_only_affects_network() {
        let chaos = ChaosEngine::new();
        chaos.configure(&json!({"enabled": true}));
        chaos.inject_event("network_partition", json!({}));

        assert!(chaos.should_fail_network("https://api.example.com"));
        assert!(!chaos.should_fail_read("/etc/hosts"));
    }

    #[test]
    fn clear_events_restores_normal_operation() {
        let chaos = ChaosEngine::new();
        chaos.configure(&json!({"enabled": true}));
        chaos.inject_event("disk_fail", json!({}));
        chaos.clear_events();
        assert!(!chaos.should_fail_read("/etc/hosts"));
    }

    #[test]
    fn rule_with_certain_probability_fires_on_match_only() {
        let chaos = ChaosEngine::new();
        chaos.configure(&json!({
            "enabled": true,
            "rules": [
                {"type": "file_read_fail", "path_pattern": "/critical/*", "probability": 1.0},
            ],
        }));

        assert!(chaos.should_fail_read("/critical/db"));
        assert!(!chaos.should_fail_read("/safe/file"));
        // A read rule never affects writes.
        assert!(!chaos.should_fail_write("/critical/db"));
    }

    #[test]
    fn network_rules_cover_both_timeout_and_fail_types() {
        let chaos = ChaosEngine::new();
        chaos.configure(&json!({
            "enabled": true,
            "rules": [
                {"type": "network_timeout", "url_pattern": "https://slow.api/*", "probability": 1.0},
            ],
        }));
        assert!(chaos.should_fail_network("https://slow.api/v1"));
        assert!(!chaos.should_fail_network("https://fast.api/v1"));
    }

    #[test]
    fn global_failure_rate_of_one_always_fires() {
        let chaos = ChaosEngine::new();
        chaos.configure(&json!({"enabled": true, "failure_rate": 1.0}));
        assert!(chaos.should_fail_read("/any/path"));
    }

    #[test]
    fn seeded_engines_produce_identical_decisions() {
        let run = |seed: u64| -> Vec<bool> {
            let chaos = ChaosEngine::new();
            chaos.configure(&json!({"enabled": true, "failure_rate": 0.5, "seed": seed}));
            (0..32).map(|_| chaos.should_fail_read("/p")).collect()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn slow_io_event_overrides_latency_range() {
        let chaos = ChaosEngine::new();
        chaos.configure(&json!({
            "enabled": true,
            "latency": {"min_ms": 1, "max_ms": 5},
        }));
        chaos.inject_event("slow_io", json!({"slow_io_latency_ms": 750}));
        assert_eq!(chaos.latency_ms(), 750);

        chaos.clear_events();
        let latency = chaos.latency_ms();
        assert!((1..=5).contains(&latency));
    }

    #[test]
    fn slow_io_defaults_to_one_second() {
        let chaos = ChaosEngine::new();
        chaos.configure(&json!({"enabled": true}));
        chaos.inject_event("slow_io", json!({}));
        assert_eq!(chaos.latency_ms(), 1000);
    }

    #[test]
    fn metrics_count_injected_failures() {
        let chaos = ChaosEngine::new();
        chaos.configure(&json!({"enabled": true}));
        chaos.inject_event("disk_fail", json!({}));
        chaos.should_fail_read("/a");
        chaos.should_fail_write("/b");

        let metrics = chaos.metrics();
        assert_eq!(metrics["failures_injected"], 2);
        assert_eq!(metrics["active_events"][0], "disk_fail");
    }

    #[test]
    fn snapshot_roundtrip_preserves_rules_and_events() {
        let chaos = ChaosEngine::new();
        chaos.configure(&json!({
            "enabled": true,
            "failure_rate": 0.25,
            "rules": [{"type": "file_read_fail", "pattern": "/x/*", "probability": 0.5}],
        }));
        chaos.inject_event("disk_fail", json!({"reason": "test"}));

        let snapshot = chaos.to_json();
        let restored = ChaosEngine::new();
        restored.from_json(&snapshot);

        assert!(restored.is_enabled());
        assert!(restored.should_fail_read("/anything"));
        let restored_snapshot = restored.to_json();
        assert_eq!(restored_snapshot["failure_rate"], 0.25);
        assert_eq!(restored_snapshot["rules"][0]["pattern"], "/x/*");
        assert_eq!(restored_snapshot["active_events"][0], "disk_fail");
    }
}
