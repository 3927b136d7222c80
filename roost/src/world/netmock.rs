//! Network mocking for simulation worlds.
//!
//! In `mock` and `record` modes HTTP requests are resolved against
//! configured responses before any real I/O: exact URL match first, then
//! pattern match, then the passthrough allow-list, then `fail_unmatched`,
//! then the default response. `passthrough` mode intercepts nothing.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::glob;

/// A configured mock response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: String,
    pub headers: HashMap<String, String>,
    pub latency_ms: u64,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            status: 200,
            body: String::new(),
            headers: HashMap::new(),
            latency_ms: 0,
        }
    }
}

impl MockResponse {
    fn from_json(value: &Value, default_status: u16, default_body: &str) -> Self {
        match value {
            Value::String(body) => Self {
                body: body.clone(),
                ..Self::default()
            },
            Value::Object(obj) => {
                let mut headers = HashMap::new();
                if let Some(hs) = obj.get("headers").and_then(|h| h.as_object()) {
                    for (k, v) in hs {
                        if let Some(s) = v.as_str() {
                            headers.insert(k.clone(), s.to_string());
                        }
                    }
                }
                Self {
                    status: obj.get("status").and_then(|s| s.as_u64()).unwrap_or(default_status as u64)
                        as u16,
                    body: obj
                        .get("body")
                        .and_then(|b| b.as_str())
                        .unwrap_or(default_body)
                        .to_string(),
                    headers,
                    latency_ms: obj.get("latency_ms").and_then(|l| l.as_u64()).unwrap_or(0),
                }
            }
            _ => Self::default(),
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "status": self.status,
            "body": self.body,
            "headers": self.headers,
            "latency_ms": self.latency_ms,
        })
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// "mock", "passthrough", or "record".
    mode: String,
    mocks: HashMap<String, MockResponse>,
    default_response: Option<MockResponse>,
    allowed_domains: Vec<String>,
    fail_unmatched: bool,
    recorded: Vec<Value>,
    requests_intercepted: u64,
    requests_passed_through: u64,
    requests_failed: u64,
}

/// HTTP interception for one world.
pub struct NetworkMock {
    inner: Mutex<Inner>,
}

impl Default for NetworkMock {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                mode: "passthrough".to_string(),
                ..Inner::default()
            }),
        }
    }
}

impl NetworkMock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&self, config: &Value) {
        let mut inner = self.inner.lock().unwrap();

        inner.mode = config
            .get("mode")
            .and_then(|m| m.as_str())
            .unwrap_or("passthrough")
            .to_string();

        inner.mocks.clear();
        if let Some(mocks) = config.get("mock_responses").and_then(|m| m.as_object()) {
            for (url, response_config) in mocks {
                inner
                    .mocks
                    .insert(url.clone(), MockResponse::from_json(response_config, 200, ""));
            }
        }

        inner.default_response = config
            .get("default_response")
            .filter(|d| d.is_object())
            .map(|d| MockResponse::from_json(d, 404, "Not Found"));

        inner.allowed_domains = config
            .get("allowed_domains")
            .and_then(|d| d.as_array())
            .map(|arr| arr.iter().filter_map(|d| d.as_str().map(String::from)).collect())
            .unwrap_or_default();

        inner.fail_unmatched = config
            .get("fail_unmatched")
            .and_then(|f| f.as_bool())
            .unwrap_or(false);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().mode != "passthrough"
    }

    pub fn mode(&self) -> String {
        self.inner.lock().unwrap().mode.clone()
    }

    /// Resolve a mock response for a URL. `None` means pass through to the
    /// real network.
    pub fn get_response(&self, url: &str, _method: &str) -> Option<MockResponse> {
        let mut inner = self.inner.lock().unwrap();

        if inner.mode == "passthrough" {
            return None;
        }

        // Exact match first.
        if let Some(response) = inner.mocks.get(url).cloned() {
            inner.requests_intercepted += 1;
            return Some(response);
        }

        // Then pattern match.
        let matched = inner
            .mocks
            .iter()
            .find(|(pattern, _)| glob::matches(url, pattern))
            .map(|(_, response)| response.clone());
        if let Some(response) = matched {
            inner.requests_intercepted += 1;
            return Some(response);
        }

        // Passthrough allow-list.
        let domain = extract_domain(url);
        if inner
            .allowed_domains
            .iter()
            .any(|allowed| domain == *allowed || glob::matches(&domain, allowed))
        {
            inner.requests_passed_through += 1;
            return None;
        }

        if inner.fail_unmatched {
            inner.requests_failed += 1;
            return Some(MockResponse {
                status: 503,
                body: "Network mock: URL not configured and fail_unmatched=true".to_string(),
                ..MockResponse::default()
            });
        }

        if let Some(default) = inner.default_response.clone() {
            inner.requests_intercepted += 1;
            return Some(default);
        }

        inner.requests_passed_through += 1;
        None
    }

    pub fn add_mock(&self, url_pattern: &str, response: MockResponse) {
        self.inner
            .lock()
            .unwrap()
            .mocks
            .insert(url_pattern.to_string(), response);
    }

    /// Store a response observed in record mode.
    pub fn record(&self, url: &str, method: &str, status: u16, body: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.recorded.push(json!({
            "url": url,
            "method": method,
            "status": status,
            "body": body,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        }));
    }

    pub fn recorded(&self) -> Vec<Value> {
        self.inner.lock().unwrap().recorded.clone()
    }

    pub fn metrics(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        json!({
            "mode": inner.mode,
            "mock_count": inner.mocks.len(),
            "requests_intercepted": inner.requests_intercepted,
            "requests_passed_through": inner.requests_passed_through,
            "requests_failed": inner.requests_failed,
            "recorded_count": inner.recorded.len(),
        })
    }

    pub fn to_json(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let mocks: serde_json::Map<String, Value> = inner
            .mocks
            .iter()
            .map(|(url, response)| (url.clone(), response.to_json()))
            .collect();
        json!({
            "mode": inner.mode,
            "fail_unmatched": inner.fail_unmatched,
            "mock_responses": mocks,
            "default_response": inner.default_response.as_ref().map(|d| d.to_json()),
            "allowed_domains": inner.allowed_domains,
            "recorded": inner.recorded,
        })
    }

    pub fn from_json(&self, snapshot: &Value) {
        self.configure(snapshot);
        let mut inner = self.inner.lock().unwrap();
        inner.recorded = snapshot
            .get("recorded")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
    }
}

/// Extract the host from a URL, dropping scheme, path and port.
fn extract_domain(url: &str) -> String {
    let rest = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };
    let host = rest.split('/').next().unwrap_or(rest);
    host.split(':').next().unwrap_or(host).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_config() -> Value {
        json!({
            "mode": "mock",
            "mock_responses": {
                "https://api.example.com/data": {"status": 200, "body": "{\"ok\":true}"},
                "https://api.example.com/v2/*": {"status": 201, "body": "versioned"},
            },
            "allowed_domains": ["trusted.example.org"],
        })
    }

    #[test]
    fn passthrough_mode_intercepts_nothing() {
        let mock = NetworkMock::new();
        mock.configure(&json!({"mode": "passthrough"}));
        assert!(!mock.is_enabled());
        assert!(mock.get_response("https://anywhere.com", "GET").is_none());
    }

    #[test]
    fn exact_match_wins() {
        let mock = NetworkMock::new();
        mock.configure(&mock_config());
        let response = mock.get_response("https://api.example.com/data", "GET").unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "{\"ok\":true}");
    }

    #[test]
    fn pattern_match_after_exact() {
        let mock = NetworkMock::new();
        mock.configure(&mock_config());
        let response = mock
            .get_response("https://api.example.com/v2/users", "GET")
            .unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body, "versioned");
    }

    #[test]
    fn allowed_domain_passes_through() {
        let mock = NetworkMock::new();
        mock.configure(&mock_config());
        assert!(mock
            .get_response("https://trusted.example.org/any/path", "GET")
            .is_none());
    }

    #[test]
    fn fail_unmatched_synthesizes_503() {
        let mock = NetworkMock::new();
        mock.configure(&json!({"mode": "mock", "fail_unmatched": true}));
        let response = mock.get_response("https://unknown.example.com", "GET").unwrap();
        assert_eq!(response.status, 503);
        assert!(response.body.contains("fail_unmatched"));
    }

    #[test]
    fn default_response_before_passthrough() {
        let mock = NetworkMock::new();
        mock.configure(&json!({
            "mode": "mock",
            "default_response": {"status": 404, "body": "nope"},
        }));
        let response = mock.get_response("https://unknown.example.com", "GET").unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body, "nope");
    }

    #[test]
    fn unmatched_without_default_passes_through() {
        let mock = NetworkMock::new();
        mock.configure(&json!({"mode": "mock"}));
        assert!(mock.get_response("https://unknown.example.com", "GET").is_none());
    }

    #[test]
    fn record_mode_stores_entries() {
        let mock = NetworkMock::new();
        mock.configure(&json!({"mode": "record"}));
        mock.record("https://api.example.com", "GET", 200, "body");
        let recorded = mock.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0]["url"], "https://api.example.com");
        assert_eq!(recorded[0]["status"], 200);
    }

    #[test]
    fn metrics_track_resolution_outcomes() {
        let mock = NetworkMock::new();
        mock.configure(&json!({
            "mode": "mock",
            "mock_responses": {"https://a/x": "hit"},
            "allowed_domains": ["pass.example"],
            "fail_unmatched": true,
        }));
        mock.get_response("https://a/x", "GET");
        mock.get_response("https://pass.example/y", "GET");
        mock.get_response("https://other/z", "GET");

        let metrics = mock.metrics();
        assert_eq!(metrics["requests_intercepted"], 1);
        assert_eq!(metrics["requests_passed_through"], 1);
        assert_eq!(metrics["requests_failed"], 1);
    }

    #[test]
    fn snapshot_roundtrip() {
        let mock = NetworkMock::new();
        mock.configure(&mock_config());
        mock.record("https://r", "GET", 200, "x");
        let snapshot = mock.to_json();

        let restored = NetworkMock::new();
        restored.from_json(&snapshot);
        assert_eq!(restored.mode(), "mock");
        assert!(restored.get_response("https://api.example.com/data", "GET").is_some());
        assert_eq!(restored.recorded().len(), 1);
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(extract_domain("https://api.example.com/path"), "api.example.com");
        assert_eq!(extract_domain("http://host:8080/x"), "host");
        assert_eq!(extract_domain("bare.host/path"), "bare.host");
    }
}
