//! In-memory virtual filesystem for simulation worlds.
//!
//! Agents inside a world see this filesystem instead of the host's for any
//! path the world intercepts. Files carry a mode (`r` or `rw`); optional
//! glob allow-lists gate writes and define which paths are intercepted.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::glob;

/// A virtual file.
#[derive(Debug, Clone)]
struct VirtualFile {
    content: String,
    /// "r" = readonly, "rw" = read-write.
    mode: String,
    created_at_ms: i64,
    modified_at_ms: i64,
}

impl VirtualFile {
    fn new(content: String, mode: String) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            content,
            mode,
            created_at_ms: now,
            modified_at_ms: now,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    files: HashMap<String, VirtualFile>,
    readonly_patterns: Vec<String>,
    writable_patterns: Vec<String>,
    intercept_patterns: Vec<String>,
    read_count: u64,
    write_count: u64,
    bytes_read: u64,
    bytes_written: u64,
}

/// Virtual filesystem for one world.
#[derive(Default)]
pub struct VirtualFs {
    inner: Mutex<Inner>,
}

impl VirtualFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a JSON configuration:
    /// `{"initial_files": {path: content | {content, mode}},
    ///   "readonly_patterns": [...], "writable_patterns": [...],
    ///   "intercept_patterns": [...]}`.
    ///
    /// When any files or patterns are configured but no explicit intercept
    /// list is given, everything (`/**`) is intercepted.
    pub fn configure(&self, config: &Value) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(files) = config.get("initial_files").and_then(|f| f.as_object()) {
            for (path, file_config) in files {
                let (content, mode) = match file_config {
                    Value::String(s) => (s.clone(), "rw".to_string()),
                    Value::Object(obj) => (
                        obj.get("content").and_then(|c| c.as_str()).unwrap_or("").to_string(),
                        obj.get("mode").and_then(|m| m.as_str()).unwrap_or("rw").to_string(),
                    ),
                    _ => continue,
                };
                let normalized = normalize_path(path);
                tracing::debug!(path = %normalized, mode = %mode, "vfs initial file");
                inner.files.insert(normalized, VirtualFile::new(content, mode));
            }
        }

        inner.readonly_patterns = string_list(config.get("readonly_patterns"));
        inner.writable_patterns = string_list(config.get("writable_patterns"));

        match config.get("intercept_patterns") {
            Some(Value::Array(patterns)) => {
                inner.intercept_patterns = patterns
                    .iter()
                    .filter_map(|p| p.as_str().map(String::from))
                    .collect();
            }
            _ => {
                if !inner.files.is_empty()
                    || !inner.readonly_patterns.is_empty()
                    || !inner.writable_patterns.is_empty()
                {
                    inner.intercept_patterns = vec!["/**".to_string()];
                }
            }
        }
    }

    /// Whether the VFS has any files or patterns at all.
    pub fn is_enabled(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.files.is_empty()
            || !inner.readonly_patterns.is_empty()
            || !inner.writable_patterns.is_empty()
            || !inner.intercept_patterns.is_empty()
    }

    pub fn exists(&self, path: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.files.contains_key(&normalize_path(path))
    }

    /// Read a file's content. Increments read counters on hit.
    pub fn read(&self, path: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        let normalized = normalize_path(path);
        let Some(file) = inner.files.get(&normalized) else {
            return None;
        };
        let content = file.content.clone();
        inner.read_count += 1;
        inner.bytes_read += content.len() as u64;
        Some(content)
    }

    /// Create or update a file. Denied when the target exists with mode
    /// `r`, or when writable patterns are configured and a new path matches
    /// none of them.
    pub fn write(&self, path: &str, content: &str, append: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let normalized = normalize_path(path);

        let exists = inner.files.contains_key(&normalized);
        if exists && inner.files[&normalized].mode == "r" {
            tracing::warn!(path = %normalized, "vfs write to read-only file denied");
            return false;
        }
        if !exists
            && !inner.writable_patterns.is_empty()
            && !glob::matches_any(&normalized, &inner.writable_patterns)
        {
            tracing::warn!(path = %normalized, "vfs path not writable");
            return false;
        }

        if exists {
            let file = inner.files.get_mut(&normalized).unwrap();
            if append {
                file.content.push_str(content);
            } else {
                file.content = content.to_string();
            }
            file.modified_at_ms = chrono::Utc::now().timestamp_millis();
        } else {
            inner
                .files
                .insert(normalized, VirtualFile::new(content.to_string(), "rw".to_string()));
        }
        inner.write_count += 1;
        inner.bytes_written += content.len() as u64;
        true
    }

    /// Delete a file. Fails on missing or read-only files.
    pub fn remove(&self, path: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let normalized = normalize_path(path);
        let readonly = match inner.files.get(&normalized) {
            None => return false,
            Some(file) => file.mode == "r",
        };
        if readonly {
            tracing::warn!(path = %normalized, "vfs delete of read-only file denied");
            return false;
        }
        inner.files.remove(&normalized);
        true
    }

    /// Paths matching a glob pattern, sorted.
    pub fn list(&self, pattern: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut result: Vec<String> = inner
            .files
            .keys()
            .filter(|path| pattern == "*" || pattern == "/**" || glob::matches(path, pattern))
            .cloned()
            .collect();
        result.sort();
        result
    }

    /// File metadata: size, mode, timestamps.
    pub fn stat(&self, path: &str) -> Option<Value> {
        let inner = self.inner.lock().unwrap();
        let normalized = normalize_path(path);
        inner.files.get(&normalized).map(|file| {
            json!({
                "path": normalized,
                "size": file.content.len(),
                "mode": file.mode,
                "created_at": file.created_at_ms,
                "modified_at": file.modified_at_ms,
            })
        })
    }

    /// Whether a write to this path would be allowed.
    pub fn is_writable(&self, path: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        let normalized = normalize_path(path);
        if let Some(file) = inner.files.get(&normalized) {
            return file.mode != "r";
        }
        if inner.writable_patterns.is_empty() {
            return true;
        }
        glob::matches_any(&normalized, &inner.writable_patterns)
    }

    /// True when the path exists in the VFS or matches an intercept pattern.
    pub fn should_intercept(&self, path: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        let normalized = normalize_path(path);
        if inner.files.contains_key(&normalized) {
            return true;
        }
        glob::matches_any(&normalized, &inner.intercept_patterns)
    }

    pub fn metrics(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let total_size: u64 = inner.files.values().map(|f| f.content.len() as u64).sum();
        json!({
            "file_count": inner.files.len(),
            "read_count": inner.read_count,
            "write_count": inner.write_count,
            "bytes_read": inner.bytes_read,
            "bytes_written": inner.bytes_written,
            "total_size_bytes": total_size,
        })
    }

    /// Serialize files and patterns for a world snapshot.
    pub fn to_json(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let files: serde_json::Map<String, Value> = inner
            .files
            .iter()
            .map(|(path, file)| {
                (
                    path.clone(),
                    json!({
                        "content": file.content,
                        "mode": file.mode,
                        "created_at": file.created_at_ms,
                        "modified_at": file.modified_at_ms,
                    }),
                )
            })
            .collect();
        json!({
            "files": files,
            "readonly_patterns": inner.readonly_patterns,
            "writable_patterns": inner.writable_patterns,
            "intercept_patterns": inner.intercept_patterns,
        })
    }

    /// Rebuild from a snapshot, replacing all current state.
    pub fn from_json(&self, snapshot: &Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.files.clear();

        if let Some(files) = snapshot.get("files").and_then(|f| f.as_object()) {
            for (path, file_json) in files {
                let mut file = VirtualFile::new(
                    file_json.get("content").and_then(|c| c.as_str()).unwrap_or("").to_string(),
                    file_json.get("mode").and_then(|m| m.as_str()).unwrap_or("rw").to_string(),
                );
                if let Some(created) = file_json.get("created_at").and_then(|v| v.as_i64()) {
                    file.created_at_ms = created;
                }
                if let Some(modified) = file_json.get("modified_at").and_then(|v| v.as_i64()) {
                    file.modified_at_ms = modified;
                }
                inner.files.insert(path.clone(), file);
            }
        }

        inner.readonly_patterns = string_list(snapshot.get("readonly_patterns"));
        inner.writable_patterns = string_list(snapshot.get("writable_patterns"));
        inner.intercept_patterns = string_list(snapshot.get("intercept_patterns"));
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|p| p.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

/// Normalize a path: collapse `.`/`..` and repeated slashes, enforce a
/// leading `/`.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let mut result = String::from("/");
    result.push_str(&parts.join("/"));
    result
}
