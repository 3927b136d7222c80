//! One-shot `.env` loading and environment helpers.
//!
//! The `.env` file is located by walking upward from the current working
//! directory, then from the executable's directory. The first file found
//! wins. Values never override variables already present in the process
//! environment, and loading is idempotent across calls.

use std::path::PathBuf;
use std::sync::OnceLock;

static DOTENV_LOADED: OnceLock<()> = OnceLock::new();

/// Load `.env` into the process environment. Later calls are no-ops.
pub fn load_dotenv() {
    DOTENV_LOADED.get_or_init(|| {
        for dir in search_dirs() {
            let path = dir.join(".env");
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            apply_dotenv(&content);
            tracing::debug!(path = %path.display(), "loaded .env");
            break;
        }
    });
}

/// Get an environment variable, treating empty values as absent.
pub fn var(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = Some(cwd.as_path());
        while let Some(d) = dir {
            dirs.push(d.to_path_buf());
            dir = d.parent();
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
        }
    }
    dirs
}

fn apply_dotenv(content: &str) {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            if (bytes[0] == b'"' && bytes[value.len() - 1] == b'"')
                || (bytes[0] == b'\'' && bytes[value.len() - 1] == b'\'')
            {
                value = &value[1..value.len() - 1];
            }
        }
        if !key.is_empty() && std::env::var_os(key).is_none() {
            std::env::set_var(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_parses_comments_and_quotes() {
        let content = r#"
# a comment
ROOST_TEST_PLAIN=hello
ROOST_TEST_DQUOTE="quoted value"
ROOST_TEST_SQUOTE='single'
ROOST_TEST_SPACES =  padded
not-a-pair
"#;
        apply_dotenv(content);
        assert_eq!(std::env::var("ROOST_TEST_PLAIN").unwrap(), "hello");
        assert_eq!(std::env::var("ROOST_TEST_DQUOTE").unwrap(), "quoted value");
        assert_eq!(std::env::var("ROOST_TEST_SQUOTE").unwrap(), "single");
        assert_eq!(std::env::var("ROOST_TEST_SPACES").unwrap(), "padded");
    }

    #[test]
    fn apply_never_overrides_existing() {
        std::env::set_var("ROOST_TEST_EXISTING", "original");
        apply_dotenv("ROOST_TEST_EXISTING=overridden\n");
        assert_eq!(std::env::var("ROOST_TEST_EXISTING").unwrap(), "original");
    }

    #[test]
    fn var_treats_empty_as_absent() {
        std::env::set_var("ROOST_TEST_EMPTY", "");
        assert!(var("ROOST_TEST_EMPTY").is_none());
        assert!(var("ROOST_TEST_NEVER_SET_ANYWHERE").is_none());
    }
}
