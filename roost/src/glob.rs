//! Glob matching for path and URL patterns.
//!
//! Supported wildcards: `*` (anything except `/`), `**` (anything including
//! `/`), `?` (a single non-slash character). Matching is case-insensitive
//! and must cover the whole input.

use regex::Regex;

/// Does `input` match the glob `pattern`?
pub(crate) fn matches(input: &str, pattern: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }
    let Ok(re) = compile(pattern) else {
        tracing::warn!(pattern, "invalid glob pattern");
        return false;
    };
    re.is_match(input)
}

/// Does `input` match any pattern in the list?
pub(crate) fn matches_any(input: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| matches(input, p))
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    let mut regex_str = String::with_capacity(pattern.len() * 2 + 8);
    regex_str.push_str("(?i)^");

    let bytes = pattern.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'*' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'*' {
                    regex_str.push_str(".*");
                    i += 1;
                } else {
                    regex_str.push_str("[^/]*");
                }
            }
            b'?' => regex_str.push_str("[^/]"),
            c if br".()[]{}^$|\+".contains(&c) => {
                regex_str.push('\\');
                regex_str.push(c as char);
            }
            c => regex_str.push(c as char),
        }
        i += 1;
    }

    regex_str.push('$');
    Regex::new(&regex_str)
}
