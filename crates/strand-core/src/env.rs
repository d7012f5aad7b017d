//! Environment variable utilities
//!
//! Generic `env_get<T>` parsing with defaults. The runtime reads its
//! tunables (`STRAND_*`) through these.

use std::str::FromStr;

/// Get environment variable parsed as type T, or return the default.
///
/// Works with any type that implements `FromStr`; unset and unparseable
/// values both fall back.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean.
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true; anything
/// else set reads as false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as an optional value.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let v: usize = env_get("STRAND_TEST_UNSET_VAR", 7);
        assert_eq!(v, 7);
    }

    #[test]
    fn test_env_get_parse() {
        std::env::set_var("STRAND_TEST_PARSE_VAR", "42");
        let v: u64 = env_get("STRAND_TEST_PARSE_VAR", 0);
        assert_eq!(v, 42);
        std::env::remove_var("STRAND_TEST_PARSE_VAR");
    }

    #[test]
    fn test_env_get_bool() {
        std::env::set_var("STRAND_TEST_BOOL_VAR", "on");
        assert!(env_get_bool("STRAND_TEST_BOOL_VAR", false));
        std::env::set_var("STRAND_TEST_BOOL_VAR", "0");
        assert!(!env_get_bool("STRAND_TEST_BOOL_VAR", true));
        std::env::remove_var("STRAND_TEST_BOOL_VAR");
    }
}
