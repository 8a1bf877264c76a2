//! Environment variable helpers
//!
//! Generic `env_get<T>` for parsing environment overrides with defaults.

use std::str::FromStr;

/// Get environment variable parsed as type T, or return the default
///
/// Works with any `FromStr` type; unparseable values fall back silently.
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

/// Get environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true and
/// "0", "false", "no", "off" as false; anything else keeps the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let v: usize = env_get("WEFT_TEST_UNSET_VARIABLE", 42);
        assert_eq!(v, 42);
    }

    #[test]
    fn test_env_get_parses() {
        std::env::set_var("WEFT_TEST_PARSE", "17");
        let v: u64 = env_get("WEFT_TEST_PARSE", 3);
        assert_eq!(v, 17);
        std::env::remove_var("WEFT_TEST_PARSE");
    }

    #[test]
    fn test_env_get_bool() {
        std::env::set_var("WEFT_TEST_BOOL", "yes");
        assert!(env_get_bool("WEFT_TEST_BOOL", false));
        std::env::set_var("WEFT_TEST_BOOL", "off");
        assert!(!env_get_bool("WEFT_TEST_BOOL", true));
        std::env::remove_var("WEFT_TEST_BOOL");
    }
}
