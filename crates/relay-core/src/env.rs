//! Environment variable helpers
//!
//! Every `RELAY_*` knob is read through these, so a bad value falls back to
//! the default instead of failing startup.
//!
//! ```ignore
//! use relay_core::env::{env_get, env_get_millis};
//!
//! let max: usize = env_get("RELAY_MAX_SOCKETS", 4);
//! let poll = env_get_millis("RELAY_POLL_INTERVAL_MS", 500);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Returns `Some(T)` if the variable is set and parses, `None` otherwise.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Millisecond count as a `Duration`.
#[inline]
pub fn env_get_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__RELAY_TEST_UNSET_1__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_opt_none() {
        let val: Option<u16> = env_get_opt("__RELAY_TEST_UNSET_2__");
        assert!(val.is_none());
    }

    #[test]
    fn test_env_get_parses_and_trims() {
        std::env::set_var("__RELAY_TEST_NUM__", " 123 ");
        let val: usize = env_get("__RELAY_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__RELAY_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_falls_back() {
        std::env::set_var("__RELAY_TEST_BAD__", "not_a_number");
        let val: u16 = env_get("__RELAY_TEST_BAD__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__RELAY_TEST_BAD__");
    }

    #[test]
    fn test_env_get_millis() {
        assert_eq!(
            env_get_millis("__RELAY_TEST_UNSET_3__", 250),
            Duration::from_millis(250)
        );
    }
}
