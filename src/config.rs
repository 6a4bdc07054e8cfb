//! Runtime configuration.
//!
//! All knobs are environment-driven with sane defaults, read once at startup
//! through [`RuntimeConfig::from_env`]. Out-of-range values are clamped
//! rather than rejected so a bad deployment variable degrades to a safe
//! setting instead of refusing to boot.
//!
//! # Environment Variables
//!
//! - `TOOLGATE_RATE_PER_MINUTE` — sliding per-minute admission limit (default: 60)
//! - `TOOLGATE_RATE_PER_HOUR` — sliding per-hour admission limit (default: 1000)
//! - `TOOLGATE_MAX_PAYLOAD_KB` — serialized payload ceiling in KB (default: 1024)
//! - `TOOLGATE_MAX_DEPTH` — maximum payload nesting depth (default: 10)
//! - `TOOLGATE_MAX_STRING_LEN` — maximum payload string length (default: 10000)
//! - `TOOLGATE_MAX_ARRAY_LEN` — maximum payload array length (default: 1000)
//! - `TOOLGATE_TASK_TTL_HOURS` — terminal task retention (default: 24)
//! - `TOOLGATE_TOOL_TIMEOUT_SECS` — default per-capability timeout (default: 60)
//! - `TOOLGATE_WORKERS` — background worker count (default: 4)

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum length of an object key, in characters.
///
/// Fixed rather than configurable: keys are code-shaped identifiers and
/// anything longer is adversarial.
pub const MAX_KEY_LEN: usize = 100;

/// Bounds applied by the payload structure check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StructureLimits {
    /// Maximum nesting depth of the payload tree.
    pub max_depth: usize,
    /// Maximum length of any string value, in characters.
    pub max_string_len: usize,
    /// Maximum number of elements in any array.
    pub max_array_len: usize,
}

impl Default for StructureLimits {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_string_len: 10_000,
            max_array_len: 1_000,
        }
    }
}

/// Sliding-window admission limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimits {
    /// Allowed admissions per trailing minute, per subject/capability pair.
    pub per_minute: u32,
    /// Allowed admissions per trailing hour, per subject/capability pair.
    pub per_hour: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_minute: 60,
            per_hour: 1_000,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Serialized payload ceiling in bytes.
    pub max_payload_bytes: usize,
    /// Structural payload bounds.
    pub structure: StructureLimits,
    /// Admission rate limits.
    pub rate: RateLimits,
    /// How long terminal tasks are retained before the sweep collects them.
    pub task_ttl: Duration,
    /// Default invocation deadline for capabilities without their own.
    pub tool_timeout: Duration,
    /// Number of background workers draining the task queue.
    pub workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
            structure: StructureLimits::default(),
            rate: RateLimits::default(),
            task_ttl: Duration::from_secs(24 * 3600),
            tool_timeout: Duration::from_secs(60),
            workers: 4,
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from `TOOLGATE_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_payload_bytes: env_usize("TOOLGATE_MAX_PAYLOAD_KB", 1024, 1, 64 * 1024) * 1024,
            structure: StructureLimits {
                max_depth: env_usize("TOOLGATE_MAX_DEPTH", 10, 1, 64),
                max_string_len: env_usize("TOOLGATE_MAX_STRING_LEN", 10_000, 1, 10_000_000),
                max_array_len: env_usize("TOOLGATE_MAX_ARRAY_LEN", 1_000, 1, 1_000_000),
            },
            rate: RateLimits {
                per_minute: env_usize("TOOLGATE_RATE_PER_MINUTE", 60, 1, 100_000) as u32,
                per_hour: env_usize("TOOLGATE_RATE_PER_HOUR", 1_000, 1, 10_000_000) as u32,
            },
            task_ttl: Duration::from_secs(
                env_usize("TOOLGATE_TASK_TTL_HOURS", 24, 1, 24 * 30) as u64 * 3600,
            ),
            tool_timeout: Duration::from_secs(
                env_usize("TOOLGATE_TOOL_TIMEOUT_SECS", 60, 1, 3600) as u64,
            ),
            workers: env_usize("TOOLGATE_WORKERS", defaults.workers, 1, 256),
        }
    }
}

/// Parse an environment variable as usize, clamped to `[min, max]`.
fn env_usize(name: &str, default: usize, min: usize, max: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .map(|v| v.clamp(min, max))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.max_payload_bytes, 1024 * 1024);
        assert_eq!(cfg.structure.max_depth, 10);
        assert_eq!(cfg.rate.per_minute, 60);
        assert_eq!(cfg.task_ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn test_env_usize_clamps() {
        std::env::set_var("TOOLGATE_TEST_CLAMP", "999999");
        assert_eq!(env_usize("TOOLGATE_TEST_CLAMP", 5, 1, 100), 100);
        std::env::set_var("TOOLGATE_TEST_CLAMP", "not a number");
        assert_eq!(env_usize("TOOLGATE_TEST_CLAMP", 5, 1, 100), 5);
        std::env::remove_var("TOOLGATE_TEST_CLAMP");
    }
}
