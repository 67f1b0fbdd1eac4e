//! Scrub configuration.
//!
//! Only the staging backend is configurable. Options come from serde
//! (config files), from the environment, or from CLI flags layered on top.

use rts_error::{Result, RtsError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const ENV_STAGING: &str = "RTS_STAGING";
pub const ENV_SPILL_THRESHOLD: &str = "RTS_SPILL_THRESHOLD_BYTES";

/// Default largest staging buffer kept in memory under [`StagingMode::Auto`].
pub const DEFAULT_SPILL_THRESHOLD_BYTES: u64 = 64 * 1024 * 1024;

/// Where the recomputed summary is staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingMode {
    /// Heap buffer.
    Memory,
    /// Anonymous temporary file.
    Spill,
    /// Memory up to the spill threshold, temporary file above it.
    #[default]
    Auto,
}

impl fmt::Display for StagingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Spill => f.write_str("spill"),
            Self::Auto => f.write_str("auto"),
        }
    }
}

impl FromStr for StagingMode {
    type Err = RtsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "spill" | "file" => Ok(Self::Spill),
            "auto" => Ok(Self::Auto),
            other => Err(RtsError::Format(format!(
                "unknown staging mode {other:?} (expected memory, spill or auto)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrubOptions {
    pub staging: StagingMode,
    pub spill_threshold_bytes: u64,
}

impl Default for ScrubOptions {
    fn default() -> Self {
        Self {
            staging: StagingMode::Auto,
            spill_threshold_bytes: DEFAULT_SPILL_THRESHOLD_BYTES,
        }
    }
}

impl ScrubOptions {
    /// Defaults overridden by `RTS_STAGING` and `RTS_SPILL_THRESHOLD_BYTES`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut opts = Self::default();
        if let Some(raw) = lookup(ENV_STAGING) {
            opts.staging = raw.parse()?;
        }
        if let Some(raw) = lookup(ENV_SPILL_THRESHOLD) {
            opts.spill_threshold_bytes = raw.trim().parse().map_err(|_| {
                RtsError::Format(format!(
                    "{ENV_SPILL_THRESHOLD}={raw:?} is not a byte count"
                ))
            })?;
        }
        Ok(opts)
    }

    /// The backend actually used for a staging area of `len` bytes.
    #[must_use]
    pub fn resolve_mode(&self, len: u64) -> StagingMode {
        match self.staging {
            StagingMode::Auto if len > self.spill_threshold_bytes => StagingMode::Spill,
            StagingMode::Auto => StagingMode::Memory,
            explicit => explicit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let opts = ScrubOptions::from_lookup(lookup(&[])).expect("opts");
        assert_eq!(opts, ScrubOptions::default());
        assert_eq!(opts.spill_threshold_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn env_overrides() {
        let opts = ScrubOptions::from_lookup(lookup(&[
            (ENV_STAGING, "Spill"),
            (ENV_SPILL_THRESHOLD, " 4096 "),
        ]))
        .expect("opts");
        assert_eq!(opts.staging, StagingMode::Spill);
        assert_eq!(opts.spill_threshold_bytes, 4096);
    }

    #[test]
    fn invalid_env_is_format_error() {
        let err = ScrubOptions::from_lookup(lookup(&[(ENV_STAGING, "tape")])).expect_err("mode");
        assert!(matches!(err, RtsError::Format(_)));
        let err = ScrubOptions::from_lookup(lookup(&[(ENV_SPILL_THRESHOLD, "lots")]))
            .expect_err("threshold");
        assert!(matches!(err, RtsError::Format(_)));
    }

    #[test]
    fn auto_resolves_by_threshold() {
        let opts = ScrubOptions {
            staging: StagingMode::Auto,
            spill_threshold_bytes: 1000,
        };
        assert_eq!(opts.resolve_mode(1000), StagingMode::Memory);
        assert_eq!(opts.resolve_mode(1001), StagingMode::Spill);

        let forced = ScrubOptions {
            staging: StagingMode::Memory,
            ..opts
        };
        assert_eq!(forced.resolve_mode(u64::MAX), StagingMode::Memory);
    }

    #[test]
    fn serde_fills_missing_fields() {
        let opts: ScrubOptions = serde_json::from_str(r#"{"staging":"spill"}"#).expect("json");
        assert_eq!(opts.staging, StagingMode::Spill);
        assert_eq!(opts.spill_threshold_bytes, DEFAULT_SPILL_THRESHOLD_BYTES);
        assert_eq!(StagingMode::Auto.to_string(), "auto");
    }
}
