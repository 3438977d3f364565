//! Runtime configuration.
//!
//! A [`RuntimeConfig`] comes from defaults, an optional JSON file, and
//! `LUNET_*` environment overrides, in that order.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default number of failing timer callbacks retained for inspection.
pub const DEFAULT_MAX_TIMER_ERRORS: usize = 64;

/// Configuration for an [`Instance`](crate::Instance) or
/// [`InstancePool`](crate::InstancePool).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory prepended to `package.path` (`?.lua` and `?/init.lua`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lua_path: Option<PathBuf>,
    /// Instances in a pool. `0` means one per available CPU.
    pub pool_size: usize,
    /// Tokio worker threads for the async bridge. `0` uses tokio's default.
    pub worker_threads: usize,
    /// Also expose the script table as the global `ngx`.
    pub ngx_alias: bool,
    /// How many timer callback failures [`Instance::timer_errors`](crate::Instance::timer_errors)
    /// keeps. Older entries are discarded first.
    pub max_timer_errors: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lua_path: None,
            pool_size: 0,
            worker_threads: 0,
            ngx_alias: false,
            max_timer_errors: DEFAULT_MAX_TIMER_ERRORS,
        }
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `LUNET_*` variables from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_vars(std::env::vars())
    }

    fn with_vars(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        for (key, value) in vars {
            match key.as_str() {
                "LUNET_LUA_PATH" if !value.is_empty() => {
                    self.lua_path = Some(PathBuf::from(value));
                }
                "LUNET_POOL_SIZE" => {
                    self.pool_size = value
                        .parse()
                        .with_context(|| format!("Invalid LUNET_POOL_SIZE: {value:?}"))?;
                }
                "LUNET_WORKER_THREADS" => {
                    self.worker_threads = value
                        .parse()
                        .with_context(|| format!("Invalid LUNET_WORKER_THREADS: {value:?}"))?;
                }
                "LUNET_NGX_ALIAS" => {
                    self.ngx_alias = matches!(value.as_str(), "1" | "true" | "yes");
                }
                _ => {}
            }
        }
        Ok(self)
    }

    /// Pool size with `0` resolved to the available parallelism.
    #[must_use]
    pub fn effective_pool_size(&self) -> usize {
        if self.pool_size > 0 {
            return self.pool_size;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_timer_errors, DEFAULT_MAX_TIMER_ERRORS);
        assert!(!config.ngx_alias);
        assert!(config.lua_path.is_none());
        assert!(config.effective_pool_size() >= 1);
    }

    #[test]
    fn test_env_overrides() {
        let config = RuntimeConfig::default()
            .with_vars(vars(&[
                ("LUNET_LUA_PATH", "/opt/lua"),
                ("LUNET_POOL_SIZE", "3"),
                ("LUNET_WORKER_THREADS", "2"),
                ("LUNET_NGX_ALIAS", "1"),
                ("UNRELATED", "x"),
            ]))
            .expect("valid overrides");
        assert_eq!(config.lua_path, Some(PathBuf::from("/opt/lua")));
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.effective_pool_size(), 3);
        assert_eq!(config.worker_threads, 2);
        assert!(config.ngx_alias);
    }

    #[test]
    fn test_invalid_pool_size_is_rejected() {
        let err = RuntimeConfig::default()
            .with_vars(vars(&[("LUNET_POOL_SIZE", "many")]))
            .expect_err("non-numeric pool size");
        assert!(err.to_string().contains("LUNET_POOL_SIZE"));
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{ "pool_size": 4, "ngx_alias": true }}"#).expect("write config");

        let config = RuntimeConfig::load(file.path()).expect("load config");
        assert_eq!(config.pool_size, 4);
        assert!(config.ngx_alias);
        assert_eq!(config.max_timer_errors, DEFAULT_MAX_TIMER_ERRORS);
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "not json").expect("write config");
        assert!(RuntimeConfig::load(file.path()).is_err());
    }
}
