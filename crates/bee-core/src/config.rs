// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;

/// Default runtime directory.
pub const DEFAULT_DIR: &str = ".bee";

/// Bee runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Local runtime directory (credential store, toolchains, modules)
    pub dir: PathBuf,
    /// Size of the worker pool
    pub parallel: usize,
    /// Extra module roots, loaded after the built-ins
    pub module_paths: Vec<PathBuf>,
    /// Inventory file
    pub inventory: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `BEE_DIR`: runtime directory (default: `.bee`)
    /// - `BEE_PARALLEL`: worker pool size (default: 2 × CPU count)
    /// - `BEE_MODULE_PATHS`: extra module roots, `:`-separated
    /// - `BEE_INVENTORY`: inventory file
    pub fn from_env() -> Result<Self, ConfigError> {
        let dir = std::env::var("BEE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DIR));

        let parallel = match std::env::var("BEE_PARALLEL") {
            Ok(value) => match value.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid(
                        "BEE_PARALLEL",
                        "must be a positive integer",
                    ));
                }
            },
            Err(_) => default_parallel(),
        };

        let module_paths = std::env::var("BEE_MODULE_PATHS")
            .map(|paths| {
                paths
                    .split(':')
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let inventory = std::env::var("BEE_INVENTORY").ok().map(PathBuf::from);

        Ok(Self {
            dir,
            parallel,
            module_paths,
            inventory,
        })
    }
}

/// Default worker pool size: twice the CPU count.
pub fn default_parallel() -> usize {
    num_cpus::get() * 2
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("BEE_DIR");
        guard.remove("BEE_PARALLEL");
        guard.remove("BEE_MODULE_PATHS");
        guard.remove("BEE_INVENTORY");

        let config = Config::from_env().unwrap();

        assert_eq!(config.dir, PathBuf::from(".bee"));
        assert_eq!(config.parallel, num_cpus::get() * 2);
        assert!(config.module_paths.is_empty());
        assert!(config.inventory.is_none());
    }

    #[test]
    fn test_config_from_env_with_module_paths() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("BEE_DIR", "/var/lib/bee");
        guard.set("BEE_PARALLEL", "4");
        guard.set("BEE_MODULE_PATHS", "/opt/modules::./local");
        guard.set("BEE_INVENTORY", "hosts.ini");

        let config = Config::from_env().unwrap();

        assert_eq!(config.dir, PathBuf::from("/var/lib/bee"));
        assert_eq!(config.parallel, 4);
        assert_eq!(
            config.module_paths,
            vec![PathBuf::from("/opt/modules"), PathBuf::from("./local")]
        );
        assert_eq!(config.inventory, Some(PathBuf::from("hosts.ini")));
    }

    #[test]
    fn test_config_rejects_zero_parallel() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("BEE_PARALLEL", "0");

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::Invalid("BEE_PARALLEL", _))
        ));
    }
}
