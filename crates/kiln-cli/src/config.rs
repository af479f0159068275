//! `kiln.toml` loading and command-line overrides

use std::path::{Path, PathBuf};

use anyhow::Context;
use kiln_jit::{JitConfig, Mode};
use serde::{Deserialize, Serialize};

/// Name of the configuration file looked up in the working directory
pub const CONFIG_FILE: &str = "kiln.toml";

/// Contents of `kiln.toml`
///
/// ```toml
/// [jit]
/// default_mode = "integer"
/// worker_threads = 4
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub jit: JitConfig,
}

impl CliConfig {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("invalid configuration")
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }

    /// Load `explicit` if given, else `kiln.toml` in `dir` if present, else defaults
    pub fn load(explicit: Option<&Path>, dir: &Path) -> anyhow::Result<Self> {
        let path: PathBuf = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let candidate = dir.join(CONFIG_FILE);
                if !candidate.exists() {
                    tracing::debug!("no {} found, using defaults", CONFIG_FILE);
                    return Ok(CliConfig::default());
                }
                candidate
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::from_toml(&text).with_context(|| format!("in {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

/// Settings given on the command line; each one set replaces the file value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub mode: Option<Mode>,
    pub no_downgrade: bool,
    pub no_optimize: bool,
    pub no_verify: bool,
    pub release_gil: bool,
    pub workers: Option<usize>,
    pub max_code_units: Option<usize>,
}

impl Overrides {
    pub fn apply(&self, config: &mut JitConfig) {
        if let Some(mode) = self.mode {
            config.default_mode = mode;
        }
        if self.no_downgrade {
            config.allow_mode_downgrade = false;
        }
        if self.no_optimize {
            config.optimize = false;
        }
        if self.no_verify {
            config.verify_ir = false;
        }
        if self.release_gil {
            config.release_gil_around_calls = true;
        }
        if let Some(workers) = self.workers {
            config.worker_threads = Some(workers);
        }
        if let Some(limit) = self.max_code_units {
            config.max_code_units = Some(limit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_table() {
        let config = CliConfig::from_toml("[jit]\ndefault_mode = \"integer\"\n").unwrap();
        assert_eq!(config.jit.default_mode, Mode::Integer);
        assert!(config.jit.verify_ir);
        assert_eq!(CliConfig::from_toml("").unwrap(), CliConfig::default());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(CliConfig::from_toml("[jit]\ndefault_mode = \"float\"\n").is_err());
    }

    #[test]
    fn test_overrides_win() {
        let mut config =
            CliConfig::from_toml("[jit]\nworker_threads = 8\noptimize = true\n").unwrap().jit;
        let overrides = Overrides { workers: Some(2), no_optimize: true, ..Default::default() };
        overrides.apply(&mut config);
        assert_eq!(config.worker_threads, Some(2));
        assert!(!config.optimize);
        assert!(config.allow_mode_downgrade);
    }
}
