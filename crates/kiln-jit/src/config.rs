//! Engine configuration

use serde::{Deserialize, Serialize};

use crate::ir::Mode;
use crate::pipeline::CompileOptions;

/// Configuration for the JIT engine
///
/// Every field has a default, so a partial `kiln.toml` table deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Mode requested for every compile (default: object)
    pub default_mode: Mode,
    /// Recompile in object mode when integer mode refuses a function (default: true)
    pub allow_mode_downgrade: bool,
    /// Run the IR verifier before handing out an artifact (default: true)
    pub verify_ir: bool,
    /// Run the optimization passes (default: true)
    pub optimize: bool,
    /// Bracket calls into uncompiled code with lock release/acquire (default: false)
    pub release_gil_around_calls: bool,
    /// Batch worker threads, `None` for one per CPU
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_threads: Option<usize>,
    /// Refuse functions longer than this many code units (default: 65536)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_code_units: Option<usize>,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            default_mode: Mode::Object,
            allow_mode_downgrade: true,
            verify_ir: true,
            optimize: true,
            release_gil_around_calls: false,
            worker_threads: None,
            max_code_units: Some(65_536),
        }
    }
}

impl JitConfig {
    /// Per-compile options for `mode`
    pub fn compile_options(&self, mode: Mode) -> CompileOptions {
        CompileOptions {
            mode,
            optimize: self.optimize,
            verify_ir: self.verify_ir,
            release_gil: self.release_gil_around_calls,
            max_code_units: self.max_code_units,
        }
    }

    /// Number of batch workers to spawn
    pub fn effective_workers(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = JitConfig::default();
        assert_eq!(config.default_mode, Mode::Object);
        assert!(config.allow_mode_downgrade);
        assert!(config.effective_workers() >= 1);
    }

    #[test]
    fn test_config_partial_json() {
        let config: JitConfig =
            serde_json::from_str(r#"{"default_mode":"integer","worker_threads":3}"#).unwrap();
        assert_eq!(config.default_mode, Mode::Integer);
        assert_eq!(config.effective_workers(), 3);
        assert!(config.verify_ir);
    }

    #[test]
    fn test_config_zero_workers_clamped() {
        let config = JitConfig { worker_threads: Some(0), ..Default::default() };
        assert_eq!(config.effective_workers(), 1);
    }

    #[test]
    fn test_compile_options_follow_config() {
        let config = JitConfig {
            optimize: false,
            release_gil_around_calls: true,
            ..Default::default()
        };
        let options = config.compile_options(Mode::Integer);
        assert_eq!(options.mode, Mode::Integer);
        assert!(!options.optimize);
        assert!(options.release_gil);
        assert_eq!(options.max_code_units, Some(65_536));
    }
}
