//! JIT configuration
//!
//! [`JitConfig`] carries the tuning constants of the trace JIT. Every field
//! has a default, so a JSON file only needs to name what it overrides:
//!
//! ```
//! use quicktrace::JitConfig;
//!
//! let config = JitConfig::from_json_str(r#"{ "hot_threshold": 10 }"#).unwrap();
//! assert_eq!(config.hot_threshold, 10);
//! assert_eq!(config.max_trace_length, 1024);
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Executions of a loop header before recording starts (recording begins
/// once the counter exceeds this value)
pub const HOT_TRACE_THRESHOLD: u32 = 4;

/// Maximum number of IR instruction ids in one trace
pub const MAX_TRACE_LENGTH: usize = 1024;

/// A trace is compiled only when it holds more instructions than this
pub const MIN_TRACE_LENGTH: usize = 4;

/// Register-stack slots below the logical zero (values already on the
/// operand stack when recording starts)
pub const RESERVED_REGSTACK: usize = 64;

/// Initial capacity of the IR instruction arena
pub const IR_ARENA_CAPACITY: usize = 512;

/// Tuning knobs for the trace JIT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Master switch; a disabled engine never records or invokes traces
    pub enabled: bool,
    /// Loop-header executions before recording starts
    pub hot_threshold: u32,
    /// Maximum IR instruction ids per trace
    pub max_trace_length: usize,
    /// Traces with this many instructions or fewer are not compiled
    pub min_trace_length: usize,
    /// Register-stack slots reserved below the recording frame
    pub reserved_regstack: usize,
    /// Run the post-recording optimizer (folding and dead-code elimination)
    pub optimize: bool,
    /// Log every submitted trace's IR
    pub dump_ir: bool,
    /// Log stack maps as they are captured
    pub dump_stack_maps: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hot_threshold: HOT_TRACE_THRESHOLD,
            max_trace_length: MAX_TRACE_LENGTH,
            min_trace_length: MIN_TRACE_LENGTH,
            reserved_regstack: RESERVED_REGSTACK,
            optimize: true,
            dump_ir: false,
            dump_stack_maps: false,
        }
    }
}

impl JitConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration with the JIT switched off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: JitConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject configurations the recorder cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_trace_length == 0 {
            return Err(Error::config("max_trace_length must be positive"));
        }
        if self.reserved_regstack == 0 {
            return Err(Error::config("reserved_regstack must be positive"));
        }
        if self.min_trace_length >= self.max_trace_length {
            return Err(Error::config(format!(
                "min_trace_length ({}) must be below max_trace_length ({})",
                self.min_trace_length, self.max_trace_length
            )));
        }
        Ok(())
    }

    pub fn with_hot_threshold(mut self, threshold: u32) -> Self {
        self.hot_threshold = threshold;
        self
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_dump_ir(mut self, dump: bool) -> Self {
        self.dump_ir = dump;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_tuning_constants() {
        let config = JitConfig::default();
        assert!(config.enabled);
        assert_eq!(config.hot_threshold, 4);
        assert_eq!(config.max_trace_length, 1024);
        assert_eq!(config.min_trace_length, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_overrides() {
        let config = JitConfig::from_json_str(r#"{"optimize": false, "dump_ir": true}"#).unwrap();
        assert!(!config.optimize);
        assert!(config.dump_ir);
        assert_eq!(config.hot_threshold, HOT_TRACE_THRESHOLD);
    }

    #[test]
    fn test_validate_rejects_inverted_lengths() {
        let err = JitConfig::from_json_str(r#"{"min_trace_length": 2000}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"hot_threshold": 1, "enabled": false}}"#).unwrap();
        let config = JitConfig::load(file.path()).unwrap();
        assert_eq!(config.hot_threshold, 1);
        assert!(!config.enabled);
    }

    #[test]
    fn test_disabled() {
        assert!(!JitConfig::disabled().enabled);
    }
}
