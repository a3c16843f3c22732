//! Defense configuration parsing and validation.
//!
//! `mcp-defend` optionally reads a TOML file that tunes the transcript and
//! re-dispositions individual rules by name:
//!
//! ```toml
//! truncate_chars = 400
//!
//! [rules]
//! tool-description-injection = "block"
//! annotation-suspicious = "warn"
//! ```
//!
//! Dispositions: `warn` records and forwards, `block` records and
//! suppresses, `off` unregisters the rule entirely.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::proxy::rules::{RuleAction, RuleRegistry};
use crate::proxy::trace::DEFAULT_TRUNCATE_CHARS;
use crate::{AppError, Result};

/// Per-rule disposition as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDisposition {
    /// Record the violation and let the frame through.
    Warn,
    /// Record the violation and suppress the frame.
    Block,
    /// Do not evaluate the rule at all.
    Off,
}

fn default_truncate_chars() -> usize {
    DEFAULT_TRUNCATE_CHARS
}

/// Configuration parsed from the `--config` TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DefendConfig {
    /// Payload preview cutoff for the transcript.
    #[serde(default = "default_truncate_chars")]
    pub truncate_chars: usize,
    /// Disposition overrides keyed by rule name.
    #[serde(default)]
    pub rules: BTreeMap<String, RuleDisposition>,
}

impl Default for DefendConfig {
    fn default() -> Self {
        Self {
            truncate_chars: DEFAULT_TRUNCATE_CHARS,
            rules: BTreeMap::new(),
        }
    }
}

impl DefendConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the rule dispositions to `registry`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for a disposition naming a rule the
    /// registry does not hold — a typo here must not silently weaken the
    /// defense.
    pub fn apply(&self, registry: &mut RuleRegistry) -> Result<()> {
        for (name, disposition) in &self.rules {
            let known = match disposition {
                RuleDisposition::Warn => registry.set_action(name, RuleAction::Warn),
                RuleDisposition::Block => registry.set_action(name, RuleAction::Block),
                RuleDisposition::Off => registry.remove(name),
            };
            if !known {
                return Err(AppError::Config(format!("unknown rule '{name}' in config")));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.truncate_chars < 16 {
            return Err(AppError::Config(
                "truncate_chars must be at least 16".into(),
            ));
        }
        Ok(())
    }
}
