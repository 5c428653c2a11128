// config.rs — Analysis tuning knobs
//
// Loaded from JSON; every field has a default so an empty object is a valid
// config. Unknown fields are rejected to catch typos.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoalescingConfig {
    /// Lanes per hardware execution group.
    pub warp_size: i64,
    /// Upper bound on probed execution groups per index map.
    pub max_probes: usize,
    /// Values sampled per range symbol.
    pub symbol_samples: usize,
}

impl Default for CoalescingConfig {
    fn default() -> Self {
        CoalescingConfig {
            warp_size: 32,
            max_probes: 256,
            symbol_samples: 3,
        }
    }
}

impl CoalescingConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: CoalescingConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.warp_size <= 0 {
            return Err(ConfigError::Invalid(format!(
                "warp_size must be positive, got {}",
                self.warp_size
            )));
        }
        if self.max_probes == 0 {
            return Err(ConfigError::Invalid("max_probes must be positive".to_string()));
        }
        if self.symbol_samples == 0 {
            return Err(ConfigError::Invalid("symbol_samples must be positive".to_string()));
        }
        Ok(())
    }
}
