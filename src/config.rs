use serde::{Deserialize, Serialize};

use crate::scripting::sandbox::TrustLevel;

pub const DEFAULT_MAX_DEPTH: usize = 64;
pub const DEFAULT_CHUNK_NAME: &str = "script";

/// Per-session engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Which standard libraries the script VM gets.
    pub trust_level: TrustLevel,
    /// Upper bound on engine heap usage in bytes. `None` means unlimited.
    pub memory_limit: Option<usize>,
    /// Deepest array nesting converted in either direction.
    pub max_depth: usize,
    /// Name reported in compile and runtime error messages.
    pub chunk_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trust_level: TrustLevel::default(),
            memory_limit: None,
            max_depth: DEFAULT_MAX_DEPTH,
            chunk_name: DEFAULT_CHUNK_NAME.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("invalid engine config: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = EngineConfig::from_json(r#"{ "memory_limit": 1048576 }"#).unwrap();
        assert_eq!(config.memory_limit, Some(1_048_576));
        assert_eq!(config.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(config.trust_level, TrustLevel::Basic);
        assert_eq!(config.chunk_name, "script");
    }

    #[test]
    fn trust_level_is_snake_case() {
        let config = EngineConfig::from_json(r#"{ "trust_level": "file_read" }"#).unwrap();
        assert_eq!(config.trust_level, TrustLevel::FileRead);
    }

    #[test]
    fn rejects_garbage() {
        assert!(EngineConfig::from_json("{ nope").is_err());
    }
}
