//! Provider and database configuration.

use serde::Deserialize;

use crate::error::{Error, Result};

/// The buffer cache policy selected for a provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BufferCacheConfig {
    /// Allocate on `get`, free on `release`.
    Default,
    /// Keep released buffers indexed by `(mode, size)`, unbounded.
    KeepAll {
        /// Fractional oversizing applied to newly allocated buffers.
        #[serde(default)]
        margin: f32,
    },
    /// Like `keep_all`, bounded per mode with FIFO eviction.
    Lru {
        #[serde(default)]
        margin: f32,
        #[serde(default = "default_lru_capacity")]
        capacity: usize,
    },
}

fn default_lru_capacity() -> usize {
    32
}

impl Default for BufferCacheConfig {
    fn default() -> Self {
        BufferCacheConfig::Default
    }
}

impl BufferCacheConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            BufferCacheConfig::Default => Ok(()),
            BufferCacheConfig::KeepAll { margin } | BufferCacheConfig::Lru { margin, .. } => {
                if *margin < 0.0 {
                    return Err(Error::InvalidConfig("buffer cache margin must be >= 0".into()));
                }
                Ok(())
            }
        }
    }
}

/// The configuration of a single database, as accepted by `open_db`.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// The registered backend type name (e.g. `"map"`).
    #[serde(rename = "type")]
    pub backend_type: String,
    /// Backend-specific configuration, passed through unparsed.
    #[serde(default)]
    pub config: serde_json::Value,
    /// An optional human-readable name for the database.
    #[serde(default)]
    pub name: Option<String>,
}

impl DatabaseConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.backend_type.is_empty() {
            return Err(Error::InvalidConfig("database type must not be empty".into()));
        }
        Ok(())
    }
}

/// Top-level provider configuration, as described in the external
/// interface's JSON configuration object.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub buffer_cache: BufferCacheConfig,
    #[serde(default)]
    pub use_progress_thread: bool,
}

impl ProviderConfig {
    /// Parses and validates a provider configuration from its JSON text.
    pub fn parse(json: &str) -> Result<Self> {
        let cfg: ProviderConfig =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if let Some(db) = &self.database {
            db.validate()?;
        }
        self.buffer_cache.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let cfg = ProviderConfig::parse("{}").unwrap();
        assert!(cfg.database.is_none());
        assert!(matches!(cfg.buffer_cache, BufferCacheConfig::Default));
    }

    #[test]
    fn rejects_negative_margin() {
        let json = r#"{"buffer_cache": {"type": "keep_all", "margin": -1.0}}"#;
        assert!(ProviderConfig::parse(json).is_err());
    }

    #[test]
    fn parses_lru_with_defaults() {
        let json = r#"{"buffer_cache": {"type": "lru"}}"#;
        let cfg = ProviderConfig::parse(json).unwrap();
        match cfg.buffer_cache {
            BufferCacheConfig::Lru { capacity, margin } => {
                assert_eq!(capacity, 32);
                assert_eq!(margin, 0.0);
            }
            _ => panic!("expected lru config"),
        }
    }
}
