use crate::error::SchemataError;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use zeroize::Zeroizing;

pub const TREE_SPACE_PREFIX: &str = "treespace.";
pub const DEFAULT_TREE_SPACE: &str = ".default";
const SETTING_PREFIX: &str = "schemata.";

/// Runtime configuration for a schema manager and its storage mapping.
#[derive(Debug, Clone)]
pub struct SchemataConfig {
    /// Tree-space name to `"<glob>:<volume template>"`. The `.default` entry
    /// holds a bare volume template consulted when no glob matches.
    pub tree_spaces: BTreeMap<String, String>,
    /// Extra `${name}` substitutions available to volume templates.
    pub volume_properties: BTreeMap<String, String>,
    pub max_tables_per_volume: u32,
    pub max_cached_trees: usize,
    pub max_pooled_cursors_per_tree: usize,
    pub catalog_schema: String,
    pub catalog_tree_name: String,
    pub sort_schema: String,
    pub sort_in_temp_volume: bool,
    /// Zero disables the limit.
    pub max_catalog_bytes: usize,
    pub query_timeout: Option<Duration>,
    /// HMAC key for catalog dump files. Wrapped in Arc<Zeroizing<>> so the
    /// key is zeroed when the last reference is dropped.
    pub dump_hmac_key: Option<Arc<Zeroizing<Vec<u8>>>>,
}

impl Default for SchemataConfig {
    fn default() -> Self {
        let mut tree_spaces = BTreeMap::new();
        tree_spaces.insert(DEFAULT_TREE_SPACE.to_string(), "default".to_string());
        Self {
            tree_spaces,
            volume_properties: BTreeMap::new(),
            max_tables_per_volume: 100_000,
            max_cached_trees: 64,
            max_pooled_cursors_per_tree: 32,
            catalog_schema: "sys".into(),
            catalog_tree_name: "_schema_".into(),
            sort_schema: "sys".into(),
            sort_in_temp_volume: true,
            max_catalog_bytes: 0,
            query_timeout: None,
            dump_hmac_key: None,
        }
    }
}

impl SchemataConfig {
    pub fn production(hmac_key: [u8; 32]) -> Self {
        Self {
            dump_hmac_key: Some(Arc::new(Zeroizing::new(hmac_key.to_vec()))),
            max_catalog_bytes: 64 * 1024 * 1024,
            ..Self::default()
        }
    }

    /// Small caches so eviction and pooling paths are exercised early.
    pub fn development() -> Self {
        Self {
            max_cached_trees: 10,
            max_pooled_cursors_per_tree: 5,
            ..Self::default()
        }
    }

    /// Builds a config from `key=value` server properties. Keys under
    /// `treespace.` become tree-space rules, keys under `schemata.` set
    /// numeric limits, and everything else is a volume template property.
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self, SchemataError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut config = Self::default();
        for (key, value) in properties {
            let key = key.into();
            let value = value.into();
            if let Some(name) = key.strip_prefix(TREE_SPACE_PREFIX) {
                if name.is_empty() {
                    warn!(property = %key, "ignoring tree space with empty name");
                    continue;
                }
                config.tree_spaces.insert(name.to_string(), value);
            } else if let Some(setting) = key.strip_prefix(SETTING_PREFIX) {
                config.apply_setting(setting, &value)?;
            } else {
                config.volume_properties.insert(key, value);
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn apply_setting(&mut self, setting: &str, value: &str) -> Result<(), SchemataError> {
        match setting {
            "max_tables_per_volume" => self.max_tables_per_volume = parse_number(setting, value)?,
            "max_cached_trees" => self.max_cached_trees = parse_number(setting, value)?,
            "max_pooled_cursors_per_tree" => {
                self.max_pooled_cursors_per_tree = parse_number(setting, value)?
            }
            "max_catalog_bytes" => self.max_catalog_bytes = parse_number(setting, value)?,
            "query_timeout_ms" => {
                let ms: u64 = parse_number(setting, value)?;
                self.query_timeout = (ms > 0).then(|| Duration::from_millis(ms));
            }
            "sort_in_temp_volume" => {
                self.sort_in_temp_volume =
                    value
                        .parse()
                        .map_err(|_| SchemataError::InvalidConfig {
                            message: format!("{SETTING_PREFIX}{setting} must be true or false"),
                        })?
            }
            "catalog_schema" => self.catalog_schema = value.to_string(),
            "sort_schema" => self.sort_schema = value.to_string(),
            other => {
                warn!(setting = other, "ignoring unknown setting");
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SchemataError> {
        if self.max_tables_per_volume == 0 {
            return Err(SchemataError::InvalidConfig {
                message: "max_tables_per_volume must be > 0".into(),
            });
        }
        if self.max_cached_trees == 0 {
            return Err(SchemataError::InvalidConfig {
                message: "max_cached_trees must be > 0".into(),
            });
        }
        if self.catalog_tree_name.is_empty() {
            return Err(SchemataError::InvalidConfig {
                message: "catalog_tree_name must not be empty".into(),
            });
        }
        Ok(())
    }

    pub fn with_tree_space(mut self, name: &str, pattern: &str, volume: &str) -> Self {
        self.tree_spaces
            .insert(name.to_string(), format!("{pattern}:{volume}"));
        self
    }

    pub fn with_default_volume(mut self, volume: &str) -> Self {
        self.tree_spaces
            .insert(DEFAULT_TREE_SPACE.to_string(), volume.to_string());
        self
    }

    pub fn with_volume_property(mut self, name: &str, value: &str) -> Self {
        self.volume_properties
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_sort_in_temp_volume(mut self, enabled: bool) -> Self {
        self.sort_in_temp_volume = enabled;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    /// Sets the dump HMAC key, wrapping it in Arc<Zeroizing<>>.
    pub fn with_hmac_key(mut self, key: Vec<u8>) -> Self {
        self.dump_hmac_key = Some(Arc::new(Zeroizing::new(key)));
        self
    }

    pub fn hmac_key(&self) -> Option<&[u8]> {
        self.dump_hmac_key.as_ref().map(|arc| &***arc as &[u8])
    }
}

fn parse_number<T: std::str::FromStr>(setting: &str, value: &str) -> Result<T, SchemataError> {
    value
        .trim()
        .parse()
        .map_err(|_| SchemataError::InvalidConfig {
            message: format!("{SETTING_PREFIX}{setting} must be a non-negative integer, got '{value}'"),
        })
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_TREE_SPACE, SchemataConfig};
    use std::time::Duration;

    #[test]
    fn properties_split_into_rules_settings_and_template_values() {
        let config = SchemataConfig::from_properties([
            ("treespace.a", "s*:v1"),
            ("treespace..default", "fallback"),
            ("datapath", "/var/data"),
            ("schemata.max_cached_trees", "12"),
            ("schemata.query_timeout_ms", "250"),
        ])
        .expect("config");
        assert_eq!(config.tree_spaces.get("a").map(String::as_str), Some("s*:v1"));
        assert_eq!(
            config.tree_spaces.get(DEFAULT_TREE_SPACE).map(String::as_str),
            Some("fallback")
        );
        assert_eq!(
            config.volume_properties.get("datapath").map(String::as_str),
            Some("/var/data")
        );
        assert_eq!(config.max_cached_trees, 12);
        assert_eq!(config.query_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn malformed_numeric_setting_is_rejected() {
        let err = SchemataConfig::from_properties([("schemata.max_cached_trees", "many")])
            .expect_err("must fail");
        assert_eq!(err.code_str(), "invalid_config");
    }

    #[test]
    fn zero_capacity_fails_validation() {
        let config = SchemataConfig {
            max_tables_per_volume: 0,
            ..SchemataConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn hmac_key_is_exposed_as_slice() {
        let config = SchemataConfig::production([7u8; 32]);
        assert_eq!(config.hmac_key().map(|k| k.len()), Some(32));
        assert!(SchemataConfig::development().hmac_key().is_none());
    }
}
