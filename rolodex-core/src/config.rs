//! Configuration types

use crate::{ConfigError, EntityTypeSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Cache-wide behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Whether types cache their entities until told otherwise.
    pub cache_by_default: bool,
    /// Check a write's returned fields against the supplied parameters.
    pub verify_writes: bool,
    /// Prefix of backing table names (`civicrm` gives `civicrm_contact`).
    pub table_prefix: String,
    /// Boolean field marking a soft-deleted entity of an undeletable type.
    pub soft_delete_field: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_by_default: true,
            verify_writes: true,
            table_prefix: "civicrm".to_string(),
            soft_delete_field: "is_deleted".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn with_cache_by_default(mut self, cache: bool) -> Self {
        self.cache_by_default = cache;
        self
    }

    pub fn with_verify_writes(mut self, verify: bool) -> Self {
        self.verify_writes = verify;
        self
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn with_soft_delete_field(mut self, field: impl Into<String>) -> Self {
        self.soft_delete_field = field.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "table_prefix".to_string(),
                value: String::new(),
                reason: "table_prefix must not be empty".to_string(),
            });
        }
        if self.soft_delete_field.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "soft_delete_field".to_string(),
                value: String::new(),
                reason: "soft_delete_field must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// A schema file: cache settings plus the entity types to register, in
/// dependency order (parents before children).
///
/// ```toml
/// [cache]
/// verify_writes = true
///
/// [[entity]]
/// name = "Contact"
/// lookups = ["external_identifier"]
///
/// [[entity]]
/// name = "Email"
/// [[entity.parents]]
/// name = "contact"
/// children = "emails"
/// parent = "Contact"
/// parent_id_field = "contact_id"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchemaConfig {
    pub cache: CacheConfig,
    pub entity: Vec<EntityTypeSpec>,
}

impl SchemaConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let schema: SchemaConfig = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&source)
    }

    /// Validate settings and reject duplicate type names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        let mut names = BTreeSet::new();
        for spec in &self.entity {
            if spec.name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "entity.name".to_string(),
                    value: String::new(),
                    reason: "entity name must not be empty".to_string(),
                });
            }
            if !names.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateEntityType {
                    entity_type: spec.name.clone(),
                });
            }
        }
        Ok(())
    }
}
