//! Store configuration file handling
//!
//! Loads and manages the ~/.config/normcache/config.yaml file describing
//! per-typename merge policies and foreign-key associations.

use crate::store::MergePolicy;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Association between a foreign-key field and a relation field
///
/// Keyed by the foreign-key field name inside [`TypeConfig::references`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceConfig {
    /// Typename of the related entity
    #[serde(rename = "type")]
    pub typename: String,

    /// Relation field holding the related entity (or list of entities)
    pub field: String,

    /// Fields a cached related entity must have to count as resolved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_fields: Vec<String>,
}

impl ReferenceConfig {
    /// Create an association to `typename` through relation `field`
    pub fn new(typename: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            typename: typename.into(),
            field: field.into(),
            required_fields: Vec::new(),
        }
    }

    /// Require fields on the related entity
    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

/// Per-typename settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeConfig {
    /// Default merge policy per array-of-entities field
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub merge_policies: BTreeMap<String, MergePolicy>,

    /// Associations keyed by foreign-key field
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub references: BTreeMap<String, ReferenceConfig>,
}

/// Store configuration
///
/// Represents the complete ~/.config/normcache/config.yaml file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Settings per typename
    #[serde(default)]
    pub types: BTreeMap<String, TypeConfig>,
}

impl StoreConfig {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the default path (~/.config/normcache/config.yaml)
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        Self::load(&path)
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::CacheError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading store configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(types = config.types.len(), "Configuration loaded successfully");

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving store configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/normcache/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("normcache");
        path.push("config.yaml");
        path
    }

    /// Settings for a typename
    pub fn type_config(&self, typename: &str) -> Option<&TypeConfig> {
        self.types.get(typename)
    }

    /// Declare an association (builder style)
    pub fn with_reference(
        mut self,
        typename: impl Into<String>,
        foreign_key: impl Into<String>,
        reference: ReferenceConfig,
    ) -> Self {
        self.types
            .entry(typename.into())
            .or_default()
            .references
            .insert(foreign_key.into(), reference);
        self
    }

    /// Declare a default merge policy (builder style)
    pub fn with_merge_policy(
        mut self,
        typename: impl Into<String>,
        field: impl Into<String>,
        policy: MergePolicy,
    ) -> Self {
        self.types
            .entry(typename.into())
            .or_default()
            .merge_policies
            .insert(field.into(), policy);
        self
    }

    /// Configured merge policy for an array field
    pub fn merge_policy(&self, typename: &str, field: &str) -> Option<MergePolicy> {
        self.type_config(typename)
            .and_then(|t| t.merge_policies.get(field).copied())
    }

    /// All associations of a typename as `(foreign_key, reference)` pairs
    pub fn references(&self, typename: &str) -> impl Iterator<Item = (&str, &ReferenceConfig)> {
        self.type_config(typename)
            .into_iter()
            .flat_map(|t| t.references.iter().map(|(fk, r)| (fk.as_str(), r)))
    }

    /// Association whose relation side is `relation_field`
    pub fn reference_for_relation(
        &self,
        typename: &str,
        relation_field: &str,
    ) -> Option<(&str, &ReferenceConfig)> {
        self.references(typename)
            .find(|(_, reference)| reference.field == relation_field)
    }
}
