//! Entity registry and run configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tripsync_core::{builtin_entities, EntitySpec};
use tripsync_storage::StoreConfig;

/// Known entity types. Doubles as the allow-list for relation and key names
/// that may reach a SQL statement.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityRegistry {
    entities: Vec<EntitySpec>,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl EntityRegistry {
    pub fn builtin() -> Self {
        Self {
            entities: builtin_entities(),
        }
    }

    pub fn new(entities: Vec<EntitySpec>) -> Result<Self> {
        let registry = Self { entities };
        registry.validate()?;
        Ok(registry)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing entity registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn get(&self, entity_type: &str) -> Option<&EntitySpec> {
        self.entities.iter().find(|e| e.entity_type == entity_type)
    }

    pub fn entities(&self) -> &[EntitySpec] {
        &self.entities
    }

    fn validate(&self) -> Result<()> {
        let mut types = HashSet::new();
        let mut relations = HashSet::new();
        for entity in &self.entities {
            if !types.insert(entity.entity_type.as_str()) {
                bail!("entity type {} is declared twice", entity.entity_type);
            }
            for relation in [&entity.staging_relation, &entity.final_relation] {
                if !relations.insert(relation.normalized()) {
                    bail!("relation {relation} is shared by more than one entity pair");
                }
            }
            if entity.business_key.is_empty() {
                bail!("entity {} declares an empty business key", entity.entity_type);
            }
            for column in entity.business_key.iter().chain([&entity.tie_break]) {
                if !entity.declares(column.as_str()) {
                    bail!(
                        "entity {} uses column {column} that its canonical schema does not declare",
                        entity.entity_type
                    );
                }
            }
        }
        Ok(())
    }
}

/// How the merge treats staging rows whose identity already exists in final.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeMode {
    /// Leave existing rows untouched.
    #[default]
    InsertOnly,
    /// Rewrite existing rows whose values changed, then insert the rest.
    Upsert,
}

impl FromStr for MergeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert-only" | "insert_only" | "insert" => Ok(Self::InsertOnly),
            "upsert" | "update" => Ok(Self::Upsert),
            other => bail!("unknown merge mode {other}; expected insert-only or upsert"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store: StoreConfig,
    pub entities_file: Option<PathBuf>,
    pub mode: MergeMode,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store: StoreConfig::from_env(),
            entities_file: std::env::var("TRIPSYNC_ENTITIES").ok().map(PathBuf::from),
            mode: std::env::var("TRIPSYNC_MERGE_MODE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        }
    }

    pub fn registry(&self) -> Result<EntityRegistry> {
        match &self.entities_file {
            Some(path) => EntityRegistry::load(path),
            None => Ok(EntityRegistry::builtin()),
        }
    }
}
