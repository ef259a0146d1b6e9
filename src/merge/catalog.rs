//! Schema catalog snapshot and its process-wide cache.
//!
//! The catalog is the typed stand-in for runtime schema reflection: a map of
//! entity descriptors loaded once from the store (or from a TOML description)
//! and shared read-only between merges until explicitly invalidated.

use super::error::{MergeError, Result};
use super::models::{EntityTypeDescriptor, RelationshipDescriptor};
use crate::store::MergeStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaCatalog {
    entities: BTreeMap<String, EntityTypeDescriptor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    entity: Vec<EntityTypeDescriptor>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entities(entities: impl IntoIterator<Item = EntityTypeDescriptor>) -> Self {
        let mut catalog = Self::new();
        for entity in entities {
            catalog.insert(entity);
        }
        catalog
    }

    /// Parse a catalog written as a list of `[[entity]]` tables.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)
            .map_err(|e| MergeError::Configuration(format!("invalid schema catalog: {e}")))?;
        Ok(Self::from_entities(file.entity))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        let file = CatalogFile {
            entity: self.entities.values().cloned().collect(),
        };
        toml::to_string_pretty(&file)
            .map_err(|e| MergeError::Configuration(format!("cannot serialize schema catalog: {e}")))
    }

    pub fn insert(&mut self, entity: EntityTypeDescriptor) {
        self.entities.insert(entity.name.clone(), entity);
    }

    pub fn get(&self, name: &str) -> Option<&EntityTypeDescriptor> {
        self.entities.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityTypeDescriptor> {
        self.entities.values()
    }

    /// Relationships from any entity whose target is `target`, with their source.
    pub fn relationships_into<'a>(
        &'a self,
        target: &'a str,
    ) -> impl Iterator<Item = (&'a EntityTypeDescriptor, &'a RelationshipDescriptor)> + 'a {
        self.entities.values().flat_map(move |source| {
            source
                .relationships
                .iter()
                .filter(move |rel| rel.target == target)
                .map(move |rel| (source, rel))
        })
    }

    /// Flag every field that a relationship of `root` maps its key into.
    /// Fields the catalog already classified are left alone.
    pub fn mark_root_references(&mut self, root: &str) {
        let Some(root_entity) = self.entities.get(root) else {
            return;
        };

        let mapped: Vec<(String, String)> = root_entity
            .relationships
            .iter()
            .flat_map(|rel| {
                rel.key_map
                    .iter()
                    .map(move |pair| (rel.target.clone(), pair.related_field.clone()))
            })
            .collect();

        for (target, field_name) in mapped {
            if let Some(field) = self
                .entities
                .get_mut(&target)
                .and_then(|entity| entity.fields.iter_mut().find(|f| f.name == field_name))
            {
                if field.references_root.is_none() {
                    field.references_root = Some(true);
                }
            }
        }
    }
}

/// Process-wide catalog snapshot with explicit load and invalidation.
#[derive(Debug)]
pub struct CatalogCache {
    root_entity: String,
    current: RwLock<Option<Arc<SchemaCatalog>>>,
}

impl CatalogCache {
    pub fn new(root_entity: impl Into<String>) -> Self {
        Self {
            root_entity: root_entity.into(),
            current: RwLock::new(None),
        }
    }

    pub fn root_entity(&self) -> &str {
        &self.root_entity
    }

    /// Read the catalog from the store, replacing any cached snapshot.
    pub async fn load(&self, store: &dyn MergeStore) -> Result<Arc<SchemaCatalog>> {
        let catalog = store.load_catalog().await?;
        self.install(catalog).await
    }

    /// Cache a catalog obtained elsewhere, e.g. from a schema description file.
    pub async fn install(&self, mut catalog: SchemaCatalog) -> Result<Arc<SchemaCatalog>> {
        if !catalog.contains(&self.root_entity) {
            return Err(MergeError::Configuration(format!(
                "root entity {} is not present in the schema catalog",
                self.root_entity
            )));
        }
        catalog.mark_root_references(&self.root_entity);

        let catalog = Arc::new(catalog);
        *self.current.write().await = Some(catalog.clone());
        info!(
            "Loaded schema catalog with {} entity types (root: {})",
            catalog.len(),
            self.root_entity
        );
        Ok(catalog)
    }

    pub async fn get_or_load(&self, store: &dyn MergeStore) -> Result<Arc<SchemaCatalog>> {
        if let Some(catalog) = self.current.read().await.as_ref() {
            return Ok(catalog.clone());
        }
        self.load(store).await
    }

    pub async fn invalidate(&self) {
        *self.current.write().await = None;
        debug!("Schema catalog cache invalidated");
    }

    pub async fn is_loaded(&self) -> bool {
        self.current.read().await.is_some()
    }
}
