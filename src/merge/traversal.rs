use super::catalog::SchemaCatalog;
use super::error::{MergeError, Result};
use super::models::{EntityKind, EntityTypeDescriptor};
use std::collections::HashSet;
use tracing::debug;

/// Entity types reachable from the root, in first-discovery order.
///
/// Walking forward yields parents before children (safe creation order);
/// walking backward yields children before parents (safe deletion order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalOrder {
    entities: Vec<EntityTypeDescriptor>,
}

impl TraversalOrder {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&EntityTypeDescriptor> {
        self.entities.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EntityTypeDescriptor> {
        self.entities.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.entities.iter().position(|e| e.name == name)
    }
}

impl<'a> IntoIterator for &'a TraversalOrder {
    type Item = &'a EntityTypeDescriptor;
    type IntoIter = std::slice::Iter<'a, EntityTypeDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entities.iter()
    }
}

pub fn build_traversal_order(catalog: &SchemaCatalog, root: &str) -> Result<TraversalOrder> {
    let root_entity = catalog.get(root).ok_or_else(|| {
        MergeError::Configuration(format!("unknown root entity type: {root}"))
    })?;

    let mut visited = HashSet::new();
    let mut entities = Vec::new();
    visit(catalog, root_entity, &mut visited, &mut entities)?;

    debug!(
        "Traversal order from {} covers {} entity types",
        root,
        entities.len()
    );
    Ok(TraversalOrder { entities })
}

fn visit(
    catalog: &SchemaCatalog,
    entity: &EntityTypeDescriptor,
    visited: &mut HashSet<String>,
    out: &mut Vec<EntityTypeDescriptor>,
) -> Result<()> {
    visited.insert(entity.name.clone());
    out.push(entity.clone());

    for relationship in &entity.relationships {
        if relationship.target_kind == EntityKind::View || visited.contains(&relationship.target) {
            continue;
        }

        let target = catalog
            .get(&relationship.target)
            .ok_or_else(|| MergeError::DataIntegrity {
                message: format!(
                    "{} declares a relationship to {}, which is missing from the catalog",
                    entity.name, relationship.target
                ),
            })?;

        // The catalog entry itself may be a view even when the edge did not say so.
        if target.is_view() {
            continue;
        }

        visit(catalog, target, visited, out)?;
    }

    Ok(())
}
