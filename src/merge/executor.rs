use super::catalog::SchemaCatalog;
use super::error::{MergeError, Rejection, Result};
use super::models::{EntityTypeDescriptor, FieldDescriptor, MergeSummary, RecordKey};
use super::satellite::{load_identity, reconcile_satellites, SatelliteKind};
use super::traversal::{build_traversal_order, TraversalOrder};
use crate::config::MergeConfig;
use crate::store::StoreTransaction;
use regex::Regex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

/// Rewrites every reference to one party so it points at another, then
/// removes the absorbed party's rows.
#[derive(Debug, Clone)]
pub struct MergeExecutor {
    root_entity: String,
    root_key_pattern: Regex,
    satellites: Vec<SatelliteKind>,
}

impl MergeExecutor {
    pub fn new(config: &MergeConfig) -> Result<Self> {
        let root_key_pattern = Regex::new(&config.root_key_field_pattern).map_err(|e| {
            MergeError::Configuration(format!("invalid root key field pattern: {e}"))
        })?;

        let satellites = config
            .satellite_entities
            .iter()
            .map(|name| {
                SatelliteKind::from_entity_name(name).ok_or_else(|| {
                    MergeError::Configuration(format!("unknown satellite entity type: {name}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root_entity: config.root_entity.clone(),
            root_key_pattern,
            satellites,
        })
    }

    pub fn root_entity(&self) -> &str {
        &self.root_entity
    }

    /// Whether `field` of `entity` holds a root key.
    pub fn references_root(&self, entity: &EntityTypeDescriptor, field: &FieldDescriptor) -> bool {
        if entity.name == self.root_entity && field.is_primary_key {
            return true;
        }
        match field.references_root {
            Some(flag) => flag,
            None => self.root_key_pattern.is_match(&field.name),
        }
    }

    pub fn traversal_order(&self, catalog: &SchemaCatalog) -> Result<TraversalOrder> {
        build_traversal_order(catalog, &self.root_entity)
    }

    /// Merge `from` into `to` inside `tx`. Nothing is committed here; the
    /// caller owns the transaction and rolls it back on any error.
    pub async fn merge(
        &self,
        tx: &mut dyn StoreTransaction,
        catalog: &SchemaCatalog,
        from: &str,
        to: &str,
    ) -> Result<MergeSummary> {
        if from == to {
            return Err(Rejection::SameKey {
                key: from.to_string(),
            }
            .into());
        }

        let from_identity = load_identity(tx, catalog, &self.root_entity, from)
            .await?
            .ok_or_else(|| MergeError::PartyNotFound { id: from.to_string() })?;
        let to_identity = load_identity(tx, catalog, &self.root_entity, to)
            .await?
            .ok_or_else(|| MergeError::PartyNotFound { id: to.to_string() })?;
        if from_identity.party_type != to_identity.party_type {
            return Err(Rejection::TypeMismatch {
                from_type: from_identity.party_type.to_string(),
                to_type: to_identity.party_type.to_string(),
            }
            .into());
        }

        info!("Merging party {} into {}", from, to);
        let mut summary = MergeSummary {
            from_party_id: from.to_string(),
            to_party_id: to.to_string(),
            ..MergeSummary::default()
        };

        summary.satellites_reconciled =
            reconcile_satellites(tx, catalog, &self.satellites, from, to).await?;

        let order = self.traversal_order(catalog)?;
        summary.entities_visited = order.len();

        // Originals to delete, per traversal position.
        let mut removals: Vec<Vec<RecordKey>> = vec![Vec::new(); order.len()];

        for (index, entity) in order.iter().enumerate() {
            let root_fields: Vec<&FieldDescriptor> = entity
                .fields
                .iter()
                .filter(|field| self.references_root(entity, field))
                .collect();
            if root_fields.is_empty() {
                continue;
            }

            let mut handled = HashSet::new();
            for field in &root_fields {
                let rows = tx.find_by_field(entity, &field.name, from).await?;
                for row in rows {
                    let original_key = row.key(entity)?;
                    if !handled.insert(original_key.to_string()) {
                        continue;
                    }

                    // Every root reference to the loser moves at once.
                    let mut rewritten = row.clone();
                    let mut key_changed = false;
                    for root_field in &root_fields {
                        if row.holds(&root_field.name, from) {
                            rewritten.set(&root_field.name, to);
                            key_changed |= root_field.is_primary_key;
                        }
                    }

                    if key_changed {
                        let new_key = rewritten.key(entity)?;
                        if tx.find_by_key(entity, &new_key).await?.is_none() {
                            tx.insert(entity, &rewritten).await?;
                            summary.records_copied += 1;
                        } else {
                            debug!("{} already exists, keeping it", new_key);
                            summary.key_collisions += 1;
                        }
                        removals[index].push(original_key);
                    } else {
                        tx.update(entity, &original_key, &rewritten).await?;
                        summary.records_updated += 1;
                    }
                }
            }
        }

        for (index, entity) in order.iter().enumerate().rev() {
            for key in &removals[index] {
                summary.records_removed += tx.delete(entity, key).await? as usize;
            }
        }

        info!(
            "Merged party {} into {}: {} updated, {} copied, {} collisions, {} removed",
            from,
            to,
            summary.records_updated,
            summary.records_copied,
            summary.key_collisions,
            summary.records_removed
        );
        Ok(summary)
    }

    /// [`merge`](Self::merge) bounded by `timeout`.
    pub async fn merge_with_timeout(
        &self,
        tx: &mut dyn StoreTransaction,
        catalog: &SchemaCatalog,
        from: &str,
        to: &str,
        timeout: Duration,
    ) -> Result<MergeSummary> {
        match tokio::time::timeout(timeout, self.merge(tx, catalog, from, to)).await {
            Ok(result) => result,
            Err(_) => Err(MergeError::OperationTimeout {
                message: format!(
                    "merge of {} into {} exceeded {}s",
                    from,
                    to,
                    timeout.as_secs()
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> MergeExecutor {
        MergeExecutor::new(&MergeConfig::default()).unwrap()
    }

    #[test]
    fn test_root_reference_heuristic() {
        let executor = executor();
        let order = EntityTypeDescriptor::new("order_header")
            .with_pk("order_id")
            .with_field("party_id")
            .with_field("bill_from_party_id")
            .with_field("third_party_name");

        let refs: Vec<&str> = order
            .fields
            .iter()
            .filter(|f| executor.references_root(&order, f))
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(refs, vec!["party_id", "bill_from_party_id"]);
    }

    #[test]
    fn test_catalog_classification_overrides_pattern() {
        let executor = executor();
        let mut entity = EntityTypeDescriptor::new("party_note")
            .with_field("party_id")
            .with_field("owner_ref");
        entity.fields[0].references_root = Some(false);
        entity.fields[1].references_root = Some(true);

        assert!(!executor.references_root(&entity, &entity.fields[0]));
        assert!(executor.references_root(&entity, &entity.fields[1]));
    }

    #[test]
    fn test_root_primary_key_always_counts() {
        let config = MergeConfig {
            root_entity: "organization".to_string(),
            root_key_field_pattern: "^org_ref$".to_string(),
            satellite_entities: Vec::new(),
            ..MergeConfig::default()
        };
        let executor = MergeExecutor::new(&config).unwrap();
        let root = EntityTypeDescriptor::new("organization").with_pk("id");
        assert!(executor.references_root(&root, &root.fields[0]));
    }

    #[test]
    fn test_unknown_satellite_is_configuration_error() {
        let config = MergeConfig {
            satellite_entities: vec!["party_role".to_string()],
            ..MergeConfig::default()
        };
        assert!(matches!(
            MergeExecutor::new(&config),
            Err(MergeError::Configuration(_))
        ));
    }
}
