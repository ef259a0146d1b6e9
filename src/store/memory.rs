//! In-process store used by tests and embedders.
//!
//! A transaction takes the store-wide lock for its whole lifetime and works
//! on a private copy of the state, so transactions are fully serialized and a
//! rollback (or a dropped transaction) leaves no trace. Primary keys and the
//! catalog's foreign keys are checked on every statement, the way a
//! relational store checks immediate constraints.

use super::{
    MergeStore, StoreTransaction, CONTACT_MECH, EMAIL_ADDRESS_TYPE, PARTY_CONTACT_MECH,
    POSTAL_ADDRESS,
};
use crate::merge::catalog::SchemaCatalog;
use crate::merge::error::{MergeError, Result};
use crate::merge::models::{
    CandidateFilter, DynamicRecord, EntityKind, EntityTypeDescriptor, MergeCandidate,
    PartyEmailAddress, PartyPostalAddress, RecordKey,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct StoreState {
    catalog: SchemaCatalog,
    tables: BTreeMap<String, Vec<DynamicRecord>>,
    candidates: BTreeMap<(String, String), MergeCandidate>,
}

#[derive(Debug, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new(catalog: SchemaCatalog) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                catalog,
                ..StoreState::default()
            })),
        }
    }

    /// Replace the catalog, as a schema change would.
    pub async fn set_catalog(&self, catalog: SchemaCatalog) {
        self.state.lock().await.catalog = catalog;
    }

    /// Insert rows through a committed transaction, with constraint checks.
    pub async fn seed(&self, records: impl IntoIterator<Item = DynamicRecord>) -> Result<()> {
        let mut tx = self.begin_local().await;
        for record in records {
            let entity = tx.descriptor(&record.entity)?;
            tx.insert(&entity, &record).await?;
        }
        Box::new(tx).commit().await
    }

    pub async fn records(&self, entity: &str) -> Vec<DynamicRecord> {
        self.state
            .lock()
            .await
            .tables
            .get(entity)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count_where(&self, entity: &str, field: &str, value: &str) -> usize {
        self.state
            .lock()
            .await
            .tables
            .get(entity)
            .map(|rows| rows.iter().filter(|r| r.holds(field, value)).count())
            .unwrap_or(0)
    }

    pub async fn candidates(&self) -> Vec<MergeCandidate> {
        self.state.lock().await.candidates.values().cloned().collect()
    }

    pub async fn candidate(&self, from: &str, to: &str) -> Option<MergeCandidate> {
        self.state
            .lock()
            .await
            .candidates
            .get(&(from.to_string(), to.to_string()))
            .cloned()
    }

    async fn begin_local(&self) -> InMemoryTransaction {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        InMemoryTransaction { guard, working }
    }
}

#[async_trait]
impl MergeStore for InMemoryStore {
    async fn load_catalog(&self) -> Result<SchemaCatalog> {
        Ok(self.state.lock().await.catalog.clone())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(self.begin_local().await))
    }
}

pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<StoreState>,
    working: StoreState,
}

impl InMemoryTransaction {
    fn descriptor(&self, entity: &str) -> Result<EntityTypeDescriptor> {
        self.working
            .catalog
            .get(entity)
            .cloned()
            .ok_or_else(|| MergeError::DataIntegrity {
                message: format!("unknown entity type {entity}"),
            })
    }

    fn rows(&self, entity: &str) -> &[DynamicRecord] {
        self.working
            .tables
            .get(entity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn check_writable(entity: &EntityTypeDescriptor) -> Result<()> {
        if entity.is_view() {
            return Err(MergeError::ConstraintViolation {
                entity: entity.name.clone(),
                message: "views cannot be written".to_string(),
            });
        }
        Ok(())
    }

    /// Every relationship pointing at `record` must find its source row.
    fn check_parents(&self, entity: &EntityTypeDescriptor, record: &DynamicRecord) -> Result<()> {
        for (source, relationship) in self.working.catalog.relationships_into(&entity.name) {
            if relationship.key_map.is_empty() || source.is_view() {
                continue;
            }

            let mut wanted = Vec::with_capacity(relationship.key_map.len());
            for pair in &relationship.key_map {
                match record.get(&pair.related_field) {
                    Some(value) if !value.is_null() => wanted.push((pair.field.as_str(), value)),
                    _ => break,
                }
            }
            if wanted.len() < relationship.key_map.len() {
                continue;
            }

            let found = self.rows(&source.name).iter().any(|parent| {
                wanted
                    .iter()
                    .all(|(field, value)| parent.get(field) == Some(*value))
            });
            if !found {
                return Err(MergeError::ConstraintViolation {
                    entity: entity.name.clone(),
                    message: format!(
                        "row references a missing {} row ({})",
                        source.name,
                        describe(&wanted)
                    ),
                });
            }
        }
        Ok(())
    }

    /// No row of a related entity may still hold the mapped values of `record`.
    fn check_children(&self, entity: &EntityTypeDescriptor, record: &DynamicRecord) -> Result<()> {
        for relationship in &entity.relationships {
            if relationship.key_map.is_empty() || relationship.target_kind == EntityKind::View {
                continue;
            }

            let held: Vec<(&str, &Value)> = relationship
                .key_map
                .iter()
                .map(|pair| {
                    (
                        pair.related_field.as_str(),
                        record.get(&pair.field).unwrap_or(&Value::Null),
                    )
                })
                .collect();
            if held.iter().any(|(_, value)| value.is_null()) {
                continue;
            }

            let orphaned = self.rows(&relationship.target).iter().any(|child| {
                held.iter()
                    .all(|(field, value)| child.get(field) == Some(*value))
            });
            if orphaned {
                return Err(MergeError::ConstraintViolation {
                    entity: entity.name.clone(),
                    message: format!(
                        "{} rows still reference ({})",
                        relationship.target,
                        describe(&held)
                    ),
                });
            }
        }
        Ok(())
    }

    fn position(&self, entity: &str, key: &RecordKey) -> Option<usize> {
        self.rows(entity).iter().position(|row| key.matches(row))
    }
}

fn describe(pairs: &[(&str, &Value)]) -> String {
    pairs
        .iter()
        .map(|(field, value)| match value {
            Value::String(s) => format!("{field}={s}"),
            other => format!("{field}={other}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn find_by_field(
        &mut self,
        entity: &EntityTypeDescriptor,
        field: &str,
        value: &str,
    ) -> Result<Vec<DynamicRecord>> {
        Ok(self
            .rows(&entity.name)
            .iter()
            .filter(|row| row.holds(field, value))
            .cloned()
            .collect())
    }

    async fn find_by_key(
        &mut self,
        entity: &EntityTypeDescriptor,
        key: &RecordKey,
    ) -> Result<Option<DynamicRecord>> {
        Ok(self
            .rows(&entity.name)
            .iter()
            .find(|row| key.matches(row))
            .cloned())
    }

    async fn insert(&mut self, entity: &EntityTypeDescriptor, record: &DynamicRecord) -> Result<()> {
        Self::check_writable(entity)?;

        let mut record = record.clone();
        record.entity = entity.name.clone();

        if entity.has_primary_key() {
            let key = record.key(entity)?;
            if self.position(&entity.name, &key).is_some() {
                return Err(MergeError::ConstraintViolation {
                    entity: entity.name.clone(),
                    message: format!("duplicate key {key}"),
                });
            }
        }
        self.check_parents(entity, &record)?;

        self.working
            .tables
            .entry(entity.name.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn update(
        &mut self,
        entity: &EntityTypeDescriptor,
        key: &RecordKey,
        record: &DynamicRecord,
    ) -> Result<()> {
        Self::check_writable(entity)?;

        // Every matching row, as an UPDATE would on a table without a primary key.
        let indices: Vec<usize> = self
            .rows(&entity.name)
            .iter()
            .enumerate()
            .filter(|(_, row)| key.matches(row))
            .map(|(index, _)| index)
            .collect();
        if indices.is_empty() {
            return Err(MergeError::DataIntegrity {
                message: format!("cannot update missing row {key}"),
            });
        }

        for index in indices {
            let current = self.rows(&entity.name)[index].clone();
            let mut updated = current.clone();
            for field in entity.non_key_fields() {
                let value = record.get(&field.name).cloned().unwrap_or(Value::Null);
                updated.fields.insert(field.name.clone(), value);
            }

            self.check_parents(entity, &updated)?;
            let changed_mapped_field = entity.relationships.iter().any(|rel| {
                rel.key_map
                    .iter()
                    .any(|pair| current.get(&pair.field) != updated.get(&pair.field))
            });
            if changed_mapped_field {
                self.check_children(entity, &current)?;
            }

            if let Some(rows) = self.working.tables.get_mut(&entity.name) {
                rows[index] = updated;
            }
        }
        Ok(())
    }

    async fn delete(&mut self, entity: &EntityTypeDescriptor, key: &RecordKey) -> Result<u64> {
        Self::check_writable(entity)?;

        let doomed: Vec<DynamicRecord> = self
            .rows(&entity.name)
            .iter()
            .filter(|row| key.matches(row))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        // Remove first so self-referencing rows in the same delete do not block it.
        if let Some(rows) = self.working.tables.get_mut(&entity.name) {
            rows.retain(|row| !key.matches(row));
        }
        for row in &doomed {
            self.check_children(entity, row)?;
        }

        debug!("Deleted {} row(s) matching {}", doomed.len(), key);
        Ok(doomed.len() as u64)
    }

    async fn postal_addresses(&mut self) -> Result<Vec<PartyPostalAddress>> {
        let mut addresses = Vec::new();
        for link in self.rows(PARTY_CONTACT_MECH) {
            if link.get("thru_date").is_some_and(|v| !v.is_null()) {
                continue;
            }
            let (Some(party_id), Some(mech_id)) =
                (link.get_str("party_id"), link.get_str("contact_mech_id"))
            else {
                continue;
            };

            for postal in self
                .rows(POSTAL_ADDRESS)
                .iter()
                .filter(|p| p.holds("contact_mech_id", mech_id))
            {
                addresses.push(PartyPostalAddress {
                    party_id: party_id.to_string(),
                    contact_mech_id: mech_id.to_string(),
                    address1: postal.get_str("address1").map(str::to_string),
                    postal_code: postal.get_str("postal_code").map(str::to_string),
                    country_code: postal.get_str("country_geo_id").map(str::to_string),
                });
            }
        }
        Ok(addresses)
    }

    async fn email_addresses(&mut self) -> Result<Vec<PartyEmailAddress>> {
        let mut emails = Vec::new();
        for link in self.rows(PARTY_CONTACT_MECH) {
            if link.get("thru_date").is_some_and(|v| !v.is_null()) {
                continue;
            }
            let (Some(party_id), Some(mech_id)) =
                (link.get_str("party_id"), link.get_str("contact_mech_id"))
            else {
                continue;
            };

            for mech in self.rows(CONTACT_MECH).iter().filter(|m| {
                m.holds("contact_mech_id", mech_id)
                    && m.holds("contact_mech_type_id", EMAIL_ADDRESS_TYPE)
            }) {
                if let Some(email) = mech.get_str("info_string") {
                    emails.push(PartyEmailAddress {
                        party_id: party_id.to_string(),
                        contact_mech_id: mech_id.to_string(),
                        email: email.to_string(),
                    });
                }
            }
        }
        Ok(emails)
    }

    async fn list_candidates(&mut self, filter: CandidateFilter) -> Result<Vec<MergeCandidate>> {
        Ok(self
            .working
            .candidates
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    async fn lock_candidate(&mut self, from: &str, to: &str) -> Result<Option<MergeCandidate>> {
        Ok(self
            .working
            .candidates
            .get(&(from.to_string(), to.to_string()))
            .cloned())
    }

    async fn insert_candidate(&mut self, candidate: &MergeCandidate) -> Result<bool> {
        let key = (
            candidate.from_party_id.clone(),
            candidate.to_party_id.clone(),
        );
        if self.working.candidates.contains_key(&key) {
            return Ok(false);
        }
        self.working.candidates.insert(key, candidate.clone());
        Ok(true)
    }

    async fn mark_candidate_processed(
        &mut self,
        from: &str,
        to: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        match self
            .working
            .candidates
            .get_mut(&(from.to_string(), to.to_string()))
        {
            Some(candidate) if candidate.processed_at.is_none() => {
                candidate.processed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn block_candidate(&mut self, from: &str, to: &str, reason: &str) -> Result<bool> {
        match self
            .working
            .candidates
            .get_mut(&(from.to_string(), to.to_string()))
        {
            Some(candidate) if candidate.processed_at.is_none() => {
                candidate.blocked = true;
                candidate.reason = reason.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
