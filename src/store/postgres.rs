//! PostgreSQL store.
//!
//! The catalog comes from `information_schema`. Dynamic records travel as
//! `jsonb`: rows are read with `to_jsonb(t)` and written back through
//! `jsonb_populate_record`, so values keep their column types without the
//! engine knowing them.

use super::{
    MergeStore, StoreTransaction, CONTACT_MECH, EMAIL_ADDRESS_TYPE, PARTY_CONTACT_MECH,
    POSTAL_ADDRESS,
};
use crate::merge::catalog::SchemaCatalog;
use crate::merge::error::{MergeError, Result};
use crate::merge::models::{
    CandidateFilter, DynamicRecord, EntityKind, EntityTypeDescriptor, FieldDescriptor, KeyMapping,
    MergeCandidate, PartyEmailAddress, PartyPostalAddress, RecordKey, RelationshipDescriptor,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const CANDIDATE_TABLE: &str = "party_merge_candidate";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    schema: String,
}

impl PgStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the candidate table if it does not exist.
    pub async fn initialize(&self) -> Result<()> {
        let table = qualified(&self.schema, CANDIDATE_TABLE)?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                from_party_id VARCHAR NOT NULL,
                to_party_id VARCHAR NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                blocked BOOLEAN NOT NULL DEFAULT false,
                processed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (from_party_id, to_party_id),
                CHECK (from_party_id <> to_party_id)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        info!("Merge candidate table ready in schema {}", self.schema);
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ForeignKeyColumn {
    constraint_name: String,
    child_table: String,
    child_column: String,
    parent_table: String,
    parent_column: String,
}

#[async_trait]
impl MergeStore for PgStore {
    async fn load_catalog(&self) -> Result<SchemaCatalog> {
        let tables: Vec<(String, String)> = sqlx::query_as(
            "SELECT table_name::text, table_type::text
             FROM information_schema.tables
             WHERE table_schema = $1",
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await?;

        let mut entities: BTreeMap<String, EntityTypeDescriptor> = tables
            .into_iter()
            .filter(|(name, _)| name != CANDIDATE_TABLE)
            .map(|(name, table_type)| {
                let entity = if table_type == "VIEW" {
                    EntityTypeDescriptor::view(name.clone())
                } else {
                    EntityTypeDescriptor::new(name.clone())
                };
                (name, entity)
            })
            .collect();

        let primary_keys: Vec<(String, String)> = sqlx::query_as(
            "SELECT kcu.table_name::text, kcu.column_name::text
             FROM information_schema.table_constraints tc
             JOIN information_schema.key_column_usage kcu
               ON kcu.constraint_name = tc.constraint_name
              AND kcu.constraint_schema = tc.constraint_schema
             WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = $1",
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await?;

        let columns: Vec<(String, String)> = sqlx::query_as(
            "SELECT table_name::text, column_name::text
             FROM information_schema.columns
             WHERE table_schema = $1
             ORDER BY table_name, ordinal_position",
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await?;

        for (table, column) in columns {
            if let Some(entity) = entities.get_mut(&table) {
                let is_pk = primary_keys
                    .iter()
                    .any(|(t, c)| *t == table && *c == column);
                entity.fields.push(FieldDescriptor::new(column, is_pk));
            }
        }

        let foreign_keys: Vec<ForeignKeyColumn> = sqlx::query_as(
            "SELECT tc.constraint_name::text AS constraint_name,
                    kcu.table_name::text AS child_table,
                    kcu.column_name::text AS child_column,
                    pk.table_name::text AS parent_table,
                    pk.column_name::text AS parent_column
             FROM information_schema.table_constraints tc
             JOIN information_schema.key_column_usage kcu
               ON kcu.constraint_name = tc.constraint_name
              AND kcu.constraint_schema = tc.constraint_schema
             JOIN information_schema.referential_constraints rc
               ON rc.constraint_name = tc.constraint_name
              AND rc.constraint_schema = tc.constraint_schema
             JOIN information_schema.key_column_usage pk
               ON pk.constraint_name = rc.unique_constraint_name
              AND pk.constraint_schema = rc.unique_constraint_schema
              AND pk.ordinal_position = kcu.position_in_unique_constraint
             WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1
             ORDER BY tc.constraint_name, kcu.ordinal_position",
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await?;

        let mut constraints: BTreeMap<String, (String, String, Vec<KeyMapping>)> = BTreeMap::new();
        for fk in foreign_keys {
            let entry = constraints
                .entry(fk.constraint_name)
                .or_insert_with(|| (fk.parent_table.clone(), fk.child_table.clone(), Vec::new()));
            entry.2.push(KeyMapping {
                field: fk.parent_column,
                related_field: fk.child_column,
            });
        }

        for (parent, child, key_map) in constraints.into_values() {
            let target_kind = entities
                .get(&child)
                .map(|e| e.kind)
                .unwrap_or(EntityKind::Table);
            if let Some(entity) = entities.get_mut(&parent) {
                entity.relationships.push(RelationshipDescriptor {
                    target: child,
                    target_kind,
                    key_map,
                });
            }
        }

        let view_usage: Vec<(String, String)> = sqlx::query_as(
            "SELECT view_name::text, table_name::text
             FROM information_schema.view_table_usage
             WHERE view_schema = $1 AND table_schema = $1",
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await?;

        for (view, table) in view_usage {
            if let Some(entity) = entities.get_mut(&table) {
                entity.relationships.push(RelationshipDescriptor {
                    target: view,
                    target_kind: EntityKind::View,
                    key_map: Vec::new(),
                });
            }
        }

        debug!(
            "Read {} entity types from schema {}",
            entities.len(),
            self.schema
        );
        Ok(SchemaCatalog::from_entities(entities.into_values()))
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTransaction {
            tx,
            schema: self.schema.clone(),
        }))
    }
}

pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
    schema: String,
}

/// Quote an identifier after checking it is a plain SQL name.
fn ident(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(MergeError::DataIntegrity {
            message: format!("refusing to use {name:?} as an SQL identifier"),
        });
    }
    Ok(format!("\"{name}\""))
}

fn qualified(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", ident(schema)?, ident(table)?))
}

/// `t.a IS NOT DISTINCT FROM k.a AND ...` over the key's fields.
fn key_condition(key: &RecordKey) -> Result<String> {
    let mut parts = Vec::with_capacity(key.fields.len());
    for (name, _) in &key.fields {
        let column = ident(name)?;
        parts.push(format!("t.{column} IS NOT DISTINCT FROM k.{column}"));
    }
    if parts.is_empty() {
        return Err(MergeError::InvalidRecord {
            entity: key.entity.clone(),
            message: "empty record key".to_string(),
        });
    }
    Ok(parts.join(" AND "))
}

fn map_write_error(entity: &str, err: sqlx::Error) -> MergeError {
    if let sqlx::Error::Database(db) = &err {
        // Class 23: integrity constraint violation
        if db.code().is_some_and(|code| code.starts_with("23")) {
            return MergeError::ConstraintViolation {
                entity: entity.to_string(),
                message: db.message().to_string(),
            };
        }
    }
    MergeError::Database(err)
}

fn candidate_condition(filter: CandidateFilter) -> &'static str {
    match filter {
        CandidateFilter::Pending => "processed_at IS NULL AND NOT blocked",
        CandidateFilter::Unprocessed => "processed_at IS NULL",
        CandidateFilter::Blocked => "processed_at IS NULL AND blocked",
        CandidateFilter::Processed => "processed_at IS NOT NULL",
        CandidateFilter::All => "TRUE",
    }
}

const CANDIDATE_COLUMNS: &str =
    "from_party_id, to_party_id, reason, blocked, processed_at, created_at";

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn find_by_field(
        &mut self,
        entity: &EntityTypeDescriptor,
        field: &str,
        value: &str,
    ) -> Result<Vec<DynamicRecord>> {
        let table = qualified(&self.schema, &entity.name)?;
        let column = ident(field)?;
        let rows: Vec<serde_json::Value> = sqlx::query_scalar(&format!(
            "SELECT to_jsonb(t) FROM {table} t WHERE t.{column}::text = $1 FOR UPDATE OF t"
        ))
        .bind(value)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter()
            .map(|row| DynamicRecord::from_value(entity.name.clone(), row))
            .collect()
    }

    async fn find_by_key(
        &mut self,
        entity: &EntityTypeDescriptor,
        key: &RecordKey,
    ) -> Result<Option<DynamicRecord>> {
        let table = qualified(&self.schema, &entity.name)?;
        let condition = key_condition(key)?;
        let row: Option<serde_json::Value> = sqlx::query_scalar(&format!(
            "SELECT to_jsonb(t) FROM {table} t, jsonb_populate_record(NULL::{table}, $1) k
             WHERE {condition} FOR UPDATE OF t"
        ))
        .bind(key.to_value())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(|value| DynamicRecord::from_value(entity.name.clone(), value))
            .transpose()
    }

    async fn insert(&mut self, entity: &EntityTypeDescriptor, record: &DynamicRecord) -> Result<()> {
        let table = qualified(&self.schema, &entity.name)?;
        sqlx::query(&format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, $1)"
        ))
        .bind(record.clone().into_value())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_write_error(&entity.name, e))?;
        Ok(())
    }

    async fn update(
        &mut self,
        entity: &EntityTypeDescriptor,
        key: &RecordKey,
        record: &DynamicRecord,
    ) -> Result<()> {
        let table = qualified(&self.schema, &entity.name)?;
        let condition = key_condition(key)?;

        let mut assignments = Vec::new();
        for field in entity.non_key_fields() {
            let column = ident(&field.name)?;
            assignments.push(format!("{column} = r.{column}"));
        }
        if assignments.is_empty() {
            return Ok(());
        }

        let result = sqlx::query(&format!(
            "UPDATE {table} t SET {}
             FROM jsonb_populate_record(NULL::{table}, $1) k,
                  jsonb_populate_record(NULL::{table}, $2) r
             WHERE {condition}",
            assignments.join(", ")
        ))
        .bind(key.to_value())
        .bind(record.clone().into_value())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_write_error(&entity.name, e))?;

        if result.rows_affected() == 0 {
            return Err(MergeError::DataIntegrity {
                message: format!("cannot update missing row {key}"),
            });
        }
        Ok(())
    }

    async fn delete(&mut self, entity: &EntityTypeDescriptor, key: &RecordKey) -> Result<u64> {
        let table = qualified(&self.schema, &entity.name)?;
        let condition = key_condition(key)?;
        let result = sqlx::query(&format!(
            "DELETE FROM {table} t USING jsonb_populate_record(NULL::{table}, $1) k
             WHERE {condition}"
        ))
        .bind(key.to_value())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_write_error(&entity.name, e))?;
        Ok(result.rows_affected())
    }

    async fn postal_addresses(&mut self) -> Result<Vec<PartyPostalAddress>> {
        let links = qualified(&self.schema, PARTY_CONTACT_MECH)?;
        let postal = qualified(&self.schema, POSTAL_ADDRESS)?;
        let rows = sqlx::query_as::<_, PartyPostalAddress>(&format!(
            "SELECT pcm.party_id::text AS party_id,
                    pcm.contact_mech_id::text AS contact_mech_id,
                    pa.address1::text AS address1,
                    pa.postal_code::text AS postal_code,
                    pa.country_geo_id::text AS country_code
             FROM {links} pcm
             JOIN {postal} pa ON pa.contact_mech_id = pcm.contact_mech_id
             WHERE pcm.thru_date IS NULL"
        ))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn email_addresses(&mut self) -> Result<Vec<PartyEmailAddress>> {
        let links = qualified(&self.schema, PARTY_CONTACT_MECH)?;
        let mechs = qualified(&self.schema, CONTACT_MECH)?;
        let rows = sqlx::query_as::<_, PartyEmailAddress>(&format!(
            "SELECT pcm.party_id::text AS party_id,
                    pcm.contact_mech_id::text AS contact_mech_id,
                    cm.info_string::text AS email
             FROM {links} pcm
             JOIN {mechs} cm ON cm.contact_mech_id = pcm.contact_mech_id
             WHERE pcm.thru_date IS NULL
               AND cm.contact_mech_type_id = $1
               AND cm.info_string IS NOT NULL"
        ))
        .bind(EMAIL_ADDRESS_TYPE)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn list_candidates(&mut self, filter: CandidateFilter) -> Result<Vec<MergeCandidate>> {
        let table = qualified(&self.schema, CANDIDATE_TABLE)?;
        let rows = sqlx::query_as::<_, MergeCandidate>(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM {table}
             WHERE {}
             ORDER BY from_party_id, to_party_id",
            candidate_condition(filter)
        ))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn lock_candidate(&mut self, from: &str, to: &str) -> Result<Option<MergeCandidate>> {
        let table = qualified(&self.schema, CANDIDATE_TABLE)?;
        let row = sqlx::query_as::<_, MergeCandidate>(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM {table}
             WHERE from_party_id = $1 AND to_party_id = $2
             FOR UPDATE"
        ))
        .bind(from)
        .bind(to)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn insert_candidate(&mut self, candidate: &MergeCandidate) -> Result<bool> {
        let table = qualified(&self.schema, CANDIDATE_TABLE)?;
        let result = sqlx::query(&format!(
            "INSERT INTO {table} ({CANDIDATE_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (from_party_id, to_party_id) DO NOTHING"
        ))
        .bind(&candidate.from_party_id)
        .bind(&candidate.to_party_id)
        .bind(&candidate.reason)
        .bind(candidate.blocked)
        .bind(candidate.processed_at)
        .bind(candidate.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_write_error(CANDIDATE_TABLE, e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_candidate_processed(
        &mut self,
        from: &str,
        to: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let table = qualified(&self.schema, CANDIDATE_TABLE)?;
        let result = sqlx::query(&format!(
            "UPDATE {table} SET processed_at = $3
             WHERE from_party_id = $1 AND to_party_id = $2 AND processed_at IS NULL"
        ))
        .bind(from)
        .bind(to)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn block_candidate(&mut self, from: &str, to: &str, reason: &str) -> Result<bool> {
        let table = qualified(&self.schema, CANDIDATE_TABLE)?;
        let result = sqlx::query(&format!(
            "UPDATE {table} SET blocked = true, reason = $3
             WHERE from_party_id = $1 AND to_party_id = $2 AND processed_at IS NULL"
        ))
        .bind(from)
        .bind(to)
        .bind(reason)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
