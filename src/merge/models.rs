use super::error::{MergeError, Rejection, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    #[default]
    Table,
    View,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(default)]
    pub is_primary_key: bool,
    /// Whether the field holds a root identity key. `None` means the catalog
    /// could not tell and the configured name pattern decides.
    #[serde(default)]
    pub references_root: Option<bool>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, is_primary_key: bool) -> Self {
        Self {
            name: name.into(),
            is_primary_key,
            references_root: None,
        }
    }
}

/// Pairs a field of the relationship source with the target field holding its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMapping {
    pub field: String,
    pub related_field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
    pub target: String,
    #[serde(default)]
    pub target_kind: EntityKind,
    #[serde(default)]
    pub key_map: Vec<KeyMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTypeDescriptor {
    pub name: String,
    #[serde(default)]
    pub kind: EntityKind,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDescriptor>,
}

impl EntityTypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntityKind::Table,
            fields: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn view(name: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::View,
            ..Self::new(name)
        }
    }

    pub fn with_pk(mut self, name: &str) -> Self {
        self.fields.push(FieldDescriptor::new(name, true));
        self
    }

    pub fn with_field(mut self, name: &str) -> Self {
        self.fields.push(FieldDescriptor::new(name, false));
        self
    }

    /// Adds a relationship whose target holds `pairs` as (source field, target field).
    pub fn with_relationship(mut self, target: &str, kind: EntityKind, pairs: &[(&str, &str)]) -> Self {
        self.relationships.push(RelationshipDescriptor {
            target: target.to_string(),
            target_kind: kind,
            key_map: pairs
                .iter()
                .map(|(field, related)| KeyMapping {
                    field: field.to_string(),
                    related_field: related.to_string(),
                })
                .collect(),
        });
        self
    }

    pub fn is_view(&self) -> bool {
        self.kind == EntityKind::View
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_key_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.is_primary_key)
    }

    pub fn non_key_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| !f.is_primary_key)
    }

    pub fn has_primary_key(&self) -> bool {
        self.fields.iter().any(|f| f.is_primary_key)
    }
}

/// A schema-agnostic row: field name to JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicRecord {
    pub entity: String,
    pub fields: Map<String, Value>,
}

impl DynamicRecord {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            fields: Map::new(),
        }
    }

    pub fn from_value(entity: impl Into<String>, value: Value) -> Result<Self> {
        let entity = entity.into();
        match value {
            Value::Object(fields) => Ok(Self { entity, fields }),
            other => Err(MergeError::InvalidRecord {
                entity,
                message: format!("expected a JSON object, got {other}"),
            }),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn holds(&self, field: &str, key: &str) -> bool {
        self.get_str(field) == Some(key)
    }

    /// The identifying key of this record. Entities without a declared primary
    /// key are identified by every field.
    pub fn key(&self, descriptor: &EntityTypeDescriptor) -> Result<RecordKey> {
        let names: Vec<&str> = if descriptor.has_primary_key() {
            descriptor.primary_key_fields().map(|f| f.name.as_str()).collect()
        } else {
            descriptor.fields.iter().map(|f| f.name.as_str()).collect()
        };

        let mut fields = Vec::with_capacity(names.len());
        for name in names {
            let value = self.fields.get(name).cloned().unwrap_or(Value::Null);
            if value.is_null() && descriptor.field(name).is_some_and(|f| f.is_primary_key) {
                return Err(MergeError::InvalidRecord {
                    entity: descriptor.name.clone(),
                    message: format!("primary key field {name} is null"),
                });
            }
            fields.push((name.to_string(), value));
        }

        Ok(RecordKey {
            entity: descriptor.name.clone(),
            fields,
        })
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordKey {
    pub entity: String,
    pub fields: Vec<(String, Value)>,
}

impl RecordKey {
    pub fn matches(&self, record: &DynamicRecord) -> bool {
        self.fields
            .iter()
            .all(|(name, value)| record.get(name).unwrap_or(&Value::Null) == value)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.iter().cloned().collect())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.entity)?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match value {
                Value::String(s) => write!(f, "{name}={s}")?,
                other => write!(f, "{name}={other}")?,
            }
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct MergeCandidate {
    pub from_party_id: String,
    pub to_party_id: String,
    pub reason: String,
    pub blocked: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MergeCandidate {
    pub fn new(from: &str, to: &str, reason: impl Into<String>) -> Result<Self> {
        if from == to {
            return Err(Rejection::SameKey {
                key: from.to_string(),
            }
            .into());
        }
        Ok(Self {
            from_party_id: from.to_string(),
            to_party_id: to.to_string(),
            reason: reason.into(),
            blocked: false,
            processed_at: None,
            created_at: Utc::now(),
        })
    }

    pub fn block(mut self, reason: impl Into<String>) -> Self {
        self.blocked = true;
        self.reason = reason.into();
        self
    }

    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none() && !self.blocked
    }

    pub fn involves(&self, party_id: &str) -> bool {
        self.from_party_id == party_id || self.to_party_id == party_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateFilter {
    /// Unprocessed and not blocked: what the batch picks up.
    Pending,
    /// Unprocessed, blocked or not.
    Unprocessed,
    Blocked,
    Processed,
    All,
}

impl CandidateFilter {
    pub fn matches(&self, candidate: &MergeCandidate) -> bool {
        match self {
            CandidateFilter::Pending => candidate.is_pending(),
            CandidateFilter::Unprocessed => candidate.processed_at.is_none(),
            CandidateFilter::Blocked => candidate.processed_at.is_none() && candidate.blocked,
            CandidateFilter::Processed => candidate.processed_at.is_some(),
            CandidateFilter::All => true,
        }
    }
}

/// Coarse identity type used by the consistency checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartyType {
    Organization,
    Individual,
    Other(String),
}

impl PartyType {
    pub fn from_type_id(type_id: &str) -> Self {
        match type_id.to_uppercase().as_str() {
            "PARTY_GROUP" | "ORGANIZATION" | "LEGAL_ORGANIZATION" | "INFORMAL_GROUP" => {
                PartyType::Organization
            }
            "PERSON" | "INDIVIDUAL" => PartyType::Individual,
            _ => PartyType::Other(type_id.to_lowercase()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PartyType::Organization => "organization",
            PartyType::Individual => "individual",
            PartyType::Other(other) => other,
        }
    }
}

impl fmt::Display for PartyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyIdentity {
    pub party_id: String,
    pub party_type: PartyType,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PartyPostalAddress {
    pub party_id: String,
    pub contact_mech_id: String,
    pub address1: Option<String>,
    pub postal_code: Option<String>,
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PartyEmailAddress {
    pub party_id: String,
    pub contact_mech_id: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub from_party_id: String,
    pub to_party_id: String,
    pub entities_visited: usize,
    pub satellites_reconciled: usize,
    pub records_updated: usize,
    pub records_copied: usize,
    pub key_collisions: usize,
    pub records_removed: usize,
}
