//! Typed 1:1 satellites of the party record.
//!
//! Satellites are reconciled field by field before any key is rewritten: the
//! survivor keeps every value it has and picks up the ones only the loser
//! carries.

use super::catalog::SchemaCatalog;
use super::error::{MergeError, Result};
use super::models::{DynamicRecord, EntityTypeDescriptor, PartyIdentity, PartyType};
use crate::store::StoreTransaction;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SatelliteKind {
    PartySupplementalData,
    Party,
    PartyGroup,
    Person,
}

impl SatelliteKind {
    pub const ALL: [SatelliteKind; 4] = [
        SatelliteKind::PartySupplementalData,
        SatelliteKind::Party,
        SatelliteKind::PartyGroup,
        SatelliteKind::Person,
    ];

    pub fn entity_name(&self) -> &'static str {
        match self {
            SatelliteKind::PartySupplementalData => "party_supplemental_data",
            SatelliteKind::Party => "party",
            SatelliteKind::PartyGroup => "party_group",
            SatelliteKind::Person => "person",
        }
    }

    pub fn from_entity_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.entity_name() == name)
    }
}

/// A typed satellite row. `overlay` copies every value `other` has onto `self`.
pub trait SatelliteRecord: Serialize + DeserializeOwned + Clone + Send {
    fn overlay(&mut self, other: &Self);
}

macro_rules! satellite_record {
    ($(#[$meta:meta])* $name:ident { $($field:ident: $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            #[serde(default)]
            pub party_id: String,
            $(pub $field: Option<$ty>,)*
        }

        impl SatelliteRecord for $name {
            fn overlay(&mut self, other: &Self) {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field.clone();
                    }
                )*
            }
        }
    };
}

satellite_record!(
    /// The core identity row.
    Party {
        party_type_id: String,
        external_id: String,
        preferred_currency_uom_id: String,
        description: String,
        status_id: String,
    }
);

satellite_record!(
    Person {
        salutation: String,
        first_name: String,
        middle_name: String,
        last_name: String,
        personal_title: String,
        suffix: String,
        nickname: String,
        gender: String,
        birth_date: String,
        marital_status: String,
        occupation: String,
        comments: String,
    }
);

satellite_record!(
    PartyGroup {
        group_name: String,
        group_name_local: String,
        office_site_name: String,
        annual_revenue: f64,
        num_employees: i64,
        ticker_symbol: String,
        comments: String,
    }
);

satellite_record!(
    /// CRM profile data kept alongside the party.
    PartySupplementalData {
        parent_party_id: String,
        company_name: String,
        annual_revenue: f64,
        currency_uom_id: String,
        number_employees: i64,
        industry_enum_id: String,
        ownership_enum_id: String,
        important_note: String,
        primary_postal_address_id: String,
        primary_telecom_number_id: String,
        primary_email_id: String,
    }
);

/// Copy the survivor onto the loser, then the combined loser back onto the
/// survivor. Survivor values win; gaps are filled from the loser.
pub fn reconcile<T: SatelliteRecord>(survivor: &T, loser: &T) -> T {
    let mut combined = loser.clone();
    combined.overlay(survivor);
    let mut result = survivor.clone();
    result.overlay(&combined);
    result
}

/// The single key field of a party-keyed entity.
pub fn party_key_field(entity: &EntityTypeDescriptor) -> Result<&str> {
    let mut keys = entity.primary_key_fields();
    match (keys.next(), keys.next()) {
        (Some(field), None) => Ok(field.name.as_str()),
        _ => Err(MergeError::Configuration(format!(
            "{} must have a single primary key field to be keyed by party",
            entity.name
        ))),
    }
}

async fn find_by_party(
    tx: &mut dyn StoreTransaction,
    entity: &EntityTypeDescriptor,
    party_id: &str,
) -> Result<Option<DynamicRecord>> {
    let field = party_key_field(entity)?;
    Ok(tx.find_by_field(entity, field, party_id).await?.into_iter().next())
}

async fn reconcile_typed<T: SatelliteRecord>(
    tx: &mut dyn StoreTransaction,
    entity: &EntityTypeDescriptor,
    from: &str,
    to: &str,
) -> Result<bool> {
    let (Some(loser_row), Some(survivor_row)) = (
        find_by_party(tx, entity, from).await?,
        find_by_party(tx, entity, to).await?,
    ) else {
        return Ok(false);
    };

    let loser: T = serde_json::from_value(loser_row.clone().into_value())?;
    let survivor: T = serde_json::from_value(survivor_row.clone().into_value())?;
    let merged = reconcile(&survivor, &loser);

    let key = survivor_row.key(entity)?;
    let mut updated = survivor_row;
    if let Value::Object(values) = serde_json::to_value(&merged)? {
        for (name, value) in values {
            let is_data_field = entity.field(&name).is_some_and(|f| !f.is_primary_key);
            if is_data_field && !value.is_null() {
                updated.set(&name, value);
            }
        }
    }

    // Columns the typed record does not model: survivor wins, loser fills gaps.
    for field in entity.non_key_fields() {
        let survivor_empty = updated.get(&field.name).map_or(true, Value::is_null);
        match loser_row.get(&field.name) {
            Some(value) if survivor_empty && !value.is_null() => {
                updated.set(&field.name, value.clone())
            }
            _ => {}
        }
    }

    tx.update(entity, &key, &updated).await?;
    Ok(true)
}

/// Reconcile every configured satellite for which both parties have a row.
/// Returns how many satellites were rewritten on the survivor.
pub async fn reconcile_satellites(
    tx: &mut dyn StoreTransaction,
    catalog: &SchemaCatalog,
    kinds: &[SatelliteKind],
    from: &str,
    to: &str,
) -> Result<usize> {
    let mut reconciled = 0;
    for kind in kinds {
        let entity = catalog.get(kind.entity_name()).ok_or_else(|| {
            MergeError::Configuration(format!(
                "satellite entity type {} is not present in the schema catalog",
                kind.entity_name()
            ))
        })?;

        let changed = match kind {
            SatelliteKind::Party => reconcile_typed::<Party>(tx, entity, from, to).await?,
            SatelliteKind::Person => reconcile_typed::<Person>(tx, entity, from, to).await?,
            SatelliteKind::PartyGroup => {
                reconcile_typed::<PartyGroup>(tx, entity, from, to).await?
            }
            SatelliteKind::PartySupplementalData => {
                reconcile_typed::<PartySupplementalData>(tx, entity, from, to).await?
            }
        };

        if changed {
            debug!("Reconciled {} of {} into {}", kind.entity_name(), from, to);
            reconciled += 1;
        }
    }
    Ok(reconciled)
}

/// Coarse type and display name of a party, or `None` when the party row is absent.
pub async fn load_identity(
    tx: &mut dyn StoreTransaction,
    catalog: &SchemaCatalog,
    root: &str,
    party_id: &str,
) -> Result<Option<PartyIdentity>> {
    let root_entity = catalog
        .get(root)
        .ok_or_else(|| MergeError::Configuration(format!("unknown root entity type: {root}")))?;

    let Some(row) = find_by_party(tx, root_entity, party_id).await? else {
        return Ok(None);
    };
    let party: Party = serde_json::from_value(row.into_value())?;
    let party_type = party
        .party_type_id
        .as_deref()
        .map(PartyType::from_type_id)
        .unwrap_or_else(|| PartyType::Other("unknown".to_string()));

    let mut display_name = None;
    if let Some(entity) = catalog.get(SatelliteKind::PartyGroup.entity_name()) {
        if let Some(row) = find_by_party(tx, entity, party_id).await? {
            let group: PartyGroup = serde_json::from_value(row.into_value())?;
            display_name = group.group_name;
        }
    }
    if display_name.is_none() {
        if let Some(entity) = catalog.get(SatelliteKind::Person.entity_name()) {
            if let Some(row) = find_by_party(tx, entity, party_id).await? {
                let person: Person = serde_json::from_value(row.into_value())?;
                let name = [person.first_name, person.last_name]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                if !name.trim().is_empty() {
                    display_name = Some(name);
                }
            }
        }
    }

    Ok(Some(PartyIdentity {
        party_id: party_id.to_string(),
        party_type,
        display_name,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in SatelliteKind::ALL {
            assert_eq!(SatelliteKind::from_entity_name(kind.entity_name()), Some(kind));
        }
        assert_eq!(SatelliteKind::from_entity_name("party_role"), None);
    }

    #[test]
    fn test_reconcile_keeps_survivor_values_and_fills_gaps() {
        let survivor = Person {
            party_id: "P1".to_string(),
            first_name: Some("Jane".to_string()),
            last_name: Some("Doe".to_string()),
            ..Person::default()
        };
        let loser = Person {
            party_id: "P2".to_string(),
            first_name: Some("Janet".to_string()),
            nickname: Some("JD".to_string()),
            ..Person::default()
        };

        let merged = reconcile(&survivor, &loser);
        assert_eq!(merged.party_id, "P1");
        assert_eq!(merged.first_name.as_deref(), Some("Jane"));
        assert_eq!(merged.last_name.as_deref(), Some("Doe"));
        assert_eq!(merged.nickname.as_deref(), Some("JD"));
    }

    #[test]
    fn test_typed_record_ignores_untyped_columns() {
        let group: PartyGroup = serde_json::from_value(serde_json::json!({
            "party_id": "P1",
            "group_name": "Acme",
            "annual_revenue": 1250000.5,
            "last_updated_stamp": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(group.group_name.as_deref(), Some("Acme"));
        assert_eq!(group.annual_revenue, Some(1250000.5));
        assert_eq!(group.num_employees, None);
    }

    #[test]
    fn test_party_key_field_requires_single_key() {
        let entity = EntityTypeDescriptor::new("party_role")
            .with_pk("party_id")
            .with_pk("role_type_id");
        assert!(party_key_field(&entity).is_err());

        let entity = EntityTypeDescriptor::new("person").with_pk("party_id");
        assert_eq!(party_key_field(&entity).unwrap(), "party_id");
    }
}
