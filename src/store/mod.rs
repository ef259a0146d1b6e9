//! Transactional record store seam.
//!
//! The merge engine never talks to a database directly; it opens a
//! [`StoreTransaction`] from a [`MergeStore`] and drives every read and write
//! of a merge through it, so commit and rollback are the only atomicity
//! boundary.

pub mod connection;
pub mod memory;
pub mod postgres;

use crate::merge::catalog::SchemaCatalog;
use crate::merge::error::Result;
use crate::merge::models::{
    CandidateFilter, DynamicRecord, EntityTypeDescriptor, MergeCandidate, PartyEmailAddress,
    PartyPostalAddress, RecordKey,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Links parties to contact mechanisms.
pub const PARTY_CONTACT_MECH: &str = "party_contact_mech";
/// Postal details keyed by contact mechanism.
pub const POSTAL_ADDRESS: &str = "postal_address";
/// Contact mechanisms; emails live in `info_string`.
pub const CONTACT_MECH: &str = "contact_mech";
pub const EMAIL_ADDRESS_TYPE: &str = "EMAIL_ADDRESS";

#[async_trait]
pub trait MergeStore: Send + Sync {
    /// Snapshot of entity, field and relationship metadata.
    async fn load_catalog(&self) -> Result<SchemaCatalog>;

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    async fn find_by_field(
        &mut self,
        entity: &EntityTypeDescriptor,
        field: &str,
        value: &str,
    ) -> Result<Vec<DynamicRecord>>;

    async fn find_by_key(
        &mut self,
        entity: &EntityTypeDescriptor,
        key: &RecordKey,
    ) -> Result<Option<DynamicRecord>>;

    async fn insert(&mut self, entity: &EntityTypeDescriptor, record: &DynamicRecord) -> Result<()>;

    /// Overwrite the non-key fields of the row identified by `key`.
    async fn update(
        &mut self,
        entity: &EntityTypeDescriptor,
        key: &RecordKey,
        record: &DynamicRecord,
    ) -> Result<()>;

    /// Returns the number of rows removed.
    async fn delete(&mut self, entity: &EntityTypeDescriptor, key: &RecordKey) -> Result<u64>;

    /// Active postal addresses with their owning party.
    async fn postal_addresses(&mut self) -> Result<Vec<PartyPostalAddress>>;

    /// Active email addresses with their owning party.
    async fn email_addresses(&mut self) -> Result<Vec<PartyEmailAddress>>;

    async fn list_candidates(&mut self, filter: CandidateFilter) -> Result<Vec<MergeCandidate>>;

    /// Re-read a candidate, holding its row until the transaction ends.
    async fn lock_candidate(&mut self, from: &str, to: &str) -> Result<Option<MergeCandidate>>;

    /// Returns false when a candidate with the same (from, to) already exists.
    async fn insert_candidate(&mut self, candidate: &MergeCandidate) -> Result<bool>;

    async fn mark_candidate_processed(
        &mut self,
        from: &str,
        to: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn block_candidate(&mut self, from: &str, to: &str, reason: &str) -> Result<bool>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
