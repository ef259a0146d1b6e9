//! Merges that overrun their time budget leave no trace


use async_trait::async_trait;
use chrono::{DateTime, Utc};
use party_merge::config::MergeConfig;
use party_merge::merge::{
    CandidateFilter, DynamicRecord, EntityTypeDescriptor, MergeCandidate, MergeError,
    PartyEmailAddress, PartyPostalAddress, RecordKey, Result,
};
use party_merge::{
    InMemoryStore, MergeService, MergeStore, RoleAuthorizer, SchemaCatalog, StoreTransaction,
};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

/// Deletes stall, so a merge times out after its forward pass has written.
struct StallingStore {
    inner: InMemoryStore,
    stall: Duration,
}

struct StallingTransaction {
    inner: Box<dyn StoreTransaction>,
    stall: Duration,
}

#[async_trait]
impl MergeStore for StallingStore {
    async fn load_catalog(&self) -> Result<SchemaCatalog> {
        self.inner.load_catalog().await
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(StallingTransaction {
            inner: self.inner.begin().await?,
            stall: self.stall,
        }))
    }
}

#[async_trait]
impl StoreTransaction for StallingTransaction {
    async fn find_by_field(
        &mut self,
        entity: &EntityTypeDescriptor,
        field: &str,
        value: &str,
    ) -> Result<Vec<DynamicRecord>> {
        self.inner.find_by_field(entity, field, value).await
    }

    async fn find_by_key(
        &mut self,
        entity: &EntityTypeDescriptor,
        key: &RecordKey,
    ) -> Result<Option<DynamicRecord>> {
        self.inner.find_by_key(entity, key).await
    }

    async fn insert(&mut self, entity: &EntityTypeDescriptor, record: &DynamicRecord) -> Result<()> {
        self.inner.insert(entity, record).await
    }

    async fn update(
        &mut self,
        entity: &EntityTypeDescriptor,
        key: &RecordKey,
        record: &DynamicRecord,
    ) -> Result<()> {
        self.inner.update(entity, key, record).await
    }

    async fn delete(&mut self, entity: &EntityTypeDescriptor, key: &RecordKey) -> Result<u64> {
        tokio::time::sleep(self.stall).await;
        self.inner.delete(entity, key).await
    }

    async fn postal_addresses(&mut self) -> Result<Vec<PartyPostalAddress>> {
        self.inner.postal_addresses().await
    }

    async fn email_addresses(&mut self) -> Result<Vec<PartyEmailAddress>> {
        self.inner.email_addresses().await
    }

    async fn list_candidates(&mut self, filter: CandidateFilter) -> Result<Vec<MergeCandidate>> {
        self.inner.list_candidates(filter).await
    }

    async fn lock_candidate(&mut self, from: &str, to: &str) -> Result<Option<MergeCandidate>> {
        self.inner.lock_candidate(from, to).await
    }

    async fn insert_candidate(&mut self, candidate: &MergeCandidate) -> Result<bool> {
        self.inner.insert_candidate(candidate).await
    }

    async fn mark_candidate_processed(
        &mut self,
        from: &str,
        to: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.mark_candidate_processed(from, to, at).await
    }

    async fn block_candidate(&mut self, from: &str, to: &str, reason: &str) -> Result<bool> {
        self.inner.block_candidate(from, to, reason).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback().await
    }
}

async fn stalled_setup() -> (InMemoryStore, MergeService) {
    let store = seeded_store(
        [
            person("P1", "Jane", "Doe"),
            person("P2", "Jane", "Doe"),
            vec![role("P1", "CUSTOMER"), order("O1", "P1")],
        ]
        .into_iter()
        .flatten()
        .collect(),
    )
    .await;

    let mut tx = store.begin().await.unwrap();
    tx.insert_candidate(&MergeCandidate::new("P1", "P2", "test").unwrap())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let stalling = StallingStore {
        inner: store.clone(),
        stall: Duration::from_secs(5),
    };
    let config = MergeConfig {
        merge_timeout_seconds: 1,
        ..MergeConfig::default()
    };
    let service = MergeService::new(
        Arc::new(stalling),
        config,
        Arc::new(RoleAuthorizer::new(&authorization())),
    )
    .unwrap();
    (store, service)
}

async fn assert_untouched(store: &InMemoryStore) {
    assert_eq!(store.count_where("party", "party_id", "P1").await, 1);
    assert_eq!(store.count_where("order_header", "party_id", "P1").await, 1);
    assert_eq!(store.count_where("party_role", "party_id", "P1").await, 1);
    assert_eq!(store.count_where("party_role", "party_id", "P2").await, 0);
    assert!(store.candidate("P1", "P2").await.unwrap().processed_at.is_none());
}

#[tokio::test]
async fn test_timed_out_merge_is_rolled_back() {
    let (store, service) = stalled_setup().await;

    let err = service.merge("P1", "P2", ADMIN, false).await.unwrap_err();
    assert!(matches!(err, MergeError::OperationTimeout { .. }));
    assert_untouched(&store).await;
}

#[tokio::test]
async fn test_timed_out_batch_item_is_reported_and_rolled_back() {
    let (store, service) = stalled_setup().await;

    let report = service.run_batch().await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.merged, 0);
    assert_eq!(report.failed(), 1);
    assert!(report.failures[0].error.contains("exceeded"));
    assert_untouched(&store).await;
}
