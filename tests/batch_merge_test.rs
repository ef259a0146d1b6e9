//! Batch auto-merge: per-candidate transactions and failure isolation


use party_merge::config::MergeConfig;
use party_merge::merge::{CandidateFilter, DynamicRecord, MergeCandidate};
use party_merge::{InMemoryStore, MergeStore};
use test_helpers::*;

fn records(groups: Vec<Vec<DynamicRecord>>) -> Vec<DynamicRecord> {
    groups.into_iter().flatten().collect()
}

async fn add_candidate(store: &InMemoryStore, from: &str, to: &str) {
    let mut tx = store.begin().await.unwrap();
    tx.insert_candidate(&MergeCandidate::new(from, to, "test").unwrap())
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

async fn three_duplicates() -> InMemoryStore {
    seeded_store(records(vec![
        person("P1", "Jane", "Doe"),
        person("P2", "Jane", "Doe"),
        person("P3", "Jane", "Doe"),
        email_address("P1", "CM1", "jane@example.com"),
        email_address("P2", "CM2", "jane@example.com"),
        email_address("P3", "CM3", "jane@example.com"),
        vec![role("P2", "CUSTOMER"), order("O3", "P3")],
    ]))
    .await
}

#[tokio::test]
async fn test_batch_merges_pending_candidates() {
    let store = three_duplicates().await;
    let service = service(&store);
    service.find_candidates().await.unwrap();

    let report = service.run_batch().await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.merged, 2);
    assert_eq!(report.skipped, 0);
    assert!(report.failures.is_empty());

    assert_eq!(store.records("party").await.len(), 1);
    assert_eq!(store.count_where("party_role", "party_id", "P1").await, 1);
    assert_eq!(store.count_where("order_header", "party_id", "P1").await, 1);
    assert_eq!(store.count_where("party_contact_mech", "party_id", "P1").await, 3);

    let processed = service
        .list_candidates(CandidateFilter::Processed)
        .await
        .unwrap();
    assert_eq!(processed.len(), 2);
}

#[tokio::test]
async fn test_second_run_finds_nothing_to_do() {
    let store = three_duplicates().await;
    let service = service(&store);
    service.find_candidates().await.unwrap();
    service.run_batch().await.unwrap();

    let report = service.run_batch().await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(report.merged, 0);
}

#[tokio::test]
async fn test_failed_candidate_does_not_stop_the_batch() {
    let store = seeded_store(records(vec![
        person("P1", "Jane", "Doe"),
        person("P2", "Jane", "Doe"),
        person("P5", "Sam", "Roe"),
        person("P6", "Sam", "Roe"),
    ]))
    .await;
    add_candidate(&store, "P2", "P1").await;
    // P4 does not exist.
    add_candidate(&store, "P4", "P5").await;
    add_candidate(&store, "P6", "P5").await;

    let report = service(&store).run_batch().await.unwrap();
    assert_eq!(report.attempted, 3);
    assert_eq!(report.merged, 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.failures[0].from_party_id, "P4");
    assert_eq!(report.failures[0].to_party_id, "P5");
    assert!(report.failures[0].error.contains("P4"));

    let failed = store.candidate("P4", "P5").await.unwrap();
    assert!(failed.processed_at.is_none());
    assert!(store.candidate("P6", "P5").await.unwrap().processed_at.is_some());
    assert_eq!(store.count_where("party", "party_id", "P6").await, 0);
}

#[tokio::test]
async fn test_operator_block_is_honoured() {
    let store = three_duplicates().await;
    let service = service(&store);
    service.find_candidates().await.unwrap();
    service
        .block_candidate("P3", "P1", "needs review")
        .await
        .unwrap();

    let report = service.run_batch().await.unwrap();
    assert_eq!(report.merged, 1);
    assert_eq!(store.count_where("party", "party_id", "P3").await, 1);
    assert!(store.candidate("P3", "P1").await.unwrap().processed_at.is_none());
}

#[tokio::test]
async fn test_batch_limit_caps_attempts() {
    let store = three_duplicates().await;
    let config = MergeConfig {
        batch_limit: Some(1),
        ..MergeConfig::default()
    };
    let service = service_with_config(&store, config);
    service.find_candidates().await.unwrap();

    let report = service.run_batch().await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.merged, 1);
    assert_eq!(
        service
            .list_candidates(CandidateFilter::Pending)
            .await
            .unwrap()
            .len(),
        1
    );
}
