//! Duplicate candidate detection over postal addresses and emails


use party_merge::merge::{CandidateFilter, DynamicRecord};
use test_helpers::*;

fn records(groups: Vec<Vec<DynamicRecord>>) -> Vec<DynamicRecord> {
    groups.into_iter().flatten().collect()
}

#[tokio::test]
async fn test_street_variants_become_one_candidate() {
    let store = seeded_store(records(vec![
        person("P1", "Jane", "Doe"),
        person("P2", "Jane", "Doe"),
        postal_address("P1", "CM1", "123 Main St", "94107", "US"),
        postal_address("P2", "CM2", "123 MAIN STREET", "94107", "US"),
    ]))
    .await;
    let service = service(&store);

    let report = service.find_candidates().await.unwrap();
    assert_eq!(report.addresses_scanned, 2);
    assert_eq!(report.groups_found, 1);
    assert_eq!(report.candidates_created, 1);
    assert_eq!(report.candidates_blocked, 0);

    let candidate = store.candidate("P2", "P1").await.expect("P1 survives as lowest key");
    assert!(!candidate.blocked);
    assert!(candidate.processed_at.is_none());
    assert_eq!(candidate.reason, "Matching postal address: US94107123MAINST");
}

#[tokio::test]
async fn test_type_mismatch_is_recorded_blocked_and_skipped_by_batch() {
    let store = seeded_store(records(vec![
        organization("P1", "Jordan Lee"),
        person("P2", "Jordan", "Lee"),
        email_address("P1", "CM1", "jordan@example.com"),
        email_address("P2", "CM2", " JORDAN@example.com"),
    ]))
    .await;
    let service = service(&store);

    let report = service.find_candidates().await.unwrap();
    assert_eq!(report.candidates_created, 1);
    assert_eq!(report.candidates_blocked, 1);

    let candidate = store.candidate("P2", "P1").await.unwrap();
    assert!(candidate.blocked);
    assert!(candidate.reason.starts_with("Matching email address: JORDAN@EXAMPLE.COM"));
    assert!(candidate.reason.contains("party type mismatch"));

    let batch = service.run_batch().await.unwrap();
    assert_eq!(batch.attempted, 0);
    assert_eq!(batch.merged, 0);
    assert_eq!(store.count_where("party", "party_id", "P2").await, 1);
    assert!(store.candidate("P2", "P1").await.unwrap().processed_at.is_none());
}

#[tokio::test]
async fn test_name_mismatch_blocks_candidate() {
    let store = seeded_store(records(vec![
        organization("P1", "Acme Inc."),
        organization("P2", "Apex Holdings"),
        email_address("P1", "CM1", "billing@example.com"),
        email_address("P2", "CM2", "billing@example.com"),
    ]))
    .await;

    service(&store).find_candidates().await.unwrap();

    let candidate = store.candidate("P2", "P1").await.unwrap();
    assert!(candidate.blocked);
    assert!(candidate.reason.contains("name mismatch"));
}

#[tokio::test]
async fn test_punctuation_does_not_block() {
    let store = seeded_store(records(vec![
        organization("P1", "Acme, Inc."),
        organization("P2", "ACME INC"),
        email_address("P1", "CM1", "billing@acme.example"),
        email_address("P2", "CM2", "Billing@Acme.example"),
    ]))
    .await;

    service(&store).find_candidates().await.unwrap();
    assert!(!store.candidate("P2", "P1").await.unwrap().blocked);
}

#[tokio::test]
async fn test_detection_is_idempotent() {
    let store = seeded_store(records(vec![
        person("P1", "Jane", "Doe"),
        person("P2", "Jane", "Doe"),
        person("P3", "Jane", "Doe"),
        postal_address("P1", "CM1", "9 Elm Road", "10001", "US"),
        postal_address("P2", "CM2", "9 ELM RD", "10001", "US"),
        email_address("P3", "CM3", "jane@example.com"),
        email_address("P2", "CM4", "jane@example.com"),
    ]))
    .await;
    let service = service(&store);

    let first = service.find_candidates().await.unwrap();
    let after_first = store.candidates().await;
    assert_eq!(first.candidates_created, after_first.len());

    let second = service.find_candidates().await.unwrap();
    assert_eq!(second.candidates_created, 0);
    assert_eq!(second.groups_found, 0);
    assert_eq!(store.candidates().await, after_first);
}

#[tokio::test]
async fn test_party_is_proposed_as_loser_once_across_passes() {
    let store = seeded_store(records(vec![
        person("P1", "Jane", "Doe"),
        person("P2", "Jane", "Doe"),
        person("P3", "Jane", "Doe"),
        postal_address("P1", "CM1", "9 Elm Road", "10001", "US"),
        postal_address("P2", "CM2", "9 Elm Road", "10001", "US"),
        // P2 also shares an email with P3; P2 is already taken by the address pass.
        email_address("P2", "CM3", "jane@example.com"),
        email_address("P3", "CM4", "jane@example.com"),
    ]))
    .await;

    let report = service(&store).find_candidates().await.unwrap();
    assert_eq!(report.candidates_created, 1);

    let candidates = store.candidates().await;
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].from_party_id, "P2");
    assert_eq!(candidates[0].to_party_id, "P1");
}

#[tokio::test]
async fn test_group_survivor_is_lowest_key() {
    let store = seeded_store(records(vec![
        person("P3", "Jane", "Doe"),
        person("P1", "Jane", "Doe"),
        person("P2", "Jane", "Doe"),
        email_address("P3", "CM3", "jane@example.com"),
        email_address("P1", "CM1", "jane@example.com"),
        email_address("P2", "CM2", "jane@example.com"),
    ]))
    .await;

    let report = service(&store).find_candidates().await.unwrap();
    assert_eq!(report.groups_found, 1);
    assert_eq!(report.candidates_created, 2);
    assert!(store.candidate("P2", "P1").await.is_some());
    assert!(store.candidate("P3", "P1").await.is_some());
}

#[tokio::test]
async fn test_open_candidates_exclude_their_parties() {
    let store = seeded_store(records(vec![
        person("P1", "Jane", "Doe"),
        person("P2", "Jane", "Doe"),
        person("P3", "Jane", "Doe"),
        email_address("P1", "CM1", "jane@example.com"),
        email_address("P2", "CM2", "jane@example.com"),
    ]))
    .await;
    let service = service(&store);
    service.find_candidates().await.unwrap();

    // A new duplicate of P1 appears while P2 -> P1 is still open.
    store
        .seed(email_address("P3", "CM3", "JANE@example.com"))
        .await
        .unwrap();
    let report = service.find_candidates().await.unwrap();
    assert_eq!(report.candidates_created, 0);

    // Once the open candidate is merged, P3 is picked up.
    service.run_batch().await.unwrap();
    let report = service.find_candidates().await.unwrap();
    assert_eq!(report.candidates_created, 1);
    assert!(store.candidate("P3", "P1").await.is_some());
}

#[tokio::test]
async fn test_ended_contact_mechs_are_ignored() {
    let mut ended = email_address("P2", "CM2", "jane@example.com");
    ended[1].set("thru_date", "2024-06-01T00:00:00Z");

    let store = seeded_store(records(vec![
        person("P1", "Jane", "Doe"),
        person("P2", "Jane", "Doe"),
        email_address("P1", "CM1", "jane@example.com"),
        ended,
    ]))
    .await;

    let report = service(&store).find_candidates().await.unwrap();
    assert_eq!(report.emails_scanned, 1);
    assert_eq!(report.candidates_created, 0);
}

#[tokio::test]
async fn test_candidate_listing_filters() {
    let store = seeded_store(records(vec![
        person("P1", "Jane", "Doe"),
        person("P2", "Jane", "Doe"),
        person("P3", "Jane", "Doe"),
        email_address("P1", "CM1", "jane@example.com"),
        email_address("P2", "CM2", "jane@example.com"),
        email_address("P3", "CM3", "jane@example.com"),
    ]))
    .await;
    let service = service(&store);
    service.find_candidates().await.unwrap();

    assert!(service
        .block_candidate("P3", "P1", "different people, verified by phone")
        .await
        .unwrap());
    assert!(!service.block_candidate("P9", "P1", "no such pair").await.unwrap());

    let pending = service.list_candidates(CandidateFilter::Pending).await.unwrap();
    let blocked = service.list_candidates(CandidateFilter::Blocked).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].from_party_id, "P2");
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].reason, "different people, verified by phone");
    assert_eq!(
        service.list_candidates(CandidateFilter::All).await.unwrap().len(),
        2
    );
}
