use super::catalog::SchemaCatalog;
use super::error::Result;
use super::models::{CandidateFilter, MergeCandidate, PartyIdentity};
use super::normalize::Normalizer;
use super::satellite::load_identity;
use crate::store::{MergeStore, StoreTransaction};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, error, info};

/// Outcome of one detection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectionReport {
    pub addresses_scanned: usize,
    pub emails_scanned: usize,
    pub groups_found: usize,
    pub candidates_created: usize,
    pub candidates_blocked: usize,
    /// Pairs that already had a candidate row
    pub candidates_existing: usize,
}

/// Groups parties sharing a normalized postal address or email and records
/// one candidate per non-survivor member.
#[derive(Debug, Clone)]
pub struct DuplicateDetector {
    normalizer: Normalizer,
    root_entity: String,
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    PostalAddress,
    Email,
}

impl Signal {
    fn label(&self) -> &'static str {
        match self {
            Signal::PostalAddress => "postal address",
            Signal::Email => "email address",
        }
    }
}

impl DuplicateDetector {
    pub fn new(normalizer: Normalizer, root_entity: impl Into<String>) -> Self {
        Self {
            normalizer,
            root_entity: root_entity.into(),
        }
    }

    /// Run both matching passes in one transaction.
    pub async fn find_candidates(
        &self,
        store: &dyn MergeStore,
        catalog: &SchemaCatalog,
    ) -> Result<DetectionReport> {
        let mut tx = store.begin().await?;
        match self.detect(tx.as_mut(), catalog).await {
            Ok(report) => {
                tx.commit().await?;
                info!(
                    "Duplicate detection finished: {} groups, {} new candidates ({} blocked)",
                    report.groups_found, report.candidates_created, report.candidates_blocked
                );
                Ok(report)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!("Failed to rollback detection transaction: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    pub async fn detect(
        &self,
        tx: &mut dyn StoreTransaction,
        catalog: &SchemaCatalog,
    ) -> Result<DetectionReport> {
        let mut report = DetectionReport::default();

        // Parties already paired in an open candidate are left alone.
        let mut excluded: HashSet<String> = tx
            .list_candidates(CandidateFilter::Unprocessed)
            .await?
            .into_iter()
            .flat_map(|c| [c.from_party_id, c.to_party_id])
            .collect();
        debug!("{} parties excluded by open candidates", excluded.len());

        let addresses = tx.postal_addresses().await?;
        report.addresses_scanned = addresses.len();
        let groups = group_by_key(addresses.iter().filter_map(|address| {
            if excluded.contains(&address.party_id) {
                return None;
            }
            self.normalizer
                .address_key(address)
                .map(|key| (key, address.party_id.clone()))
        }));
        self.emit(tx, catalog, Signal::PostalAddress, groups, &mut excluded, &mut report)
            .await?;

        let emails = tx.email_addresses().await?;
        report.emails_scanned = emails.len();
        let groups = group_by_key(emails.iter().filter_map(|email| {
            if excluded.contains(&email.party_id) {
                return None;
            }
            self.normalizer
                .email_key(&email.email)
                .map(|key| (key, email.party_id.clone()))
        }));
        self.emit(tx, catalog, Signal::Email, groups, &mut excluded, &mut report)
            .await?;

        Ok(report)
    }

    async fn emit(
        &self,
        tx: &mut dyn StoreTransaction,
        catalog: &SchemaCatalog,
        signal: Signal,
        groups: BTreeMap<String, BTreeSet<String>>,
        excluded: &mut HashSet<String>,
        report: &mut DetectionReport,
    ) -> Result<()> {
        for (key, members) in groups {
            let members: Vec<String> = members
                .into_iter()
                .filter(|party_id| !excluded.contains(party_id))
                .collect();
            if members.len() < 2 {
                continue;
            }
            report.groups_found += 1;

            // BTreeSet order: the lowest key survives.
            let survivor = &members[0];
            let reason = format!("Matching {}: {}", signal.label(), key);
            for loser in &members[1..] {
                let candidate = self
                    .check_consistency(tx, catalog, loser, survivor, &reason)
                    .await?;
                let blocked = candidate.blocked;
                if tx.insert_candidate(&candidate).await? {
                    report.candidates_created += 1;
                    if blocked {
                        report.candidates_blocked += 1;
                    }
                    debug!("Merge candidate {} -> {}: {}", loser, survivor, candidate.reason);
                } else {
                    report.candidates_existing += 1;
                }
            }
            excluded.extend(members);
        }
        Ok(())
    }

    async fn check_consistency(
        &self,
        tx: &mut dyn StoreTransaction,
        catalog: &SchemaCatalog,
        from: &str,
        to: &str,
        reason: &str,
    ) -> Result<MergeCandidate> {
        let candidate = MergeCandidate::new(from, to, reason)?;
        let from_identity = load_identity(tx, catalog, &self.root_entity, from).await?;
        let to_identity = load_identity(tx, catalog, &self.root_entity, to).await?;

        let (from_identity, to_identity) = match (from_identity, to_identity) {
            (Some(f), Some(t)) => (f, t),
            (None, _) => {
                return Ok(candidate.block(format!("{reason}; party record {from} not found")))
            }
            (_, None) => {
                return Ok(candidate.block(format!("{reason}; party record {to} not found")))
            }
        };

        if let Some(problem) = self.inconsistency(&from_identity, &to_identity) {
            return Ok(candidate.block(format!("{reason}; {problem}")));
        }
        Ok(candidate)
    }

    /// Why two parties must not be auto-merged, if they must not.
    pub fn inconsistency(&self, from: &PartyIdentity, to: &PartyIdentity) -> Option<String> {
        if from.party_type != to.party_type {
            return Some(format!(
                "party type mismatch ({} vs {})",
                from.party_type, to.party_type
            ));
        }

        let from_name = from.display_name.as_deref().map(|n| self.normalizer.name_key(n));
        let to_name = to.display_name.as_deref().map(|n| self.normalizer.name_key(n));
        if from_name != to_name {
            return Some(format!(
                "name mismatch ({} vs {})",
                from.display_name.as_deref().unwrap_or("<none>"),
                to.display_name.as_deref().unwrap_or("<none>")
            ));
        }
        None
    }
}

fn group_by_key(
    entries: impl Iterator<Item = (String, String)>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (key, party_id) in entries {
        groups.entry(key).or_default().insert(party_id);
    }
    groups
}
