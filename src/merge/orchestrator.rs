use super::catalog::SchemaCatalog;
use super::error::{MergeError, Rejection, Result};
use super::executor::MergeExecutor;
use super::models::{CandidateFilter, MergeCandidate, MergeSummary};
use crate::store::{MergeStore, StoreTransaction};
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItemFailure {
    pub from_party_id: String,
    pub to_party_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub attempted: usize,
    pub merged: usize,
    /// Candidates found blocked or processed when re-read under lock
    pub skipped: usize,
    pub failures: Vec<BatchItemFailure>,
}

impl BatchReport {
    fn new() -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            attempted: 0,
            merged: 0,
            skipped: 0,
            failures: Vec::new(),
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

enum Outcome {
    Merged(MergeSummary),
    Skipped(Rejection),
}

/// Runs every pending candidate through the executor, one transaction each.
pub struct BatchMerger<'a> {
    executor: &'a MergeExecutor,
    merge_timeout: Duration,
    batch_limit: Option<usize>,
}

impl<'a> BatchMerger<'a> {
    pub fn new(executor: &'a MergeExecutor, merge_timeout: Duration) -> Self {
        Self {
            executor,
            merge_timeout,
            batch_limit: None,
        }
    }

    pub fn with_batch_limit(mut self, limit: Option<usize>) -> Self {
        self.batch_limit = limit;
        self
    }

    pub async fn run(&self, store: &dyn MergeStore, catalog: &SchemaCatalog) -> Result<BatchReport> {
        let mut report = BatchReport::new();

        let pending = {
            let mut tx = store.begin().await?;
            let listed = tx.list_candidates(CandidateFilter::Pending).await;
            tx.rollback().await?;
            listed?
        };
        let limit = self.batch_limit.unwrap_or(usize::MAX);
        info!(
            "Batch {} starting with {} pending candidates",
            report.batch_id,
            pending.len().min(limit)
        );

        for candidate in pending.into_iter().take(limit) {
            report.attempted += 1;
            match self.process(store, catalog, &candidate).await {
                Ok(Outcome::Merged(_)) => report.merged += 1,
                Ok(Outcome::Skipped(reason)) => {
                    warn!("Batch {} skipped candidate: {}", report.batch_id, reason);
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(
                        "Batch {} failed to merge {} into {}: {}",
                        report.batch_id, candidate.from_party_id, candidate.to_party_id, e
                    );
                    report.failures.push(BatchItemFailure {
                        from_party_id: candidate.from_party_id.clone(),
                        to_party_id: candidate.to_party_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Batch {} finished: {} attempted, {} merged, {} skipped, {} failed",
            report.batch_id,
            report.attempted,
            report.merged,
            report.skipped,
            report.failed()
        );
        Ok(report)
    }

    async fn process(
        &self,
        store: &dyn MergeStore,
        catalog: &SchemaCatalog,
        candidate: &MergeCandidate,
    ) -> Result<Outcome> {
        let from = candidate.from_party_id.as_str();
        let to = candidate.to_party_id.as_str();
        let mut tx = store.begin().await?;

        // Operators may have blocked or merged the pair since it was listed.
        let current = match tx.lock_candidate(from, to).await {
            Ok(current) => current,
            Err(e) => return Err(rollback_after(tx, e).await),
        };
        let skip = match current {
            Some(c) if c.processed_at.is_some() => Some(Rejection::AlreadyProcessed {
                from: from.to_string(),
                to: to.to_string(),
            }),
            Some(c) if c.blocked => Some(Rejection::Blocked {
                from: from.to_string(),
                to: to.to_string(),
            }),
            Some(_) => None,
            None => {
                return Err(rollback_after(
                    tx,
                    MergeError::DataIntegrity {
                        message: format!("candidate {from} -> {to} disappeared"),
                    },
                )
                .await)
            }
        };
        if let Some(reason) = skip {
            tx.rollback().await?;
            return Ok(Outcome::Skipped(reason));
        }

        let summary = match self
            .executor
            .merge_with_timeout(tx.as_mut(), catalog, from, to, self.merge_timeout)
            .await
        {
            Ok(summary) => summary,
            Err(e) => return Err(rollback_after(tx, e).await),
        };

        if let Err(e) = tx.mark_candidate_processed(from, to, Utc::now()).await {
            return Err(rollback_after(tx, e).await);
        }
        tx.commit().await?;
        Ok(Outcome::Merged(summary))
    }
}

/// Roll back after `cause`, logging a rollback failure, and hand `cause` back.
pub(crate) async fn rollback_after(tx: Box<dyn StoreTransaction>, cause: MergeError) -> MergeError {
    if let Err(rollback_err) = tx.rollback().await {
        error!("Failed to rollback transaction after {}: {}", cause, rollback_err);
    }
    cause
}
