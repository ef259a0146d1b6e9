use super::catalog::{CatalogCache, SchemaCatalog};
use super::detector::{DetectionReport, DuplicateDetector};
use super::error::{MergeError, Rejection, Result};
use super::executor::MergeExecutor;
use super::models::{CandidateFilter, MergeCandidate, MergeSummary, PartyIdentity};
use super::normalize::Normalizer;
use super::orchestrator::{rollback_after, BatchMerger, BatchReport};
use super::satellite::load_identity;
use super::traversal::TraversalOrder;
use crate::authorization::{Authorizer, RoleAuthorizer};
use crate::config::{Config, MergeConfig};
use crate::store::MergeStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Entry point for callers: validation, manual merge, detection and batch runs.
pub struct MergeService {
    store: Arc<dyn MergeStore>,
    config: MergeConfig,
    catalog: CatalogCache,
    executor: MergeExecutor,
    detector: DuplicateDetector,
    authorizer: Arc<dyn Authorizer>,
}

impl MergeService {
    pub fn new(
        store: Arc<dyn MergeStore>,
        config: MergeConfig,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self> {
        let executor = MergeExecutor::new(&config)?;
        let detector = DuplicateDetector::new(
            Normalizer::new(config.normalization.clone()),
            config.root_entity.clone(),
        );
        Ok(Self {
            store,
            catalog: CatalogCache::new(config.root_entity.clone()),
            executor,
            detector,
            authorizer,
            config,
        })
    }

    /// Service with a [`RoleAuthorizer`] built from the configuration.
    pub fn from_config(store: Arc<dyn MergeStore>, config: &Config) -> Result<Self> {
        let authorizer = Arc::new(RoleAuthorizer::new(&config.authorization));
        Self::new(store, config.merge.clone(), authorizer)
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn catalog_cache(&self) -> &CatalogCache {
        &self.catalog
    }

    pub async fn catalog(&self) -> Result<Arc<SchemaCatalog>> {
        self.catalog.get_or_load(self.store.as_ref()).await
    }

    /// Drop the cached catalog; the next operation reloads it.
    pub async fn invalidate_catalog(&self) {
        self.catalog.invalidate().await;
    }

    pub async fn traversal_order(&self) -> Result<TraversalOrder> {
        let catalog = self.catalog().await?;
        self.executor.traversal_order(&catalog)
    }

    fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.config.merge_timeout_seconds)
    }

    /// Check that `user` may merge `from` into `to`. Reads only.
    pub async fn validate_merge(&self, from: &str, to: &str, user: &str) -> Result<()> {
        if from == to {
            return Err(Rejection::SameKey {
                key: from.to_string(),
            }
            .into());
        }

        let catalog = self.catalog().await?;
        let (from_identity, to_identity) = self.load_pair(&catalog, from, to).await?;

        let root = self.catalog.root_entity();
        let from_permission = format!("{root}:update:{}", from_identity.party_type);
        let to_permission = format!("{root}:update:{}", to_identity.party_type);
        let check = self
            .authorizer
            .check_permissions(user, &[from_permission.as_str(), to_permission.as_str()]);
        if !check.allowed {
            warn!("User {} denied merge of {} into {}: {}", user, from, to, check.reason);
            return Err(Rejection::PermissionDenied {
                user: user.to_string(),
                permission: check.required_permission,
            }
            .into());
        }

        if from_identity.party_type != to_identity.party_type {
            return Err(Rejection::TypeMismatch {
                from_type: from_identity.party_type.to_string(),
                to_type: to_identity.party_type.to_string(),
            }
            .into());
        }

        debug!("Merge of {} into {} validated for {}", from, to, user);
        Ok(())
    }

    async fn load_pair(
        &self,
        catalog: &SchemaCatalog,
        from: &str,
        to: &str,
    ) -> Result<(PartyIdentity, PartyIdentity)> {
        let root = self.catalog.root_entity();
        let mut tx = self.store.begin().await?;
        let loaded = async {
            let from_identity = load_identity(tx.as_mut(), catalog, root, from).await?;
            let to_identity = load_identity(tx.as_mut(), catalog, root, to).await?;
            Ok::<_, MergeError>((from_identity, to_identity))
        }
        .await;
        tx.rollback().await?;

        match loaded? {
            (Some(from_identity), Some(to_identity)) => Ok((from_identity, to_identity)),
            (None, _) => Err(MergeError::PartyNotFound { id: from.to_string() }),
            (_, None) => Err(MergeError::PartyNotFound { id: to.to_string() }),
        }
    }

    /// Merge `from` into `to` in one transaction. A pending candidate for the
    /// same pair is marked processed with it.
    pub async fn merge(
        &self,
        from: &str,
        to: &str,
        user: &str,
        skip_validation: bool,
    ) -> Result<MergeSummary> {
        if !skip_validation {
            self.validate_merge(from, to, user).await?;
        }

        let catalog = self.catalog().await?;
        let operation_id = Uuid::new_v4();
        info!(
            "Merge {} requested by {}: {} into {}",
            operation_id, user, from, to
        );

        let mut tx = self.store.begin().await?;
        let summary = match self
            .executor
            .merge_with_timeout(tx.as_mut(), &catalog, from, to, self.merge_timeout())
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                error!("Merge {} of {} into {} failed: {}", operation_id, from, to, e);
                return Err(rollback_after(tx, e).await);
            }
        };

        match tx.mark_candidate_processed(from, to, Utc::now()).await {
            Ok(true) => debug!("Candidate {} -> {} marked processed", from, to),
            Ok(false) => {}
            Err(e) => return Err(rollback_after(tx, e).await),
        }
        tx.commit().await?;

        info!("Merge {} committed", operation_id);
        Ok(summary)
    }

    pub async fn find_candidates(&self) -> Result<DetectionReport> {
        let catalog = self.catalog().await?;
        self.detector
            .find_candidates(self.store.as_ref(), &catalog)
            .await
    }

    pub async fn run_batch(&self) -> Result<BatchReport> {
        let catalog = self.catalog().await?;
        BatchMerger::new(&self.executor, self.merge_timeout())
            .with_batch_limit(self.config.batch_limit)
            .run(self.store.as_ref(), &catalog)
            .await
    }

    pub async fn list_candidates(&self, filter: CandidateFilter) -> Result<Vec<MergeCandidate>> {
        let mut tx = self.store.begin().await?;
        let listed = tx.list_candidates(filter).await;
        tx.rollback().await?;
        listed
    }

    /// Hold a candidate back from auto-merge. Returns false when no open
    /// candidate exists for the pair.
    pub async fn block_candidate(&self, from: &str, to: &str, reason: &str) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        match tx.block_candidate(from, to, reason).await {
            Ok(blocked) => {
                tx.commit().await?;
                if blocked {
                    info!("Candidate {} -> {} blocked: {}", from, to, reason);
                }
                Ok(blocked)
            }
            Err(e) => Err(rollback_after(tx, e).await),
        }
    }
}
