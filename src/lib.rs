pub mod authorization;
pub mod config;
pub mod merge;
pub mod store;

pub use authorization::{Authorizer, PermissionCheck, RoleAuthorizer};
pub use config::Config;

// Re-export merge engine types for convenience
pub use merge::{
    build_traversal_order, BatchReport, CandidateFilter, DetectionReport, DynamicRecord,
    EntityTypeDescriptor, MergeCandidate, MergeError, MergeService, MergeSummary, Rejection,
    SchemaCatalog, TraversalOrder,
};

pub use store::{
    connection::{create_pool, pool_from_config},
    InMemoryStore, MergeStore, PgStore, StoreTransaction,
};
