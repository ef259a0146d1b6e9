pub mod catalog;
pub mod detector;
pub mod error;
pub mod executor;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod satellite;
pub mod service;
pub mod traversal;

pub use catalog::{CatalogCache, SchemaCatalog};
pub use detector::{DetectionReport, DuplicateDetector};
pub use error::{MergeError, Rejection, Result};
pub use executor::MergeExecutor;
pub use models::*;
pub use normalize::Normalizer;
pub use orchestrator::{BatchItemFailure, BatchMerger, BatchReport};
pub use satellite::SatelliteKind;
pub use service::MergeService;
pub use traversal::{build_traversal_order, TraversalOrder};
