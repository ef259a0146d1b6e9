use thiserror::Error;

/// Reasons a merge request is turned away before any state is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("cannot merge party {key} into itself")]
    SameKey { key: String },

    #[error("party type mismatch: {from_type} cannot be merged into {to_type}")]
    TypeMismatch { from_type: String, to_type: String },

    #[error("user {user} lacks permission {permission}")]
    PermissionDenied { user: String, permission: String },

    #[error("candidate {from} -> {to} is blocked from auto-merge")]
    Blocked { from: String, to: String },

    #[error("candidate {from} -> {to} was already processed")]
    AlreadyProcessed { from: String, to: String },
}

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Merge rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("Party not found: {id}")]
    PartyNotFound { id: String },

    #[error("Data integrity error: {message}")]
    DataIntegrity { message: String },

    #[error("Constraint violation on {entity}: {message}")]
    ConstraintViolation { entity: String, message: String },

    #[error("Invalid record for {entity}: {message}")]
    InvalidRecord { entity: String, message: String },

    #[error("Operation timeout: {message}")]
    OperationTimeout { message: String },
}

impl MergeError {
    /// True for validation outcomes that are reported to the caller rather than raised.
    pub fn is_rejection(&self) -> bool {
        matches!(self, MergeError::Rejected(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            MergeError::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MergeError>;
