use thiserror::Error;

/// The platform's error taxonomy. Every public operation in this crate
/// returns `Result<T, CoreError>` — each kind maps to exactly one failure
/// class described in the design notes, never an ad hoc string.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed kit: {0}")]
    MalformedKit(String),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("version already exists: {owner}/{kit_id}/{version}")]
    VersionExists {
        owner: String,
        kit_id: String,
        version: String,
    },

    #[error("kit not found: {owner}/{kit_id}/{version}")]
    KitNotFound {
        owner: String,
        kit_id: String,
        version: String,
    },

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("capability denied: {receiver} has no {kind} edge from {provider}")]
    CapabilityDenied {
        provider: String,
        receiver: String,
        kind: String,
    },

    #[error("composition error: {0}")]
    CompositionError(String),

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("tool error: {0}")]
    ToolError(String),

    #[error("agent runner error: {0}")]
    AgentRunnerError(String),

    #[error("platform call failed: {message}")]
    PlatformCallFailed { message: String },

    #[error("registry error: {0}")]
    RegistryError(String),

    #[error("decryption error: {0}")]
    DecryptionError(String),

    #[error("database error: {0}")]
    DbError(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl From<redb::Error> for CoreError {
    fn from(e: redb::Error) -> Self {
        CoreError::DbError(e.to_string())
    }
}

impl From<redb::DatabaseError> for CoreError {
    fn from(e: redb::DatabaseError) -> Self {
        CoreError::DbError(e.to_string())
    }
}

impl From<redb::TransactionError> for CoreError {
    fn from(e: redb::TransactionError) -> Self {
        CoreError::DbError(e.to_string())
    }
}

impl From<redb::TableError> for CoreError {
    fn from(e: redb::TableError) -> Self {
        CoreError::DbError(e.to_string())
    }
}

impl From<redb::StorageError> for CoreError {
    fn from(e: redb::StorageError) -> Self {
        CoreError::DbError(e.to_string())
    }
}

impl From<redb::CommitError> for CoreError {
    fn from(e: redb::CommitError) -> Self {
        CoreError::DbError(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::DbError(format!("serialization failure: {e}"))
    }
}
