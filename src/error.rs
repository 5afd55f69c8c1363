use thiserror::Error;

/// Policy graph validation failure. Always fatal at compile/publish time
/// and never partially applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("parent relation cycle through type '{type_name}'")]
    CyclicParent { type_name: String },

    #[error("type '{type_name}' references unknown relation '{relation}'")]
    UnknownRelation { type_name: String, relation: String },

    #[error("type '{type_name}' references unknown permission '{permission}'")]
    UnknownPermission {
        type_name: String,
        permission: String,
    },

    #[error("invalid binding on '{type_name}.{relation}': {reason}")]
    InvalidBinding {
        type_name: String,
        relation: String,
        reason: String,
    },

    #[error("duplicate type definition '{type_name}'")]
    DuplicateType { type_name: String },

    #[error("malformed expression for '{type_name}.{permission}': {reason}")]
    InvalidExpression {
        type_name: String,
        permission: String,
        reason: String,
    },

    #[error("permission '{type_name}.{permission}' references itself")]
    CyclicPermission {
        type_name: String,
        permission: String,
    },
}

#[derive(Error, Debug)]
pub enum RebacError {
    #[error("policy configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("tuple sync failed for {type_name}:{record_id}: {reason}")]
    Sync {
        type_name: String,
        record_id: String,
        reason: String,
    },

    #[error("relationship store unavailable: {reason}")]
    EngineUnavailable { reason: String },

    #[error("operation timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("policy misconfiguration: {reason}")]
    PolicyMisconfig { reason: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RebacError {
    /// Transient failures are candidates for retry; everything else is
    /// surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, RebacError::EngineUnavailable { .. })
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        RebacError::EngineUnavailable {
            reason: reason.into(),
        }
    }

    pub fn misconfig(reason: impl Into<String>) -> Self {
        RebacError::PolicyMisconfig {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;
