use thiserror::Error;

use crate::cache::CacheState;
use crate::types::ObservationType;

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(
        "unknown observation constellation: procedure={}, property={property}, offering={offering}",
        .procedure.as_deref().unwrap_or("*")
    )]
    UnknownConstellation {
        procedure: Option<String>,
        property: String,
        offering: String,
    },

    #[error(
        "observation type conflict for ({procedure}, {property}, {offering}): \
         stored type is {stored}, request asserts {proposed}"
    )]
    TypeConflict {
        procedure: String,
        property: String,
        offering: String,
        stored: ObservationType,
        proposed: ObservationType,
    },

    #[error("procedure hierarchy cycle: {parent} cannot become parent of {procedure}")]
    CycleDetected { procedure: String, parent: String },

    #[error("catalog store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("full cache rebuild already in progress")]
    ConcurrentRebuildInProgress,

    #[error("content cache not ready (state: {0})")]
    CacheNotReady(CacheState),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("update coordinator stopped")]
    CoordinatorStopped,

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CatalogError {
    /// Only infrastructure failures are worth retrying; validation errors are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::ConcurrentRebuildInProgress
        )
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::UnknownConstellation { .. } | Self::InvalidInput(_) => 400,
            Self::NotFound(_) => 404,
            Self::TypeConflict { .. } | Self::CycleDetected { .. } => 409,
            Self::ConcurrentRebuildInProgress => 409,
            Self::StoreUnavailable(_) | Self::CacheNotReady(_) | Self::CoordinatorStopped => 503,
            Self::Internal(_) => 500,
        }
    }
}
