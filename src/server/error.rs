use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    CapacityExceeded(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("External service failure: {0}")]
    ExternalService(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl ServiceError {
    /// Stable identifier sent on the wire as `ERR: <kind>: <message>`.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::CapacityExceeded(_) => "capacity_exceeded",
            ServiceError::PermissionDenied(_) => "permission_denied",
            ServiceError::Unauthorized(_) => "unauthorized",
            ServiceError::ExternalService(_) => "external_service",
            ServiceError::Storage(_) => "storage",
        }
    }

    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
            _ => false,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
