use sea_orm::error::DbErr;
use serde::Serialize;
use uuid::Uuid;

/// Stable classification of a [`ServiceError`], independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidAdjustment,
    InvalidTransfer,
    InsufficientStock,
    Validation,
    InvalidOperation,
    Internal,
}

impl ErrorKind {
    /// Machine-readable code suitable for API payloads and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "resource_not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidAdjustment => "invalid_adjustment",
            ErrorKind::InvalidTransfer => "invalid_transfer",
            ErrorKind::InsufficientStock => "insufficient_stock",
            ErrorKind::Validation => "validation_error",
            ErrorKind::InvalidOperation => "invalid_operation",
            ErrorKind::Internal => "internal_error",
        }
    }
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid adjustment: {0}")]
    InvalidAdjustment(String),

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error(
        "Insufficient stock for product {product_id} at warehouse {warehouse_id}: available {available}, requested {requested}"
    )]
    InsufficientStock {
        warehouse_id: Uuid,
        product_id: Uuid,
        available: i64,
        requested: i64,
    },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    pub fn db_error(error: DbErr) -> Self {
        ServiceError::DatabaseError(error)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ServiceError::NotFound(message.into())
    }

    /// Single source of truth for error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidAdjustment(_) => ErrorKind::InvalidAdjustment,
            Self::InvalidTransfer(_) => ErrorKind::InvalidTransfer,
            Self::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            Self::ValidationError(_) => ErrorKind::Validation,
            Self::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Self::DatabaseError(_) | Self::ConfigError(_) | Self::InternalError(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Returns the error message suitable for callers.
    /// Internal errors return generic messages so storage details never leak.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::ConfigError(_) | Self::InternalError(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

pub type LedgerResult<T> = Result<T, ServiceError>;
