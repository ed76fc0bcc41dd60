//! Database error types shared by the repositories

use std::fmt;

use crate::error::{AppError, AppErrorKind, InfrastructureError};

/// Classification of a storage failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    /// Pool exhausted, connection refused, I/O failure
    Connection { message: String },
    /// Row expected but missing
    NotFound { entity: String, id: String },
    /// Unique / check / foreign-key violation
    ConstraintViolation { constraint: String, message: String },
    /// Row could not be decoded into the domain type
    Decode { message: String },
    Unknown { message: String },
}

#[derive(Debug, Clone)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseErrorKind::Connection {
                    message: err.to_string(),
                }
            }
            sqlx::Error::Database(db_err) => match db_err.constraint() {
                Some(constraint) => DatabaseErrorKind::ConstraintViolation {
                    constraint: constraint.to_string(),
                    message: db_err.message().to_string(),
                },
                None => DatabaseErrorKind::Unknown {
                    message: db_err.message().to_string(),
                },
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DatabaseErrorKind::Decode {
                    message: err.to_string(),
                }
            }
            _ => DatabaseErrorKind::Unknown {
                message: err.to_string(),
            },
        };
        Self { kind }
    }

    /// Transient failures worth a second attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::Connection { .. })
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::ConstraintViolation { .. })
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DatabaseErrorKind::Connection { message } => {
                write!(f, "Database connection error: {}", message)
            }
            DatabaseErrorKind::NotFound { entity, id } => {
                write!(f, "{} not found: {}", entity, id)
            }
            DatabaseErrorKind::ConstraintViolation {
                constraint,
                message,
            } => write!(f, "Constraint {} violated: {}", constraint, message),
            DatabaseErrorKind::Decode { message } => {
                write!(f, "Failed to decode row: {}", message)
            }
            DatabaseErrorKind::Unknown { message } => write!(f, "Database error: {}", message),
        }
    }
}

impl std::error::Error for DatabaseError {}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: err.to_string(),
            is_retryable: err.is_retryable(),
        }))
    }
}
