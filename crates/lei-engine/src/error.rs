//! Errors returned by administrative operations.
//!
//! The I/O path never returns these: an I/O that cannot be matched or
//! corrupted simply passes through.

use thiserror::Error;

use crate::types::ObjectId;

/// Errors from the record store, registry, tables and engine control.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeiError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("record table full ({limit} records)")]
    ResourceExhausted { limit: usize },

    #[error("record handle {0} not found")]
    RecordNotFound(usize),

    #[error("object {0} not registered")]
    ObjectNotFound(ObjectId),

    #[error("table {0} not found")]
    TableNotFound(usize),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl LeiError {
    /// Whether this is one of the not-found variants.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RecordNotFound(_) | Self::ObjectNotFound(_) | Self::TableNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LeiError>;
