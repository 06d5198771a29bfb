//! Caller-facing validation errors.
//!
//! Everything else in the crate travels as `anyhow::Error`; these are raised
//! before any work starts so a caller can tell bad input from degraded data.

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    MalformedDate(String),

    #[error("inverted date range: from {from} is after to {to}")]
    InvertedRange { from: NaiveDate, to: NaiveDate },

    #[error("unknown {field} '{value}'")]
    UnknownValue { field: &'static str, value: String },
}

/// True when `err` (or its source chain) is a `ValidationError`.
pub fn is_validation_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<ValidationError>().is_some())
}
