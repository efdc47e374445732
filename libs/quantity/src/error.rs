//! Error types for quantity parsing.

use thiserror::Error;

/// Errors that can occur when parsing a resource quantity string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuantityError {
    /// The quantity string is empty.
    #[error("quantity cannot be empty")]
    Empty,

    /// The numeric portion of the quantity could not be parsed.
    #[error("invalid numeric value in quantity '{0}'")]
    InvalidValue(String),

    /// The unit suffix is not one this system understands.
    #[error("unknown unit suffix '{suffix}' in quantity '{quantity}'")]
    UnknownSuffix { quantity: String, suffix: String },

    /// The value carries more precision than the unit can represent.
    #[error("quantity '{0}' has more precision than the unit supports")]
    ExcessPrecision(String),
}
