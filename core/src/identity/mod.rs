// Identity: rotating anonymous broadcast identifiers
//
// Derivation is pluggable (IdentifierSource); the rotator owns validity
// windows, successor pre-generation and the no-repeat lookback.

mod rotator;
mod source;

pub use rotator::{BroadcastIdentifier, IdentifierRotator, RotationConfig};
pub use source::{IdentifierBytes, IdentifierSource, KeyedSource, RandomSource, IDENTIFIER_LEN};

#[cfg(test)]
pub(crate) use source::MockIdentifierSource;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RotatorError {
    /// The randomness source is unavailable or keeps producing used values.
    #[error("Identifier entropy exhausted: {0}")]
    ExhaustedEntropy(String),
}
