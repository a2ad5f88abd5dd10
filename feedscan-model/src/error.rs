use std::fmt::{self, Display};

/// Errors produced by model parsing and validation routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    UnknownScanType(String),
    UnknownScanState(String),
    InvalidIdentifier(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownScanType(value) => {
                write!(f, "unknown scan type: {value}")
            }
            ModelError::UnknownScanState(value) => {
                write!(f, "unknown scan state: {value}")
            }
            ModelError::InvalidIdentifier(value) => {
                write!(f, "invalid identifier: {value}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
