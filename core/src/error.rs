//! Structured error kinds the engine surfaces (spec §7), composing with
//! `anyhow` at call boundaries the way the rest of this workspace does.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LmError {
    NotFound(String),
    InvalidArgument(String),
    Internal(String),
    Unimplemented(String),
}

impl LmError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        LmError::NotFound(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        LmError::InvalidArgument(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        LmError::Internal(msg.into())
    }

    pub fn unimplemented(msg: impl Into<String>) -> Self {
        LmError::Unimplemented(msg.into())
    }
}

impl fmt::Display for LmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LmError::NotFound(m) => write!(f, "not found: {m}"),
            LmError::InvalidArgument(m) => write!(f, "invalid argument: {m}"),
            LmError::Internal(m) => write!(f, "internal: {m}"),
            LmError::Unimplemented(m) => write!(f, "unimplemented: {m}"),
        }
    }
}

impl std::error::Error for LmError {}

pub type LmResult<T> = Result<T, LmError>;
