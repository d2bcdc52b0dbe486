//! Tagged business results.

use serde::{Deserialize, Serialize};

/// A domain-level failure produced by business logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct BusinessError {
    /// Stable machine-readable code (e.g. `not_found`).
    pub code: String,
    pub message: String,
}

impl BusinessError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Response of an operation whose business logic may fail.
///
/// Both variants are successful endpoint calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply<T> {
    Ok(T),
    Failed(BusinessError),
}

impl<T> Reply<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok(_))
    }

    pub fn failure(&self) -> Option<&BusinessError> {
        match self {
            Reply::Ok(_) => None,
            Reply::Failed(e) => Some(e),
        }
    }

    pub fn into_result(self) -> Result<T, BusinessError> {
        match self {
            Reply::Ok(v) => Ok(v),
            Reply::Failed(e) => Err(e),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reply<U> {
        match self {
            Reply::Ok(v) => Reply::Ok(f(v)),
            Reply::Failed(e) => Reply::Failed(e),
        }
    }
}

impl<T> From<Result<T, BusinessError>> for Reply<T> {
    fn from(res: Result<T, BusinessError>) -> Self {
        match res {
            Ok(v) => Reply::Ok(v),
            Err(e) => Reply::Failed(e),
        }
    }
}
