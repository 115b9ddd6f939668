//! Three-way results.
//!
//! Every awaited operation in the crate ends in exactly one of three terminal
//! outcomes: a value, an error, or cancellation. Cancellation is kept out of
//! [`Error`] so callers can never mistake it for a failure.

use std::fmt;

use crate::error::Error;

/// Marker returned when an operation observed cancellation of its own token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation was cancelled")
    }
}

impl std::error::Error for Cancelled {}

#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Ok(T),
    Err(Error),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Outcome::Err(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Ok(value) => Some(value),
            _ => None,
        }
    }

    pub fn err(self) -> Option<Error> {
        match self {
            Outcome::Err(error) => Some(error),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Outcome<&T> {
        match self {
            Outcome::Ok(value) => Outcome::Ok(value),
            Outcome::Err(error) => Outcome::Err(error.clone()),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }

    pub fn map<U, F>(self, f: F) -> Outcome<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Outcome::Ok(value) => Outcome::Ok(f(value)),
            Outcome::Err(error) => Outcome::Err(error),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }

    /// Chain a fallible step onto a successful outcome.
    pub fn and_then<U, F>(self, f: F) -> Outcome<U>
    where
        F: FnOnce(T) -> Outcome<U>,
    {
        match self {
            Outcome::Ok(value) => f(value),
            Outcome::Err(error) => Outcome::Err(error),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }

    /// Collapse into a `Result`, reporting cancellation through `Cancelled`.
    pub fn into_result(self) -> Result<crate::Result<T>, Cancelled> {
        match self {
            Outcome::Ok(value) => Ok(Ok(value)),
            Outcome::Err(error) => Ok(Err(error)),
            Outcome::Cancelled => Err(Cancelled),
        }
    }
}

impl<T> From<crate::Result<T>> for Outcome<T> {
    fn from(result: crate::Result<T>) -> Self {
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(error) => Outcome::Err(error),
        }
    }
}

impl<T> From<Result<T, Cancelled>> for Outcome<T> {
    fn from(result: Result<T, Cancelled>) -> Self {
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(Cancelled) => Outcome::Cancelled,
        }
    }
}
