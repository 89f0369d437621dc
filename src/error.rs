//! Error types shared by every subsystem.
//!
//! See also the language-neutral error code table in the crate's top level
//! documentation: a single, consistently-used enum where `Ok` never doubles
//! as "queue now empty" (that ambiguity existed in the source this crate is
//! ported from and is deliberately not reproduced here).
use std::io;

use num_derive::{FromPrimitive, ToPrimitive};

use crate::io_manager::Event;

/// Rich error type returned by fallible public operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("scheduler has already been stopped")]
    AlreadyStopped,

    #[error("event already registered for fd {fd} ({event:?})")]
    DuplicateEvent { fd: i32, event: Event },

    #[error("no such fd registered: {0}")]
    NoSuchFd(i32),

    #[error("fd {fd} has no {event:?} event registered")]
    NoSuchEvent { fd: i32, event: Event },

    #[error("stack allocation failed ({0} bytes)")]
    StackAllocation(usize),

    #[error("system error: {0}")]
    System(#[from] io::Error),

    #[error("invalid state: expected {expected}, found {found}")]
    InvalidState { expected: String, found: String },
}

impl Error {
    /// Flatten this error down to the language-neutral code from spec section 6.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::AlreadyStopped => ErrorCode::AlreadyStopped,
            Error::DuplicateEvent { .. } => ErrorCode::DuplicateEvent,
            Error::NoSuchFd(_) => ErrorCode::NoSuchFd,
            Error::NoSuchEvent { .. } => ErrorCode::NoSuchEvent,
            Error::StackAllocation(_) | Error::System(_) => ErrorCode::System,
            Error::InvalidState { .. } => ErrorCode::InvalidState,
        }
    }

    pub(crate) fn invalid_state(expected: impl Into<String>, found: impl Into<String>) -> Error {
        Error::InvalidState {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

/// Flat, language-neutral error code (spec section 6).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ErrorCode {
    Ok = 0,
    AlreadyStopped = 1,
    DuplicateEvent = 2,
    NoSuchFd = 3,
    NoSuchEvent = 4,
    System = 5,
    InvalidState = 6,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trips_to_a_single_meaning() {
        let err = Error::NoSuchFd(7);
        assert_eq!(err.code(), ErrorCode::NoSuchFd);
        assert_ne!(err.code(), ErrorCode::Ok);
    }
}
