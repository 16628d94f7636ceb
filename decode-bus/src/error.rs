//! Error taxonomy shared by every stage of the decode pipeline.
//!
//! Backpressure (`would block`, `need input`) is deliberately absent here: those
//! are normal outcomes and travel through [`Sent`](crate::packet::Sent),
//! [`Received`] and [`Pull`](crate::decoder::Pull) instead.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// An allocation could not be satisfied. Never retried.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The caller broke an API contract, e.g. submitting to a busy slot.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The codec adapter rejected its input. Usually recoverable by skipping.
    #[error("decode error: {0}")]
    Decode(String),

    /// The scheduler itself misbehaved (or was driven into a state it cannot
    /// make progress from). Kept apart from [`Error::Decode`] so callers can
    /// tell bad input from a defect.
    #[error("internal bug: {0}")]
    InvariantBroken(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("filter not found: {0}")]
    FilterNotFound(String),

    /// End of stream reported by a pull-style adapter or packet source.
    #[error("end of stream")]
    Eof,

    #[error("worker thread failed: {0}")]
    Join(String),
}

impl Error {
    /// Errors that must abort the current call and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhausted(_) | Error::ContractViolation(_) | Error::Join(_)
        )
    }

    pub fn is_invariant_broken(&self) -> bool {
        matches!(self, Error::InvariantBroken(_))
    }

    pub(crate) fn alloc(size: usize) -> Self {
        Error::ResourceExhausted(format!("failed to allocate {} bytes", size))
    }
}

/// Result of pulling one unit from a stage that may need more input first.
#[derive(Debug)]
pub enum Received<T> {
    Unit(T),
    NeedInput,
    Eof,
}

impl<T> Received<T> {
    pub fn unit(self) -> Option<T> {
        match self {
            Received::Unit(u) => Some(u),
            _ => None,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Received::Eof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::alloc(16).is_fatal());
        assert!(Error::ContractViolation("double submit".into()).is_fatal());
        assert!(!Error::Decode("bad slice".into()).is_fatal());
        assert!(Error::InvariantBroken("slot mismatch".into()).is_invariant_broken());
        assert!(!Error::Decode("bad slice".into()).is_invariant_broken());
    }

    #[test]
    fn test_received_unit() {
        let r: Received<u32> = Received::Unit(7);
        assert_eq!(r.unit(), Some(7));
        let r: Received<u32> = Received::Eof;
        assert!(r.is_eof());
        assert_eq!(r.unit(), None);
    }
}
