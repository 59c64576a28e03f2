//! Error types for vfb-ipc.

use std::io;

use thiserror::Error;

/// Errors surfaced by segments, locks and the election protocol.
///
/// `Timeout` and `OwnerDied` are transient: the caller decides whether and
/// when to retry.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid resource name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("shared object `{name}` does not exist")]
    NotFound { name: String },

    #[error("shared object `{name}` exists but its creator has not finished initializing it")]
    NotReady { name: String },

    #[error("failed to allocate {size} bytes for `{name}`: {source}")]
    Allocation {
        name: String,
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to remap `{name}` from {from} to {to} bytes: {source}")]
    Remap {
        name: String,
        from: usize,
        to: usize,
        #[source]
        source: io::Error,
    },

    #[error("{op} failed for `{name}`: {source}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out waiting for the lock")]
    Timeout,

    #[error("previous lock owner died while holding the lock")]
    OwnerDied,
}

impl Error {
    pub(crate) fn os(op: &'static str, name: impl Into<String>, source: io::Error) -> Self {
        Self::Os {
            op,
            name: name.into(),
            source,
        }
    }

    /// Whether retrying the same call later can succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::OwnerDied | Error::NotReady { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
