//! Transport error taxonomy.
//!
//! Out-of-memory stays a distinct wrapped type ([`OomError`]) so callers
//! can always tell "retry later" apart from logical failure. Disconnection
//! never propagates as an error from idempotent operations; producing
//! operations report it with [`Error::Disconnected`]. Policy failures
//! during authentication (guid pinning, uid checks) disconnect first and
//! then surface as `is_authenticated() == false`; their variants here
//! exist for logging and for callers that inspect open failures.

use thiserror::Error;

pub use unibus_core::mem::OomError;

/// Errors surfaced by the transport layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An allocation failed or was injected to fail; retryable.
    #[error("not enough memory")]
    NoMemory(#[from] OomError),

    /// An address entry was syntactically or semantically unusable.
    #[error("bad address: {message}")]
    BadAddress {
        /// What was wrong with the address.
        message: String,
    },

    /// The address was valid but no session could be established.
    #[error("did not connect: {message}")]
    DidNotConnect {
        /// Why the connection attempt failed.
        message: String,
        /// The underlying I/O error, when there is one.
        #[source]
        source: Option<std::io::Error>,
    },

    /// The operation needs a live transport but this one is terminal.
    #[error("transport is disconnected")]
    Disconnected,

    /// The client pinned a guid the server did not present.
    #[error("server guid mismatch: expected {expected}, server advertised {advertised}")]
    GuidMismatch {
        /// The guid the client pinned.
        expected: String,
        /// The guid the server advertised.
        advertised: String,
    },

    /// A connecting identity was refused.
    #[error("authentication rejected for uid {uid:?}")]
    AuthRejected {
        /// The refused uid, when one was presented.
        uid: Option<u32>,
    },

    /// The message loader found the byte stream unparseable.
    #[error("corrupted message stream")]
    StreamCorrupted,
}

impl Error {
    pub(crate) fn bad_address(message: impl Into<String>) -> Self {
        Self::BadAddress {
            message: message.into(),
        }
    }

    pub(crate) fn did_not_connect(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::DidNotConnect {
            message: message.into(),
            source: Some(source),
        }
    }

    pub(crate) fn did_not_connect_msg(message: impl Into<String>) -> Self {
        Self::DidNotConnect {
            message: message.into(),
            source: None,
        }
    }
}
