//! Process credentials carried by a connection.
//!
//! On Unix sockets these arrive out-of-band via `SCM_CREDENTIALS` during
//! the initial NUL-byte exchange; the authentication dialog then verifies
//! the identity the peer claims against them.

use nix::unistd::{getgid, getpid, getuid};

/// A pid/uid/gid triple. Fields are `None` until learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    /// Process ID of the peer, when the platform reports one.
    pub pid: Option<u32>,
    /// User ID of the peer.
    pub uid: Option<u32>,
    /// Group ID of the peer.
    pub gid: Option<u32>,
}

impl Credentials {
    /// A triple with nothing learned yet.
    #[must_use]
    pub const fn unset() -> Self {
        Self {
            pid: None,
            uid: None,
            gid: None,
        }
    }

    /// The calling process's own credentials.
    #[must_use]
    pub fn from_current_process() -> Self {
        #[allow(clippy::cast_sign_loss)]
        Self {
            pid: Some(getpid().as_raw() as u32),
            uid: Some(getuid().as_raw()),
            gid: Some(getgid().as_raw()),
        }
    }

    /// Whether both triples carry the same, known user ID.
    ///
    /// This is the identity check a server applies when no user predicate
    /// is installed: the connecting user must be the server's own.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        match (self.uid, other.uid) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}
