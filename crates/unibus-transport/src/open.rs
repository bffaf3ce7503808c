//! The opener chain: address entry in, transport out.
//!
//! Each backend contributes an opener. Openers are tried in a fixed
//! order; one that does not recognize the entry's method steps aside
//! with [`OpenOutcome::NotHandled`], anything else ends the scan. An
//! address no opener claims is reported as an unknown address type.

use unibus_core::address::{parse_address, AddressEntry};

use crate::base::Transport;
use crate::error::Error;

/// What one opener did with an address entry.
pub(crate) enum OpenOutcome {
    /// The opener claimed the entry and produced a connected transport.
    Opened(Transport),
    /// Not this opener's method; try the next one.
    NotHandled,
    /// The opener claimed the entry but failed; the scan stops and the
    /// error is surfaced.
    Failed(Error),
}

type Opener = fn(&AddressEntry) -> OpenOutcome;

#[cfg(feature = "debug-pipe")]
const OPENERS: &[Opener] = &[
    crate::socket::open_tcp,
    crate::socket::open_unix,
    crate::autolaunch::open_autolaunch,
    crate::debug_pipe::open_debug_pipe,
];

#[cfg(not(feature = "debug-pipe"))]
const OPENERS: &[Opener] = &[
    crate::socket::open_tcp,
    crate::socket::open_unix,
    crate::autolaunch::open_autolaunch,
];

/// Opens a client transport for one address entry.
pub(crate) fn open(entry: &AddressEntry) -> Result<Transport, Error> {
    for opener in OPENERS {
        match opener(entry) {
            OpenOutcome::Opened(mut transport) => {
                if let Some(guid) = entry.get("guid") {
                    transport.base.expected_guid = Some(guid.to_owned());
                }
                tracing::debug!(entry = %entry, "opened transport");
                return Ok(transport);
            }
            OpenOutcome::NotHandled => {}
            OpenOutcome::Failed(err) => {
                tracing::debug!(entry = %entry, %err, "opener failed");
                return Err(err);
            }
        }
    }
    Err(Error::bad_address(
        "Unknown address type (examples of valid types are \"tcp\" and on UNIX \"unix\")",
    ))
}

/// Parses a full address and opens the first entry that connects.
///
/// Entries are tried in listed order; the first success wins, and the
/// last failure is reported if none does.
pub(crate) fn open_address(address: &str) -> Result<Transport, Error> {
    let entries = parse_address(address).map_err(|err| Error::bad_address(err.to_string()))?;
    let mut last_error = None;
    for entry in &entries {
        match open(entry) {
            Ok(transport) => return Ok(transport),
            Err(err) => last_error = Some(err),
        }
    }
    Err(last_error.expect("parse_address yields at least one entry"))
}
