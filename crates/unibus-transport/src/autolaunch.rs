//! The `autolaunch:` opener.
//!
//! Autolaunch is not a backend of its own: it locates (or starts) a
//! session bus, obtains its real address, and recurses into the opener
//! chain with that. The environment is consulted first so an already
//! running session is reused; otherwise `dbus-launch` is spawned and its
//! shell-syntax output parsed for the address line.

use std::process::Command;

use unibus_core::address::AddressEntry;

use crate::error::Error;
use crate::open::OpenOutcome;

const SESSION_ADDRESS_VAR: &str = "DBUS_SESSION_BUS_ADDRESS";

pub(crate) fn open_autolaunch(entry: &AddressEntry) -> OpenOutcome {
    if entry.method() != "autolaunch" {
        return OpenOutcome::NotHandled;
    }
    let address = match autolaunch_address() {
        Ok(address) => address,
        Err(err) => return OpenOutcome::Failed(err),
    };
    tracing::debug!(address, "autolaunch resolved a session bus address");
    match crate::open::open_address(&address) {
        Ok(transport) => OpenOutcome::Opened(transport),
        Err(err) => OpenOutcome::Failed(err),
    }
}

/// Finds the session bus address: environment first, then `dbus-launch`.
fn autolaunch_address() -> Result<String, Error> {
    if let Ok(address) = std::env::var(SESSION_ADDRESS_VAR) {
        if !address.is_empty() {
            return Ok(address);
        }
    }

    let output = Command::new("dbus-launch")
        .arg("--sh-syntax")
        .output()
        .map_err(|err| Error::did_not_connect("failed to spawn dbus-launch", err))?;
    if !output.status.success() {
        return Err(Error::did_not_connect_msg(format!(
            "dbus-launch exited with {}",
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_launcher_output(&stdout).ok_or_else(|| {
        Error::did_not_connect_msg("dbus-launch output carried no session bus address")
    })
}

/// Extracts the address from `DBUS_SESSION_BUS_ADDRESS='...';` output.
fn parse_launcher_output(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        let Some(rest) = line.strip_prefix(SESSION_ADDRESS_VAR) else {
            continue;
        };
        let rest = rest.trim_start_matches('=');
        let rest = rest.trim_end_matches(';');
        let address = rest.trim_matches('\'').trim();
        if !address.is_empty() {
            return Some(address.to_owned());
        }
    }
    None
}
