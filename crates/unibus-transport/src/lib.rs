//! # unibus-transport
//!
//! The message-transport layer of the unibus IPC stack: takes a raw,
//! reliable, ordered byte stream (a unix domain or TCP socket) and turns
//! it into an authenticated, credential-aware, flow-controlled channel
//! over which whole marshalled messages flow in each direction.
//!
//! # Architecture
//!
//! ```text
//! host loop ──watch ready──> Connection ──> Transport::handle_watch
//!                                              │
//!                             backend reads ───┤── auth session (until
//!                                              │    authenticated)
//!                                              └── message loader ──>
//!                                  Connection received queue (tagged
//!                                  with the live-byte counter)
//! ```
//!
//! The transport consumes an abstract watch/timeout registration
//! interface (the [`Connection`] trait) instead of talking to any event
//! loop; the owning connection wires those registrations to whatever
//! loop the application runs. Incoming backpressure is a single
//! mechanism: parsed-but-unreleased message bytes are accounted in a
//! counter, and the backend's read watch is disabled while the count
//! sits at or above the configured bound.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use unibus_transport::{Connection, Transport};
//!
//! # fn connection() -> Arc<dyn Connection> { unimplemented!() }
//! let mut transport = Transport::open_address("unix:path=/run/bus,guid=1234abcd")?;
//! let connection: Arc<dyn Connection> = connection();
//! transport.set_connection(&connection)?;
//! // ... hand watch callbacks from the loop to transport.handle_watch
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Server side, wrap each accepted stream:
//! [`socket::unix_server_transport`] / [`socket::tcp_server_transport`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod autolaunch;
mod base;
pub mod connection;
#[cfg(feature = "debug-pipe")]
pub mod debug_pipe;
pub mod error;
mod open;
pub mod socket;
pub mod watch;

pub use base::{
    DispatchStatus, IterationFlags, Transport, UnixUserFunction, DEFAULT_MAX_LIVE_MESSAGES_SIZE,
};
pub use connection::Connection;
pub use error::{Error, OomError};
pub use watch::{Condition, Timeout, Watch};

pub use unibus_core::address::{parse_address, AddressEntry, AddressError};
pub use unibus_core::credentials::Credentials;
pub use unibus_core::message::{Message, MessageBuilder, MessageType};
