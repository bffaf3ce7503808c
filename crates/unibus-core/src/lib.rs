//! # unibus-core
//!
//! Core primitives for the unibus IPC stack: the pieces the message
//! transport is assembled from, kept free of any socket machinery.
//!
//! ## Module Overview
//!
//! - [`mem`]: fallible allocation facade with failure injection and guard
//!   bands ([`mem::HeapBuf`], [`mem::fallible_reserve`])
//! - [`counter`]: live-byte accounting with threshold notification
//!   ([`counter::Counter`])
//! - [`credentials`]: process credential triples ([`credentials::Credentials`])
//! - [`address`]: server address parsing ([`address::AddressEntry`])
//! - [`message`]: marshalled messages and the incremental loader
//!   ([`message::Message`], [`message::MessageLoader`])
//! - [`auth`]: the SASL authentication dialog ([`auth::AuthSession`])
//!
//! Everything here is synchronous and lock-free by itself; callers are
//! expected to serialize access the way the transport layer does, under
//! the owning connection's lock.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod address;
pub mod auth;
pub mod counter;
pub mod credentials;
pub mod mem;
pub mod message;

pub use address::{parse_address, AddressEntry, AddressError};
pub use auth::{AuthSession, AuthState};
pub use counter::Counter;
pub use credentials::Credentials;
pub use mem::{HeapBuf, OomError};
pub use message::{Message, MessageBuilder, MessageLoader, MessageType};
