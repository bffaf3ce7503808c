//! The contract the owning connection exposes to its transport.
//!
//! A connection owns exactly one transport and holds the only strong
//! handle to itself that the transport sees; the transport keeps a
//! [`Weak`](std::sync::Weak) back-reference, so the pair can never keep
//! each other alive. Every transport operation runs under the
//! connection's lock; implementations of this trait are called from
//! inside that lock and must not call back into the transport.

use std::sync::Arc;

use unibus_core::mem::OomError;
use unibus_core::message::Message;

use crate::watch::{Timeout, Watch};

/// Services a connection provides to its transport.
pub trait Connection: Send + Sync {
    /// Registers a watch with the host event loop.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] when the registration cannot be stored; the
    /// transport unwinds the operation that needed the watch.
    fn add_watch(&self, watch: Arc<Watch>) -> Result<(), OomError>;

    /// Removes a previously added watch.
    fn remove_watch(&self, watch: &Arc<Watch>);

    /// Notifies that `watch`'s enabled flag changed. The loop re-reads
    /// [`Watch::is_enabled`] before its next poll.
    fn watch_toggled(&self, watch: &Arc<Watch>);

    /// Registers a timer with the host event loop.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] when the registration cannot be stored.
    fn add_timeout(&self, timeout: Arc<Timeout>) -> Result<(), OomError>;

    /// Removes a previously added timer.
    fn remove_timeout(&self, timeout: &Arc<Timeout>);

    /// Hands a fully parsed incoming message to the connection's
    /// received queue. The message already carries its live-byte
    /// counter adoption.
    fn queue_received_message(&self, message: Message);

    /// The oldest outgoing message, if any, left in place. The backend
    /// writes it (possibly across several iterations) and then calls
    /// [`Connection::message_sent`].
    fn first_outgoing(&self) -> Option<Arc<Message>>;

    /// Reports that `message` was fully written and should leave the
    /// outgoing queue.
    fn message_sent(&self, message: &Arc<Message>);
}
