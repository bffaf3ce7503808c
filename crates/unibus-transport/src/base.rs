//! Transport base: lifecycle, authentication gating, and dispatch.
//!
//! A [`Transport`] turns a raw, reliable byte stream into an
//! authenticated, flow-controlled channel of whole marshalled messages.
//! It composes four state machines behind one dispatch contract:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Connection (owner)            │  queues, lock
//! ├─────────────────────────────────────────┤
//! │            Transport base                │  auth gate, dispatch
//! ├──────────────┬──────────────────────────┤
//! │ Auth session │ Message loader │ Counter │
//! ├──────────────┴──────────────────────────┤
//! │           Backend (socket, pipe)         │  raw I/O, watches
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! `Fresh → Authenticating → Authenticated → Disconnected`, with
//! `Disconnected` terminal and reachable from anywhere. Two orthogonal
//! flags cover the pre-auth credential byte: the client sends first, the
//! server receives first. Once both are clear the SASL dialog runs;
//! completing it flips `authenticated` after the guid and identity
//! policy checks pass. Any policy failure disconnects immediately.
//!
//! # Concurrency
//!
//! Every operation here runs under the owning connection's lock — the
//! exclusive `&mut self` receivers are that lock made visible in the
//! types. The one cross-thread path is the live-byte counter notify,
//! which only flips an atomic flag; the next operation under the lock
//! observes it and lets the backend re-evaluate the read watch.
//!
//! The server-side user predicate is likewise called with the lock held
//! and must not block or reenter the connection.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use unibus_core::auth::{AuthSession, AuthState};
use unibus_core::counter::Counter;
use unibus_core::credentials::Credentials;
use unibus_core::mem::{check_alloc, OomError};
use unibus_core::message::MessageLoader;

use crate::connection::Connection;
use crate::watch::{Condition, Watch};

/// Default bound on bytes held by parsed-but-unreleased messages: 63 MiB.
pub const DEFAULT_MAX_LIVE_MESSAGES_SIZE: usize = 63 * 1024 * 1024;

/// What a transport iteration should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IterationFlags(u8);

impl IterationFlags {
    /// Read from the wire if possible.
    pub const DO_READING: Self = Self(1);
    /// Write to the wire if possible.
    pub const DO_WRITING: Self = Self(1 << 1);
    /// Block in poll up to the iteration timeout.
    pub const BLOCK: Self = Self(1 << 2);

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for IterationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Result of asking the transport whether buffered data remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// At least one parsed message is deliverable right now.
    DataRemains,
    /// Nothing deliverable; all caught up (or backpressured).
    Complete,
    /// An allocation failed mid-dispatch; retry when memory frees up.
    NeedMemory,
}

/// Server-side predicate deciding whether a connecting uid is allowed.
///
/// Runs with the connection lock held; it must be quick, must not block,
/// and must not call back into the connection.
pub type UnixUserFunction = Box<dyn FnMut(u32) -> bool + Send>;

/// Operations every backend variant supplies.
pub(crate) trait BackendOps {
    /// Tears down the I/O channel: deregister watches, close descriptors.
    fn disconnect(&mut self, base: &mut TransportBase);

    /// Polls and then reads/writes per `flags`, honoring `timeout_ms`
    /// (-1 means no timeout) when [`IterationFlags::BLOCK`] is set.
    fn do_iteration(&mut self, base: &mut TransportBase, flags: IterationFlags, timeout_ms: i32);

    /// Reacts to readiness on one of the backend's watches.
    fn handle_watch(
        &mut self,
        base: &mut TransportBase,
        watch: &Arc<Watch>,
        condition: Condition,
    ) -> Result<(), OomError>;

    /// Hook run when the transport is attached to its connection;
    /// registers watches.
    fn connection_set(&mut self, base: &mut TransportBase) -> Result<(), OomError>;

    /// The underlying socket descriptor, for backends that have one.
    fn socket_fd(&self) -> Option<RawFd> {
        None
    }

    /// Re-evaluates the read watch after the live-byte counter crossed
    /// the receive threshold in either direction.
    fn live_messages_changed(&mut self, base: &mut TransportBase) {
        let _ = base;
    }
}

/// The backend variant set. A tagged sum rather than a vtable, so adding
/// a backend forces every dispatch site to handle it.
pub(crate) enum Backend {
    Socket(crate::socket::SocketBackend),
    #[cfg(feature = "debug-pipe")]
    DebugPipe(crate::debug_pipe::DebugPipeBackend),
}

impl BackendOps for Backend {
    fn disconnect(&mut self, base: &mut TransportBase) {
        match self {
            Self::Socket(b) => b.disconnect(base),
            #[cfg(feature = "debug-pipe")]
            Self::DebugPipe(b) => b.disconnect(base),
        }
    }

    fn do_iteration(&mut self, base: &mut TransportBase, flags: IterationFlags, timeout_ms: i32) {
        match self {
            Self::Socket(b) => b.do_iteration(base, flags, timeout_ms),
            #[cfg(feature = "debug-pipe")]
            Self::DebugPipe(b) => b.do_iteration(base, flags, timeout_ms),
        }
    }

    fn handle_watch(
        &mut self,
        base: &mut TransportBase,
        watch: &Arc<Watch>,
        condition: Condition,
    ) -> Result<(), OomError> {
        match self {
            Self::Socket(b) => b.handle_watch(base, watch, condition),
            #[cfg(feature = "debug-pipe")]
            Self::DebugPipe(b) => b.handle_watch(base, watch, condition),
        }
    }

    fn connection_set(&mut self, base: &mut TransportBase) -> Result<(), OomError> {
        match self {
            Self::Socket(b) => b.connection_set(base),
            #[cfg(feature = "debug-pipe")]
            Self::DebugPipe(b) => b.connection_set(base),
        }
    }

    fn socket_fd(&self) -> Option<RawFd> {
        match self {
            Self::Socket(b) => b.socket_fd(),
            #[cfg(feature = "debug-pipe")]
            Self::DebugPipe(b) => b.socket_fd(),
        }
    }

    fn live_messages_changed(&mut self, base: &mut TransportBase) {
        match self {
            Self::Socket(b) => b.live_messages_changed(base),
            #[cfg(feature = "debug-pipe")]
            Self::DebugPipe(b) => b.live_messages_changed(base),
        }
    }
}

/// State shared by every backend variant.
pub(crate) struct TransportBase {
    pub(crate) loader: MessageLoader,
    pub(crate) auth: AuthSession,
    pub(crate) live_messages_size: Arc<Counter>,
    pub(crate) max_live_messages_size: usize,
    pub(crate) authenticated: bool,
    pub(crate) disconnected: bool,
    pub(crate) is_server: bool,
    pub(crate) send_credentials_pending: bool,
    pub(crate) receive_credentials_pending: bool,
    pub(crate) unused_bytes_recovered: bool,
    pub(crate) address: Option<String>,
    pub(crate) expected_guid: Option<String>,
    pub(crate) credentials: Credentials,
    pub(crate) connection: Option<Weak<dyn Connection>>,
    pub(crate) unix_user_function: Option<UnixUserFunction>,
    counter_notified: Arc<AtomicBool>,
}

impl TransportBase {
    /// Builds the base for a client (`address`) or server (`server_guid`)
    /// transport; exactly one of the two must be given.
    pub(crate) fn new(server_guid: Option<&str>, address: Option<&str>) -> Self {
        debug_assert!(
            server_guid.is_some() != address.is_some(),
            "server transports have a guid, client transports an address"
        );
        let is_server = server_guid.is_some();
        let auth = match server_guid {
            Some(guid) => AuthSession::server(guid),
            None => AuthSession::client(),
        };

        let base = Self {
            loader: MessageLoader::new(),
            auth,
            live_messages_size: Arc::new(Counter::new()),
            max_live_messages_size: DEFAULT_MAX_LIVE_MESSAGES_SIZE,
            authenticated: false,
            disconnected: false,
            is_server,
            send_credentials_pending: !is_server,
            receive_credentials_pending: is_server,
            unused_bytes_recovered: false,
            address: address.map(str::to_owned),
            expected_guid: None,
            credentials: Credentials::unset(),
            connection: None,
            unix_user_function: None,
            counter_notified: Arc::new(AtomicBool::new(false)),
        };
        base.install_counter_notify();
        if let Some(address) = &base.address {
            tracing::debug!(address, "initialized transport");
        }
        base
    }

    /// (Re-)registers the counter notify at the current threshold. The
    /// hook only flips a flag; see the module docs.
    fn install_counter_notify(&self) {
        let notified = Arc::clone(&self.counter_notified);
        self.live_messages_size.set_notify(
            self.max_live_messages_size,
            Some(Arc::new(move || {
                notified.store(true, Ordering::SeqCst);
            })),
        );
    }

    pub(crate) fn set_max_received_size(&mut self, size: usize) {
        self.max_live_messages_size = size;
        self.install_counter_notify();
    }

    /// Consumes a pending counter notification, if any.
    pub(crate) fn take_counter_notification(&mut self) -> bool {
        self.counter_notified.swap(false, Ordering::SeqCst)
    }

    /// The owning connection, while it is still alive.
    pub(crate) fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.as_ref().and_then(Weak::upgrade)
    }

    /// Idempotent teardown; only the first call reaches the backend.
    pub(crate) fn disconnect_with<B: BackendOps>(&mut self, backend: &mut B) {
        if self.disconnected {
            return;
        }
        tracing::debug!("disconnecting transport");
        backend.disconnect(self);
        self.disconnected = true;
    }

    /// The authentication gate. May drive the SASL dialog one step, may
    /// disconnect on guid or identity policy failure.
    pub(crate) fn authenticated_with<B: BackendOps>(&mut self, backend: &mut B) -> bool {
        if self.authenticated {
            return true;
        }
        if self.disconnected {
            return false;
        }

        let mut maybe = !(self.send_credentials_pending || self.receive_credentials_pending);
        if maybe {
            match self.auth.do_work() {
                AuthState::Authenticated => {}
                AuthState::NeedDisconnect => {
                    tracing::debug!("auth dialog failed, disconnecting");
                    self.disconnect_with(backend);
                    return false;
                }
                AuthState::HaveBytesToSend
                | AuthState::WaitingForInput
                | AuthState::WaitingForMemory => maybe = false,
            }
        }

        if maybe && !self.is_server {
            let Some(advertised) = self.auth.guid_from_server().map(str::to_owned) else {
                tracing::warn!("authenticated without a server guid, disconnecting");
                self.disconnect_with(backend);
                return false;
            };
            match &self.expected_guid {
                Some(expected) if *expected != advertised => {
                    tracing::warn!(
                        expected,
                        advertised,
                        "server guid does not match the pinned guid, disconnecting"
                    );
                    self.disconnect_with(backend);
                    return false;
                }
                Some(_) => {}
                None => {
                    if check_alloc(advertised.len()).is_err() {
                        tracing::debug!("no memory to adopt server guid, deferring auth");
                        return false;
                    }
                    self.expected_guid = Some(advertised);
                }
            }
        }

        if maybe && self.is_server {
            let identity = self.auth.identity();
            if let Some(function) = self.unix_user_function.as_mut() {
                let allowed = identity.uid.is_some_and(|uid| function(uid));
                if allowed {
                    tracing::debug!(uid = identity.uid, "client uid authorized by predicate");
                } else {
                    tracing::warn!(
                        uid = identity.uid,
                        "client uid rejected by predicate, disconnecting"
                    );
                    self.disconnect_with(backend);
                    return false;
                }
            } else {
                let ours = Credentials::from_current_process();
                if ours.matches(&identity) {
                    tracing::debug!(uid = identity.uid, "client uid matches our own");
                } else {
                    tracing::warn!(
                        client = identity.uid,
                        ours = ours.uid,
                        "client authorized as a different uid, disconnecting"
                    );
                    self.disconnect_with(backend);
                    return false;
                }
            }
        }

        self.authenticated = maybe;
        if maybe {
            tracing::debug!("transport authenticated");
        }
        maybe
    }

    /// One-shot migration of bytes the auth dialog over-read past the
    /// end-of-auth delimiter into the loader, preserving stream order.
    fn recover_unused_bytes(&mut self) -> Result<(), OomError> {
        if self.auth.needs_decoding() {
            let mut plaintext = BytesMut::new();
            self.auth
                .decode_data(self.auth.unused_bytes(), &mut plaintext)?;
            self.loader.feed(&plaintext)?;
            tracing::trace!(
                count = plaintext.len(),
                "decoded unused auth bytes into the loader"
            );
        } else {
            let Self { auth, loader, .. } = self;
            loader.feed(auth.unused_bytes())?;
            tracing::trace!(
                count = auth.unused_bytes().len(),
                "moved unused auth bytes into the loader"
            );
        }
        self.auth.delete_unused_bytes();
        Ok(())
    }

    /// The dispatch algorithm: backpressure gate, auth gate, one-shot
    /// trailing-byte transfer, then the loader.
    pub(crate) fn dispatch_status_with<B: BackendOps>(&mut self, backend: &mut B) -> DispatchStatus {
        if self.live_messages_size.value() >= self.max_live_messages_size {
            // Complete for now; the application must drain first.
            return DispatchStatus::Complete;
        }

        if !self.authenticated_with(backend) {
            if self.auth.do_work() == AuthState::WaitingForMemory {
                return DispatchStatus::NeedMemory;
            }
            if !self.authenticated_with(backend) {
                return DispatchStatus::Complete;
            }
        }

        if !self.unused_bytes_recovered {
            if self.recover_unused_bytes().is_err() {
                tracing::debug!("not enough memory to transfer unused auth bytes");
                return DispatchStatus::NeedMemory;
            }
            self.unused_bytes_recovered = true;
        }

        if self.loader.queue_messages().is_err() {
            return DispatchStatus::NeedMemory;
        }

        match self.loader.peek_message() {
            Some(next) => {
                let live = self.live_messages_size.value();
                // Hold a parsed message back when delivering it would put
                // the live total over the bound, unless nothing is live
                // at all (a single message may exceed the bound alone).
                if live > 0 && live + next.size() > self.max_live_messages_size {
                    DispatchStatus::Complete
                } else {
                    DispatchStatus::DataRemains
                }
            }
            None => DispatchStatus::Complete,
        }
    }

    /// Drains deliverable messages into the connection's received queue,
    /// tagging each with the live-byte counter. Disconnects on stream
    /// corruption.
    pub(crate) fn queue_messages_with<B: BackendOps>(
        &mut self,
        backend: &mut B,
    ) -> Result<(), OomError> {
        let mut status = self.dispatch_status_with(backend);
        while status == DispatchStatus::DataRemains {
            let Some(mut message) = self.loader.pop_message() else {
                break;
            };
            message.attach_size_counter(&self.live_messages_size);
            tracing::trace!(
                serial = message.serial(),
                size = message.size(),
                "queueing received message"
            );
            let Some(connection) = self.connection() else {
                // Owner already gone; nobody left to deliver to.
                drop(message);
                break;
            };
            connection.queue_received_message(message);
            status = self.dispatch_status_with(backend);
        }

        if self.loader.is_corrupted() {
            tracing::warn!("corrupted message stream, disconnecting");
            self.disconnect_with(backend);
        }

        if status == DispatchStatus::NeedMemory {
            Err(OomError)
        } else {
            Ok(())
        }
    }
}

/// An authenticated, flow-controlled message channel over a raw byte
/// stream.
///
/// Obtained from [`Transport::open`] on the client side or from a
/// backend-specific accept constructor on the server side, then attached
/// to its owner with [`Transport::set_connection`]. All methods must be
/// called under the owning connection's lock.
pub struct Transport {
    pub(crate) base: TransportBase,
    pub(crate) backend: Backend,
}

impl Transport {
    pub(crate) fn new(base: TransportBase, backend: Backend) -> Self {
        Self { base, backend }
    }

    /// Opens a client transport for one address entry, trying each
    /// registered backend opener in order.
    ///
    /// A `guid` field in the entry pins the server identity the
    /// authentication dialog must confirm.
    ///
    /// # Errors
    ///
    /// [`Error::BadAddress`] when no opener recognizes the method or the
    /// entry is malformed for its method, [`Error::DidNotConnect`] when
    /// the responsible opener failed to establish a session.
    ///
    /// [`Error::BadAddress`]: crate::error::Error::BadAddress
    /// [`Error::DidNotConnect`]: crate::error::Error::DidNotConnect
    pub fn open(entry: &unibus_core::address::AddressEntry) -> Result<Self, crate::error::Error> {
        crate::open::open(entry)
    }

    /// Parses `address` and opens the first entry that succeeds.
    ///
    /// # Errors
    ///
    /// As [`Transport::open`], plus [`Error::BadAddress`] for parse
    /// failures; the error of the last tried entry wins.
    ///
    /// [`Error::BadAddress`]: crate::error::Error::BadAddress
    pub fn open_address(address: &str) -> Result<Self, crate::error::Error> {
        crate::open::open_address(address)
    }

    /// Closes this end of the connection. Idempotent; every later I/O
    /// operation is a no-op.
    pub fn disconnect(&mut self) {
        self.base.disconnect_with(&mut self.backend);
    }

    /// Whether the transport has not been disconnected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.base.disconnected
    }

    /// Whether authentication has completed. May drive the dialog one
    /// step, and may disconnect on guid or identity policy failure.
    /// Stays true after disconnection.
    pub fn is_authenticated(&mut self) -> bool {
        self.base.authenticated_with(&mut self.backend)
    }

    /// The address this client transport was opened from; `None` on the
    /// server side.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.base.address.as_deref()
    }

    /// Reacts to readiness reported by the host loop for `watch`.
    ///
    /// No-op on a disconnected transport or an invalidated watch. The
    /// condition is sanitized against the watch's interest first.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] when handling ran out of memory; the caller
    /// should retry once memory pressure clears.
    pub fn handle_watch(
        &mut self,
        watch: &Arc<Watch>,
        condition: Condition,
    ) -> Result<(), OomError> {
        self.flush_counter_notification();
        if self.base.disconnected {
            return Ok(());
        }
        if watch.fd() < 0 {
            tracing::warn!("asked to handle an invalidated watch; it should have been removed");
            return Ok(());
        }
        let condition = watch.sanitize_condition(condition);
        let result = self.backend.handle_watch(&mut self.base, watch, condition);
        self.flush_counter_notification();
        result
    }

    /// Performs one poll-read-write cycle. With [`IterationFlags::BLOCK`]
    /// the poll waits up to `timeout_ms` (-1 for no timeout); otherwise
    /// it only picks up readiness that is already there. An empty flag
    /// set is a no-op.
    pub fn do_iteration(&mut self, flags: IterationFlags, timeout_ms: i32) {
        tracing::trace!(
            ?flags,
            timeout_ms,
            connected = !self.base.disconnected,
            "transport iteration"
        );
        if !flags.intersects(IterationFlags::DO_READING | IterationFlags::DO_WRITING) {
            return;
        }
        if self.base.disconnected {
            return;
        }
        self.flush_counter_notification();
        self.backend.do_iteration(&mut self.base, flags, timeout_ms);
        self.flush_counter_notification();
    }

    /// Converts buffered bytes into messages on the connection's
    /// received queue, as far as backpressure allows. Disconnects on
    /// stream corruption.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] when an allocation failed before everything
    /// deliverable was queued; retryable.
    pub fn queue_messages(&mut self) -> Result<(), OomError> {
        self.flush_counter_notification();
        let result = self.base.queue_messages_with(&mut self.backend);
        self.flush_counter_notification();
        result
    }

    /// Reports whether buffered data remains to deliver, everything is
    /// caught up, or an allocation is needed to make progress.
    pub fn dispatch_status(&mut self) -> DispatchStatus {
        self.flush_counter_notification();
        self.base.dispatch_status_with(&mut self.backend)
    }

    /// The underlying socket descriptor, for backends that have one.
    /// `None` once disconnected.
    #[must_use]
    pub fn socket_fd(&self) -> Option<RawFd> {
        if self.base.disconnected {
            return None;
        }
        self.backend.socket_fd()
    }

    /// Attaches the owning connection. One-shot; the backend registers
    /// its watches here.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] when watch registration failed; the
    /// transport stays unattached and the call may be retried.
    pub fn set_connection(&mut self, connection: &Arc<dyn Connection>) -> Result<(), OomError> {
        debug_assert!(self.base.connection.is_none(), "connection attached twice");
        self.base.connection = Some(Arc::downgrade(connection));
        if let Err(err) = self.backend.connection_set(&mut self.base) {
            self.base.connection = None;
            return Err(err);
        }
        Ok(())
    }

    /// Caps the size of a single marshalled message.
    pub fn set_max_message_size(&mut self, size: usize) {
        self.base.loader.set_max_message_size(size);
    }

    /// The cap on a single marshalled message.
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.base.loader.max_message_size()
    }

    /// Bounds the bytes held by parsed-but-unreleased incoming messages
    /// and re-registers the counter notify at the new threshold.
    pub fn set_max_received_size(&mut self, size: usize) {
        self.base.set_max_received_size(size);
    }

    /// The live-byte bound.
    #[must_use]
    pub fn max_received_size(&self) -> usize {
        self.base.max_live_messages_size
    }

    /// The authenticated peer uid, once authentication completed.
    #[must_use]
    pub fn unix_user(&self) -> Option<u32> {
        if !self.base.authenticated {
            return None;
        }
        self.base.auth.identity().uid
    }

    /// The authenticated peer process id, when the platform provided
    /// one.
    #[must_use]
    pub fn unix_process_id(&self) -> Option<u32> {
        if !self.base.authenticated {
            return None;
        }
        self.base.auth.identity().pid
    }

    /// Installs (or clears) the server-side uid predicate, returning the
    /// previous one so the caller can drop it outside the lock.
    pub fn set_unix_user_function(
        &mut self,
        function: Option<UnixUserFunction>,
    ) -> Option<UnixUserFunction> {
        std::mem::replace(&mut self.base.unix_user_function, function)
    }

    /// Restricts the authentication mechanisms offered or accepted.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] on injected allocation failure.
    pub fn set_auth_mechanisms(&mut self, mechanisms: &[&str]) -> Result<(), OomError> {
        self.base.auth.set_mechanisms(mechanisms)
    }

    fn flush_counter_notification(&mut self) {
        if self.base.take_counter_notification() {
            self.backend.live_messages_changed(&mut self.base);
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if !self.base.disconnected {
            self.disconnect();
        }
        self.base.live_messages_size.set_notify(0, None);
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("address", &self.base.address)
            .field("is_server", &self.base.is_server)
            .field("authenticated", &self.base.authenticated)
            .field("disconnected", &self.base.disconnected)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, feature = "debug-pipe"))]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use unibus_core::message::{Message, MessageBuilder, MessageType};

    use crate::debug_pipe;
    use crate::watch::Timeout;

    const GUID: &str = "a1b2c3d4e5f60718a1b2c3d4e5f60718";

    #[derive(Default)]
    struct TestConnection {
        watches: Mutex<Vec<Arc<Watch>>>,
        timeouts: Mutex<Vec<Arc<Timeout>>>,
        received: Mutex<VecDeque<Message>>,
        outgoing: Mutex<VecDeque<Arc<Message>>>,
    }

    impl TestConnection {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn send(&self, message: Message) {
            self.outgoing.lock().unwrap().push_back(Arc::new(message));
        }

        fn received_count(&self) -> usize {
            self.received.lock().unwrap().len()
        }

        fn pop_received(&self) -> Option<Message> {
            self.received.lock().unwrap().pop_front()
        }
    }

    impl Connection for TestConnection {
        fn add_watch(&self, watch: Arc<Watch>) -> Result<(), OomError> {
            self.watches.lock().unwrap().push(watch);
            Ok(())
        }

        fn remove_watch(&self, watch: &Arc<Watch>) {
            self.watches.lock().unwrap().retain(|w| !Arc::ptr_eq(w, watch));
        }

        fn watch_toggled(&self, _watch: &Arc<Watch>) {}

        fn add_timeout(&self, timeout: Arc<Timeout>) -> Result<(), OomError> {
            self.timeouts.lock().unwrap().push(timeout);
            Ok(())
        }

        fn remove_timeout(&self, timeout: &Arc<Timeout>) {
            self.timeouts
                .lock()
                .unwrap()
                .retain(|t| !Arc::ptr_eq(t, timeout));
        }

        fn queue_received_message(&self, message: Message) {
            self.received.lock().unwrap().push_back(message);
        }

        fn first_outgoing(&self) -> Option<Arc<Message>> {
            self.outgoing.lock().unwrap().front().cloned()
        }

        fn message_sent(&self, message: &Arc<Message>) {
            let popped = self.outgoing.lock().unwrap().pop_front();
            assert!(popped.is_some_and(|m| Arc::ptr_eq(&m, message)));
        }
    }

    fn pipe_pair(name: &str, pin_guid: Option<&str>) -> (Transport, Transport, debug_pipe::DebugPipeListener) {
        let listener = debug_pipe::listen(name, GUID).unwrap();
        let address = match pin_guid {
            Some(guid) => format!("debug-pipe:name={name},guid={guid}"),
            None => format!("debug-pipe:name={name}"),
        };
        let client = Transport::open_address(&address).unwrap();
        let server = listener.accept().expect("server transport queued");
        (client, server, listener)
    }

    fn attach(transport: &mut Transport, connection: &Arc<TestConnection>) {
        let connection: Arc<dyn Connection> = connection.clone();
        transport.set_connection(&connection).unwrap();
    }

    fn pump(client: &mut Transport, server: &mut Transport, rounds: usize) {
        let both = IterationFlags::DO_READING | IterationFlags::DO_WRITING;
        for _ in 0..rounds {
            client.do_iteration(both, 0);
            server.do_iteration(both, 0);
        }
    }

    fn message_of_total_size(serial: u32, total: usize) -> Message {
        assert!(total >= unibus_core::message::HEADER_LEN);
        MessageBuilder::new(MessageType::MethodCall, serial)
            .body(&vec![0u8; total - unibus_core::message::HEADER_LEN])
            .build()
            .unwrap()
    }

    #[test]
    fn pipe_pair_authenticates_and_delivers_a_message() {
        let (mut client, mut server, _listener) = pipe_pair("base-auth", Some(GUID));
        let client_conn = TestConnection::new();
        let server_conn = TestConnection::new();
        attach(&mut client, &client_conn);
        attach(&mut server, &server_conn);

        pump(&mut client, &mut server, 12);
        assert!(client.is_authenticated());
        assert!(server.is_authenticated());
        assert_eq!(server.unix_user(), Credentials::from_current_process().uid);
        assert_eq!(client.base.expected_guid.as_deref(), Some(GUID));

        let message = message_of_total_size(7, 48);
        server_conn.send(message);
        pump(&mut client, &mut server, 4);

        assert_eq!(client_conn.received_count(), 1);
        let received = client_conn.pop_received().unwrap();
        assert_eq!(received.serial(), 7);
        assert_eq!(received.size(), 48);
        // Still adopted by the counter until the application drops it.
        assert_eq!(client.base.live_messages_size.value(), 48);
        drop(received);
        assert_eq!(client.base.live_messages_size.value(), 0);
    }

    #[test]
    fn unpinned_client_adopts_the_advertised_guid() {
        let (mut client, mut server, _listener) = pipe_pair("base-adopt", None);
        let client_conn = TestConnection::new();
        let server_conn = TestConnection::new();
        attach(&mut client, &client_conn);
        attach(&mut server, &server_conn);

        pump(&mut client, &mut server, 12);
        assert!(client.is_authenticated());
        assert_eq!(client.base.expected_guid.as_deref(), Some(GUID));
    }

    #[test]
    fn guid_mismatch_disconnects_without_delivering() {
        let (mut client, mut server, _listener) = pipe_pair("base-mismatch", Some("ffffffff"));
        let client_conn = TestConnection::new();
        let server_conn = TestConnection::new();
        attach(&mut client, &client_conn);
        attach(&mut server, &server_conn);

        let message = message_of_total_size(1, 48);
        server_conn.send(message);
        pump(&mut client, &mut server, 12);

        assert!(!client.is_authenticated());
        assert!(!client.is_connected());
        assert_eq!(client_conn.received_count(), 0);
    }

    #[test]
    fn server_predicate_gates_the_connecting_uid() {
        let (mut client, mut server, _listener) = pipe_pair("base-predicate-ok", Some(GUID));
        let client_conn = TestConnection::new();
        let server_conn = TestConnection::new();
        attach(&mut client, &client_conn);
        attach(&mut server, &server_conn);

        let seen = Arc::new(AtomicU32::new(0));
        let seen_by_predicate = Arc::clone(&seen);
        let previous = server.set_unix_user_function(Some(Box::new(move |uid| {
            seen_by_predicate.store(uid, Ordering::SeqCst);
            true
        })));
        assert!(previous.is_none());

        pump(&mut client, &mut server, 12);
        assert!(server.is_authenticated());
        assert_eq!(
            Some(seen.load(Ordering::SeqCst)),
            Credentials::from_current_process().uid
        );
    }

    #[test]
    fn server_predicate_rejection_disconnects() {
        let (mut client, mut server, _listener) = pipe_pair("base-predicate-no", Some(GUID));
        let client_conn = TestConnection::new();
        let server_conn = TestConnection::new();
        attach(&mut client, &client_conn);
        attach(&mut server, &server_conn);

        server.set_unix_user_function(Some(Box::new(|_uid| false)));
        pump(&mut client, &mut server, 12);

        assert!(!server.is_authenticated());
        assert!(!server.is_connected());
    }

    #[test]
    fn backpressure_holds_the_third_message_in_the_loader() {
        let (mut client, mut server, _listener) = pipe_pair("base-backpressure", Some(GUID));
        let client_conn = TestConnection::new();
        let server_conn = TestConnection::new();
        attach(&mut client, &client_conn);
        attach(&mut server, &server_conn);
        client.set_max_received_size(100);

        for serial in 1..=3 {
            server_conn.send(message_of_total_size(serial, 40));
        }
        pump(&mut client, &mut server, 12);

        // Two delivered (80 live bytes); the third would cross the bound.
        assert_eq!(client_conn.received_count(), 2);
        assert_eq!(client.base.live_messages_size.value(), 80);
        assert!(client.base.loader.peek_message().is_some());
        assert_eq!(client.dispatch_status(), DispatchStatus::Complete);

        // Releasing one message makes room; the third follows.
        drop(client_conn.pop_received());
        assert_eq!(client.base.live_messages_size.value(), 40);
        client.queue_messages().unwrap();
        assert_eq!(client_conn.received_count(), 2);
        assert_eq!(client.base.live_messages_size.value(), 80);
        assert!(client.base.loader.peek_message().is_none());
    }

    #[test]
    fn an_oversized_message_still_passes_when_nothing_is_live() {
        let (mut client, mut server, _listener) = pipe_pair("base-oversize", Some(GUID));
        let client_conn = TestConnection::new();
        let server_conn = TestConnection::new();
        attach(&mut client, &client_conn);
        attach(&mut server, &server_conn);
        client.set_max_received_size(100);

        // A single 120-byte message exceeds the bound on its own; with
        // nothing live it is still delivered (the bound would otherwise
        // deadlock), overshooting by at most one message.
        server_conn.send(message_of_total_size(1, 120));
        pump(&mut client, &mut server, 12);
        assert_eq!(client_conn.received_count(), 1);
        assert_eq!(client.base.live_messages_size.value(), 120);
    }

    #[test]
    fn trailing_bytes_transfer_exactly_once() {
        let (mut client, _server, _listener) = pipe_pair("base-trailing", Some(GUID));
        let client_conn = TestConnection::new();
        attach(&mut client, &client_conn);

        // Drive the client's auth dialog by hand: flush AUTH, then feed
        // the server's acceptance plus eight message-prefix bytes in one
        // chunk, then flush BEGIN.
        client.base.send_credentials_pending = false;
        assert_eq!(
            client.base.auth.do_work(),
            unibus_core::auth::AuthState::HaveBytesToSend
        );
        let n = client.base.auth.bytes_to_send().len();
        client.base.auth.bytes_sent(n);

        let trailing = b"l\x01\x00\x01PRE!";
        let mut chunk = format!("OK {GUID}\r\n").into_bytes();
        chunk.extend_from_slice(trailing);
        client.base.auth.bytes_received(&chunk).unwrap();
        assert_eq!(
            client.base.auth.do_work(),
            unibus_core::auth::AuthState::HaveBytesToSend
        );
        let n = client.base.auth.bytes_to_send().len();
        client.base.auth.bytes_sent(n);

        assert!(!client.base.unused_bytes_recovered);
        assert_eq!(client.dispatch_status(), DispatchStatus::Complete);
        assert!(client.base.authenticated);
        assert!(client.base.unused_bytes_recovered);
        assert_eq!(client.base.loader.pending_bytes(), trailing);
        assert!(client.base.auth.unused_bytes().is_empty());

        // A second dispatch must not transfer again.
        assert_eq!(client.dispatch_status(), DispatchStatus::Complete);
        assert_eq!(client.base.loader.pending_bytes(), trailing);
    }

    #[test]
    fn disconnect_is_idempotent_and_gates_every_operation() {
        let (mut client, mut server, _listener) = pipe_pair("base-disconnect", Some(GUID));
        let client_conn = TestConnection::new();
        let server_conn = TestConnection::new();
        attach(&mut client, &client_conn);
        attach(&mut server, &server_conn);
        pump(&mut client, &mut server, 12);
        assert!(client.is_authenticated());

        client.disconnect();
        assert!(!client.is_connected());
        client.disconnect();
        assert!(!client.is_connected());

        // Operations on a terminal transport are clean no-ops.
        server_conn.send(message_of_total_size(9, 48));
        pump(&mut client, &mut server, 4);
        assert_eq!(client_conn.received_count(), 0);
        client.queue_messages().unwrap();
        assert!(client.socket_fd().is_none());
        let both = IterationFlags::DO_READING | IterationFlags::DO_WRITING;
        client.do_iteration(both, 10);
        // Authenticated state survives disconnection.
        assert!(client.is_authenticated());
    }

    #[test]
    fn empty_iteration_flags_are_a_no_op() {
        let (mut client, _server, _listener) = pipe_pair("base-noflags", Some(GUID));
        let client_conn = TestConnection::new();
        attach(&mut client, &client_conn);
        client.do_iteration(IterationFlags::default(), -1);
        client.do_iteration(IterationFlags::BLOCK, 50);
        assert!(client.is_connected());
    }

    #[test]
    fn message_size_limits_are_forwarded_to_the_loader() {
        let (mut client, _server, _listener) = pipe_pair("base-limits", Some(GUID));
        client.set_max_message_size(4096);
        assert_eq!(client.max_message_size(), 4096);
        client.set_max_received_size(512);
        assert_eq!(client.max_received_size(), 512);
    }

    #[test]
    fn identity_is_unavailable_before_authentication() {
        let (mut client, _server, _listener) = pipe_pair("base-identity", Some(GUID));
        assert_eq!(client.unix_user(), None);
        assert_eq!(client.unix_process_id(), None);
        assert!(!client.is_authenticated());
    }
}
