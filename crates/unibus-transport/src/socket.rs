//! Stream-socket backend: unix domain and TCP.
//!
//! One backend serves both socket families; they differ only in the
//! pre-auth credential exchange. The wire always starts with a single
//! NUL byte from the client — on a unix socket it is sent with an
//! `SCM_CREDENTIALS` ancillary message and received under `SO_PASSCRED`,
//! so the server learns a kernel-verified pid/uid/gid before the SASL
//! dialog runs; on TCP the byte travels alone and the server must rely
//! on what the dialog claims.
//!
//! The backend owns two watches on the one descriptor. The read watch is
//! enabled except while the live-byte counter sits at or above the
//! receive threshold; the write watch is enabled only while output is
//! pending (credential byte, auth replies, or marshalled messages).
//! `do_iteration` drives the same read/write paths through `poll(2)`
//! instead of the host loop.
//!
//! Reads land directly in the auth session's or loader's buffer via the
//! get/return-buffer loan, so an allocation failure happens before the
//! `read(2)` and never loses wire bytes.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, sockopt, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
    UnixCredentials,
};
use unibus_core::address::AddressEntry;
use unibus_core::credentials::Credentials;
use unibus_core::mem::OomError;
use unibus_core::message::Message;

use crate::base::{Backend, BackendOps, IterationFlags, Transport, TransportBase};
use crate::error::Error;
use crate::open::OpenOutcome;
use crate::watch::{Condition, Watch};

/// Upper bound on bytes consumed from the wire in one read pass.
const READ_CHUNK: usize = 2048;

enum SocketStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.read(buf),
            Self::Tcp(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.write(buf),
            Self::Tcp(s) => s.write(buf),
        }
    }

    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Unix(s) => s.as_raw_fd(),
            Self::Tcp(s) => s.as_raw_fd(),
        }
    }

    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Unix(s) => s.as_fd(),
            Self::Tcp(s) => s.as_fd(),
        }
    }
}

pub(crate) struct SocketBackend {
    stream: Option<SocketStream>,
    read_watch: Option<Arc<Watch>>,
    write_watch: Option<Arc<Watch>>,
    outgoing: Option<Arc<Message>>,
    outgoing_pos: usize,
}

impl SocketBackend {
    fn new(stream: SocketStream) -> Self {
        Self {
            stream: Some(stream),
            read_watch: None,
            write_watch: None,
            outgoing: None,
            outgoing_pos: 0,
        }
    }
}

/// Wraps an already-connected unix stream as a client transport.
///
/// # Errors
///
/// Returns the I/O error from switching the stream to non-blocking mode.
pub fn unix_client_transport(stream: UnixStream, address: &str) -> io::Result<Transport> {
    stream.set_nonblocking(true)?;
    Ok(Transport::new(
        TransportBase::new(None, Some(address)),
        Backend::Socket(SocketBackend::new(SocketStream::Unix(stream))),
    ))
}

/// Wraps an accepted unix stream as a server transport advertising
/// `server_guid`. Enables `SO_PASSCRED` so the client's credential byte
/// carries kernel-verified identity.
///
/// # Errors
///
/// Returns the I/O error from socket option setup.
pub fn unix_server_transport(stream: UnixStream, server_guid: &str) -> io::Result<Transport> {
    stream.set_nonblocking(true)?;
    setsockopt(&stream, sockopt::PassCred, &true).map_err(io::Error::from)?;
    Ok(Transport::new(
        TransportBase::new(Some(server_guid), None),
        Backend::Socket(SocketBackend::new(SocketStream::Unix(stream))),
    ))
}

/// Wraps an already-connected TCP stream as a client transport.
///
/// # Errors
///
/// Returns the I/O error from switching the stream to non-blocking mode.
pub fn tcp_client_transport(stream: TcpStream, address: &str) -> io::Result<Transport> {
    stream.set_nonblocking(true)?;
    Ok(Transport::new(
        TransportBase::new(None, Some(address)),
        Backend::Socket(SocketBackend::new(SocketStream::Tcp(stream))),
    ))
}

/// Wraps an accepted TCP stream as a server transport advertising
/// `server_guid`. TCP carries no credential ancillary data; identity
/// rests on what the auth dialog claims.
///
/// # Errors
///
/// Returns the I/O error from switching the stream to non-blocking mode.
pub fn tcp_server_transport(stream: TcpStream, server_guid: &str) -> io::Result<Transport> {
    stream.set_nonblocking(true)?;
    Ok(Transport::new(
        TransportBase::new(Some(server_guid), None),
        Backend::Socket(SocketBackend::new(SocketStream::Tcp(stream))),
    ))
}

/// Opener for `tcp:host=...,port=...` entries.
pub(crate) fn open_tcp(entry: &AddressEntry) -> OpenOutcome {
    if entry.method() != "tcp" {
        return OpenOutcome::NotHandled;
    }
    let host = entry.get("host").unwrap_or("localhost");
    let Some(port) = entry.get("port") else {
        return OpenOutcome::Failed(Error::bad_address("tcp address requires a port"));
    };
    let Ok(port) = port.parse::<u16>() else {
        return OpenOutcome::Failed(Error::bad_address(format!(
            "tcp port {port:?} is not a number"
        )));
    };

    match TcpStream::connect((host, port)) {
        Ok(stream) => match tcp_client_transport(stream, &entry.to_string()) {
            Ok(transport) => OpenOutcome::Opened(transport),
            Err(err) => OpenOutcome::Failed(Error::did_not_connect(
                format!("failed to set up socket for {host}:{port}"),
                err,
            )),
        },
        Err(err) => OpenOutcome::Failed(Error::did_not_connect(
            format!("failed to connect to {host}:{port}"),
            err,
        )),
    }
}

/// Opener for `unix:path=...` entries.
pub(crate) fn open_unix(entry: &AddressEntry) -> OpenOutcome {
    if entry.method() != "unix" {
        return OpenOutcome::NotHandled;
    }
    let Some(path) = entry.get("path") else {
        return OpenOutcome::Failed(Error::bad_address("unix address requires a path"));
    };

    match UnixStream::connect(path) {
        Ok(stream) => match unix_client_transport(stream, &entry.to_string()) {
            Ok(transport) => OpenOutcome::Opened(transport),
            Err(err) => OpenOutcome::Failed(Error::did_not_connect(
                format!("failed to set up socket for {path}"),
                err,
            )),
        },
        Err(err) => OpenOutcome::Failed(Error::did_not_connect(
            format!("failed to connect to socket {path}"),
            err,
        )),
    }
}

impl SocketBackend {
    /// Enables the write watch exactly while output is pending.
    fn check_write_watch(&mut self, base: &mut TransportBase) {
        if base.disconnected {
            return;
        }
        let Some(watch) = &self.write_watch else {
            return;
        };
        let pending = if base.authenticated {
            self.outgoing.is_some()
                || base
                    .connection()
                    .is_some_and(|conn| conn.first_outgoing().is_some())
        } else {
            base.send_credentials_pending || !base.auth.bytes_to_send().is_empty()
        };
        if watch.is_enabled() != pending {
            watch.set_enabled(pending);
            if let Some(conn) = base.connection() {
                conn.watch_toggled(watch);
            }
        }
    }

    /// Enables the read watch exactly while we are willing to buffer
    /// more: below the live-byte threshold.
    fn check_read_watch(&mut self, base: &mut TransportBase) {
        if base.disconnected {
            return;
        }
        let Some(watch) = &self.read_watch else {
            return;
        };
        let want = base.live_messages_size.value() < base.max_live_messages_size;
        if watch.is_enabled() != want {
            tracing::trace!(enable = want, "toggling read watch for backpressure");
            watch.set_enabled(want);
            if let Some(conn) = base.connection() {
                conn.watch_toggled(watch);
            }
        }
    }

    fn send_credentials(&mut self, base: &mut TransportBase) {
        let Some(stream) = &mut self.stream else {
            return;
        };
        match stream {
            SocketStream::Unix(s) => {
                let creds = UnixCredentials::new();
                let iov = [IoSlice::new(&[0u8])];
                let cmsg = [ControlMessage::ScmCredentials(&creds)];
                match sendmsg::<UnixAddr>(s.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None) {
                    Ok(_) => {
                        tracing::trace!("sent credential byte with SCM_CREDENTIALS");
                        base.send_credentials_pending = false;
                    }
                    Err(nix::errno::Errno::EAGAIN) => {}
                    Err(err) => {
                        tracing::warn!(%err, "failed to send credential byte");
                        base.disconnect_with(self);
                    }
                }
            }
            SocketStream::Tcp(_) => match stream.write(&[0u8]) {
                Ok(1) => {
                    tracing::trace!("sent bare credential byte");
                    base.send_credentials_pending = false;
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    tracing::warn!(%err, "failed to send credential byte");
                    base.disconnect_with(self);
                }
            },
        }
    }

    fn read_credentials(&mut self, base: &mut TransportBase) {
        let Some(stream) = &mut self.stream else {
            return;
        };
        let mut byte = [0xffu8; 1];
        let (nread, creds) = match stream {
            SocketStream::Unix(s) => {
                let fd = s.as_raw_fd();
                let mut iov = [IoSliceMut::new(&mut byte)];
                let mut space = nix::cmsg_space!(UnixCredentials);
                match recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut space), MsgFlags::empty()) {
                    Ok(msg) => {
                        let mut creds = None;
                        if let Ok(cmsgs) = msg.cmsgs() {
                            for cmsg in cmsgs {
                                if let ControlMessageOwned::ScmCredentials(ucred) = cmsg {
                                    creds = Some(ucred);
                                }
                            }
                        }
                        (msg.bytes, creds)
                    }
                    Err(nix::errno::Errno::EAGAIN) => return,
                    Err(err) => {
                        tracing::warn!(%err, "failed to read credential byte");
                        base.disconnect_with(self);
                        return;
                    }
                }
            }
            SocketStream::Tcp(s) => match s.read(&mut byte) {
                Ok(n) => (n, None),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    tracing::warn!(%err, "failed to read credential byte");
                    base.disconnect_with(self);
                    return;
                }
            },
        };

        if nread == 0 {
            tracing::debug!("peer closed before sending credentials");
            base.disconnect_with(self);
            return;
        }
        if byte[0] != 0 {
            tracing::warn!(byte = byte[0], "credential byte was not nul");
            base.disconnect_with(self);
            return;
        }

        if let Some(ucred) = creds {
            #[allow(clippy::cast_sign_loss)]
            let learned = Credentials {
                pid: Some(ucred.pid() as u32),
                uid: Some(ucred.uid()),
                gid: Some(ucred.gid()),
            };
            tracing::debug!(
                pid = learned.pid,
                uid = learned.uid,
                "received peer credentials"
            );
            base.credentials = learned;
        } else {
            tracing::debug!("credential byte carried no ancillary identity");
        }
        base.auth.set_peer_credentials(base.credentials);
        base.receive_credentials_pending = false;
    }

    /// Pulls bytes off the wire into the auth session or the loader,
    /// then converts whatever became deliverable.
    fn do_reading(&mut self, base: &mut TransportBase) -> Result<(), OomError> {
        if base.disconnected {
            return Ok(());
        }
        if base.live_messages_size.value() >= base.max_live_messages_size {
            // Backpressured; leave bytes in the kernel buffer.
            return Ok(());
        }

        if base.receive_credentials_pending {
            self.read_credentials(base);
            if base.receive_credentials_pending || base.disconnected {
                return Ok(());
            }
        }

        let Some(stream) = &mut self.stream else {
            return Ok(());
        };

        // Grow the target buffer before reading so an allocation failure
        // costs nothing. Bytes keep routing through the auth session
        // until its trailing bytes have been migrated, which preserves
        // stream order across an interrupted transfer.
        let mut eof = false;
        if base.authenticated && base.unused_bytes_recovered {
            let buf = base.loader.get_buffer(READ_CHUNK)?;
            match stream.read(buf) {
                Ok(0) => {
                    base.loader.return_buffer(0);
                    eof = true;
                }
                Ok(n) => base.loader.return_buffer(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    base.loader.return_buffer(0);
                }
                Err(err) => {
                    base.loader.return_buffer(0);
                    tracing::warn!(%err, "read failed");
                    eof = true;
                }
            }
        } else {
            let buf = base.auth.get_buffer(READ_CHUNK)?;
            match stream.read(buf) {
                Ok(0) => {
                    base.auth.return_buffer(0);
                    eof = true;
                }
                Ok(n) => base.auth.return_buffer(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    base.auth.return_buffer(0);
                }
                Err(err) => {
                    base.auth.return_buffer(0);
                    tracing::warn!(%err, "read failed");
                    eof = true;
                }
            }
        }

        if eof {
            tracing::debug!("peer closed the stream");
            base.disconnect_with(self);
            return Ok(());
        }

        let result = base.queue_messages_with(self);
        self.check_write_watch(base);
        self.check_read_watch(base);
        result
    }

    /// Flushes pending output: the credential byte, then auth replies,
    /// then marshalled messages pulled from the connection.
    fn do_writing(&mut self, base: &mut TransportBase) -> Result<(), OomError> {
        if base.disconnected {
            return Ok(());
        }

        if base.send_credentials_pending {
            self.send_credentials(base);
            if base.send_credentials_pending || base.disconnected {
                self.check_write_watch(base);
                return Ok(());
            }
        }

        let mut result = Ok(());
        if base.authenticated {
            self.write_messages(base);
        } else {
            result = self.write_auth_bytes(base);
        }
        self.check_write_watch(base);
        result
    }

    fn write_auth_bytes(&mut self, base: &mut TransportBase) -> Result<(), OomError> {
        loop {
            match base.auth.do_work() {
                unibus_core::auth::AuthState::HaveBytesToSend => {
                    let Some(stream) = &mut self.stream else {
                        return Ok(());
                    };
                    match stream.write(base.auth.bytes_to_send()) {
                        Ok(0) => return Ok(()),
                        Ok(n) => base.auth.bytes_sent(n),
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            tracing::warn!(%err, "auth write failed");
                            base.disconnect_with(self);
                            return Ok(());
                        }
                    }
                }
                unibus_core::auth::AuthState::WaitingForMemory => return Err(OomError),
                unibus_core::auth::AuthState::NeedDisconnect => {
                    tracing::debug!("auth dialog failed");
                    base.disconnect_with(self);
                    return Ok(());
                }
                unibus_core::auth::AuthState::WaitingForInput
                | unibus_core::auth::AuthState::Authenticated => return Ok(()),
            }
        }
    }

    fn write_messages(&mut self, base: &mut TransportBase) {
        loop {
            if self.outgoing.is_none() {
                let Some(conn) = base.connection() else {
                    return;
                };
                let Some(message) = conn.first_outgoing() else {
                    return;
                };
                self.outgoing = Some(message);
                self.outgoing_pos = 0;
            }
            let message = self.outgoing.clone().expect("outgoing message present");
            let data = message.marshalled();

            let Some(stream) = &mut self.stream else {
                return;
            };
            match stream.write(&data[self.outgoing_pos..]) {
                Ok(n) => {
                    self.outgoing_pos += n;
                    if self.outgoing_pos == data.len() {
                        tracing::trace!(
                            serial = message.serial(),
                            size = data.len(),
                            "message fully written"
                        );
                        if let Some(conn) = base.connection() {
                            conn.message_sent(&message);
                        }
                        self.outgoing = None;
                        self.outgoing_pos = 0;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    tracing::warn!(%err, "message write failed");
                    base.disconnect_with(self);
                    return;
                }
            }
        }
    }
}

impl BackendOps for SocketBackend {
    fn disconnect(&mut self, base: &mut TransportBase) {
        let connection = base.connection();
        for watch in [self.read_watch.take(), self.write_watch.take()]
            .into_iter()
            .flatten()
        {
            if let Some(conn) = &connection {
                conn.remove_watch(&watch);
            }
            watch.invalidate();
        }
        self.outgoing = None;
        self.outgoing_pos = 0;
        // Dropping the stream closes the descriptor.
        self.stream = None;
    }

    fn do_iteration(&mut self, base: &mut TransportBase, flags: IterationFlags, timeout_ms: i32) {
        let Some(stream) = &self.stream else {
            return;
        };

        let read_gated = self
            .read_watch
            .as_ref()
            .is_some_and(|watch| !watch.is_enabled());
        let want_read = flags.contains(IterationFlags::DO_READING)
            && !read_gated
            && base.live_messages_size.value() < base.max_live_messages_size;
        let want_write = flags.contains(IterationFlags::DO_WRITING)
            && (base.send_credentials_pending
                || !base.authenticated
                || self.outgoing.is_some()
                || base
                    .connection()
                    .is_some_and(|conn| conn.first_outgoing().is_some()));
        if !want_read && !want_write {
            return;
        }

        let mut events = PollFlags::empty();
        if want_read {
            events |= PollFlags::POLLIN;
        }
        if want_write {
            events |= PollFlags::POLLOUT;
        }

        let timeout = if flags.contains(IterationFlags::BLOCK) {
            if timeout_ms < 0 {
                PollTimeout::NONE
            } else {
                PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX)
            }
        } else {
            PollTimeout::ZERO
        };

        let revents = {
            let mut fds = [PollFd::new(stream.as_fd(), events)];
            match poll(&mut fds, timeout) {
                Ok(0) => PollFlags::empty(),
                Ok(_) => fds[0].revents().unwrap_or(PollFlags::empty()),
                Err(nix::errno::Errno::EINTR) => PollFlags::empty(),
                Err(err) => {
                    tracing::warn!(%err, "poll failed during iteration");
                    PollFlags::empty()
                }
            }
        };

        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
            if let Err(OomError) = self.do_reading(base) {
                tracing::debug!("iteration read ran out of memory, will retry");
            }
        }
        if !base.disconnected && revents.contains(PollFlags::POLLOUT) {
            if let Err(OomError) = self.do_writing(base) {
                tracing::debug!("iteration write ran out of memory, will retry");
            }
        }
    }

    fn handle_watch(
        &mut self,
        base: &mut TransportBase,
        watch: &Arc<Watch>,
        condition: Condition,
    ) -> Result<(), OomError> {
        let is_read = self
            .read_watch
            .as_ref()
            .is_some_and(|own| Arc::ptr_eq(own, watch));
        let is_write = self
            .write_watch
            .as_ref()
            .is_some_and(|own| Arc::ptr_eq(own, watch));

        if is_read
            && condition.intersects(Condition::READABLE | Condition::HANGUP | Condition::ERROR)
        {
            self.do_reading(base)?;
        }
        if is_write && condition.intersects(Condition::WRITABLE) && !base.disconnected {
            self.do_writing(base)?;
        }
        Ok(())
    }

    fn connection_set(&mut self, base: &mut TransportBase) -> Result<(), OomError> {
        let Some(stream) = &self.stream else {
            return Ok(());
        };
        let Some(conn) = base.connection() else {
            return Ok(());
        };
        let fd = stream.as_raw_fd();
        let read_watch = Arc::new(Watch::new(fd, Condition::READABLE, true));
        let write_watch = Arc::new(Watch::new(fd, Condition::WRITABLE, false));

        conn.add_watch(Arc::clone(&read_watch))?;
        if let Err(err) = conn.add_watch(Arc::clone(&write_watch)) {
            conn.remove_watch(&read_watch);
            return Err(err);
        }
        self.read_watch = Some(read_watch);
        self.write_watch = Some(write_watch);

        // A client has output from the start: the credential byte.
        self.check_write_watch(base);
        Ok(())
    }

    fn socket_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(SocketStream::as_raw_fd)
    }

    fn live_messages_changed(&mut self, base: &mut TransportBase) {
        self.check_read_watch(base);
    }
}
