//! SASL authentication dialog.
//!
//! The wire dialog is line-oriented: after the initial NUL byte (which the
//! transport exchanges out-of-band, together with socket credentials where
//! the platform supports them), the client and server trade CRLF-terminated
//! commands until the client's `BEGIN`, after which every byte belongs to
//! the message stream.
//!
//! ```text
//! C: AUTH EXTERNAL 31303030          (hex of the ASCII uid "1000")
//! S: OK 45afe1d073019a2971f7...      (server guid)
//! C: BEGIN
//! ```
//!
//! The session is a pull-driven state machine: the transport feeds it raw
//! bytes ([`AuthSession::bytes_received`]), asks it to make progress
//! ([`AuthSession::do_work`]), and drains whatever it queued for the wire
//! ([`AuthSession::bytes_to_send`]). Because a single read may carry bytes
//! past the `BEGIN`/`OK` delimiter, anything left over is retained as the
//! *unused bytes* slice in arrival order; the transport migrates it into
//! the message loader exactly once after authentication completes.
//!
//! Only the `EXTERNAL` mechanism is implemented: the client claims its
//! uid, and the server verifies the claim against the out-of-band socket
//! credentials when it has them. A rejected mechanism produces `REJECTED`
//! with the supported list, letting conforming clients fail cleanly.
//!
//! All buffer growth goes through the fallible allocation policy; an
//! injected failure surfaces as [`AuthState::WaitingForMemory`] and the
//! dialog resumes exactly where it stopped on the next call.

use bytes::{Buf, BytesMut};

use crate::credentials::Credentials;
use crate::mem::{check_alloc, fallible_reserve, OomError};

/// Commands longer than this are treated as a protocol violation.
const MAX_COMMAND_LINE: usize = 16 * 1024;

/// Progress report from [`AuthSession::do_work`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// The dialog needs more bytes from the peer.
    WaitingForInput,
    /// An allocation failed; retry after memory pressure clears.
    WaitingForMemory,
    /// There are bytes queued for the wire; flush them.
    HaveBytesToSend,
    /// The dialog failed; the transport must disconnect.
    NeedDisconnect,
    /// Authentication completed and all handshake bytes are flushed.
    Authenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientPhase {
    NeedSendAuth,
    WaitingForOk,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerPhase {
    WaitingForAuth,
    WaitingForBegin,
    Done,
    Failed,
}

#[derive(Debug)]
enum Role {
    Client {
        phase: ClientPhase,
        server_guid: Option<String>,
    },
    Server {
        phase: ServerPhase,
        guid: String,
    },
}

/// One side of the authentication dialog.
#[derive(Debug)]
pub struct AuthSession {
    role: Role,
    mechanisms: Vec<String>,
    incoming: BytesMut,
    outgoing: BytesMut,
    unused: BytesMut,
    identity: Credentials,
    peer_credentials: Credentials,
    security_layer: bool,
    loaned_from: Option<(bool, usize)>,
}

impl AuthSession {
    /// Creates the client side of a dialog.
    #[must_use]
    pub fn client() -> Self {
        Self::new(Role::Client {
            phase: ClientPhase::NeedSendAuth,
            server_guid: None,
        })
    }

    /// Creates the server side of a dialog advertising `guid`.
    #[must_use]
    pub fn server(guid: &str) -> Self {
        Self::new(Role::Server {
            phase: ServerPhase::WaitingForAuth,
            guid: guid.to_owned(),
        })
    }

    fn new(role: Role) -> Self {
        Self {
            role,
            mechanisms: vec!["EXTERNAL".to_owned()],
            incoming: BytesMut::new(),
            outgoing: BytesMut::new(),
            unused: BytesMut::new(),
            identity: Credentials::unset(),
            peer_credentials: Credentials::unset(),
            security_layer: false,
            loaned_from: None,
        }
    }

    /// Restricts the mechanisms this side will accept or offer.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] on injected allocation failure.
    pub fn set_mechanisms(&mut self, mechanisms: &[&str]) -> Result<(), OomError> {
        check_alloc(mechanisms.iter().map(|m| m.len()).sum())?;
        self.mechanisms = mechanisms.iter().map(|&m| m.to_owned()).collect();
        Ok(())
    }

    /// Records the peer credentials the transport learned out-of-band.
    pub fn set_peer_credentials(&mut self, credentials: Credentials) {
        self.peer_credentials = credentials;
    }

    /// The identity the peer authenticated as. Populated on the server
    /// side once `EXTERNAL` verification succeeds.
    #[must_use]
    pub fn identity(&self) -> Credentials {
        self.identity
    }

    /// The guid the server advertised, once the client has seen `OK`.
    #[must_use]
    pub fn guid_from_server(&self) -> Option<&str> {
        match &self.role {
            Role::Client { server_guid, .. } => server_guid.as_deref(),
            Role::Server { .. } => None,
        }
    }

    /// Feeds raw bytes from the wire, in arrival order.
    ///
    /// Bytes arriving after the dialog completed are appended to the
    /// unused-bytes slice instead, preserving stream order.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] when buffering fails; nothing is consumed and
    /// the same bytes can be fed again.
    pub fn bytes_received(&mut self, bytes: &[u8]) -> Result<(), OomError> {
        let target = if self.is_done() {
            &mut self.unused
        } else {
            &mut self.incoming
        };
        fallible_reserve(target, bytes.len())?;
        target.extend_from_slice(bytes);
        Ok(())
    }

    /// Loans out `len` writable bytes for a direct wire read; commit the
    /// bytes actually read with [`AuthSession::return_buffer`]. Growth
    /// happens before any I/O, so a failure here consumes nothing.
    ///
    /// Bytes land in the line buffer, or in the unused-bytes slice once
    /// the dialog has completed.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] when growing the buffer fails.
    pub fn get_buffer(&mut self, len: usize) -> Result<&mut [u8], OomError> {
        debug_assert!(self.loaned_from.is_none(), "read buffer loaned twice");
        let to_unused = self.is_done();
        let target = if to_unused {
            &mut self.unused
        } else {
            &mut self.incoming
        };
        fallible_reserve(target, len)?;
        let start = target.len();
        target.resize(start + len, 0);
        self.loaned_from = Some((to_unused, start));
        Ok(&mut target[start..])
    }

    /// Commits `used` bytes of the loaned read area.
    pub fn return_buffer(&mut self, used: usize) {
        let Some((to_unused, start)) = self.loaned_from.take() else {
            return;
        };
        let target = if to_unused {
            &mut self.unused
        } else {
            &mut self.incoming
        };
        target.truncate(start + used);
    }

    /// Bytes queued for the wire. Call [`AuthSession::bytes_sent`] after
    /// writing a prefix of them.
    #[must_use]
    pub fn bytes_to_send(&self) -> &[u8] {
        &self.outgoing
    }

    /// Marks `count` queued bytes as written.
    pub fn bytes_sent(&mut self, count: usize) {
        self.outgoing.advance(count);
    }

    /// Bytes that arrived past the end-of-auth delimiter.
    #[must_use]
    pub fn unused_bytes(&self) -> &[u8] {
        &self.unused
    }

    /// Discards the unused-byte slice after the transport migrated it.
    pub fn delete_unused_bytes(&mut self) {
        self.unused = BytesMut::new();
    }

    /// Whether wire data must pass through [`AuthSession::decode_data`]
    /// before the message loader sees it. True only when a mechanism
    /// negotiated a security layer; `EXTERNAL` never does.
    #[must_use]
    pub fn needs_decoding(&self) -> bool {
        self.security_layer
    }

    /// Decodes wire data through the negotiated security layer into
    /// `plaintext`. With no layer this is a plain copy.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] when growing `plaintext` fails; the output
    /// buffer is unchanged in that case.
    pub fn decode_data(&self, encoded: &[u8], plaintext: &mut BytesMut) -> Result<(), OomError> {
        fallible_reserve(plaintext, encoded.len())?;
        plaintext.extend_from_slice(encoded);
        Ok(())
    }

    /// Drives the dialog as far as the buffered input allows.
    pub fn do_work(&mut self) -> AuthState {
        loop {
            match self.advance_once() {
                Ok(true) => {}
                Ok(false) => break,
                Err(OomError) => return AuthState::WaitingForMemory,
            }
        }

        if self.is_failed() {
            AuthState::NeedDisconnect
        } else if !self.outgoing.is_empty() {
            AuthState::HaveBytesToSend
        } else if self.is_done() {
            AuthState::Authenticated
        } else {
            AuthState::WaitingForInput
        }
    }

    fn is_done(&self) -> bool {
        matches!(
            self.role,
            Role::Client {
                phase: ClientPhase::Done,
                ..
            } | Role::Server {
                phase: ServerPhase::Done,
                ..
            }
        )
    }

    fn is_failed(&self) -> bool {
        matches!(
            self.role,
            Role::Client {
                phase: ClientPhase::Failed,
                ..
            } | Role::Server {
                phase: ServerPhase::Failed,
                ..
            }
        )
    }

    fn fail(&mut self) {
        match &mut self.role {
            Role::Client { phase, .. } => *phase = ClientPhase::Failed,
            Role::Server { phase, .. } => *phase = ServerPhase::Failed,
        }
    }

    /// Makes one step of progress. `Ok(true)` means a step was taken and
    /// another may follow; `Ok(false)` means the dialog is blocked on
    /// input (or finished). An `Err` leaves the state untouched so the
    /// step can be retried.
    fn advance_once(&mut self) -> Result<bool, OomError> {
        if self.is_done() || self.is_failed() {
            return Ok(false);
        }

        if let Role::Client {
            phase: phase @ ClientPhase::NeedSendAuth,
            ..
        } = &mut self.role
        {
            let uid = Credentials::from_current_process()
                .uid
                .expect("own uid is always known");
            let line = format!("AUTH EXTERNAL {}", hex_encode(uid.to_string().as_bytes()));
            fallible_reserve(&mut self.outgoing, line.len() + 2)?;
            self.outgoing.extend_from_slice(line.as_bytes());
            self.outgoing.extend_from_slice(b"\r\n");
            *phase = ClientPhase::WaitingForOk;
            return Ok(true);
        }

        let Some(line_end) = find_crlf(&self.incoming) else {
            if self.incoming.len() > MAX_COMMAND_LINE {
                tracing::warn!("auth command exceeds line limit, failing dialog");
                self.fail();
            }
            return Ok(false);
        };

        check_alloc(line_end)?;
        let line = self.incoming[..line_end].to_vec();
        let Ok(line) = std::str::from_utf8(&line) else {
            tracing::warn!("auth command is not valid UTF-8, failing dialog");
            self.incoming.advance(line_end + 2);
            self.fail();
            return Ok(false);
        };
        tracing::trace!(command = line, "auth dialog received command");

        // Handlers must finish every fallible operation before mutating
        // state; on error the line stays buffered and is replayed.
        match &self.role {
            Role::Client { .. } => self.client_handle_line(line)?,
            Role::Server { .. } => self.server_handle_line(line)?,
        }
        self.incoming.advance(line_end + 2);
        if self.is_done() {
            // Everything after the delimiter line is message-stream data.
            // The unused slice is necessarily empty until this moment, so
            // the capture is a zero-copy buffer handoff.
            debug_assert!(self.unused.is_empty());
            self.unused = self.incoming.split();
        }
        Ok(true)
    }

    fn client_handle_line(&mut self, line: &str) -> Result<(), OomError> {
        if let Some(guid) = line.strip_prefix("OK ") {
            let guid = guid.trim();
            if guid.is_empty() || !guid.bytes().all(|b| b.is_ascii_hexdigit()) {
                tracing::warn!(guid, "server advertised a malformed guid");
                self.fail();
                return Ok(());
            }
            check_alloc(guid.len())?;
            fallible_reserve(&mut self.outgoing, b"BEGIN\r\n".len())?;
            self.outgoing.extend_from_slice(b"BEGIN\r\n");
            if let Role::Client {
                phase, server_guid, ..
            } = &mut self.role
            {
                *server_guid = Some(guid.to_owned());
                *phase = ClientPhase::Done;
            }
            Ok(())
        } else if line.starts_with("REJECTED") {
            tracing::warn!(command = line, "server rejected authentication");
            self.fail();
            Ok(())
        } else {
            tracing::warn!(command = line, "unexpected server auth command");
            self.fail();
            Ok(())
        }
    }

    fn server_handle_line(&mut self, line: &str) -> Result<(), OomError> {
        let Role::Server { phase, guid } = &self.role else {
            unreachable!("server handler on client role");
        };
        let (phase, guid) = (*phase, guid.clone());

        match phase {
            ServerPhase::WaitingForAuth => {
                let mut words = line.split_ascii_whitespace();
                if words.next() != Some("AUTH") {
                    self.queue_line(&format!("ERROR \"Unknown command {line:?}\""))?;
                    return Ok(());
                }
                let mechanism = words.next();
                let initial = words.next();

                if mechanism != Some("EXTERNAL")
                    || !self.mechanisms.iter().any(|m| m == "EXTERNAL")
                {
                    self.queue_rejected()?;
                    return Ok(());
                }

                let claimed_uid = match initial {
                    Some(hex) => match decoded_uid(hex) {
                        Some(uid) => Some(uid),
                        None => {
                            self.queue_rejected()?;
                            return Ok(());
                        }
                    },
                    None => self.peer_credentials.uid,
                };
                let Some(uid) = claimed_uid else {
                    // No claim and no socket credentials to fall back on.
                    self.queue_rejected()?;
                    return Ok(());
                };
                if let Some(socket_uid) = self.peer_credentials.uid {
                    if socket_uid != uid {
                        tracing::warn!(
                            claimed = uid,
                            actual = socket_uid,
                            "EXTERNAL uid claim does not match socket credentials"
                        );
                        self.queue_rejected()?;
                        return Ok(());
                    }
                }

                self.queue_line(&format!("OK {guid}"))?;
                self.identity = Credentials {
                    uid: Some(uid),
                    pid: self.peer_credentials.pid,
                    gid: self.peer_credentials.gid,
                };
                if let Role::Server { phase, .. } = &mut self.role {
                    *phase = ServerPhase::WaitingForBegin;
                }
                Ok(())
            }
            ServerPhase::WaitingForBegin => {
                if line == "BEGIN" {
                    if let Role::Server { phase, .. } = &mut self.role {
                        *phase = ServerPhase::Done;
                    }
                } else if line == "CANCEL" {
                    self.queue_rejected()?;
                    self.identity = Credentials::unset();
                    if let Role::Server { phase, .. } = &mut self.role {
                        *phase = ServerPhase::WaitingForAuth;
                    }
                } else {
                    self.queue_line(&format!("ERROR \"Unknown command {line:?}\""))?;
                }
                Ok(())
            }
            ServerPhase::Done | ServerPhase::Failed => Ok(()),
        }
    }

    fn queue_line(&mut self, line: &str) -> Result<(), OomError> {
        fallible_reserve(&mut self.outgoing, line.len() + 2)?;
        self.outgoing.extend_from_slice(line.as_bytes());
        self.outgoing.extend_from_slice(b"\r\n");
        Ok(())
    }

    fn queue_rejected(&mut self) -> Result<(), OomError> {
        let line = format!("REJECTED {}", self.mechanisms.join(" "));
        self.queue_line(&line)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn hex_encode(data: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            #[allow(clippy::cast_possible_truncation)]
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

/// Decodes an `EXTERNAL` initial response: hex over the ASCII decimal uid.
fn decoded_uid(hex: &str) -> Option<u32> {
    let raw = hex_decode(hex)?;
    std::str::from_utf8(&raw).ok()?.parse().ok()
}
