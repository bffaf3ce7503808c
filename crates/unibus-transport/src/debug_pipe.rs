//! In-process byte-pipe backend (feature `debug-pipe`).
//!
//! A debug pipe is a pair of byte queues shared by two transports in the
//! same process, one per direction, with no file descriptors anywhere.
//! Harnesses use it to drive the full transport state machine — the
//! credential byte, the SASL dialog, message framing, backpressure —
//! completely deterministically: nothing moves except inside
//! `do_iteration` calls, so a test controls exactly when each side makes
//! progress. `BLOCK` is meaningless here and ignored.
//!
//! Servers register under a name in a process-global registry;
//! `open("debug-pipe:name=X")` hands the client transport back and
//! queues the server-side transport on the listener for `accept`.
//!
//! The credential byte still travels through the pipe. The server end
//! adopts the process's own credentials when it consumes the byte, which
//! is truthful (the peer *is* this process) and keeps the credential
//! flag machinery exercised.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytes::{Buf, BytesMut};
use unibus_core::address::AddressEntry;
use unibus_core::credentials::Credentials;
use unibus_core::mem::OomError;

use crate::base::{Backend, BackendOps, IterationFlags, Transport, TransportBase};
use crate::error::Error;
use crate::open::OpenOutcome;
use crate::watch::{Condition, Watch};

#[derive(Default)]
struct PipeState {
    to_server: BytesMut,
    to_client: BytesMut,
    client_closed: bool,
    server_closed: bool,
}

#[derive(Default)]
struct PipeShared {
    state: Mutex<PipeState>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PipeEnd {
    Client,
    Server,
}

pub(crate) struct DebugPipeBackend {
    shared: Arc<PipeShared>,
    end: PipeEnd,
}

struct ListenerInner {
    guid: String,
    pending: Mutex<VecDeque<Transport>>,
}

/// A named in-process listener producing server-side transports.
pub struct DebugPipeListener {
    name: String,
    inner: Arc<ListenerInner>,
}

fn registry() -> &'static Mutex<HashMap<String, Weak<ListenerInner>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<ListenerInner>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers an in-process listener under `name`, advertising
/// `server_guid` to connecting clients.
///
/// # Errors
///
/// Returns [`Error::BadAddress`] when the name is already taken by a
/// live listener.
pub fn listen(name: &str, server_guid: &str) -> Result<DebugPipeListener, Error> {
    let mut registry = registry().lock().expect("debug-pipe registry poisoned");
    if registry
        .get(name)
        .is_some_and(|existing| existing.upgrade().is_some())
    {
        return Err(Error::bad_address(format!(
            "debug-pipe name {name:?} is already in use"
        )));
    }
    let inner = Arc::new(ListenerInner {
        guid: server_guid.to_owned(),
        pending: Mutex::new(VecDeque::new()),
    });
    registry.insert(name.to_owned(), Arc::downgrade(&inner));
    tracing::debug!(name, "debug-pipe listener registered");
    Ok(DebugPipeListener {
        name: name.to_owned(),
        inner,
    })
}

impl DebugPipeListener {
    /// The address clients open to reach this listener.
    #[must_use]
    pub fn address(&self) -> String {
        format!("debug-pipe:name={}", self.name)
    }

    /// Takes the next queued server-side transport, if a client has
    /// connected.
    pub fn accept(&self) -> Option<Transport> {
        self.inner
            .pending
            .lock()
            .expect("debug-pipe listener poisoned")
            .pop_front()
    }
}

impl Drop for DebugPipeListener {
    fn drop(&mut self) {
        registry()
            .lock()
            .expect("debug-pipe registry poisoned")
            .remove(&self.name);
    }
}

/// Opener for `debug-pipe:name=...` entries.
pub(crate) fn open_debug_pipe(entry: &AddressEntry) -> OpenOutcome {
    if entry.method() != "debug-pipe" {
        return OpenOutcome::NotHandled;
    }
    let Some(name) = entry.get("name") else {
        return OpenOutcome::Failed(Error::bad_address("debug-pipe address requires a name"));
    };
    let listener = registry()
        .lock()
        .expect("debug-pipe registry poisoned")
        .get(name)
        .and_then(Weak::upgrade);
    let Some(listener) = listener else {
        return OpenOutcome::Failed(Error::did_not_connect_msg(format!(
            "no debug-pipe server named {name:?}"
        )));
    };

    let shared = Arc::new(PipeShared::default());
    let server = Transport::new(
        TransportBase::new(Some(&listener.guid), None),
        Backend::DebugPipe(DebugPipeBackend {
            shared: Arc::clone(&shared),
            end: PipeEnd::Server,
        }),
    );
    let client = Transport::new(
        TransportBase::new(None, Some(&entry.to_string())),
        Backend::DebugPipe(DebugPipeBackend {
            shared,
            end: PipeEnd::Client,
        }),
    );
    listener
        .pending
        .lock()
        .expect("debug-pipe listener poisoned")
        .push_back(server);
    OpenOutcome::Opened(client)
}

impl DebugPipeBackend {
    fn with_state<R>(&self, f: impl FnOnce(&mut PipeState) -> R) -> R {
        let mut state = self.shared.state.lock().expect("debug-pipe state poisoned");
        f(&mut state)
    }

    fn do_writing(&mut self, base: &mut TransportBase) {
        let mut out = Vec::new();
        let mut need_disconnect = false;

        if base.send_credentials_pending {
            out.push(0u8);
            base.send_credentials_pending = false;
        }

        if base.authenticated {
            loop {
                let Some(conn) = base.connection() else {
                    break;
                };
                let Some(message) = conn.first_outgoing() else {
                    break;
                };
                out.extend_from_slice(message.marshalled());
                conn.message_sent(&message);
            }
        } else {
            loop {
                match base.auth.do_work() {
                    unibus_core::auth::AuthState::HaveBytesToSend => {
                        let pending = base.auth.bytes_to_send().len();
                        out.extend_from_slice(base.auth.bytes_to_send());
                        base.auth.bytes_sent(pending);
                    }
                    unibus_core::auth::AuthState::NeedDisconnect => {
                        need_disconnect = true;
                        break;
                    }
                    unibus_core::auth::AuthState::WaitingForMemory => {
                        tracing::debug!("auth out of memory during pipe write, will retry");
                        break;
                    }
                    unibus_core::auth::AuthState::WaitingForInput
                    | unibus_core::auth::AuthState::Authenticated => break,
                }
            }
        }

        if !out.is_empty() {
            let end = self.end;
            self.with_state(|state| match end {
                PipeEnd::Client => state.to_server.extend_from_slice(&out),
                PipeEnd::Server => state.to_client.extend_from_slice(&out),
            });
        }
        if need_disconnect {
            tracing::debug!("auth dialog failed over debug pipe");
            base.disconnect_with(self);
        }
    }

    fn do_reading(&mut self, base: &mut TransportBase) {
        if base.live_messages_size.value() >= base.max_live_messages_size {
            return;
        }

        let end = self.end;
        let (bytes, peer_closed) = self.with_state(|state| {
            let rx = match end {
                PipeEnd::Client => &state.to_client,
                PipeEnd::Server => &state.to_server,
            };
            let closed = match end {
                PipeEnd::Client => state.server_closed,
                PipeEnd::Server => state.client_closed,
            };
            (rx.to_vec(), closed)
        });

        let mut consumed = 0;
        if base.receive_credentials_pending && !bytes.is_empty() {
            if bytes[0] != 0 {
                tracing::warn!(byte = bytes[0], "credential byte was not nul");
                base.disconnect_with(self);
                return;
            }
            // The peer is this very process.
            base.credentials = Credentials::from_current_process();
            base.auth.set_peer_credentials(base.credentials);
            base.receive_credentials_pending = false;
            consumed = 1;
        }

        let rest = &bytes[consumed..];
        if !rest.is_empty() && !base.receive_credentials_pending {
            // Same routing rule as the socket backend: the loader only
            // sees bytes once the auth session's trailing bytes have
            // been migrated, so order survives an interrupted transfer.
            let fed = if base.authenticated && base.unused_bytes_recovered {
                base.loader.feed(rest)
            } else {
                base.auth.bytes_received(rest)
            };
            match fed {
                Ok(()) => consumed += rest.len(),
                Err(OomError) => {
                    tracing::debug!("out of memory buffering pipe bytes, will retry");
                }
            }
        }

        if consumed > 0 {
            self.with_state(|state| {
                match end {
                    PipeEnd::Client => state.to_client.advance(consumed),
                    PipeEnd::Server => state.to_server.advance(consumed),
                };
            });
        }

        if base.queue_messages_with(self).is_err() {
            tracing::debug!("out of memory queueing pipe messages, will retry");
        }

        if peer_closed && !base.disconnected {
            let drained = self.with_state(|state| match end {
                PipeEnd::Client => state.to_client.is_empty(),
                PipeEnd::Server => state.to_server.is_empty(),
            });
            if drained {
                tracing::debug!("debug pipe peer closed");
                base.disconnect_with(self);
            }
        }
    }
}

impl BackendOps for DebugPipeBackend {
    fn disconnect(&mut self, _base: &mut TransportBase) {
        let end = self.end;
        self.with_state(|state| match end {
            PipeEnd::Client => state.client_closed = true,
            PipeEnd::Server => state.server_closed = true,
        });
    }

    fn do_iteration(&mut self, base: &mut TransportBase, flags: IterationFlags, _timeout_ms: i32) {
        if flags.contains(IterationFlags::DO_WRITING) && !base.disconnected {
            self.do_writing(base);
        }
        if flags.contains(IterationFlags::DO_READING) && !base.disconnected {
            self.do_reading(base);
        }
    }

    fn handle_watch(
        &mut self,
        _base: &mut TransportBase,
        _watch: &Arc<Watch>,
        _condition: Condition,
    ) -> Result<(), OomError> {
        // A debug pipe has no descriptors, so no watch should ever
        // reach it.
        tracing::warn!("debug-pipe transport asked to handle a watch");
        Ok(())
    }

    fn connection_set(&mut self, _base: &mut TransportBase) -> Result<(), OomError> {
        Ok(())
    }
}
