//! Shared harness for transport integration tests: a debug-client style
//! connection that records registrations and queues, plus a scripted
//! SASL server speaking the wire protocol over a real unix socket.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use unibus_transport::{
    Condition, Connection, Message, MessageBuilder, MessageType, OomError, Timeout, Transport,
    Watch,
};

/// Connection stand-in: stores watches, queues messages, never fails.
///
/// It deliberately does not dispatch anything on its own; tests pull
/// messages out manually to inspect them.
#[derive(Default)]
pub struct TestConnection {
    pub watches: Mutex<Vec<Arc<Watch>>>,
    pub timeouts: Mutex<Vec<Arc<Timeout>>>,
    pub received: Mutex<VecDeque<Message>>,
    pub outgoing: Mutex<VecDeque<Arc<Message>>>,
}

impl TestConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn send(&self, message: Message) {
        self.outgoing.lock().unwrap().push_back(Arc::new(message));
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn pop_received(&self) -> Option<Message> {
        self.received.lock().unwrap().pop_front()
    }

    /// Watches currently enabled and still valid, snapshot.
    pub fn active_watches(&self) -> Vec<Arc<Watch>> {
        self.watches
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.is_enabled() && w.fd() >= 0)
            .cloned()
            .collect()
    }
}

impl Connection for TestConnection {
    fn add_watch(&self, watch: Arc<Watch>) -> Result<(), OomError> {
        self.watches.lock().unwrap().push(watch);
        Ok(())
    }

    fn remove_watch(&self, watch: &Arc<Watch>) {
        self.watches
            .lock()
            .unwrap()
            .retain(|w| !Arc::ptr_eq(w, watch));
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

/// Installs a fmt subscriber once so `RUST_LOG=trace` surfaces the
/// transport's tracing during test debugging.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn attach(transport: &mut Transport, connection: &Arc<TestConnection>) {
    init_tracing();
    let connection: Arc<dyn Connection> = connection.clone();
    transport.set_connection(&connection).unwrap();
}

/// Pumps the transport through its watches until `done` reports true or
/// the deadline passes. Readiness is synthesized: the transport's own
/// condition sanitizing and non-blocking I/O turn spurious callbacks
/// into no-ops, exactly as with a real loop that over-reports.
pub fn pump_until(
    transport: &mut Transport,
    connection: &Arc<TestConnection>,
    deadline: Duration,
    mut done: impl FnMut(&mut Transport) -> bool,
) -> bool {
    let started = Instant::now();
    loop {
        for watch in connection.active_watches() {
            let condition = Condition::READABLE | Condition::WRITABLE;
            let _ = transport.handle_watch(&watch, condition);
        }
        if done(transport) {
            return true;
        }
        if started.elapsed() > deadline || !transport.is_connected() {
            return done(transport);
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Builds a marshalled method call whose wire size is exactly `total`.
pub fn message_of_total_size(serial: u32, total: usize) -> Message {
    let header_len = 16;
    assert!(total >= header_len);
    MessageBuilder::new(MessageType::MethodCall, serial)
        .body(&vec![0u8; total - header_len])
        .build()
        .unwrap()
}

/// What the scripted server should do once authentication completes.
pub struct ServerScript {
    /// Guid advertised on the `OK` line.
    pub guid: String,
    /// Raw bytes appended to the `OK` line in the same write; used to
    /// exercise the trailing-byte transfer.
    pub bytes_with_ok: Vec<u8>,
    /// Raw message-stream bytes written after `BEGIN` is received.
    pub bytes_after_begin: Vec<u8>,
    /// Whether to reject the `AUTH` command instead of accepting it.
    pub reject_auth: bool,
    /// Keep the connection open after the script ends.
    pub linger: Duration,
}

impl ServerScript {
    pub fn accepting(guid: &str) -> Self {
        Self {
            guid: guid.to_owned(),
            bytes_with_ok: Vec::new(),
            bytes_after_begin: Vec::new(),
            reject_auth: false,
            linger: Duration::from_millis(500),
        }
    }
}

/// Binds a listener at `path` and serves exactly one connection with the
/// given script on a background thread.
pub fn spawn_script_server(path: &Path, script: ServerScript) -> thread::JoinHandle<()> {
    let listener = UnixListener::bind(path).expect("bind test socket");
    thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else {
            return;
        };
        serve_one(stream, &script);
    })
}

fn serve_one(stream: UnixStream, script: &ServerScript) {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut reader = BufReader::new(stream.try_clone().expect("clone test stream"));
    let mut stream = stream;

    // Credential byte. Without SO_PASSCRED the ancillary data is simply
    // not delivered; the data byte still is.
    let mut nul = [0xffu8; 1];
    if reader.read_exact(&mut nul).is_err() || nul[0] != 0 {
        return;
    }

    let auth_line = read_crlf_line(&mut reader);
    if !auth_line.starts_with("AUTH ") {
        return;
    }
    if script.reject_auth {
        stream.write_all(b"REJECTED EXTERNAL\r\n").unwrap();
        return;
    }

    let mut ok = format!("OK {}\r\n", script.guid).into_bytes();
    ok.extend_from_slice(&script.bytes_with_ok);
    stream.write_all(&ok).unwrap();

    let begin_line = read_crlf_line(&mut reader);
    if begin_line != "BEGIN" {
        return;
    }

    if !script.bytes_after_begin.is_empty() {
        stream.write_all(&script.bytes_after_begin).unwrap();
    }
    thread::sleep(script.linger);
}

fn read_crlf_line(reader: &mut impl BufRead) -> String {
    let mut line = String::new();
    if reader.read_line(&mut line).is_err() {
        return String::new();
    }
    line.trim_end_matches(['\r', '\n']).to_owned()
}
