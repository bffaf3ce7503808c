//! Marshalled messages.
//!
//! The wire form is a 16-byte fixed header, a header-field blob, padding
//! to an 8-byte boundary, then the body:
//!
//! ```text
//! +---+------+-------+---------+----------+--------+------------+
//! | e | type | flags | version | body len | serial | fields len |
//! | 0 |  1   |   2   |    3    |   4..8   |  8..12 |   12..16   |
//! +---+------+-------+---------+----------+--------+------------+
//! | header fields ...          | zero pad to 8 | body ...       |
//! +----------------------------+---------------+----------------+
//! ```
//!
//! `e` is the endianness tag (`l` little, `B` big) governing the three
//! 32-bit header words. The serial is never zero. Field contents are
//! opaque at this layer.
//!
//! A [`Message`] owns its marshalled bytes in a [`HeapBuf`], so parsing
//! one is a single fallible allocation. Once queued toward the
//! application it is tagged with the live-byte [`Counter`]; dropping the
//! message flows the decrement back, which is what eventually re-enables
//! a backpressured read watch.

mod loader;

pub use loader::{MessageLoader, DEFAULT_MAX_MESSAGE_SIZE};

use std::sync::Arc;

use crate::counter::Counter;
use crate::mem::{HeapBuf, OomError};

/// Length of the fixed message header.
pub const HEADER_LEN: usize = 16;

/// Endianness tag for little-endian messages.
pub const LITTLE_ENDIAN_TAG: u8 = b'l';
/// Endianness tag for big-endian messages.
pub const BIG_ENDIAN_TAG: u8 = b'B';

/// Protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Kind of message, from the header's type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// A method invocation.
    MethodCall = 1,
    /// A reply carrying a return value.
    MethodReturn = 2,
    /// A reply carrying an error.
    Error = 3,
    /// A broadcast notification.
    Signal = 4,
}

impl MessageType {
    pub(crate) fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::MethodCall),
            2 => Some(Self::MethodReturn),
            3 => Some(Self::Error),
            4 => Some(Self::Signal),
            _ => None,
        }
    }
}

pub(crate) fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// A parsed (or locally built) message, owning its marshalled bytes.
///
/// Not clonable: each live message carries at most one live-byte counter
/// adoption, released exactly once on drop.
#[derive(Debug)]
pub struct Message {
    data: HeapBuf,
    msg_type: MessageType,
    serial: u32,
    fields_len: usize,
    body_len: usize,
    counter: Option<Arc<Counter>>,
}

impl Message {
    pub(crate) fn from_parts(
        data: HeapBuf,
        msg_type: MessageType,
        serial: u32,
        fields_len: usize,
        body_len: usize,
    ) -> Self {
        Self {
            data,
            msg_type,
            serial,
            fields_len,
            body_len,
            counter: None,
        }
    }

    /// The message kind.
    #[must_use]
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    /// The sender-assigned serial.
    #[must_use]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Total marshalled size in bytes; this is the amount accounted
    /// against the live-byte counter.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The complete marshalled bytes, as written to the wire.
    #[must_use]
    pub fn marshalled(&self) -> &[u8] {
        &self.data
    }

    /// The opaque header-field blob.
    #[must_use]
    pub fn header_fields(&self) -> &[u8] {
        &self.data[HEADER_LEN..HEADER_LEN + self.fields_len]
    }

    /// The message body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        let start = align8(HEADER_LEN + self.fields_len);
        &self.data[start..start + self.body_len]
    }

    /// Adopts the live-byte counter: adds this message's size now and
    /// subtracts it when the message is dropped.
    pub fn attach_size_counter(&mut self, counter: &Arc<Counter>) {
        debug_assert!(self.counter.is_none(), "size counter attached twice");
        #[allow(clippy::cast_possible_wrap)]
        counter.adjust(self.size() as isize);
        self.counter = Some(Arc::clone(counter));
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(counter) = self.counter.take() {
            #[allow(clippy::cast_possible_wrap)]
            counter.adjust(-(self.size() as isize));
        }
    }
}

/// Builds outgoing messages in the native little-endian form.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    msg_type: MessageType,
    serial: u32,
    flags: u8,
    fields: Vec<u8>,
    body: Vec<u8>,
}

impl MessageBuilder {
    /// Starts a message of the given kind and serial.
    ///
    /// # Panics
    ///
    /// Panics if `serial` is zero; serials start at one.
    #[must_use]
    pub fn new(msg_type: MessageType, serial: u32) -> Self {
        assert_ne!(serial, 0, "message serials start at one");
        Self {
            msg_type,
            serial,
            flags: 0,
            fields: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Sets the header flags byte.
    #[must_use]
    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the opaque header-field blob.
    #[must_use]
    pub fn header_fields(mut self, fields: &[u8]) -> Self {
        self.fields = fields.to_vec();
        self
    }

    /// Sets the body bytes.
    #[must_use]
    pub fn body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    /// Marshals the message.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] when the payload allocation fails.
    pub fn build(self) -> Result<Message, OomError> {
        let total = align8(HEADER_LEN + self.fields.len()) + self.body.len();
        let mut wire = Vec::with_capacity(total);
        wire.push(LITTLE_ENDIAN_TAG);
        wire.push(self.msg_type as u8);
        wire.push(self.flags);
        wire.push(PROTOCOL_VERSION);
        #[allow(clippy::cast_possible_truncation)]
        wire.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        wire.extend_from_slice(&self.serial.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        wire.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());
        wire.extend_from_slice(&self.fields);
        wire.resize(align8(wire.len()), 0);
        wire.extend_from_slice(&self.body);

        let data = HeapBuf::from_slice(&wire)?;
        Ok(Message::from_parts(
            data,
            self.msg_type,
            self.serial,
            self.fields.len(),
            self.body.len(),
        ))
    }
}
