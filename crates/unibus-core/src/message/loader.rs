//! Incremental byte-to-message parsing.
//!
//! The loader buffers raw bytes in arrival order and converts complete
//! marshalled messages into a FIFO of [`Message`]s on demand. It never
//! reorders: the transport feeds it exactly what the kernel delivered,
//! and [`MessageLoader::queue_messages`] consumes the buffer front to
//! back.
//!
//! Length and validity are checked before any payload allocation, the
//! same discipline as a length-prefixed frame codec: a header announcing
//! more than the per-message cap marks the stream corrupted without ever
//! allocating for it. Corruption is latched; the owning transport
//! disconnects when it observes the flag, and a corrupted loader ignores
//! further input.

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};

use super::{align8, Message, MessageType, BIG_ENDIAN_TAG, HEADER_LEN, LITTLE_ENDIAN_TAG};
use crate::mem::{fallible_reserve, HeapBuf, OomError};

/// Default cap on a single marshalled message: 32 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Incremental parser turning a byte stream into whole messages.
#[derive(Debug)]
pub struct MessageLoader {
    buffer: BytesMut,
    messages: VecDeque<Message>,
    max_message_size: usize,
    corrupted: bool,
    loaned_from: Option<usize>,
}

impl Default for MessageLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLoader {
    /// Creates an empty loader with the default per-message cap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            messages: VecDeque::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            corrupted: false,
            loaned_from: None,
        }
    }

    /// Loans out `len` writable bytes at the end of the input buffer for
    /// a direct wire read. Commit the bytes actually read with
    /// [`MessageLoader::return_buffer`].
    ///
    /// The growth happens before any I/O, so an injected failure here
    /// costs nothing: no wire bytes were consumed yet.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] when growing the buffer fails.
    pub fn get_buffer(&mut self, len: usize) -> Result<&mut [u8], OomError> {
        debug_assert!(self.loaned_from.is_none(), "read buffer loaned twice");
        fallible_reserve(&mut self.buffer, len)?;
        let start = self.buffer.len();
        self.buffer.resize(start + len, 0);
        self.loaned_from = Some(start);
        Ok(&mut self.buffer[start..])
    }

    /// Commits `used` bytes of the loaned read area; the rest is given
    /// back. A corrupted loader discards the bytes entirely.
    pub fn return_buffer(&mut self, used: usize) {
        let Some(start) = self.loaned_from.take() else {
            return;
        };
        if self.corrupted {
            self.buffer.truncate(start);
        } else {
            self.buffer.truncate(start + used);
        }
    }

    /// Appends raw bytes to the input buffer, in arrival order.
    ///
    /// A corrupted loader discards input; the stream is already dead.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] when growing the buffer fails; no bytes are
    /// consumed in that case and the call can be retried.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), OomError> {
        if self.corrupted {
            tracing::trace!(len = bytes.len(), "dropping bytes fed to corrupted loader");
            return Ok(());
        }
        fallible_reserve(&mut self.buffer, bytes.len())?;
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Parses as many complete messages out of the buffer as possible.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] when a payload allocation fails; the buffer
    /// is left intact so the parse can be retried.
    pub fn queue_messages(&mut self) -> Result<(), OomError> {
        while !self.corrupted {
            let Some(total) = self.validate_header() else {
                break;
            };
            if self.buffer.len() < total {
                break;
            }

            let data = HeapBuf::from_slice(&self.buffer[..total])?;
            let message = Self::demarshal(data);
            self.buffer.advance(total);
            tracing::trace!(
                serial = message.serial(),
                size = message.size(),
                "loader queued message"
            );
            self.messages.push_back(message);
        }
        Ok(())
    }

    /// Checks the fixed header at the buffer front.
    ///
    /// Returns the total message length when the header is present and
    /// valid, `None` when more bytes are needed. Marks the loader
    /// corrupted (and returns `None`) on an invalid header.
    fn validate_header(&mut self) -> Option<usize> {
        if self.buffer.len() < HEADER_LEN {
            return None;
        }
        let header: [u8; HEADER_LEN] = self.buffer[..HEADER_LEN].try_into().expect("header length");

        let big_endian = match header[0] {
            LITTLE_ENDIAN_TAG => false,
            BIG_ENDIAN_TAG => true,
            tag => {
                return self.corrupt(format_args!("invalid endianness tag {tag:#04x}"));
            }
        };
        if MessageType::from_wire(header[1]).is_none() {
            return self.corrupt(format_args!("invalid message type {}", header[1]));
        }
        if header[3] != super::PROTOCOL_VERSION {
            return self.corrupt(format_args!("unsupported protocol version {}", header[3]));
        }

        let word = |range: std::ops::Range<usize>| {
            let bytes: [u8; 4] = header[range].try_into().expect("4-byte header word");
            if big_endian {
                u32::from_be_bytes(bytes)
            } else {
                u32::from_le_bytes(bytes)
            }
        };
        let body_len = word(4..8) as usize;
        let serial = word(8..12);
        let fields_len = word(12..16) as usize;

        if serial == 0 {
            return self.corrupt(format_args!("message serial is zero"));
        }

        let max_message_size = self.max_message_size;
        let total = align8(HEADER_LEN + fields_len).checked_add(body_len);
        let total = match total {
            Some(total) if total <= max_message_size => total,
            _ => {
                return self.corrupt(format_args!(
                    "message of {} + {body_len} bytes exceeds cap of {} bytes",
                    align8(HEADER_LEN + fields_len),
                    max_message_size
                ));
            }
        };

        // Padding between fields and body must be zero.
        let pad_start = HEADER_LEN + fields_len;
        let pad_end = align8(pad_start);
        if self.buffer.len() >= pad_end && self.buffer[pad_start..pad_end].iter().any(|&b| b != 0) {
            return self.corrupt(format_args!("nonzero alignment padding"));
        }

        Some(total)
    }

    fn corrupt(&mut self, reason: std::fmt::Arguments<'_>) -> Option<usize> {
        tracing::warn!(%reason, "message stream corrupted");
        self.corrupted = true;
        None
    }

    /// Splits an already-validated wire image into a [`Message`].
    fn demarshal(data: HeapBuf) -> Message {
        let big_endian = data[0] == BIG_ENDIAN_TAG;
        let word = |range: std::ops::Range<usize>| {
            let bytes: [u8; 4] = data[range].try_into().expect("4-byte header word");
            if big_endian {
                u32::from_be_bytes(bytes)
            } else {
                u32::from_le_bytes(bytes)
            }
        };
        let msg_type = MessageType::from_wire(data[1]).expect("validated type byte");
        let body_len = word(4..8) as usize;
        let serial = word(8..12);
        let fields_len = word(12..16) as usize;
        Message::from_parts(data, msg_type, serial, fields_len, body_len)
    }

    /// The oldest fully-parsed message, if any.
    #[must_use]
    pub fn peek_message(&self) -> Option<&Message> {
        self.messages.front()
    }

    /// Removes and returns the oldest fully-parsed message.
    pub fn pop_message(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    /// Whether the byte stream was found unparseable. Latched.
    #[must_use]
    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    /// Bytes buffered but not yet parsed into messages.
    #[must_use]
    pub fn pending_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Sets the cap on a single marshalled message.
    pub fn set_max_message_size(&mut self, size: usize) {
        self.max_message_size = size;
    }

    /// The cap on a single marshalled message.
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBuilder;

    fn wire(serial: u32, body: &[u8]) -> Vec<u8> {
        MessageBuilder::new(MessageType::MethodCall, serial)
            .body(body)
            .build()
            .unwrap()
            .marshalled()
            .to_vec()
    }

    #[test]
    fn parses_a_message_fed_byte_by_byte() {
        let mut loader = MessageLoader::new();
        let wire = wire(42, b"incremental");

        for &b in &wire {
            loader.feed(&[b]).unwrap();
            loader.queue_messages().unwrap();
        }
        let message = loader.pop_message().expect("one message");
        assert_eq!(message.serial(), 42);
        assert_eq!(message.body(), b"incremental");
        assert!(loader.pending_bytes().is_empty());
        assert!(loader.pop_message().is_none());
    }

    #[test]
    fn parses_multiple_messages_in_order() {
        let mut loader = MessageLoader::new();
        let mut stream = wire(1, b"first");
        stream.extend_from_slice(&wire(2, b"second"));
        stream.extend_from_slice(&wire(3, b"third"));

        loader.feed(&stream).unwrap();
        loader.queue_messages().unwrap();

        let serials: Vec<u32> = std::iter::from_fn(|| loader.pop_message())
            .map(|m| m.serial())
            .collect();
        assert_eq!(serials, vec![1, 2, 3]);
    }

    #[test]
    fn partial_message_stays_buffered() {
        let mut loader = MessageLoader::new();
        let wire = wire(9, b"partial body");
        loader.feed(&wire[..wire.len() - 4]).unwrap();
        loader.queue_messages().unwrap();
        assert!(loader.peek_message().is_none());
        assert_eq!(loader.pending_bytes().len(), wire.len() - 4);

        loader.feed(&wire[wire.len() - 4..]).unwrap();
        loader.queue_messages().unwrap();
        assert!(loader.peek_message().is_some());
    }

    #[test]
    fn big_endian_header_is_understood() {
        let mut raw = vec![BIG_ENDIAN_TAG, 4, 0, 1];
        raw.extend_from_slice(&2u32.to_be_bytes()); // body len
        raw.extend_from_slice(&5u32.to_be_bytes()); // serial
        raw.extend_from_slice(&0u32.to_be_bytes()); // fields len
        raw.extend_from_slice(b"hi");

        let mut loader = MessageLoader::new();
        loader.feed(&raw).unwrap();
        loader.queue_messages().unwrap();
        let message = loader.pop_message().expect("parsed");
        assert_eq!(message.serial(), 5);
        assert_eq!(message.msg_type(), MessageType::Signal);
        assert_eq!(message.body(), b"hi");
    }

    #[test]
    fn invalid_endianness_tag_corrupts() {
        let mut loader = MessageLoader::new();
        let mut bad = wire(1, b"x");
        bad[0] = b'?';
        loader.feed(&bad).unwrap();
        loader.queue_messages().unwrap();
        assert!(loader.is_corrupted());
        assert!(loader.pop_message().is_none());
    }

    #[test]
    fn zero_serial_corrupts() {
        let mut loader = MessageLoader::new();
        let mut bad = wire(1, b"x");
        bad[8..12].copy_from_slice(&0u32.to_le_bytes());
        loader.feed(&bad).unwrap();
        loader.queue_messages().unwrap();
        assert!(loader.is_corrupted());
    }

    #[test]
    fn oversized_message_corrupts_without_buffering_it() {
        let mut loader = MessageLoader::new();
        loader.set_max_message_size(64);
        let big = wire(1, &[0u8; 128]);
        // Only the header needs to arrive for the verdict.
        loader.feed(&big[..HEADER_LEN]).unwrap();
        loader.queue_messages().unwrap();
        assert!(loader.is_corrupted());
    }

    #[test]
    fn corruption_is_latched_and_input_discarded() {
        let mut loader = MessageLoader::new();
        let mut bad = wire(1, b"x");
        bad[3] = 9; // bogus protocol version
        loader.feed(&bad).unwrap();
        loader.queue_messages().unwrap();
        assert!(loader.is_corrupted());

        let buffered = loader.pending_bytes().len();
        loader.feed(&wire(2, b"fine")).unwrap();
        assert_eq!(loader.pending_bytes().len(), buffered);
        loader.queue_messages().unwrap();
        assert!(loader.pop_message().is_none());
    }

    #[test]
    fn nonzero_padding_corrupts() {
        let message = MessageBuilder::new(MessageType::MethodCall, 4)
            .header_fields(b"abc")
            .body(b"body")
            .build()
            .unwrap();
        let mut raw = message.marshalled().to_vec();
        raw[HEADER_LEN + 3] = 0xff; // first pad byte after the 3 field bytes

        let mut loader = MessageLoader::new();
        loader.feed(&raw).unwrap();
        loader.queue_messages().unwrap();
        assert!(loader.is_corrupted());
    }
}
