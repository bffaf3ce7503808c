//! Debug-allocator behavior: failure injection and guard bands.
//!
//! The debug state is process-wide, so everything runs inside one test
//! function, in a fixed order, in this binary's own process.

use unibus_core::mem;
use unibus_core::mem::OomError;

#[test]
fn debug_allocator_end_to_end() {
    nth_failure_counts_down_and_resets();
    size_cap_fails_large_allocations();
    fallible_reserve_respects_injection();
    guard_bands_round_trip();
    heap_buf_survives_guard_toggle();
    loader_retries_cleanly_after_injected_failure();
    auth_dialog_retries_cleanly_after_injected_failure();
}

fn nth_failure_counts_down_and_resets() {
    mem::set_fail_alloc_interval(Some(2));
    mem::set_fail_alloc_counter(2);

    // Two allocations succeed, the third fails, then the countdown
    // restarts from the interval.
    let a = mem::malloc(8);
    assert!(!a.is_null());
    let b = mem::malloc(8);
    assert!(!b.is_null());
    assert!(mem::malloc(8).is_null());
    assert_eq!(mem::get_fail_alloc_counter(), 2);
    let c = mem::malloc(8);
    assert!(!c.is_null());

    unsafe {
        mem::free(a);
        mem::free(b);
        mem::free(c);
    }
    mem::set_fail_alloc_interval(None);
    mem::set_fail_alloc_counter(mem::NEVER_FAIL);

    // With no interval configured, an expired countdown resets to never.
    mem::set_fail_alloc_counter(0);
    assert!(mem::malloc(8).is_null());
    assert_eq!(mem::get_fail_alloc_counter(), mem::NEVER_FAIL);
    let d = mem::malloc(8);
    assert!(!d.is_null());
    unsafe { mem::free(d) };
}

fn size_cap_fails_large_allocations() {
    mem::set_fail_size_cap(Some(64));
    assert!(mem::malloc(65).is_null());
    let p = mem::malloc(64);
    assert!(!p.is_null());
    unsafe { mem::free(p) };
    mem::set_fail_size_cap(None);
}

fn fallible_reserve_respects_injection() {
    let mut buf = bytes::BytesMut::new();
    mem::set_fail_alloc_counter(0);
    assert_eq!(mem::fallible_reserve(&mut buf, 128), Err(OomError));
    mem::set_fail_alloc_counter(mem::NEVER_FAIL);
    mem::fallible_reserve(&mut buf, 128).unwrap();
    assert!(buf.capacity() >= 128);
}

fn guard_bands_round_trip() {
    mem::set_guards_enabled(true);
    unsafe {
        let p = mem::malloc(40);
        assert!(!p.is_null());
        p.write_bytes(0x5a, 40);

        // Grow through realloc; contents and bands must survive.
        let p = mem::realloc(p, 120);
        assert!(!p.is_null());
        for i in 0..40 {
            assert_eq!(*p.add(i), 0x5a);
        }
        p.write_bytes(0x5a, 120);
        mem::free(p);

        let z = mem::malloc0(24);
        assert!(!z.is_null());
        for i in 0..24 {
            assert_eq!(*z.add(i), 0);
        }
        mem::free(z);

        // Odd sizes leave the end band unaligned; still checked intact.
        let odd = mem::malloc(13);
        assert!(!odd.is_null());
        odd.write_bytes(0x77, 13);
        mem::free(odd);
    }
    mem::set_guards_enabled(false);
}

fn heap_buf_survives_guard_toggle() {
    // A buffer allocated under guards remembers that at free time even
    // if guards are switched off in between.
    mem::set_guards_enabled(true);
    let buf = mem::HeapBuf::from_slice(b"guarded payload").unwrap();
    mem::set_guards_enabled(false);
    assert_eq!(&*buf, b"guarded payload");
    drop(buf);
}

fn loader_retries_cleanly_after_injected_failure() {
    use unibus_core::message::{MessageBuilder, MessageLoader, MessageType};

    let wire = MessageBuilder::new(MessageType::Signal, 11)
        .body(b"retry me")
        .build()
        .unwrap()
        .marshalled()
        .to_vec();

    // Feeding fails; no bytes are consumed, so the retry sees them all.
    let mut loader = MessageLoader::new();
    mem::set_fail_alloc_counter(0);
    assert_eq!(loader.feed(&wire), Err(OomError));
    assert!(loader.pending_bytes().is_empty());
    mem::set_fail_alloc_counter(mem::NEVER_FAIL);
    loader.feed(&wire).unwrap();

    // The payload allocation fails during parsing; the buffer survives
    // and the next attempt produces the message.
    mem::set_fail_alloc_counter(0);
    assert_eq!(loader.queue_messages(), Err(OomError));
    assert!(loader.peek_message().is_none());
    assert_eq!(loader.pending_bytes().len(), wire.len());
    mem::set_fail_alloc_counter(mem::NEVER_FAIL);
    loader.queue_messages().unwrap();
    assert_eq!(loader.pop_message().unwrap().serial(), 11);
}

fn auth_dialog_retries_cleanly_after_injected_failure() {
    use unibus_core::auth::{AuthSession, AuthState};
    use unibus_core::credentials::Credentials;

    let mut server = AuthSession::server("cafef00d");
    server.set_peer_credentials(Credentials::from_current_process());

    let uid = Credentials::from_current_process().uid.unwrap();
    let hex: String = uid
        .to_string()
        .bytes()
        .map(|b| format!("{b:02x}"))
        .collect();
    server
        .bytes_received(format!("AUTH EXTERNAL {hex}\r\n").as_bytes())
        .unwrap();

    // Processing the command needs memory; the line stays buffered and
    // is replayed once memory is back.
    mem::set_fail_alloc_counter(0);
    assert_eq!(server.do_work(), AuthState::WaitingForMemory);
    mem::set_fail_alloc_counter(mem::NEVER_FAIL);
    assert_eq!(server.do_work(), AuthState::HaveBytesToSend);
    assert!(server.bytes_to_send().starts_with(b"OK cafef00d"));
}
