//! Framing and bus behaviour over a real Unix socket pair.
//!
//! Covers frame integrity across the socket, EOF detection on peer close,
//! and concurrent producers feeding a single consumer.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use warden_common::prelude::*;

// ─── Helpers ────────────────────────────────────────────────────────

fn pair() -> (UnixStream, UnixStream) {
    UnixStream::pair().expect("socketpair")
}

// ─── Framing ────────────────────────────────────────────────────────

#[test]
fn frames_cross_a_socket_intact() {
    let (mut a, mut b) = pair();
    let sent = vec![
        Message::with_i32(Signal::Pid.id(), 1234),
        Message::signal(Signal::ConfigError, b"remap.config: bad rule".to_vec()),
        Message::event(Event::Shutdown, Vec::new()),
    ];
    for msg in &sent {
        write_message(&mut a, msg).expect("write");
    }
    for expected in &sent {
        assert_eq!(&read_message(&mut b).expect("read"), expected);
    }
}

#[test]
fn large_payload_arrives_whole() {
    let (a, mut b) = pair();
    let payload: Vec<u8> = (0..MAX_PAYLOAD_LEN).map(|i| (i % 251) as u8).collect();
    let msg = Message::new(Event::Librecords.id(), payload);
    let writer = {
        let msg = msg.clone();
        thread::spawn(move || {
            let mut a = a;
            write_message(&mut a, &msg).expect("write");
        })
    };
    assert_eq!(read_message(&mut b).expect("read"), msg);
    writer.join().unwrap();
}

#[test]
fn peer_close_reads_as_closed() {
    let (a, mut b) = pair();
    drop(a);
    let err = read_message(&mut b).unwrap_err();
    assert!(matches!(err, WireError::Closed));
    assert!(err.is_disconnect());
}

#[test]
fn peer_close_mid_frame_reads_as_truncated() {
    let (mut a, mut b) = pair();
    let mut frame = Vec::new();
    write_message(&mut frame, &Message::signal(Signal::SystemError, b"abc".to_vec()))
        .expect("encode");
    a.write_all(&frame[..frame.len() - 1]).expect("partial write");
    drop(a);
    assert!(matches!(
        read_message(&mut b),
        Err(WireError::Truncated { .. })
    ));
}

// ─── Bus ────────────────────────────────────────────────────────────

#[test]
fn concurrent_producers_lose_nothing() {
    let bus = Arc::new(MessageBus::new());
    let producers: Vec<_> = (0..4)
        .map(|t| {
            let bus = Arc::clone(&bus);
            thread::spawn(move || {
                for i in 0..250 {
                    bus.enqueue(Message::new(t * 1000 + i, Vec::new()));
                }
            })
        })
        .collect();

    let mut received = Vec::new();
    while received.len() < 1000 {
        if let Some(msg) = bus.dequeue_timeout(Duration::from_secs(5)) {
            received.push(msg.msg_type);
        } else {
            panic!("timed out after {} messages", received.len());
        }
    }
    for p in producers {
        p.join().unwrap();
    }

    // Per-producer order is preserved.
    for t in 0..4 {
        let mine: Vec<i32> = received
            .iter()
            .copied()
            .filter(|id| id / 1000 == t)
            .collect();
        let expected: Vec<i32> = (0..250).map(|i| t * 1000 + i).collect();
        assert_eq!(mine, expected);
    }
}
