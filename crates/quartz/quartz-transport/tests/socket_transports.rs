//! Stream and queue transports over loopback on ephemeral ports.

use quartz_chunk::{Chunk, SENTINEL};
use quartz_transport::{
    QueueListener, QueueTransport, SocketEndpoint, StreamListener, StreamTransport, Transport,
    TransportError,
};
use std::io::Write;
use std::net::TcpStream;
use std::thread;

const CHUNK: usize = 4096;

fn endpoint() -> SocketEndpoint {
    SocketEndpoint::new("127.0.0.1:0", "127.0.0.1:0", CHUNK)
}

fn pattern(i: usize, len: usize) -> Vec<u8> {
    (0..len).map(|j| (i * 7 + j) as u8).collect()
}

fn expected() -> Vec<Vec<u8>> {
    let mut all: Vec<_> = (0..20).map(|i| pattern(i, CHUNK)).collect();
    all.push(pattern(20, 123));
    all
}

fn drain<T: Transport>(rx: &mut T) -> Vec<Vec<u8>> {
    let mut chunk = Chunk::zeroed(CHUNK);
    let mut got = Vec::new();
    while let Some(cycle) = rx.recv_chunk(&mut chunk).unwrap() {
        got.push(chunk.head(cycle.bytes).to_vec());
    }
    got
}

fn send_all<T: Transport>(tx: &mut T, payloads: &[Vec<u8>]) {
    for p in payloads {
        assert_eq!(tx.send_chunk(p).unwrap().bytes, p.len());
    }
    tx.finish().unwrap();
    tx.finish().unwrap();
}

// ─── Stream ─────────────────────────────────────────────────────────────────

#[test]
fn stream_delivers_frames_until_sentinel() {
    let listener = StreamListener::bind(&endpoint()).unwrap();
    let ep = endpoint().connecting_to(listener.local_addr().unwrap());

    let sender = thread::spawn(move || {
        let mut tx = StreamTransport::open_as_sender(&ep).unwrap();
        send_all(&mut tx, &expected());
        tx.close();
        tx.close();
        assert!(tx.is_closed());
    });

    let mut rx = listener.accept().unwrap();
    assert_eq!(drain(&mut rx), expected());
    sender.join().unwrap();

    let mut chunk = Chunk::zeroed(CHUNK);
    assert!(rx.recv_chunk(&mut chunk).unwrap().is_none());
    rx.close();
}

#[test]
fn stream_clean_eof_ends_the_stream() {
    let listener = StreamListener::bind(&endpoint()).unwrap();
    let ep = endpoint().connecting_to(listener.local_addr().unwrap());

    let sender = thread::spawn(move || {
        let mut tx = StreamTransport::open_as_sender(&ep).unwrap();
        tx.send_chunk(&pattern(0, CHUNK)).unwrap();
        tx.close();
    });

    let mut rx = listener.accept().unwrap();
    assert_eq!(drain(&mut rx), vec![pattern(0, CHUNK)]);
    sender.join().unwrap();
}

#[test]
fn stream_eof_inside_a_frame_is_an_error() {
    let listener = StreamListener::bind(&endpoint()).unwrap();
    let addr = listener.local_addr().unwrap();

    let sender = thread::spawn(move || {
        let mut raw = TcpStream::connect(addr).unwrap();
        raw.write_all(&100u64.to_le_bytes()).unwrap();
        raw.write_all(&[1; 10]).unwrap();
    });

    let mut rx = listener.accept().unwrap();
    sender.join().unwrap();
    let mut chunk = Chunk::zeroed(CHUNK);
    let err = rx.recv_chunk(&mut chunk).unwrap_err();
    assert!(matches!(err, TransportError::Io(_)), "{err:?}");
}

#[test]
fn stream_rejects_oversized_frame() {
    let listener = StreamListener::bind(&endpoint()).unwrap();
    let addr = listener.local_addr().unwrap();

    let sender = thread::spawn(move || {
        let mut raw = TcpStream::connect(addr).unwrap();
        raw.write_all(&(CHUNK as u64 + 1).to_le_bytes()).unwrap();
    });

    let mut rx = listener.accept().unwrap();
    sender.join().unwrap();
    let mut chunk = Chunk::zeroed(CHUNK);
    assert!(matches!(
        rx.recv_chunk(&mut chunk),
        Err(TransportError::FrameTooLarge { len, capacity: CHUNK }) if len == CHUNK + 1
    ));
}

#[test]
fn stream_sentinel_needs_exact_length() {
    let listener = StreamListener::bind(&endpoint()).unwrap();
    let ep = endpoint().connecting_to(listener.local_addr().unwrap());

    let sender = thread::spawn(move || {
        let mut tx = StreamTransport::open_as_sender(&ep).unwrap();
        let mut looks_like_done = SENTINEL.to_vec();
        looks_like_done.push(b'!');
        tx.send_chunk(&looks_like_done).unwrap();
        tx.finish().unwrap();
    });

    let mut rx = listener.accept().unwrap();
    assert_eq!(drain(&mut rx), vec![b"DONE!".to_vec()]);
    sender.join().unwrap();
}

// ─── Queue ──────────────────────────────────────────────────────────────────

#[test]
fn queue_delivers_messages_until_sentinel() {
    let listener = QueueListener::bind(&endpoint()).unwrap();
    let ep = endpoint().connecting_to(listener.local_addr().unwrap());

    let receiver = thread::spawn(move || {
        let mut rx = QueueTransport::open_as_receiver(&ep).unwrap();
        let got = drain(&mut rx);
        rx.close();
        got
    });

    let mut tx = listener.accept().unwrap();
    send_all(&mut tx, &expected());
    tx.close();
    assert!(tx.is_closed());

    assert_eq!(receiver.join().unwrap(), expected());
}

#[test]
fn queue_roles_are_enforced() {
    let listener = QueueListener::bind(&endpoint()).unwrap();
    let ep = endpoint().connecting_to(listener.local_addr().unwrap());

    let receiver = thread::spawn(move || {
        let mut rx = QueueTransport::open_as_receiver(&ep).unwrap();
        assert!(matches!(rx.send_chunk(b"x"), Err(TransportError::WrongRole { .. })));
        drain(&mut rx)
    });

    let mut tx = listener.accept().unwrap();
    let mut chunk = Chunk::zeroed(CHUNK);
    assert!(matches!(
        tx.recv_chunk(&mut chunk),
        Err(TransportError::WrongRole { .. })
    ));
    assert!(matches!(
        tx.send_chunk(&vec![0; CHUNK + 1]),
        Err(TransportError::FrameTooLarge { .. })
    ));
    tx.finish().unwrap();
    tx.close();

    assert!(receiver.join().unwrap().is_empty());
}
