// tests/transport.rs

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use ferry::transport::shm::{unique_addr, ShmOptions, ShmTransport};
use ferry::transport::sock::SockTransport;
use ferry::transport::{Connection, Transport};
use ferry::Error;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Open a listener, connect to it, and return both ends.
fn connected_pair(
    transport: &Arc<dyn Transport>,
    addr: &str,
) -> (Arc<dyn Connection>, Arc<dyn Connection>) {
    let listener = transport.listen(addr).unwrap();
    let (tx, rx) = mpsc::channel();
    listener.accept(Box::new(move |result| {
        tx.send(result).unwrap();
    }));
    let client = transport.connect(&listener.addr()).unwrap();
    let server = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    (client, server)
}

fn sock_transport() -> Arc<dyn Transport> {
    SockTransport::new().unwrap() as Arc<dyn Transport>
}

fn shm_transport(ring_capacity: usize) -> Arc<dyn Transport> {
    ShmTransport::with_options(ShmOptions { ring_capacity }).unwrap() as Arc<dyn Transport>
}

fn echo(transport: Arc<dyn Transport>, addr: &str) {
    let (client, server) = connected_pair(&transport, addr);

    let (write_tx, write_rx) = mpsc::channel();
    client.write(
        Bytes::from_static(b"hello"),
        Box::new(move |result| write_tx.send(result).unwrap()),
    );

    let (read_tx, read_rx) = mpsc::channel();
    server.read(Box::new(move |result| read_tx.send(result).unwrap()));

    write_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    let payload = read_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(payload.len(), 5);
    assert_eq!(&payload[..], &[0x68, 0x65, 0x6c, 0x6c, 0x6f]);

    // And the other direction.
    let (write_tx, write_rx) = mpsc::channel();
    server.write(
        Bytes::from_static(b"world"),
        Box::new(move |result| write_tx.send(result).unwrap()),
    );
    let (read_tx, read_rx) = mpsc::channel();
    client.read(Box::new(move |result| read_tx.send(result).unwrap()));
    write_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    let payload = read_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(&payload[..], b"world");

    transport.join();
}

#[test]
fn sock_echo() {
    init_tracing();
    echo(sock_transport(), "127.0.0.1:0");
}

#[test]
fn shm_echo() {
    init_tracing();
    echo(shm_transport(4096), &unique_addr());
}

#[test]
fn shm_chunking_explicit_read() {
    init_tracing();
    const CAPACITY: usize = 4096;
    let transport = shm_transport(CAPACITY);
    let (client, server) = connected_pair(&transport, &unique_addr());

    // Five times the ring capacity, delivered as one message.
    let message = Bytes::from(vec![0x42u8; 5 * CAPACITY]);

    let (write_tx, write_rx) = mpsc::channel();
    client.write(
        message.clone(),
        Box::new(move |result| write_tx.send(result).unwrap()),
    );

    let destination = BytesMut::zeroed(5 * CAPACITY);
    let (read_tx, read_rx) = mpsc::channel();
    server.read_into(
        destination,
        Box::new(move |result| read_tx.send(result).unwrap()),
    );

    write_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    let received = read_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(received.len(), 5 * CAPACITY);
    assert!(received.iter().all(|&b| b == 0x42));

    transport.join();
}

#[test]
fn shm_chunking_implicit_read() {
    init_tracing();
    const CAPACITY: usize = 4096;
    let transport = shm_transport(CAPACITY);
    let (client, server) = connected_pair(&transport, &unique_addr());

    let message = Bytes::from(vec![0x42u8; 5 * CAPACITY]);
    let (write_tx, write_rx) = mpsc::channel();
    client.write(
        message,
        Box::new(move |result| write_tx.send(result).unwrap()),
    );

    let (read_tx, read_rx) = mpsc::channel();
    server.read(Box::new(move |result| read_tx.send(result).unwrap()));

    write_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    let received = read_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(received.len(), 5 * CAPACITY);
    assert!(received.iter().all(|&b| b == 0x42));

    transport.join();
}

#[test]
fn shm_queued_writes_complete_in_order() {
    init_tracing();
    const CAPACITY: usize = 4096;
    let transport = shm_transport(CAPACITY);
    let (client, server) = connected_pair(&transport, &unique_addr());

    // Two messages that cannot be in the ring at the same time.
    let size = 3 * CAPACITY / 4;
    let (write_tx, write_rx) = mpsc::channel();
    for i in 0..2u8 {
        let tx = write_tx.clone();
        client.write(
            Bytes::from(vec![i; size]),
            Box::new(move |result| tx.send((i, result)).unwrap()),
        );
    }

    let (read_tx, read_rx) = mpsc::channel();
    for _ in 0..2 {
        let tx = read_tx.clone();
        server.read(Box::new(move |result| tx.send(result).unwrap()));
    }

    for i in 0..2u8 {
        let (done, result) = write_rx.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(done, i);
        result.unwrap();
    }
    for i in 0..2u8 {
        let payload = read_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
        assert_eq!(payload.len(), size);
        assert!(payload.iter().all(|&b| b == i));
    }

    transport.join();
}

fn ordered_stream(transport: Arc<dyn Transport>, addr: &str) {
    let (client, server) = connected_pair(&transport, addr);

    // A mix of sizes, including empty and larger-than-typical frames.
    let sizes = [0usize, 1, 7, 256, 1024, 65536, 3];
    let payloads: Vec<Bytes> = sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| Bytes::from(vec![(i as u8).wrapping_mul(31); size]))
        .collect();

    let (write_tx, write_rx) = mpsc::channel();
    for payload in &payloads {
        let tx = write_tx.clone();
        client.write(
            payload.clone(),
            Box::new(move |result| tx.send(result).unwrap()),
        );
    }
    let (read_tx, read_rx) = mpsc::channel();
    for _ in &payloads {
        let tx = read_tx.clone();
        server.read(Box::new(move |result| tx.send(result).unwrap()));
    }

    for _ in &payloads {
        write_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    }
    for payload in &payloads {
        let received = read_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
        assert_eq!(&received[..], &payload[..]);
    }

    transport.join();
}

#[test]
fn sock_writes_read_in_order() {
    init_tracing();
    ordered_stream(sock_transport(), "127.0.0.1:0");
}

#[test]
fn shm_writes_read_in_order() {
    init_tracing();
    ordered_stream(shm_transport(8192), &unique_addr());
}

fn framed_messages(transport: Arc<dyn Transport>, addr: &str) {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Advertisement {
        domain_descriptor: String,
    }

    let (client, server) = connected_pair(&transport, addr);

    let (write_tx, write_rx) = mpsc::channel();
    ferry::codec::write_framed(
        &client,
        &Advertisement {
            domain_descriptor: "shm:test".into(),
        },
        Box::new(move |result| write_tx.send(result).unwrap()),
    );

    let (read_tx, read_rx) = mpsc::channel();
    ferry::codec::read_framed::<Advertisement, _>(&server, move |result| {
        read_tx.send(result).unwrap();
    });

    write_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    let message = read_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(message.domain_descriptor, "shm:test");

    transport.join();
}

#[test]
fn sock_framed_messages() {
    init_tracing();
    framed_messages(sock_transport(), "127.0.0.1:0");
}

#[test]
fn shm_framed_messages() {
    init_tracing();
    framed_messages(shm_transport(4096), &unique_addr());
}

fn close_aborts_pending_reads(transport: Arc<dyn Transport>, addr: &str) {
    let (client, server) = connected_pair(&transport, addr);

    let (read_tx, read_rx) = mpsc::channel();
    client.read(Box::new(move |result| read_tx.send(result).unwrap()));

    client.close();
    let outcome = read_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(outcome.unwrap_err(), Error::ConnectionClosed);

    // New submissions fail immediately with the latched error.
    let (read_tx, read_rx) = mpsc::channel();
    client.read(Box::new(move |result| read_tx.send(result).unwrap()));
    assert_eq!(
        read_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap_err(),
        Error::ConnectionClosed
    );

    // The peer observes end-of-stream.
    let (read_tx, read_rx) = mpsc::channel();
    server.read(Box::new(move |result| read_tx.send(result).unwrap()));
    let error = read_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap_err();
    assert!(
        error == Error::Eof || error == Error::ConnectionClosed,
        "unexpected error: {error}"
    );

    transport.join();
}

#[test]
fn sock_close_aborts_pending_reads() {
    init_tracing();
    close_aborts_pending_reads(sock_transport(), "127.0.0.1:0");
}

#[test]
fn shm_close_aborts_pending_reads() {
    init_tracing();
    close_aborts_pending_reads(shm_transport(4096), &unique_addr());
}

#[test]
fn sock_length_mismatch_is_a_protocol_violation() {
    init_tracing();
    let transport = sock_transport();
    let (client, server) = connected_pair(&transport, "127.0.0.1:0");

    let (write_tx, write_rx) = mpsc::channel();
    client.write(
        Bytes::from_static(b"four"),
        Box::new(move |result| write_tx.send(result).unwrap()),
    );
    write_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();

    // Destination is 8 bytes, frame is 4.
    let (read_tx, read_rx) = mpsc::channel();
    server.read_into(
        BytesMut::zeroed(8),
        Box::new(move |result| read_tx.send(result).unwrap()),
    );
    let error = read_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap_err();
    assert!(matches!(error, Error::ProtocolViolation(_)));

    transport.join();
}

#[test]
fn transport_join_with_live_connections_returns() {
    init_tracing();
    let transport = sock_transport();
    let (_client, _server) = connected_pair(&transport, "127.0.0.1:0");
    // join() closes the connections through the loop's shutdown walk.
    transport.join();
}
