use std::{
    thread,
    time::{Duration, Instant},
};

use unisock::{Socket, SocketError, State, Timeouts, TransportKind};

fn stream_socket(port: u16) -> Socket {
    Socket::new(TransportKind::Stream, "127.0.0.1", Some(port)).unwrap()
}

#[test]
fn tcp_round_trip() {
    _ = pretty_env_logger::try_init();

    let mut server = stream_socket(18831);

    server.bind().unwrap();
    server.listen(1).unwrap();

    let client = thread::spawn(move || {
        let mut client = stream_socket(18831);

        client.connect().unwrap();

        assert_eq!(client.state(), State::Connected);

        client.send(b"hello").unwrap();

        client.recv(5, Some(5)).unwrap()
    });

    let mut conn = server.accept().unwrap();

    assert_eq!(server.state(), State::Listening);
    assert_eq!(conn.state(), State::Connected);

    let request = conn.recv(5, Some(5)).unwrap();

    assert_eq!(request, b"hello");

    conn.send(&request).unwrap();

    assert_eq!(client.join().unwrap(), b"hello");
}

#[test]
fn recv_waits_for_minimum_across_partial_writes() {
    _ = pretty_env_logger::try_init();

    let mut server = stream_socket(18832);

    server.bind().unwrap();
    server.listen(1).unwrap();

    let client = thread::spawn(move || {
        let mut client = stream_socket(18832);

        client.connect().unwrap();

        client.send(b"he").unwrap();

        thread::sleep(Duration::from_millis(100));

        client.send(b"llo").unwrap();

        // Hold the connection open until the server is done reading.
        thread::sleep(Duration::from_millis(300));
    });

    let mut conn = server.accept().unwrap();

    let bytes = conn.recv(5, None).unwrap();

    assert_eq!(bytes, b"hello");

    client.join().unwrap();
}

#[test]
fn recv_never_exceeds_maximum() {
    _ = pretty_env_logger::try_init();

    let mut server = stream_socket(18833);

    server.bind().unwrap();
    server.listen(1).unwrap();

    let client = thread::spawn(move || {
        let mut client = stream_socket(18833);

        client.connect().unwrap();

        client.send(b"abcdef").unwrap();

        thread::sleep(Duration::from_millis(300));
    });

    let mut conn = server.accept().unwrap();

    assert_eq!(conn.recv(3, Some(3)).unwrap(), b"abc");
    assert_eq!(conn.recv(3, Some(3)).unwrap(), b"def");

    client.join().unwrap();
}

#[test]
fn peer_close_surfaces_connection_closed_and_releases() {
    _ = pretty_env_logger::try_init();

    let mut server = stream_socket(18834);

    server.bind().unwrap();
    server.listen(1).unwrap();

    let client = thread::spawn(move || {
        let mut client = stream_socket(18834);

        client.connect().unwrap();
        client.close();

        assert_eq!(client.state(), State::Unbound);
    });

    let mut conn = server.accept().unwrap();

    let err = conn.recv(1, None).unwrap_err();

    assert!(matches!(err, SocketError::ConnectionClosed));

    // The failed receive already closed the socket.
    assert_eq!(conn.state(), State::Unbound);

    client.join().unwrap();
}

#[test]
fn read_timeout_expires_within_bound() {
    _ = pretty_env_logger::try_init();

    let mut server = stream_socket(18835);

    server.bind().unwrap();
    server.listen(1).unwrap();

    let client = thread::spawn(move || {
        let mut client = stream_socket(18835);

        client.connect().unwrap();

        // Stay silent long enough for the server's read to expire.
        thread::sleep(Duration::from_millis(1500));
    });

    let mut conn = server.accept().unwrap();

    conn.set_read_timeout(Some(Duration::from_secs(1)));

    let start = Instant::now();

    let err = conn.recv(1, None).unwrap_err();

    assert!(matches!(err, SocketError::Timeout(_)), "got {err:?}");

    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(900), "expired after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "expired after {elapsed:?}");

    client.join().unwrap();
}

#[test]
fn read_timeout_bounds_the_call_after_partial_data() {
    _ = pretty_env_logger::try_init();

    let mut server = stream_socket(18838);

    server.bind().unwrap();
    server.listen(1).unwrap();

    let client = thread::spawn(move || {
        let mut client = stream_socket(18838);

        client.connect().unwrap();

        // Deliver part of the payload, then stall well past the server's
        // read timeout.
        client.send(b"he").unwrap();

        thread::sleep(Duration::from_millis(1500));

        client.send(b"llo").unwrap();
    });

    let mut conn = server.accept().unwrap();

    conn.set_read_timeout(Some(Duration::from_millis(200)));

    let start = Instant::now();

    let err = conn.recv(5, None).unwrap_err();

    assert!(matches!(err, SocketError::Timeout(_)), "got {err:?}");

    // The timeout must keep bounding the call once the loop has already
    // consumed the first bytes.
    assert!(start.elapsed() < Duration::from_secs(1), "expired after {:?}", start.elapsed());

    client.join().unwrap();
}

#[test]
fn unbounded_recv_drains_more_than_one_chunk() {
    _ = pretty_env_logger::try_init();

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    let mut server = stream_socket(18839);

    server.bind().unwrap();
    server.listen(1).unwrap();

    let sent = payload.clone();

    let client = thread::spawn(move || {
        let mut client = stream_socket(18839);

        client.connect().unwrap();

        client.send(&sent).unwrap();

        // Keep the connection open while the server drains.
        thread::sleep(Duration::from_millis(1000));
    });

    let mut conn = server.accept().unwrap();

    // Let the payload pile up in the kernel buffer so the drain branch
    // has more than one full 32768-byte chunk to pull.
    thread::sleep(Duration::from_millis(500));

    let mut bytes = conn.recv(1, None).unwrap();

    assert!(bytes.len() > 32768, "drained only {} bytes", bytes.len());
    assert_eq!(bytes, payload[..bytes.len()]);

    while bytes.len() < payload.len() {
        let remaining = payload.len() - bytes.len();

        bytes.extend(conn.recv(remaining, Some(remaining)).unwrap());
    }

    assert_eq!(bytes, payload);

    client.join().unwrap();
}

#[test]
fn oversized_read_timeout_is_clamped_not_truncated() {
    _ = pretty_env_logger::try_init();

    let mut server = stream_socket(18840);

    server.bind().unwrap();
    server.listen(1).unwrap();

    let client = thread::spawn(move || {
        let mut client = stream_socket(18840);

        client.connect().unwrap();

        thread::sleep(Duration::from_millis(300));

        client.send(b"late").unwrap();

        thread::sleep(Duration::from_millis(300));
    });

    let mut conn = server.accept().unwrap();

    // 2^32 milliseconds; naive truncation to c_int would make this wait
    // expire immediately instead of outlasting the sender's delay.
    conn.set_read_timeout(Some(Duration::from_millis(1 << 32)));

    assert_eq!(conn.recv(4, Some(4)).unwrap(), b"late");

    client.join().unwrap();
}

#[test]
fn connect_to_unreachable_peer_fails_within_timeout() {
    _ = pretty_env_logger::try_init();

    // Non-routable address; depending on the network either the connect
    // wait times out or the OS reports unreachable. Both end as a
    // connection error once the candidate list is exhausted.
    let mut socket = Socket::with_timeouts(
        TransportKind::Stream,
        "10.255.255.1",
        Some(65000),
        Timeouts {
            connect: Some(Duration::from_secs(1)),
            ..Default::default()
        },
    )
    .unwrap();

    let start = Instant::now();

    let err = socket.connect().unwrap_err();

    assert!(matches!(err, SocketError::Connection { .. }), "got {err:?}");

    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn lifecycle_violations_name_the_current_state() {
    _ = pretty_env_logger::try_init();

    let mut socket = stream_socket(18836);

    let err = socket.listen(1).unwrap_err();

    assert!(matches!(
        err,
        SocketError::InvalidState {
            op: "listen",
            state: State::Unbound
        }
    ));

    let err = socket.accept().unwrap_err();

    assert!(format!("{err}").contains("Unbound"));

    let err = socket.recv(1, None).unwrap_err();

    assert!(matches!(err, SocketError::InvalidState { op: "recv", .. }));
}

#[test]
fn construction_failures() {
    _ = pretty_env_logger::try_init();

    assert!(matches!(
        Socket::new(TransportKind::Stream, "", Some(80)).unwrap_err(),
        SocketError::Resolution(_)
    ));

    assert!(matches!(
        Socket::new(TransportKind::Stream, "127.0.0.1", None).unwrap_err(),
        SocketError::Resolution(_)
    ));
}

#[test]
fn close_twice_is_a_no_op() {
    _ = pretty_env_logger::try_init();

    let mut server = stream_socket(18837);

    server.bind().unwrap();

    server.close();

    assert_eq!(server.state(), State::Unbound);

    server.close();

    assert_eq!(server.state(), State::Unbound);
}
