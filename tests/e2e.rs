//! End-to-end tests driving the Server and Client over real loopback sockets (spec §8).

use std::time::Duration;

use oblique::client;
use oblique::config::ClientConfig;
use oblique::protocol::{encode, encode_init, Command, Mode};
use oblique::server::{self, ListenerBound};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Bind an ephemeral port and hand it back freed, for use as a not-yet-taken address.
async fn free_addr() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A trivial internal target: echoes back whatever it receives, one connection at a
/// time per accept, indefinitely.
async fn spawn_echo_target() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Start a Server control listener and a Client forwarding to `target_addr`, returning
/// the public port the Server opened once the Client's INIT handshake completes.
async fn spawn_tunnel(target_addr: std::net::SocketAddr) -> u16 {
    spawn_tunnel_with_dial_delay(target_addr, Duration::ZERO).await
}

/// Like [`spawn_tunnel`], but with an artificial delay inserted before the Client dials
/// the target (spec §8 scenario 2: "Introduce a 200 ms artificial delay in the Client's
/// dial to target").
async fn spawn_tunnel_with_dial_delay(
    target_addr: std::net::SocketAddr,
    dial_delay: Duration,
) -> u16 {
    let control_addr = free_addr().await;
    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<ListenerBound>();

    tokio::spawn(server::run(control_addr, Some(ready_tx)));

    let client_config = ClientConfig {
        server_host: control_addr.ip().to_string(),
        server_port: control_addr.port(),
        target_host: target_addr.ip().to_string(),
        target_port: target_addr.port(),
        dial_delay,
    };
    tokio::spawn(client::run(client_config));

    let bound = timeout(WAIT, ready_rx.recv())
        .await
        .expect("timed out waiting for public listener")
        .expect("server task ended before binding a listener");
    bound.port
}

#[tokio::test]
async fn happy_path_single_session() {
    let target_addr = spawn_echo_target().await;
    let public_port = spawn_tunnel(target_addr).await;

    let mut conn = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    conn.write_all(b"hello through the tunnel").await.unwrap();

    let mut buf = vec![0u8; 64];
    let n = timeout(WAIT, conn.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"hello through the tunnel");
}

#[tokio::test]
async fn early_data_is_buffered_across_a_slow_dial() {
    let target_addr = spawn_echo_target().await;
    // Delay the Client's dial well past the time it takes the public connection to be
    // accepted and the first user bytes to arrive as a DATA frame, forcing the race spec
    // §8 scenario 2 describes: DATA(sid, ...) lands before the Repeater has registered.
    let public_port = spawn_tunnel_with_dial_delay(target_addr, Duration::from_millis(200)).await;

    let mut conn = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    conn.write_all(b"A").await.unwrap();

    // The echoed byte only arrives once the delayed dial completes and the buffered
    // early data is drained to the target; no INVALID is sent for this sid in the
    // meantime, so a plain read (not a protocol-error check) is the right assertion.
    let mut buf = [0u8; 1];
    let n = timeout(WAIT, conn.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"A", "early data must not be dropped while the dial is in flight");
}

#[tokio::test]
async fn multiple_concurrent_sessions() {
    let target_addr = spawn_echo_target().await;
    let public_port = spawn_tunnel(target_addr).await;

    const SESSIONS: usize = 50;
    const PAYLOAD_SIZE: usize = 64 * 1024;

    let mut handles = Vec::with_capacity(SESSIONS);
    for i in 0..SESSIONS {
        handles.push(tokio::spawn(async move {
            let mut payload = vec![0u8; PAYLOAD_SIZE];
            for (j, b) in payload.iter_mut().enumerate() {
                *b = ((i * 31 + j) % 256) as u8;
            }

            let mut conn = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
            conn.write_all(&payload).await.unwrap();

            let mut received = vec![0u8; PAYLOAD_SIZE];
            let mut got = 0;
            while got < PAYLOAD_SIZE {
                let n = timeout(WAIT, conn.read(&mut received[got..]))
                    .await
                    .unwrap()
                    .unwrap();
                assert_ne!(n, 0, "target closed early at {got} bytes (session {i})");
                got += n;
            }
            assert_eq!(received, payload, "session {i} round-trip mismatch");
        }));
    }

    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test]
async fn unreachable_target_kills_the_session() {
    // A free address nobody is listening on.
    let target_addr = free_addr().await;
    let public_port = spawn_tunnel(target_addr).await;

    let mut conn = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    let _ = conn.write_all(b"anybody home?").await;

    let mut buf = [0u8; 16];
    let n = timeout(WAIT, conn.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "expected the public connection to be closed after a failed dial");
}

/// Read exactly `expected.len()` bytes (looping over short reads) within [`WAIT`].
async fn read_exact_within(conn: &mut TcpStream, expected: &[u8]) {
    let mut got = vec![0u8; expected.len()];
    timeout(WAIT, conn.read_exact(&mut got)).await.unwrap().unwrap();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn garbled_control_frame_closes_the_channel() {
    let control_addr = free_addr().await;
    tokio::spawn(server::run(control_addr, None));

    let mut conn = TcpStream::connect(control_addr).await.unwrap();
    // Valid header shape, deliberately corrupted magic.
    let mut garbage = encode(Command::Data, 1, b"x");
    garbage[0] ^= 0xFF;
    conn.write_all(&garbage).await.unwrap();

    // The server flushes an INVALID(0) frame before closing (spec §7).
    read_exact_within(&mut conn, &encode(Command::Invalid, 0, &[])).await;

    let mut buf = [0u8; 16];
    let n = timeout(WAIT, conn.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "server should close the control channel on a malformed frame");
}

#[tokio::test]
async fn init_with_nonzero_sid_is_rejected() {
    let control_addr = free_addr().await;
    tokio::spawn(server::run(control_addr, None));

    let mut conn = TcpStream::connect(control_addr).await.unwrap();
    let frame = encode_init(7, Mode::Tcp, "Forwarding to 10.0.0.1:80");
    conn.write_all(&frame).await.unwrap();

    read_exact_within(&mut conn, &encode(Command::Invalid, 0, &[])).await;

    let mut buf = [0u8; 16];
    let n = timeout(WAIT, conn.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "server should reject an INIT carrying a non-zero sid");
}
