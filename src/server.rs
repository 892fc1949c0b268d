//! Server-side control state machine and public-listener allocation (spec §4.5, §4.7).
//!
//! One `ControlSession` actor is spawned per accepted control connection (a process may
//! serve several Clients concurrently, each wholly independent per spec §6). The actor
//! owns the session registry outright — spec §5's "mutated only by its own event loop"
//! — and is the sole writer of the control channel, dispatching frames and internal
//! [`ServerEvent`]s from one `tokio::select!` loop, the same shape
//! `cli/src/socket/server.rs`'s accept loop and `cli/src/hub/events.rs`'s event enum use
//! together upstream.

use std::net::SocketAddr;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::{Context, Result};
use crate::listener::{self, ListenerHandle};
use crate::protocol::{encode, encode_init, Command, FrameDecoder, Mode};
use crate::registry::SessionRegistry;

/// Lowest/highest ephemeral port the public listener is chosen from (spec §4.7).
const PORT_RANGE: std::ops::RangeInclusive<u16> = 1025..=65535;

/// Bounded safeguard against an unbounded bind-retry loop (`SPEC_FULL.md` §10.6); not a
/// semantic change from spec §4.7's "repeatedly".
const MAX_BIND_ATTEMPTS: usize = 1024;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Internal events the owning control actor reacts to, alongside frames read directly
/// off the control channel.
#[derive(Debug)]
pub enum ServerEvent {
    /// A new public TCP connection was accepted and needs a session id.
    NewPublicConnection(TcpStream),
    /// A Listener session's socket closed locally.
    ListenerClosed { sid: u32 },
}

/// Observability hook: emitted once a control session successfully binds its public
/// listener. Not part of the wire protocol (spec §9 leaves port publication
/// unspecified); purely so integration tests and operators can learn the chosen port
/// out of band, matching spec §9's own suggestion ("deployment arranges publication of
/// the port out of band").
#[derive(Debug, Clone, Copy)]
pub struct ListenerBound {
    pub peer: SocketAddr,
    pub port: u16,
}

/// Run the Server: bind the control-channel listener and accept Clients forever.
pub async fn run(
    bind_addr: SocketAddr,
    ready_tx: Option<mpsc::UnboundedSender<ListenerBound>>,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind control listener on {bind_addr}"))?;
    log::info!("oblique server listening on {bind_addr}");

    loop {
        let (stream, peer) = listener.accept().await?;
        log::info!("client connected from {peer}");
        let ready_tx = ready_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_control_session(stream, peer, ready_tx).await {
                log::warn!("control session with {peer} ended: {e:#}");
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    AwaitInit,
    Running,
}

/// Drives one Client's control connection end to end.
async fn run_control_session(
    stream: TcpStream,
    peer: SocketAddr,
    ready_tx: Option<mpsc::UnboundedSender<ListenerBound>>,
) -> Result<()> {
    let (mut control_read, mut control_write) = stream.into_split();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let write_task = tokio::spawn(async move {
        while let Some(frame) = control_rx.recv().await {
            if control_write.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = control_write.shutdown().await;
    });

    let mut state = ServerState::AwaitInit;
    let mut decoder = FrameDecoder::new();
    let mut registry: SessionRegistry<ListenerHandle> = SessionRegistry::new();
    let mut public_accept_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut read_buf = vec![0u8; READ_BUF_SIZE];

    'session: loop {
        tokio::select! {
            result = control_read.read(&mut read_buf) => {
                let n = match result {
                    Ok(0) | Err(_) => break 'session, // transport loss
                    Ok(n) => n,
                };
                let frames = match decoder.feed(&read_buf[..n]) {
                    Ok(frames) => frames,
                    Err(e) => {
                        log::error!("malformed frame from {peer}: {e}");
                        let _ = control_tx.send(encode(Command::Invalid, 0, &[]));
                        break 'session;
                    }
                };
                for frame in frames {
                    let outcome = handle_frame(
                        frame,
                        peer,
                        &mut state,
                        &mut registry,
                        &control_tx,
                        &event_tx,
                        &ready_tx,
                        &mut public_accept_task,
                    );
                    if let Some(reply) = outcome.reply {
                        let _ = control_tx.send(reply);
                    }
                    if outcome.is_fatal {
                        break 'session;
                    }
                }
            }
            Some(ev) = event_rx.recv() => {
                match ev {
                    ServerEvent::NewPublicConnection(conn) => {
                        let sid = registry.generate_id();
                        let handle = listener::spawn(sid, conn, control_tx.clone(), event_tx.clone());
                        registry.insert(sid, handle);
                        log::info!("[{peer}] listener session {sid:08x} accepted");
                        let _ = control_tx.send(encode(Command::Open, sid, &[]));
                    }
                    ServerEvent::ListenerClosed { sid } => {
                        if registry.remove(sid).is_some() {
                            log::info!("[{peer}] listener session {sid:08x} dead");
                            let _ = control_tx.send(encode(Command::Dead, sid, &[]));
                        }
                    }
                }
            }
        }
    }

    // Transport loss (or fatal protocol error): close every owned Listener (spec §4.5).
    for (sid, handle) in registry.drain() {
        log::debug!("[{peer}] tearing down listener session {sid:08x} (control lost)");
        handle.abort();
    }
    if let Some(task) = public_accept_task {
        task.abort();
    }
    drop(control_tx);
    let _ = write_task.await;

    Ok(())
}

/// Result of dispatching one frame: whether the control channel must now close, and an
/// optional reply to flush before doing so.
struct FrameOutcome {
    is_fatal: bool,
    reply: Option<Vec<u8>>,
}

impl FrameOutcome {
    fn ok() -> Self {
        Self {
            is_fatal: false,
            reply: None,
        }
    }

    fn fatal(reply: Vec<u8>) -> Self {
        Self {
            is_fatal: true,
            reply: Some(reply),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_frame(
    frame: crate::protocol::DecodedFrame,
    peer: SocketAddr,
    state: &mut ServerState,
    registry: &mut SessionRegistry<ListenerHandle>,
    control_tx: &mpsc::UnboundedSender<Vec<u8>>,
    event_tx: &mpsc::UnboundedSender<ServerEvent>,
    ready_tx: &Option<mpsc::UnboundedSender<ListenerBound>>,
    public_accept_task: &mut Option<tokio::task::JoinHandle<()>>,
) -> FrameOutcome {
    use crate::protocol::Command::*;

    match (*state, frame.cmd) {
        (ServerState::AwaitInit, Init) => {
            if frame.sid != 0 {
                log::error!("[{peer}] INIT with non-zero sid {}", frame.sid);
                return FrameOutcome::fatal(encode(Invalid, 0, &[]));
            }
            let mode = u32::from_be_bytes(frame.payload[..4].try_into().unwrap());
            if Mode::from_u32(mode) != Some(Mode::Tcp) {
                log::error!("[{peer}] INIT requested unsupported mode {mode}");
                return FrameOutcome::fatal(encode(Invalid, 0, &[]));
            }
            let info = String::from_utf8_lossy(&frame.payload[4..]).into_owned();
            log::info!("[{peer}] INIT received: {info}");

            match bind_public_listener() {
                Ok((listener, port)) => {
                    let event_tx = event_tx.clone();
                    let ready_tx = ready_tx.clone();
                    *public_accept_task = Some(tokio::spawn(public_accept_loop(
                        listener, port, peer, event_tx, ready_tx,
                    )));
                    *state = ServerState::Running;
                    FrameOutcome {
                        is_fatal: false,
                        reply: Some(encode_init(
                            0,
                            Mode::Tcp,
                            "Successfully created a listener.",
                        )),
                    }
                }
                Err(e) => {
                    log::error!("[{peer}] failed to bind a public listener: {e}");
                    FrameOutcome::fatal(encode(Invalid, 0, &[]))
                }
            }
        }
        (ServerState::AwaitInit, _) => {
            log::error!("[{peer}] expected INIT, got {:?}", frame.cmd);
            FrameOutcome::fatal(encode(Invalid, 0, &[]))
        }
        (ServerState::Running, Data) => {
            if let Some(handle) = registry.get(frame.sid) {
                handle.deliver(frame.payload);
            } else {
                log::debug!("[{peer}] DATA for unknown sid {:08x}", frame.sid);
                let _ = control_tx.send(encode(Invalid, frame.sid, &[]));
            }
            FrameOutcome::ok()
        }
        (ServerState::Running, Dead) => {
            if let Some(handle) = registry.remove(frame.sid) {
                log::info!("[{peer}] session {:08x} reported dead by peer", frame.sid);
                handle.abort();
                // No echo: the peer already knows its own session died (spec §4.5).
            }
            FrameOutcome::ok()
        }
        (ServerState::Running, Open) => {
            // No-op acknowledgement that the Client's Repeater dial succeeded (spec §4.5).
            log::debug!("[{peer}] OPEN ack for session {:08x}", frame.sid);
            FrameOutcome::ok()
        }
        (ServerState::Running, Beat) => FrameOutcome::ok(), // reserved, ignored
        (ServerState::Running, Invalid) => {
            log::warn!("[{peer}] peer reported INVALID for sid {:08x}", frame.sid);
            FrameOutcome::ok()
        }
        (ServerState::Running, Init) => {
            log::warn!("[{peer}] unexpected INIT while running, ignoring");
            FrameOutcome::ok()
        }
    }
}

/// Repeatedly pick a random ephemeral port and try to bind it (spec §4.7).
fn bind_public_listener() -> std::io::Result<(std::net::TcpListener, u16)> {
    let mut rng = rand::rng();
    for _ in 0..MAX_BIND_ATTEMPTS {
        let port = rng.random_range(PORT_RANGE);
        match std::net::TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => return Ok((listener, port)),
            Err(_) => continue,
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!("exhausted {MAX_BIND_ATTEMPTS} bind attempts in {PORT_RANGE:?}"),
    ))
}

/// Accept loop for the public listener: every accepted connection is handed to the
/// owning control actor as a [`ServerEvent::NewPublicConnection`] so session-id
/// generation and registry insertion stay on that single task.
async fn public_accept_loop(
    listener: std::net::TcpListener,
    port: u16,
    peer: SocketAddr,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    ready_tx: Option<mpsc::UnboundedSender<ListenerBound>>,
) {
    let listener = match listener.set_nonblocking(true).and_then(|_| TcpListener::from_std(listener)) {
        Ok(l) => l,
        Err(e) => {
            log::error!("[{peer}] failed to convert public listener to async: {e}");
            return;
        }
    };
    log::info!("[{peer}] public listener bound on port {port}");
    if let Some(tx) = &ready_tx {
        let _ = tx.send(ListenerBound { peer, port });
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                log::info!("[{peer}] public connection from {addr} on port {port}");
                if event_tx.send(ServerEvent::NewPublicConnection(stream)).is_err() {
                    break; // control session gone
                }
            }
            Err(e) => {
                log::warn!("[{peer}] accept error on public listener: {e}");
            }
        }
    }
}
