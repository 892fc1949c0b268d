//! Client-side control state machine and early-data buffering (spec §4.6).
//!
//! Mirrors `server.rs`'s shape: one actor owns the registry and the control channel,
//! dispatching frames and internal [`ClientEvent`]s from a single `tokio::select!`
//! loop. The one piece with no Server-side analogue is the early-data buffer: `DATA`
//! frames can arrive for a session id before its Repeater has finished dialing the
//! target, and they must not be dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::error::{Context, Result};
use crate::protocol::{encode, encode_init, Command, FrameDecoder, Mode};
use crate::registry::SessionRegistry;
use crate::repeater::{self, RepeaterHandle};

/// Early-data retry delay (spec §4.6, §9: fixed at 250ms by this spec's own
/// resolution of the source's ambiguous unit).
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Early-data retry count cap (spec §4.6, §9).
const MAX_RETRIES: u32 = 3;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Internal events the owning control actor reacts to, alongside frames read directly
/// off the control channel.
#[derive(Debug)]
pub enum ClientEvent {
    /// The async dial to the target succeeded.
    RepeaterConnected { sid: u32, stream: TcpStream },
    /// The async dial to the target failed.
    RepeaterDialFailed { sid: u32 },
    /// A Repeater session's socket closed locally.
    RepeaterClosed { sid: u32 },
    /// An early-data retry timer fired for `sid`.
    RetryDeliver { sid: u32, retries_left: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Connecting,
    Running,
}

/// Connect to the Server and drive one forwarding's control connection to completion.
pub async fn run(config: ClientConfig) -> Result<()> {
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to oblique server at {addr}"))?;
    log::info!("connected to server at {addr}");

    let (mut control_read, mut control_write) = stream.into_split();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ClientEvent>();

    let write_task = tokio::spawn(async move {
        while let Some(frame) = control_rx.recv().await {
            if control_write.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = control_write.shutdown().await;
    });

    // "On connect the Client immediately sends INIT(0, mode(4) ‖ info_string)" (spec §4.6).
    let info = config.info_string();
    let _ = control_tx.send(encode_init(0, Mode::Tcp, &info));

    let mut state = ClientState::Connecting;
    let mut decoder = FrameDecoder::new();
    let mut registry: SessionRegistry<RepeaterHandle> = SessionRegistry::new();
    let mut pending: HashMap<u32, VecDeque<Vec<u8>>> = HashMap::new();
    let mut retrying: HashSet<u32> = HashSet::new();
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
                        log::error!("malformed frame from server: {e}");
                        let _ = control_tx.send(encode(Command::Invalid, 0, &[]));
                        break 'session;
                    }
                };
                for frame in frames {
                    handle_frame(
                        frame,
                        &config,
                        &mut state,
                        &mut registry,
                        &mut pending,
                        &mut retrying,
                        &control_tx,
                        &event_tx,
                    );
                }
            }
            Some(ev) = event_rx.recv() => {
                handle_event(
                    ev,
                    &mut registry,
                    &mut pending,
                    &mut retrying,
                    &control_tx,
                    &event_tx,
                );
            }
        }
    }

    // Transport loss: close every owned Repeater (spec §4.6).
    for (sid, handle) in registry.drain() {
        log::debug!("tearing down repeater session {sid:08x} (control lost)");
        handle.abort();
    }
    pending.clear();
    retrying.clear();
    drop(control_tx);
    let _ = write_task.await;

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn handle_frame(
    frame: crate::protocol::DecodedFrame,
    config: &ClientConfig,
    state: &mut ClientState,
    registry: &mut SessionRegistry<RepeaterHandle>,
    pending: &mut HashMap<u32, VecDeque<Vec<u8>>>,
    retrying: &mut HashSet<u32>,
    control_tx: &mpsc::UnboundedSender<Vec<u8>>,
    event_tx: &mpsc::UnboundedSender<ClientEvent>,
) {
    use crate::protocol::Command::*;

    match (*state, frame.cmd) {
        (ClientState::Connecting, Init) => {
            let msg = String::from_utf8_lossy(&frame.payload[4..]);
            if !msg.is_empty() {
                log::info!("init ack from server: {msg}");
            }
            *state = ClientState::Running;
        }
        (_, Open) => {
            let sid = frame.sid;
            log::info!("session {sid:08x} opened, dialing target");
            let target_host = config.target_host.clone();
            let target_port = config.target_port;
            let dial_delay = config.dial_delay;
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                if !dial_delay.is_zero() {
                    tokio::time::sleep(dial_delay).await;
                }
                match TcpStream::connect((target_host.as_str(), target_port)).await {
                    Ok(stream) => {
                        let _ = event_tx.send(ClientEvent::RepeaterConnected { sid, stream });
                    }
                    Err(e) => {
                        log::warn!("session {sid:08x} dial to {target_host}:{target_port} failed: {e}");
                        let _ = event_tx.send(ClientEvent::RepeaterDialFailed { sid });
                    }
                }
            });
        }
        (_, Data) => {
            deliver_or_buffer(frame.sid, frame.payload, registry, pending, retrying, event_tx);
        }
        (_, Dead) => {
            let sid = frame.sid;
            if let Some(handle) = registry.remove(sid) {
                log::info!("session {sid:08x} reported dead by peer");
                handle.abort();
            }
            pending.remove(&sid);
            retrying.remove(&sid);
        }
        (_, Beat) => {} // reserved, ignored
        (_, Invalid) => {
            log::warn!("peer reported INVALID for sid {:08x}", frame.sid);
        }
        (ClientState::Running, Init) => {
            log::warn!("unexpected INIT while running, ignoring");
        }
    }

    let _ = control_tx; // kept for symmetry with server.rs's dispatch signature
}

fn handle_event(
    ev: ClientEvent,
    registry: &mut SessionRegistry<RepeaterHandle>,
    pending: &mut HashMap<u32, VecDeque<Vec<u8>>>,
    retrying: &mut HashSet<u32>,
    control_tx: &mpsc::UnboundedSender<Vec<u8>>,
    event_tx: &mpsc::UnboundedSender<ClientEvent>,
) {
    match ev {
        ClientEvent::RepeaterConnected { sid, stream } => {
            let handle = repeater::spawn(sid, stream, control_tx.clone(), event_tx.clone());
            registry.insert(sid, handle);
            // Serves as a "connected" acknowledgement; the Server is permitted to ignore it
            // (spec §4.4).
            let _ = control_tx.send(encode(Command::Open, sid, &[]));
            if let Some(queue) = pending.remove(&sid) {
                if let Some(handle) = registry.get(sid) {
                    for chunk in queue {
                        handle.deliver(chunk);
                    }
                }
            }
            retrying.remove(&sid);
        }
        ClientEvent::RepeaterDialFailed { sid } => {
            let _ = control_tx.send(encode(Command::Dead, sid, &[]));
            pending.remove(&sid);
            retrying.remove(&sid);
        }
        ClientEvent::RepeaterClosed { sid } => {
            if registry.remove(sid).is_some() {
                log::info!("session {sid:08x} target connection closed");
                let _ = control_tx.send(encode(Command::Dead, sid, &[]));
            }
        }
        ClientEvent::RetryDeliver { sid, retries_left } => {
            if let Some(handle) = registry.get(sid) {
                if let Some(queue) = pending.remove(&sid) {
                    for chunk in queue {
                        handle.deliver(chunk);
                    }
                }
                retrying.remove(&sid);
            } else if retries_left == 0 {
                log::warn!("session {sid:08x} exhausted early-data retries, killing");
                pending.remove(&sid);
                retrying.remove(&sid);
                let _ = control_tx.send(encode(Command::Dead, sid, &[]));
            } else {
                schedule_retry(sid, retries_left - 1, event_tx.clone());
            }
        }
    }
}

/// Implements the early-data discipline of spec §4.6: buffer `DATA` for a sid whose
/// Repeater hasn't registered yet, and start (at most one) retry countdown chain for
/// that sid — matching the Python original's single-chain-per-sid `try_send` rather than
/// a fresh chain per arriving frame (`SPEC_FULL.md` §10.6).
fn deliver_or_buffer(
    sid: u32,
    payload: Vec<u8>,
    registry: &SessionRegistry<RepeaterHandle>,
    pending: &mut HashMap<u32, VecDeque<Vec<u8>>>,
    retrying: &mut HashSet<u32>,
    event_tx: &mpsc::UnboundedSender<ClientEvent>,
) {
    if let Some(handle) = registry.get(sid) {
        handle.deliver(payload);
        return;
    }

    pending.entry(sid).or_default().push_back(payload);
    if retrying.insert(sid) {
        schedule_retry(sid, MAX_RETRIES - 1, event_tx.clone());
    }
}

fn schedule_retry(sid: u32, retries_left: u32, event_tx: mpsc::UnboundedSender<ClientEvent>) {
    tokio::spawn(async move {
        tokio::time::sleep(RETRY_DELAY).await;
        let _ = event_tx.send(ClientEvent::RetryDeliver { sid, retries_left });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(pending: &mut HashMap<u32, VecDeque<Vec<u8>>>, sid: u32) -> Vec<Vec<u8>> {
        pending.remove(&sid).map(|q| q.into_iter().collect()).unwrap_or_default()
    }

    #[test]
    fn buffers_in_order_when_unregistered() {
        let registry: SessionRegistry<RepeaterHandle> = SessionRegistry::new();
        let mut pending = HashMap::new();
        let mut retrying = HashSet::new();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        deliver_or_buffer(1, b"a".to_vec(), &registry, &mut pending, &mut retrying, &event_tx);
        deliver_or_buffer(1, b"b".to_vec(), &registry, &mut pending, &mut retrying, &event_tx);
        deliver_or_buffer(1, b"c".to_vec(), &registry, &mut pending, &mut retrying, &event_tx);

        assert_eq!(drain(&mut pending, 1), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        // Only one retry chain should have been scheduled for repeated DATA on the same sid.
        assert!(retrying.contains(&1));
        event_rx.close();
    }

    #[test]
    fn distinct_sids_buffer_independently() {
        let registry: SessionRegistry<RepeaterHandle> = SessionRegistry::new();
        let mut pending = HashMap::new();
        let mut retrying = HashSet::new();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        deliver_or_buffer(1, b"x".to_vec(), &registry, &mut pending, &mut retrying, &event_tx);
        deliver_or_buffer(2, b"y".to_vec(), &registry, &mut pending, &mut retrying, &event_tx);

        assert_eq!(drain(&mut pending, 1), vec![b"x".to_vec()]);
        assert_eq!(drain(&mut pending, 2), vec![b"y".to_vec()]);
        event_rx.close();
    }
}
