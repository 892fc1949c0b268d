//! Client-side Repeater session: owns one TCP connection to the forwarding target and
//! bridges its bytes onto the control channel (spec §4.4).
//!
//! Grounded on `cli/src/relay/stream_mux.rs`'s `handle_open`: dial, then split the
//! connected socket into a reader loop (target → control) and a writer task fed by a
//! channel (control → target), exactly the shape used here.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::ClientEvent;
use crate::protocol::{encode, Command};

/// Read buffer size for bytes arriving from the forwarding target.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Handle the owning control session keeps in its [`crate::registry::SessionRegistry`]
/// for one live Repeater session.
#[derive(Debug)]
pub struct RepeaterHandle {
    to_target_tx: mpsc::UnboundedSender<Vec<u8>>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl RepeaterHandle {
    /// Deliver bytes received from the peer (Server) to the target socket.
    pub fn deliver(&self, data: Vec<u8>) -> bool {
        self.to_target_tx.send(data).is_ok()
    }

    /// Tear down both tasks for this session, e.g. on receiving `DEAD` from the peer.
    pub fn abort(self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

/// Spawn the read/write tasks for an already-connected target socket.
///
/// The caller is responsible for the dial itself (spec §4.4: on dial failure, send
/// `DEAD(sid)` and drop any early data — this function is only reached after a
/// successful connect).
pub fn spawn(
    sid: u32,
    stream: TcpStream,
    control_tx: mpsc::UnboundedSender<Vec<u8>>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
) -> RepeaterHandle {
    let (read_half, write_half) = stream.into_split();
    let (to_target_tx, to_target_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let write_task = tokio::spawn(write_loop(sid, write_half, to_target_rx));
    let read_task = tokio::spawn(read_loop(sid, read_half, control_tx, event_tx));

    RepeaterHandle {
        to_target_tx,
        read_task,
        write_task,
    }
}

/// Writes bytes arriving from the peer into the target socket.
async fn write_loop(
    sid: u32,
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut to_target_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(data) = to_target_rx.recv().await {
        if let Err(e) = write_half.write_all(&data).await {
            log::warn!("[repeater {sid:08x}] write to target failed: {e}");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Reads bytes from the target socket and frames them as `DATA` onto the control
/// channel; reports local closure back to the owning control session.
async fn read_loop(
    sid: u32,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    control_tx: mpsc::UnboundedSender<Vec<u8>>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                log::info!("[repeater {sid:08x}] target connection closed");
                let _ = event_tx.send(ClientEvent::RepeaterClosed { sid });
                break;
            }
            Ok(n) => {
                let frame = encode(Command::Data, sid, &buf[..n]);
                if control_tx.send(frame).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::info!("[repeater {sid:08x}] target connection error: {e}");
                let _ = event_tx.send(ClientEvent::RepeaterClosed { sid });
                break;
            }
        }
    }
}
