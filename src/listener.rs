//! Server-side Listener session: owns one accepted public TCP connection and bridges
//! its bytes onto the control channel (spec §4.3).
//!
//! Grounded on `cli/src/socket/client_conn.rs`'s `SocketClientConn`: a read task and a
//! write task split over `TcpStream::into_split()`, talking to the owning control actor
//! through an event channel rather than sharing mutable state directly.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{encode, Command};
use crate::server::ServerEvent;

/// Read buffer size for bytes arriving from the external user.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Handle the owning control session keeps in its [`crate::registry::SessionRegistry`]
/// for one live Listener session.
#[derive(Debug)]
pub struct ListenerHandle {
    to_user_tx: mpsc::UnboundedSender<Vec<u8>>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Deliver bytes received from the peer (Client) to the external user's socket.
    ///
    /// Returns `false` if the session has already torn down locally; per spec §4.3,
    /// write failures are not by themselves fatal — the subsequent close event surfaces
    /// them.
    pub fn deliver(&self, data: Vec<u8>) -> bool {
        self.to_user_tx.send(data).is_ok()
    }

    /// Tear down both tasks for this session, e.g. on receiving `DEAD` from the peer.
    pub fn abort(self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

/// Spawn the read/write tasks for a newly-accepted public connection.
///
/// The caller (the owning `ControlSession`) has already generated `sid` and is
/// responsible for sending `OPEN(sid)` on the control channel; this function only wires
/// up the bidirectional byte bridge.
pub fn spawn(
    sid: u32,
    stream: TcpStream,
    control_tx: mpsc::UnboundedSender<Vec<u8>>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
) -> ListenerHandle {
    let (read_half, write_half) = stream.into_split();
    let (to_user_tx, to_user_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let write_task = tokio::spawn(write_loop(sid, write_half, to_user_rx));
    let read_task = tokio::spawn(read_loop(sid, read_half, control_tx, event_tx));

    ListenerHandle {
        to_user_tx,
        read_task,
        write_task,
    }
}

/// Writes bytes arriving from the peer into the user-facing socket.
async fn write_loop(
    sid: u32,
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut to_user_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(data) = to_user_rx.recv().await {
        if let Err(e) = write_half.write_all(&data).await {
            log::warn!("[listener {sid:08x}] write to user failed: {e}");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Reads bytes from the user-facing socket and frames them as `DATA` onto the control
/// channel; reports local closure back to the owning control session.
async fn read_loop(
    sid: u32,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    control_tx: mpsc::UnboundedSender<Vec<u8>>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                log::info!("[listener {sid:08x}] user connection closed");
                let _ = event_tx.send(ServerEvent::ListenerClosed { sid });
                break;
            }
            Ok(n) => {
                let frame = encode(Command::Data, sid, &buf[..n]);
                if control_tx.send(frame).is_err() {
                    break; // control channel gone; transport-loss teardown handles this
                }
            }
            Err(e) => {
                log::info!("[listener {sid:08x}] user connection error: {e}");
                let _ = event_tx.send(ServerEvent::ListenerClosed { sid });
                break;
            }
        }
    }
}
