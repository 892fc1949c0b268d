//! Wire protocol codec for the Oblique control channel.
//!
//! Fixed 13-byte header followed by an opaque payload:
//!
//! ```text
//! [u32 BE magic] [u8 cmd] [u32 BE sid] [u32 BE len] [payload: len bytes]
//! ```
//!
//! `MAGIC = 0xBACCAA73`. All integers are big-endian, matching the Python reference
//! implementation's `struct.pack(">LBLL", ...)` layout.

use anyhow::{anyhow, bail, Result};
use bytes::{Buf, BytesMut};

/// Magic header every frame must start with.
pub const MAGIC: u32 = 0xBACC_AA73;

/// Fixed header size: magic(4) + cmd(1) + sid(4) + len(4).
const HEADER_LEN: usize = 13;

/// Generous upper bound on a single frame's payload, purely a liveness/memory
/// safeguard against a malicious or buggy peer claiming an enormous length; spec §3
/// allows payloads up to 2^32-1 bytes but does not require accepting that much in one
/// allocation.
const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Session id reserved for control-level `INIT` framing (spec §3).
pub const CONTROL_SID: u32 = 0;

/// Control commands recognized on the wire (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client→Server (and the Server's ack reply): announce/confirm a forwarding.
    Init,
    /// Open a new session (Server→Client on accept; Client→Server as a dial-success ack).
    Open,
    /// Carries session payload bytes in either direction.
    Data,
    /// A session has died; no further frames for its sid will follow.
    Dead,
    /// Reserved keepalive; never emitted or consumed by this core.
    Beat,
    /// Sent before closing a control channel (or to flag a per-session protocol error).
    Invalid,
}

impl Command {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Command::Init),
            0x02 => Some(Command::Open),
            0x03 => Some(Command::Data),
            0x04 => Some(Command::Dead),
            0xAA => Some(Command::Beat),
            0xF0 => Some(Command::Invalid),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Command::Init => 0x01,
            Command::Open => 0x02,
            Command::Data => 0x03,
            Command::Dead => 0x04,
            Command::Beat => 0xAA,
            Command::Invalid => 0xF0,
        }
    }
}

/// `mode` values carried in an `INIT` payload's first 4 bytes (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reserved for a future management channel.
    Mgmt = 0,
    /// The only mode this core implements.
    Tcp = 1,
    /// Reserved; not implemented.
    Udp = 2,
}

impl Mode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Mode::Mgmt),
            1 => Some(Mode::Tcp),
            2 => Some(Mode::Udp),
            _ => None,
        }
    }
}

/// A fully-decoded frame: command, session id, and raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub cmd: Command,
    pub sid: u32,
    pub payload: Vec<u8>,
}

/// Encode a frame into its wire representation.
pub fn encode(cmd: Command, sid: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&MAGIC.to_be_bytes());
    buf.push(cmd.to_byte());
    buf.extend_from_slice(&sid.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Convenience: encode an `INIT` payload (`mode(4, BE) ‖ info`).
pub fn encode_init(sid: u32, mode: Mode, info: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + info.len());
    payload.extend_from_slice(&(mode as u32).to_be_bytes());
    payload.extend_from_slice(info.as_bytes());
    encode(Command::Init, sid, &payload)
}

/// Incremental frame decoder that tolerates arbitrary stream segmentation.
///
/// Feed bytes via [`FrameDecoder::feed`]; complete frames are returned in arrival
/// order, and any partial tail is retained for the next call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Feed newly-read bytes and extract all frames that are now complete.
    ///
    /// # Errors
    ///
    /// Returns an error (fatal to the control channel per spec §4.1/§7) if the magic
    /// doesn't match, the command byte is unrecognized, or an `INIT` frame's payload is
    /// shorter than 4 bytes.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<DecodedFrame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }

            let magic = u32::from_be_bytes(self.buf[0..4].try_into().unwrap());
            if magic != MAGIC {
                bail!("bad magic: expected {MAGIC:#010x}, got {magic:#010x}");
            }

            let cmd_byte = self.buf[4];
            let cmd = Command::from_byte(cmd_byte)
                .ok_or_else(|| anyhow!("unknown command byte {cmd_byte:#04x}"))?;

            let sid = u32::from_be_bytes(self.buf[5..9].try_into().unwrap());
            let len = u32::from_be_bytes(self.buf[9..13].try_into().unwrap());

            if len > MAX_PAYLOAD_LEN {
                bail!("frame payload of {len} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit");
            }

            let total = HEADER_LEN + len as usize;
            if self.buf.len() < total {
                break; // incomplete frame; wait for more bytes
            }

            if cmd == Command::Init && len < 4 {
                bail!("INIT frame payload too short: {len} bytes, need at least 4");
            }

            let payload = self.buf[HEADER_LEN..total].to_vec();
            self.buf.advance(total);
            frames.push(DecodedFrame { cmd, sid, payload });
        }

        Ok(frames)
    }

    /// True if the decoder is holding an incomplete frame.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
