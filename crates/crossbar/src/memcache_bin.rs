//! Memcache binary protocol codec.
//!
//! Packets pass through unmodified: the proxy only parses the 24-byte header
//! far enough to frame the packet, extract the routing key, and keep the
//! opaque so error responses stay correlated. Quiet opcodes are rejected
//! because they break the one-reply-per-request pipelining contract.

use bytes::Bytes;

use crate::bufio::{RecvBuffer, SendBuffer};
use crate::error::ProxyError;
use crate::message::{Message, Reply, Request};

pub const HEADER_LEN: usize = 24;

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;

pub const OP_QUIT: u8 = 0x07;
pub const OP_NOOP: u8 = 0x0a;

/// Status used for proxy-originated error responses.
const STATUS_INTERNAL_ERROR: u16 = 0x0084;

const QUIET_OPCODES: &[u8] = &[
    0x09, // GetQ
    0x0d, // GetKQ
    0x11, // SetQ
    0x12, // AddQ
    0x13, // ReplaceQ
    0x14, // DeleteQ
    0x15, // IncrementQ
    0x16, // DecrementQ
    0x17, // QuitQ
    0x18, // FlushQ
    0x19, // AppendQ
    0x1a, // PrependQ
    0x1e, // GATQ
];

/// One binary request packet.
#[derive(Debug)]
pub struct McBinRequest {
    opcode: u8,
    opaque: u32,
    key: Bytes,
    /// The complete packet, header plus body.
    raw: Bytes,
}

impl McBinRequest {
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn is_quit(&self) -> bool {
        self.opcode == OP_QUIT
    }

    pub fn encode_into(&self, out: &mut SendBuffer) {
        out.put(&self.raw);
    }
}

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Decode one request packet; `None` until the whole packet is buffered.
pub fn decode_request(rb: &mut RecvBuffer) -> Result<Option<Message>, ProxyError> {
    let buf = rb.as_slice();
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    if buf[0] != MAGIC_REQUEST {
        return Err(ProxyError::Protocol(format!(
            "bad request magic {:#04x}",
            buf[0]
        )));
    }
    let opcode = buf[1];
    if QUIET_OPCODES.contains(&opcode) {
        return Err(ProxyError::Protocol(format!(
            "quiet opcode {opcode:#04x} is not supported"
        )));
    }
    let key_len = usize::from(u16_at(buf, 2));
    let extras_len = usize::from(buf[4]);
    let total_body = u32_at(buf, 8) as usize;
    if key_len + extras_len > total_body {
        return Err(ProxyError::Protocol("body lengths exceed total".into()));
    }
    let frame_len = HEADER_LEN + total_body;
    if buf.len() < frame_len {
        return Ok(None);
    }
    let opaque = u32_at(buf, 12);
    let raw = rb.take(frame_len);
    let key_start = HEADER_LEN + extras_len;
    let key = raw.slice(key_start..key_start + key_len);
    Ok(Some(Message::new(Request::McBin(McBinRequest {
        opcode,
        opaque,
        key,
        raw,
    }))))
}

/// Decode one response packet; `None` until the whole packet is buffered.
pub fn decode_reply(rb: &mut RecvBuffer) -> Result<Option<Bytes>, ProxyError> {
    let buf = rb.as_slice();
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    if buf[0] != MAGIC_RESPONSE {
        return Err(ProxyError::Protocol(format!(
            "bad response magic {:#04x}",
            buf[0]
        )));
    }
    let frame_len = HEADER_LEN + u32_at(buf, 8) as usize;
    if buf.len() < frame_len {
        return Ok(None);
    }
    Ok(Some(rb.take(frame_len)))
}

/// Response opcode and status, for ping verification.
pub fn reply_status(packet: &[u8]) -> Option<(u8, u16)> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    Some((packet[1], u16_at(packet, 6)))
}

/// A complete NOOP request packet, used as the ping probe.
pub fn noop_packet() -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = MAGIC_REQUEST;
    header[1] = OP_NOOP;
    header
}

/// Write one completed message's reply, or a proxy-originated error packet
/// carrying the request's opcode and opaque.
pub fn write_reply(msg: &Message, out: &mut SendBuffer) {
    let (opcode, opaque) = match msg.request() {
        Request::McBin(req) => (req.opcode(), req.opaque()),
        _ => (0, 0),
    };
    if let Some(err) = msg.error() {
        write_error(opcode, opaque, &err.to_string(), out);
        return;
    }
    match msg.reply() {
        Some(Reply::McBin(raw)) => out.put(raw),
        _ => write_error(opcode, opaque, "reply missing", out),
    }
}

/// Success response to a client QUIT, sent just before the session closes.
pub fn write_quit_ack(opaque: u32, out: &mut SendBuffer) {
    let mut header = [0u8; HEADER_LEN];
    header[0] = MAGIC_RESPONSE;
    header[1] = OP_QUIT;
    header[12..16].copy_from_slice(&opaque.to_be_bytes());
    out.put(&header);
}

/// Proxy-originated error response packet.
pub fn write_error(opcode: u8, opaque: u32, text: &str, out: &mut SendBuffer) {
    let body = text.as_bytes();
    let mut header = [0u8; HEADER_LEN];
    header[0] = MAGIC_RESPONSE;
    header[1] = opcode;
    header[6..8].copy_from_slice(&STATUS_INTERNAL_ERROR.to_be_bytes());
    header[8..12].copy_from_slice(&(body.len() as u32).to_be_bytes());
    header[12..16].copy_from_slice(&opaque.to_be_bytes());
    out.put(&header);
    out.put(body);
}
