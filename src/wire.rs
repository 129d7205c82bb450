//! Framed message codec for the session transport.
//!
//! One seqpacket datagram per frame: a one-byte kind, a little-endian
//! 32-bit correlation id, then the payload. Correlation id 0 means "no
//! reply expected". The `Open`/`OpenAck`/`OpenNack` kinds carry the
//! handshake; `Open` and `OpenAck` payloads are a little-endian u32 max
//! payload size followed by the protocol name in UTF-8.

use std::io;

use crate::error::{Error, Result};

pub(crate) const HEADER_LEN: usize = 5;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum FrameKind {
    Open = 1,
    OpenAck = 2,
    OpenNack = 3,
    Request = 4,
    Response = 5,
    Push = 6,
    /// Response-position frame: the peer accepted the request but failed to
    /// handle it.
    Fault = 7,
}

impl FrameKind {
    fn from_u8(v: u8) -> Option<FrameKind> {
        match v {
            1 => Some(FrameKind::Open),
            2 => Some(FrameKind::OpenAck),
            3 => Some(FrameKind::OpenNack),
            4 => Some(FrameKind::Request),
            5 => Some(FrameKind::Response),
            6 => Some(FrameKind::Push),
            7 => Some(FrameKind::Fault),
            _ => None,
        }
    }
}

/// Reason byte carried by an `OpenNack`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum NackReason {
    ProtocolMismatch = 1,
    PayloadTooBig = 2,
}

#[derive(Debug)]
pub(crate) struct Frame<'a> {
    pub(crate) kind: FrameKind,
    pub(crate) txn: u32,
    pub(crate) payload: &'a [u8],
}

pub(crate) fn encode(kind: FrameKind, txn: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(kind as u8);
    out.extend_from_slice(&txn.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

pub(crate) fn decode(buf: &[u8]) -> Result<Frame<'_>> {
    if buf.len() < HEADER_LEN {
        return Err(malformed("short frame"));
    }
    let kind = FrameKind::from_u8(buf[0]).ok_or_else(|| malformed("unknown frame kind"))?;
    let txn = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
    Ok(Frame {
        kind,
        txn,
        payload: &buf[HEADER_LEN..],
    })
}

pub(crate) fn encode_open(kind: FrameKind, max_payload: u32, protocol: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + protocol.len());
    body.extend_from_slice(&max_payload.to_le_bytes());
    body.extend_from_slice(protocol.as_bytes());
    encode(kind, 0, &body)
}

pub(crate) fn decode_open(payload: &[u8]) -> Result<(u32, &str)> {
    if payload.len() < 4 {
        return Err(malformed("short open frame"));
    }
    let max = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let protocol =
        std::str::from_utf8(&payload[4..]).map_err(|_| malformed("open protocol not UTF-8"))?;
    Ok((max, protocol))
}

pub(crate) fn encode_nack(reason: NackReason) -> Vec<u8> {
    encode(FrameKind::OpenNack, 0, &[reason as u8])
}

pub(crate) fn decode_nack(payload: &[u8]) -> NackReason {
    match payload.first() {
        Some(2) => NackReason::PayloadTooBig,
        _ => NackReason::ProtocolMismatch,
    }
}

fn malformed(what: &str) -> Error {
    Error::Comm(io::Error::new(io::ErrorKind::InvalidData, what.to_string()))
}
