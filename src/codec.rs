// Bus wire codec - separates frame parsing/encoding from the multiplexer
//
// Every unit on the wire is a fixed 12-byte header followed by a payload:
//
//   offset  size  field
//   0       1     opcode
//   1       1     flags           bit0=END, bit1=RST, bits2-7 reserved (0)
//   2       2     reserved (0)
//   4       4     stream_id or request_id (big-endian u32)
//   8       4     payload_length  (big-endian u32)
//   12      N     payload
//
// All integers are big-endian. Payloads above the configured maximum are
// rejected; bulk transfers must be chunked into multiple STREAM_DATA frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::Cursor;
use thiserror::Error;

/// Default maximum frame payload (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: u32 = 1024 * 1024;

/// Terminal frame for this stream or call.
pub const FLAG_END: u8 = 0b0000_0001;
/// Reset frame; payload is a one-byte reason code.
pub const FLAG_RST: u8 = 0b0000_0010;

const RESERVED_FLAG_MASK: u8 = !(FLAG_END | FLAG_RST);

/// Frame opcodes.
#[derive(TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    RpcCall = 0x01,
    RpcProgress = 0x02,
    RpcResult = 0x03,
    RpcError = 0x04,
    StreamOpen = 0x10,
    StreamData = 0x11,
    StreamWindow = 0x12,
    StreamProgress = 0x13,
    StreamResult = 0x14,
    StreamClose = 0x15,
    StreamReset = 0x16,
    Ping = 0x20,
    Pong = 0x21,
}

/// Error kinds carried in RPC_ERROR frames and, as one-byte reason codes,
/// in STREAM_RESET frames.
#[derive(TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Client asked for cancellation, or the session/call deadline fired.
    Cancelled = 1,
    /// Argument count or shape wrong at dispatch.
    InvalidArgs = 2,
    /// RPC method unknown, or a stream target is missing.
    NotFound = 3,
    /// Operation refused because an equivalent one is already running.
    Conflict = 4,
    /// Session revoked or expired.
    Unauthorized = 5,
    /// Worker dial or spawn failure at the gateway.
    BridgeUnavailable = 6,
    /// Malformed frame, duplicate stream id, or similar; fatal for the
    /// whole connection.
    ProtocolError = 7,
    /// Handler panic or unexpected I/O failure.
    Internal = 8,
    /// Worker is shutting down.
    Shutdown = 9,
    /// Underlying transport closed or errored.
    TransportClosed = 10,
    /// Session idle window elapsed.
    SessionExpired = 11,
    /// A newer connection attached to the worker and took over.
    Superseded = 12,
}

impl ErrorKind {
    /// Stable wire name, as carried in RPC_ERROR payloads.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::InvalidArgs => "InvalidArgs",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::BridgeUnavailable => "BridgeUnavailable",
            ErrorKind::ProtocolError => "ProtocolError",
            ErrorKind::Internal => "Internal",
            ErrorKind::Shutdown => "Shutdown",
            ErrorKind::TransportClosed => "TransportClosed",
            ErrorKind::SessionExpired => "SessionExpired",
            ErrorKind::Superseded => "Superseded",
        }
    }

    /// Inverse of [`ErrorKind::name`]. Unknown names map to `Internal` so
    /// a newer peer cannot wedge an older one.
    pub fn from_name(name: &str) -> Self {
        match name {
            "Cancelled" => ErrorKind::Cancelled,
            "InvalidArgs" => ErrorKind::InvalidArgs,
            "NotFound" => ErrorKind::NotFound,
            "Conflict" => ErrorKind::Conflict,
            "Unauthorized" => ErrorKind::Unauthorized,
            "BridgeUnavailable" => ErrorKind::BridgeUnavailable,
            "ProtocolError" => ErrorKind::ProtocolError,
            "Shutdown" => ErrorKind::Shutdown,
            "TransportClosed" => ErrorKind::TransportClosed,
            "SessionExpired" => ErrorKind::SessionExpired,
            "Superseded" => ErrorKind::Superseded,
            _ => ErrorKind::Internal,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Frame header (12 bytes, common to all frames).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub opcode: Opcode,
    pub flags: u8,
    pub id: u32,
    pub payload_len: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 12;

    /// Decode a header from the buffer with validation.
    pub fn decode(buf: &mut Cursor<&[u8]>, max_payload: u32) -> Result<Self, CodecError> {
        if buf.remaining() < Self::SIZE {
            return Err(CodecError::Incomplete);
        }

        let opcode_raw = buf.get_u8();
        let opcode =
            Opcode::try_from(opcode_raw).map_err(|_| CodecError::InvalidOpcode(opcode_raw))?;
        let flags = buf.get_u8();
        if flags & RESERVED_FLAG_MASK != 0 {
            return Err(CodecError::ReservedFlagBits(flags));
        }
        let reserved = buf.get_u16();
        if reserved != 0 {
            return Err(CodecError::ReservedNonZero(reserved));
        }
        let id = buf.get_u32();
        let payload_len = buf.get_u32();
        if payload_len > max_payload {
            return Err(CodecError::FrameTooLarge {
                length: payload_len,
                max: max_payload,
            });
        }

        Ok(FrameHeader {
            opcode,
            flags,
            id,
            payload_len,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.opcode.into());
        buf.put_u8(self.flags);
        buf.put_u16(0);
        buf.put_u32(self.id);
        buf.put_u32(self.payload_len);
    }
}

/// A decoded frame. Exactly one unit on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    RpcCall {
        request_id: u32,
        category: String,
        method: String,
        args: Vec<String>,
    },
    RpcProgress {
        request_id: u32,
        value: serde_json::Value,
    },
    RpcResult {
        request_id: u32,
        value: serde_json::Value,
    },
    RpcError {
        request_id: u32,
        kind: ErrorKind,
        message: String,
    },
    StreamOpen {
        stream_id: u32,
        tag: String,
        args: Vec<String>,
    },
    StreamData {
        stream_id: u32,
        payload: Bytes,
    },
    StreamWindow {
        stream_id: u32,
        credit: u32,
    },
    StreamProgress {
        stream_id: u32,
        value: serde_json::Value,
    },
    StreamResult {
        stream_id: u32,
        value: serde_json::Value,
    },
    StreamClose {
        stream_id: u32,
    },
    StreamReset {
        stream_id: u32,
        reason: ErrorKind,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
}

/// Codec errors with enough context to log the offending frame.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("incomplete frame: need more data")]
    Incomplete,

    #[error("frame payload {length} exceeds maximum {max}")]
    FrameTooLarge { length: u32, max: u32 },

    #[error("invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),

    #[error("reserved flag bits set: {0:#010b}")]
    ReservedFlagBits(u8),

    #[error("reserved header bytes non-zero: {0:#06x}")]
    ReservedNonZero(u16),

    #[error("malformed {opcode:?} payload: {reason}")]
    InvalidPayload {
        opcode: Opcode,
        reason: &'static str,
    },

    #[error("invalid UTF-8 in {opcode:?} payload")]
    Utf8 { opcode: Opcode },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether this error must tear down the whole connection. Everything
    /// except a short read is fatal; the transport cannot resynchronize.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CodecError::Incomplete)
    }
}

impl Frame {
    /// Opcode this frame encodes to.
    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::RpcCall { .. } => Opcode::RpcCall,
            Frame::RpcProgress { .. } => Opcode::RpcProgress,
            Frame::RpcResult { .. } => Opcode::RpcResult,
            Frame::RpcError { .. } => Opcode::RpcError,
            Frame::StreamOpen { .. } => Opcode::StreamOpen,
            Frame::StreamData { .. } => Opcode::StreamData,
            Frame::StreamWindow { .. } => Opcode::StreamWindow,
            Frame::StreamProgress { .. } => Opcode::StreamProgress,
            Frame::StreamResult { .. } => Opcode::StreamResult,
            Frame::StreamClose { .. } => Opcode::StreamClose,
            Frame::StreamReset { .. } => Opcode::StreamReset,
            Frame::Ping { .. } => Opcode::Ping,
            Frame::Pong { .. } => Opcode::Pong,
        }
    }

    /// The stream or request id this frame addresses. Ping/Pong ride the
    /// control id 0.
    pub fn id(&self) -> u32 {
        match self {
            Frame::RpcCall { request_id, .. }
            | Frame::RpcProgress { request_id, .. }
            | Frame::RpcResult { request_id, .. }
            | Frame::RpcError { request_id, .. } => *request_id,
            Frame::StreamOpen { stream_id, .. }
            | Frame::StreamData { stream_id, .. }
            | Frame::StreamWindow { stream_id, .. }
            | Frame::StreamProgress { stream_id, .. }
            | Frame::StreamResult { stream_id, .. }
            | Frame::StreamClose { stream_id }
            | Frame::StreamReset { stream_id, .. } => *stream_id,
            Frame::Ping { .. } | Frame::Pong { .. } => 0,
        }
    }

    fn flags(&self) -> u8 {
        match self {
            Frame::RpcResult { .. }
            | Frame::RpcError { .. }
            | Frame::StreamResult { .. }
            | Frame::StreamClose { .. } => FLAG_END,
            Frame::StreamReset { .. } => FLAG_RST,
            _ => 0,
        }
    }

    /// Serialize into `buf`. Fails with [`CodecError::FrameTooLarge`] if the
    /// payload exceeds `max_payload`.
    pub fn encode(&self, buf: &mut BytesMut, max_payload: u32) -> Result<(), CodecError> {
        let payload = self.encode_payload();
        if payload.len() as u64 > max_payload as u64 {
            return Err(CodecError::FrameTooLarge {
                length: payload.len() as u32,
                max: max_payload,
            });
        }

        let header = FrameHeader {
            opcode: self.opcode(),
            flags: self.flags(),
            id: self.id(),
            payload_len: payload.len() as u32,
        };
        buf.reserve(FrameHeader::SIZE + payload.len());
        header.encode(buf);
        buf.put_slice(&payload);
        Ok(())
    }

    /// Convenience wrapper returning frozen bytes.
    pub fn to_bytes(&self, max_payload: u32) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf, max_payload)?;
        Ok(buf.freeze())
    }

    fn encode_payload(&self) -> Bytes {
        match self {
            Frame::RpcCall {
                category,
                method,
                args,
                ..
            } => {
                let mut fields = Vec::with_capacity(2 + args.len());
                fields.push(category.as_str());
                fields.push(method.as_str());
                fields.extend(args.iter().map(|a| a.as_str()));
                join_nul(&fields)
            }
            Frame::StreamOpen { tag, args, .. } => {
                // Same layout as RPC_CALL minus the method field.
                let mut fields = Vec::with_capacity(1 + args.len());
                fields.push(tag.as_str());
                fields.extend(args.iter().map(|a| a.as_str()));
                join_nul(&fields)
            }
            Frame::RpcProgress { value, .. }
            | Frame::RpcResult { value, .. }
            | Frame::StreamProgress { value, .. }
            | Frame::StreamResult { value, .. } => {
                Bytes::from(serde_json::to_vec(value).unwrap_or_default())
            }
            Frame::RpcError { kind, message, .. } => {
                let mut out = BytesMut::with_capacity(kind.name().len() + 1 + message.len());
                out.put_slice(kind.name().as_bytes());
                out.put_u8(0);
                out.put_slice(message.as_bytes());
                out.freeze()
            }
            Frame::StreamData { payload, .. } => payload.clone(),
            Frame::StreamWindow { credit, .. } => {
                let mut out = BytesMut::with_capacity(4);
                out.put_u32(*credit);
                out.freeze()
            }
            Frame::StreamClose { .. } => Bytes::new(),
            Frame::StreamReset { reason, .. } => {
                let mut out = BytesMut::with_capacity(1);
                out.put_u8((*reason).into());
                out.freeze()
            }
            Frame::Ping { nonce } | Frame::Pong { nonce } => {
                let mut out = BytesMut::with_capacity(8);
                out.put_u64(*nonce);
                out.freeze()
            }
        }
    }

    /// Check whether `buf` holds at least one complete frame, without
    /// allocating. `Incomplete` is the expected steady-state answer while
    /// the socket is still filling the read buffer.
    pub fn check(buf: &mut Cursor<&[u8]>, max_payload: u32) -> Result<usize, CodecError> {
        if buf.remaining() < FrameHeader::SIZE {
            return Err(CodecError::Incomplete);
        }

        // Peek length without consuming; full validation happens in parse.
        let pos = buf.position() as usize;
        let slice = *buf.get_ref();
        let payload_len = u32::from_be_bytes([
            slice[pos + 8],
            slice[pos + 9],
            slice[pos + 10],
            slice[pos + 11],
        ]);
        if payload_len > max_payload {
            return Err(CodecError::FrameTooLarge {
                length: payload_len,
                max: max_payload,
            });
        }
        let total = FrameHeader::SIZE + payload_len as usize;
        if buf.remaining() < total {
            return Err(CodecError::Incomplete);
        }
        Ok(total)
    }

    /// Parse one frame from `buf`. The caller must have run [`Frame::check`]
    /// first; decoding never reads past `payload_len` bytes of payload.
    pub fn parse(buf: &mut Cursor<&[u8]>, max_payload: u32) -> Result<Frame, CodecError> {
        let header = FrameHeader::decode(buf, max_payload)?;
        if buf.remaining() < header.payload_len as usize {
            return Err(CodecError::Incomplete);
        }
        let payload = buf.copy_to_bytes(header.payload_len as usize);
        Self::parse_payload(header, payload)
    }

    fn parse_payload(header: FrameHeader, payload: Bytes) -> Result<Frame, CodecError> {
        let opcode = header.opcode;
        let id = header.id;
        match opcode {
            Opcode::RpcCall => {
                let mut fields = split_nul(&payload, opcode)?;
                if fields.len() < 2 {
                    return Err(CodecError::InvalidPayload {
                        opcode,
                        reason: "expected category and method",
                    });
                }
                let category = fields.remove(0);
                let method = fields.remove(0);
                Ok(Frame::RpcCall {
                    request_id: id,
                    category,
                    method,
                    args: fields,
                })
            }
            Opcode::StreamOpen => {
                let mut fields = split_nul(&payload, opcode)?;
                if fields.is_empty() || fields[0].is_empty() {
                    return Err(CodecError::InvalidPayload {
                        opcode,
                        reason: "expected stream type tag",
                    });
                }
                let tag = fields.remove(0);
                Ok(Frame::StreamOpen {
                    stream_id: id,
                    tag,
                    args: fields,
                })
            }
            Opcode::RpcProgress => Ok(Frame::RpcProgress {
                request_id: id,
                value: parse_json(&payload, opcode)?,
            }),
            Opcode::RpcResult => Ok(Frame::RpcResult {
                request_id: id,
                value: parse_json(&payload, opcode)?,
            }),
            Opcode::RpcError => {
                let text =
                    std::str::from_utf8(&payload).map_err(|_| CodecError::Utf8 { opcode })?;
                let (kind, message) = match text.split_once('\0') {
                    Some((k, m)) => (k, m),
                    None => (text, ""),
                };
                Ok(Frame::RpcError {
                    request_id: id,
                    kind: ErrorKind::from_name(kind),
                    message: message.to_string(),
                })
            }
            Opcode::StreamData => Ok(Frame::StreamData {
                stream_id: id,
                payload,
            }),
            Opcode::StreamWindow => {
                if payload.len() != 4 {
                    return Err(CodecError::InvalidPayload {
                        opcode,
                        reason: "credit must be exactly 4 bytes",
                    });
                }
                let credit = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Frame::StreamWindow {
                    stream_id: id,
                    credit,
                })
            }
            Opcode::StreamProgress => Ok(Frame::StreamProgress {
                stream_id: id,
                value: parse_json(&payload, opcode)?,
            }),
            Opcode::StreamResult => Ok(Frame::StreamResult {
                stream_id: id,
                value: parse_json(&payload, opcode)?,
            }),
            Opcode::StreamClose => {
                if !payload.is_empty() {
                    return Err(CodecError::InvalidPayload {
                        opcode,
                        reason: "close carries no payload",
                    });
                }
                Ok(Frame::StreamClose { stream_id: id })
            }
            Opcode::StreamReset => {
                if payload.len() != 1 {
                    return Err(CodecError::InvalidPayload {
                        opcode,
                        reason: "reason must be exactly 1 byte",
                    });
                }
                // Unknown reason codes degrade to Internal rather than
                // killing the connection; the stream dies either way.
                let reason = ErrorKind::try_from(payload[0]).unwrap_or(ErrorKind::Internal);
                Ok(Frame::StreamReset {
                    stream_id: id,
                    reason,
                })
            }
            Opcode::Ping | Opcode::Pong => {
                if id != 0 {
                    return Err(CodecError::InvalidPayload {
                        opcode,
                        reason: "liveness frames ride id 0",
                    });
                }
                if payload.len() != 8 {
                    return Err(CodecError::InvalidPayload {
                        opcode,
                        reason: "nonce must be exactly 8 bytes",
                    });
                }
                let nonce = u64::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3], payload[4], payload[5],
                    payload[6], payload[7],
                ]);
                Ok(match opcode {
                    Opcode::Ping => Frame::Ping { nonce },
                    _ => Frame::Pong { nonce },
                })
            }
        }
    }
}

fn join_nul(fields: &[&str]) -> Bytes {
    let len = fields
        .iter()
        .map(|f| f.len() + 1)
        .sum::<usize>()
        .saturating_sub(1);
    let mut out = BytesMut::with_capacity(len);
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.put_u8(0);
        }
        out.put_slice(field.as_bytes());
    }
    out.freeze()
}

fn split_nul(payload: &Bytes, opcode: Opcode) -> Result<Vec<String>, CodecError> {
    let text = std::str::from_utf8(payload).map_err(|_| CodecError::Utf8 { opcode })?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    Ok(text.split('\0').map(str::to_string).collect())
}

fn parse_json(payload: &[u8], opcode: Opcode) -> Result<serde_json::Value, CodecError> {
    serde_json::from_slice(payload).map_err(|_| CodecError::InvalidPayload {
        opcode,
        reason: "payload is not valid JSON",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(frame: Frame) -> Frame {
        let bytes = frame.to_bytes(DEFAULT_MAX_PAYLOAD).unwrap();
        let mut cursor = Cursor::new(bytes.as_ref());
        Frame::check(&mut cursor, DEFAULT_MAX_PAYLOAD).unwrap();
        Frame::parse(&mut cursor, DEFAULT_MAX_PAYLOAD).unwrap()
    }

    #[test]
    fn rpc_call_roundtrip() {
        let frame = Frame::RpcCall {
            request_id: 7,
            category: "docker".into(),
            method: "list_containers".into(),
            args: vec!["all".into(), "".into()],
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn rpc_call_without_args() {
        let frame = Frame::RpcCall {
            request_id: 7,
            category: "docker".into(),
            method: "list_containers".into(),
            args: vec![],
        };
        let bytes = frame.to_bytes(DEFAULT_MAX_PAYLOAD).unwrap();
        // Payload is exactly "docker\0list_containers".
        assert_eq!(&bytes[FrameHeader::SIZE..], b"docker\0list_containers");
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn stream_frames_roundtrip() {
        for frame in [
            Frame::StreamOpen {
                stream_id: 3,
                tag: "file-upload".into(),
                args: vec!["/tmp/x".into(), "512".into()],
            },
            Frame::StreamData {
                stream_id: 3,
                payload: Bytes::from_static(b"hello"),
            },
            Frame::StreamWindow {
                stream_id: 3,
                credit: 65536,
            },
            Frame::StreamProgress {
                stream_id: 3,
                value: json!({"bytes": 256, "bytes_total": 512}),
            },
            Frame::StreamResult {
                stream_id: 3,
                value: json!({"status": "ok"}),
            },
            Frame::StreamClose { stream_id: 3 },
            Frame::StreamReset {
                stream_id: 3,
                reason: ErrorKind::Cancelled,
            },
        ] {
            assert_eq!(roundtrip(frame.clone()), frame);
        }
    }

    #[test]
    fn liveness_roundtrip() {
        assert_eq!(
            roundtrip(Frame::Ping { nonce: 0xDEAD_BEEF }),
            Frame::Ping { nonce: 0xDEAD_BEEF }
        );
        assert_eq!(roundtrip(Frame::Pong { nonce: 1 }), Frame::Pong { nonce: 1 });
    }

    #[test]
    fn zero_length_data_is_legal() {
        let frame = Frame::StreamData {
            stream_id: 9,
            payload: Bytes::new(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn rpc_error_roundtrip() {
        let frame = Frame::RpcError {
            request_id: 12,
            kind: ErrorKind::Conflict,
            message: "another indexer is running".into(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn end_flag_on_terminal_frames() {
        for frame in [
            Frame::RpcResult {
                request_id: 1,
                value: json!([]),
            },
            Frame::RpcError {
                request_id: 1,
                kind: ErrorKind::Internal,
                message: String::new(),
            },
            Frame::StreamResult {
                stream_id: 1,
                value: json!(null),
            },
            Frame::StreamClose { stream_id: 1 },
        ] {
            let bytes = frame.to_bytes(DEFAULT_MAX_PAYLOAD).unwrap();
            assert_eq!(bytes[1] & FLAG_END, FLAG_END, "{frame:?}");
        }

        let reset = Frame::StreamReset {
            stream_id: 1,
            reason: ErrorKind::Shutdown,
        }
        .to_bytes(DEFAULT_MAX_PAYLOAD)
        .unwrap();
        assert_eq!(reset[1] & FLAG_RST, FLAG_RST);
    }

    #[test]
    fn oversized_payload_rejected_on_encode() {
        let frame = Frame::StreamData {
            stream_id: 1,
            payload: Bytes::from(vec![0u8; 1025]),
        };
        let result = frame.to_bytes(1024);
        assert!(matches!(result, Err(CodecError::FrameTooLarge { .. })));
    }

    #[test]
    fn oversized_payload_rejected_on_check() {
        let mut raw = BytesMut::new();
        FrameHeader {
            opcode: Opcode::StreamData,
            flags: 0,
            id: 1,
            payload_len: DEFAULT_MAX_PAYLOAD + 1,
        }
        .encode(&mut raw);
        let mut cursor = Cursor::new(raw.as_ref());
        let result = Frame::check(&mut cursor, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(CodecError::FrameTooLarge { .. })));
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let raw: &[u8] = &[
            0x99, 0x00, 0x00, 0x00, // opcode, flags, reserved
            0x00, 0x00, 0x00, 0x01, // id
            0x00, 0x00, 0x00, 0x00, // payload_length
        ];
        let mut cursor = Cursor::new(raw);
        let err = Frame::parse(&mut cursor, DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, CodecError::InvalidOpcode(0x99)));
        assert!(err.is_fatal());
    }

    #[test]
    fn reserved_bits_rejected() {
        let raw: &[u8] = &[
            0x11, 0b0000_0100, 0x00, 0x00, // STREAM_DATA with a reserved flag bit
            0x00, 0x00, 0x00, 0x01, //
            0x00, 0x00, 0x00, 0x00,
        ];
        let mut cursor = Cursor::new(raw);
        assert!(matches!(
            Frame::parse(&mut cursor, DEFAULT_MAX_PAYLOAD),
            Err(CodecError::ReservedFlagBits(_))
        ));

        let raw: &[u8] = &[
            0x11, 0x00, 0x00, 0x01, // non-zero reserved bytes
            0x00, 0x00, 0x00, 0x01, //
            0x00, 0x00, 0x00, 0x00,
        ];
        let mut cursor = Cursor::new(raw);
        assert!(matches!(
            Frame::parse(&mut cursor, DEFAULT_MAX_PAYLOAD),
            Err(CodecError::ReservedNonZero(1))
        ));
    }

    #[test]
    fn check_incomplete_header() {
        let raw: &[u8] = &[0x11, 0x00];
        let mut cursor = Cursor::new(raw);
        assert!(matches!(
            Frame::check(&mut cursor, DEFAULT_MAX_PAYLOAD),
            Err(CodecError::Incomplete)
        ));
    }

    #[test]
    fn check_incomplete_payload() {
        let frame = Frame::StreamData {
            stream_id: 1,
            payload: Bytes::from_static(b"abcdef"),
        };
        let bytes = frame.to_bytes(DEFAULT_MAX_PAYLOAD).unwrap();
        let mut cursor = Cursor::new(&bytes[..bytes.len() - 1]);
        assert!(matches!(
            Frame::check(&mut cursor, DEFAULT_MAX_PAYLOAD),
            Err(CodecError::Incomplete)
        ));
    }

    #[test]
    fn ping_on_nonzero_id_rejected() {
        let mut raw = BytesMut::new();
        FrameHeader {
            opcode: Opcode::Ping,
            flags: 0,
            id: 5,
            payload_len: 8,
        }
        .encode(&mut raw);
        raw.put_u64(42);
        let mut cursor = Cursor::new(raw.as_ref());
        assert!(matches!(
            Frame::parse(&mut cursor, DEFAULT_MAX_PAYLOAD),
            Err(CodecError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn unknown_reset_reason_degrades_to_internal() {
        let mut raw = BytesMut::new();
        FrameHeader {
            opcode: Opcode::StreamReset,
            flags: FLAG_RST,
            id: 3,
            payload_len: 1,
        }
        .encode(&mut raw);
        raw.put_u8(0xEE);
        let mut cursor = Cursor::new(raw.as_ref());
        let frame = Frame::parse(&mut cursor, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(
            frame,
            Frame::StreamReset {
                stream_id: 3,
                reason: ErrorKind::Internal
            }
        );
    }

    #[test]
    fn error_kind_names_roundtrip() {
        for kind in [
            ErrorKind::Cancelled,
            ErrorKind::InvalidArgs,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::Unauthorized,
            ErrorKind::BridgeUnavailable,
            ErrorKind::ProtocolError,
            ErrorKind::Internal,
            ErrorKind::Shutdown,
            ErrorKind::TransportClosed,
            ErrorKind::SessionExpired,
            ErrorKind::Superseded,
        ] {
            assert_eq!(ErrorKind::from_name(kind.name()), kind);
        }
        assert_eq!(ErrorKind::from_name("SomethingNew"), ErrorKind::Internal);
    }
}
