//! Binary framing used by the danmu gateway.
//!
//! Every frame starts with a 16-byte big-endian header:
//!
//! ```text
//! 0      4        6         8           12          16
//! | len  | hdrlen | version | operation | sequence  | body ...
//! ```
//!
//! Compressed frames (version 2 = zlib, version 3 = brotli) carry one or more
//! complete frames in their body, so decoding is recursive.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::io::Read;
use std::ops::ControlFlow;
use tracing::{trace, warn};

use crate::error::{BliveError, Result};

/// Size of the header this client writes.
pub const HEADER_LEN: usize = 16;

/// Deepest allowed chain of compressed frames nested inside each other.
pub const MAX_NESTING_DEPTH: usize = 4;

/// Largest payload decompression may produce, per call and in total per receive buffer.
pub const MAX_EXPANDED_SIZE: usize = 16 * 1024 * 1024;

/// Protocol versions
pub mod ver {
    pub const RAW_JSON: u16 = 0;
    pub const POPULARITY: u16 = 1;
    pub const ZLIB: u16 = 2;
    pub const BROTLI: u16 = 3;
}

/// Operation codes carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Operation {
    Handshake = 0,
    HandshakeReply = 1,
    Heartbeat = 2,
    HeartbeatReply = 3,
    SendMsg = 4,
    SendMsgReply = 5,
    DisconnectReply = 6,
    Auth = 7,
    AuthReply = 8,
    Raw = 9,
    ProtoReady = 10,
    ProtoFinish = 11,
    ChangeRoom = 12,
    ChangeRoomReply = 13,
    Register = 14,
    RegisterReply = 15,
    Unregister = 16,
    UnregisterReply = 17,
}

impl Operation {
    pub fn from_u32(value: u32) -> Option<Self> {
        use Operation::*;
        Some(match value {
            0 => Handshake,
            1 => HandshakeReply,
            2 => Heartbeat,
            3 => HeartbeatReply,
            4 => SendMsg,
            5 => SendMsgReply,
            6 => DisconnectReply,
            7 => Auth,
            8 => AuthReply,
            9 => Raw,
            10 => ProtoReady,
            11 => ProtoFinish,
            12 => ChangeRoom,
            13 => ChangeRoomReply,
            14 => Register,
            15 => RegisterReply,
            16 => Unregister,
            17 => UnregisterReply,
            _ => return None,
        })
    }
}

/// The fixed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub packet_len: u32,
    pub header_len: u16,
    pub version: u16,
    pub operation: u32,
    pub sequence: u32,
}

impl WireHeader {
    /// Read a header from the start of `buf`. Returns `None` if fewer than 16 bytes remain.
    pub fn read(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            packet_len: BigEndian::read_u32(&buf[0..4]),
            header_len: BigEndian::read_u16(&buf[4..6]),
            version: BigEndian::read_u16(&buf[6..8]),
            operation: BigEndian::read_u32(&buf[8..12]),
            sequence: BigEndian::read_u32(&buf[12..16]),
        })
    }

    pub fn write(&self, out: &mut BytesMut) {
        out.put_u32(self.packet_len);
        out.put_u16(self.header_len);
        out.put_u16(self.version);
        out.put_u32(self.operation);
        out.put_u32(self.sequence);
    }
}

/// A header plus the body it frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: WireHeader,
    pub body: Bytes,
}

/// Split a receive buffer into its concatenated frames.
///
/// Stops at the first truncated or corrupt frame and discards the remainder.
pub fn split_frames(buf: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while let Some(header) = WireHeader::read(&buf[offset..]) {
        let total = header.packet_len as usize;
        let header_len = header.header_len as usize;
        let remaining = buf.len() - offset;

        if header_len < HEADER_LEN || total < header_len {
            warn!(
                packet_len = total,
                header_len, "Corrupt frame header, dropping remaining buffer"
            );
            break;
        }
        if total > remaining {
            warn!(
                packet_len = total,
                remaining, "Truncated frame, dropping remaining buffer"
            );
            break;
        }

        frames.push(Frame {
            header,
            body: Bytes::copy_from_slice(&buf[offset + header_len..offset + total]),
        });
        offset += total;
    }

    frames
}

/// Decompress a frame body according to its protocol version.
///
/// Versions other than zlib and brotli are returned unchanged.
pub fn decompress(version: u16, body: &[u8]) -> Result<Cow<'_, [u8]>> {
    decompress_bounded(version, body, MAX_EXPANDED_SIZE)
}

pub(crate) fn decompress_bounded(version: u16, body: &[u8], limit: usize) -> Result<Cow<'_, [u8]>> {
    match inflate(version, body, limit)? {
        Inflated::Unchanged => Ok(Cow::Borrowed(body)),
        Inflated::Expanded(data) => Ok(Cow::Owned(data)),
        Inflated::OverLimit => Err(BliveError::protocol(format!(
            "decompressed payload exceeds {limit} bytes"
        ))),
    }
}

enum Inflated {
    Unchanged,
    Expanded(Vec<u8>),
    OverLimit,
}

fn inflate(version: u16, body: &[u8], limit: usize) -> Result<Inflated> {
    let mut decompressed = Vec::new();
    let read = match version {
        ver::ZLIB => ZlibDecoder::new(body)
            .take(limit as u64 + 1)
            .read_to_end(&mut decompressed)
            .map_err(|e| BliveError::protocol(format!("zlib decompression failed: {e}")))?,
        ver::BROTLI => brotli::Decompressor::new(body, 4096)
            .take(limit as u64 + 1)
            .read_to_end(&mut decompressed)
            .map_err(|e| BliveError::protocol(format!("brotli decompression failed: {e}")))?,
        _ => return Ok(Inflated::Unchanged),
    };

    if read > limit {
        return Ok(Inflated::OverLimit);
    }
    Ok(Inflated::Expanded(decompressed))
}

/// A decoded JSON event envelope: `{"cmd": "...", "data"|"info": ...}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Command(Value);

impl Command {
    /// Name of the synthetic command produced for heartbeat replies.
    pub const HEARTBEAT: &'static str = "_HEARTBEAT";

    /// Wrap a JSON value. Only objects are valid envelopes.
    pub fn from_value(value: Value) -> Option<Self> {
        value.is_object().then_some(Self(value))
    }

    /// Synthesize the envelope for a heartbeat reply.
    pub fn heartbeat(popularity: u32) -> Self {
        Self(serde_json::json!({
            "cmd": Self::HEARTBEAT,
            "data": { "popularity": popularity },
        }))
    }

    /// The raw `cmd` string, including any `:<n>` suffix.
    pub fn cmd(&self) -> &str {
        self.0.get("cmd").and_then(Value::as_str).unwrap_or("")
    }

    /// The `cmd` string with any `:<n>` suffix removed.
    pub fn base_cmd(&self) -> &str {
        let cmd = self.cmd();
        cmd.split_once(':').map_or(cmd, |(base, _)| base)
    }

    pub fn data(&self) -> Option<&Value> {
        self.0.get("data")
    }

    pub fn info(&self) -> Option<&Value> {
        self.0.get("info")
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Something the receive loop has to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to the AUTH frame. `code == 0` means accepted.
    AuthReply { code: i64 },
    /// A command envelope for the dispatch layer.
    Command(Command),
}

/// Decode a raw receive buffer into inbound events, in wire order.
///
/// Malformed frames are logged and skipped; this never fails. All
/// decompression within one buffer shares a [`MAX_EXPANDED_SIZE`] budget.
pub fn decode(buf: &[u8]) -> Vec<Inbound> {
    decode_with_budget(buf, MAX_EXPANDED_SIZE)
}

pub(crate) fn decode_with_budget(buf: &[u8], budget: usize) -> Vec<Inbound> {
    let mut out = Vec::new();
    let mut remaining = budget;
    let _ = decode_into(buf, 0, &mut remaining, &mut out);
    out
}

/// Breaks once the expansion budget is spent; the rest of the buffer is dropped.
fn decode_into(
    buf: &[u8],
    depth: usize,
    remaining: &mut usize,
    out: &mut Vec<Inbound>,
) -> ControlFlow<()> {
    for frame in split_frames(buf) {
        match frame.header.version {
            ver::ZLIB | ver::BROTLI => {
                if depth >= MAX_NESTING_DEPTH {
                    warn!(depth, "Compressed frames nested too deeply, dropping frame");
                    continue;
                }
                match inflate(frame.header.version, &frame.body, *remaining) {
                    Ok(Inflated::Expanded(inner)) => {
                        *remaining -= inner.len();
                        decode_into(&inner, depth + 1, remaining, out)?;
                    }
                    Ok(Inflated::OverLimit) => {
                        warn!(
                            budget = MAX_EXPANDED_SIZE,
                            "Decompression budget exhausted, dropping remaining buffer"
                        );
                        return ControlFlow::Break(());
                    }
                    Ok(Inflated::Unchanged) => {}
                    Err(e) => warn!("Dropping frame: {}", e),
                }
            }
            _ => match decode_plain(&frame) {
                Ok(Some(item)) => out.push(item),
                Ok(None) => {}
                Err(e) => warn!(
                    operation = frame.header.operation,
                    "Dropping frame: {}", e
                ),
            },
        }
    }
    ControlFlow::Continue(())
}

fn decode_plain(frame: &Frame) -> Result<Option<Inbound>> {
    match Operation::from_u32(frame.header.operation) {
        Some(Operation::HeartbeatReply) => {
            if frame.body.len() < 4 {
                return Err(BliveError::protocol(format!(
                    "heartbeat reply body is {} bytes",
                    frame.body.len()
                )));
            }
            let popularity = BigEndian::read_u32(&frame.body[..4]);
            Ok(Some(Inbound::Command(Command::heartbeat(popularity))))
        }
        Some(Operation::AuthReply) => {
            let json: Value = serde_json::from_slice(&frame.body)?;
            let code = json.get("code").and_then(Value::as_i64).unwrap_or(-1);
            Ok(Some(Inbound::AuthReply { code }))
        }
        Some(Operation::SendMsgReply) => {
            let json: Value = serde_json::from_slice(&frame.body)?;
            Command::from_value(json)
                .map(|cmd| Some(Inbound::Command(cmd)))
                .ok_or_else(|| BliveError::protocol("envelope is not a JSON object"))
        }
        _ => {
            trace!(operation = frame.header.operation, "Ignoring frame");
            Ok(None)
        }
    }
}

/// Build an outbound frame: header length 16, version 1, sequence 1.
pub fn encode_packet(operation: Operation, body: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(HEADER_LEN + body.len());
    WireHeader {
        packet_len: (HEADER_LEN + body.len()) as u32,
        header_len: HEADER_LEN as u16,
        version: ver::POPULARITY,
        operation: operation as u32,
        sequence: 1,
    }
    .write(&mut packet);
    packet.put_slice(body);
    packet.freeze()
}

/// Body of the AUTH frame.
#[derive(Debug, Clone, Serialize)]
pub struct AuthPacket {
    pub uid: u64,
    pub roomid: u64,
    pub protover: u8,
    pub platform: &'static str,
    #[serde(rename = "type")]
    pub auth_type: u8,
    pub key: String,
    pub buvid: String,
}

impl AuthPacket {
    pub fn new(uid: u64, room_id: u64, key: impl Into<String>, buvid: impl Into<String>) -> Self {
        Self {
            uid,
            roomid: room_id,
            // Ask for brotli-compressed notifications
            protover: 3,
            platform: "web",
            auth_type: 2,
            key: key.into(),
            buvid: buvid.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(self)?;
        Ok(encode_packet(Operation::Auth, &body))
    }
}

/// The keepalive frame: operation 2 with an empty JSON object body.
pub fn heartbeat_packet() -> Bytes {
    encode_packet(Operation::Heartbeat, b"{}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use proptest::prelude::*;
    use std::io::Write;

    fn frame(version: u16, operation: Operation, body: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        WireHeader {
            packet_len: (HEADER_LEN + body.len()) as u32,
            header_len: HEADER_LEN as u16,
            version,
            operation: operation as u32,
            sequence: 0,
        }
        .write(&mut out);
        out.put_slice(body);
        out.to_vec()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn brotli_compress(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer.write_all(data).unwrap();
        }
        out
    }

    #[test]
    fn test_encode_packet() {
        let packet = encode_packet(Operation::Auth, b"test");

        assert_eq!(BigEndian::read_u32(&packet[0..4]), 20);
        assert_eq!(BigEndian::read_u16(&packet[4..6]), 16);
        assert_eq!(BigEndian::read_u16(&packet[6..8]), 1);
        assert_eq!(BigEndian::read_u32(&packet[8..12]), 7);
        assert_eq!(BigEndian::read_u32(&packet[12..16]), 1);
        assert_eq!(&packet[16..], b"test");
    }

    #[test]
    fn test_auth_packet_body() {
        let packet = AuthPacket::new(42, 123, "token", "buvid-x").encode().unwrap();
        let json: Value = serde_json::from_slice(&packet[16..]).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "uid": 42,
                "roomid": 123,
                "protover": 3,
                "platform": "web",
                "type": 2,
                "key": "token",
                "buvid": "buvid-x",
            })
        );
    }

    #[test]
    fn test_heartbeat_packet() {
        let packet = heartbeat_packet();
        let header = WireHeader::read(&packet).unwrap();
        assert_eq!(header.operation, Operation::Heartbeat as u32);
        assert_eq!(header.packet_len, 18);
        assert_eq!(&packet[16..], b"{}");
    }

    #[test]
    fn test_operation_codes() {
        for code in 0..=17 {
            assert_eq!(Operation::from_u32(code).map(|op| op as u32), Some(code));
        }
        assert_eq!(Operation::from_u32(18), None);
    }

    #[test]
    fn test_split_truncated_tail() {
        let mut buf = frame(0, Operation::SendMsgReply, b"{\"cmd\":\"A\"}");
        let mut second = frame(0, Operation::SendMsgReply, b"{\"cmd\":\"B\"}");
        second.truncate(second.len() - 3);
        buf.extend_from_slice(&second);

        let frames = split_frames(&buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].body[..], b"{\"cmd\":\"A\"}");
    }

    #[test]
    fn test_split_honours_header_len() {
        let body = b"{\"cmd\":\"X\"}";
        let mut buf = BytesMut::new();
        WireHeader {
            packet_len: (20 + body.len()) as u32,
            header_len: 20,
            version: 0,
            operation: Operation::SendMsgReply as u32,
            sequence: 0,
        }
        .write(&mut buf);
        buf.put_slice(&[0xAA; 4]);
        buf.put_slice(body);

        let frames = split_frames(&buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].body[..], body);
    }

    #[test]
    fn test_split_rejects_zero_length_frame() {
        let mut buf = frame(0, Operation::SendMsgReply, b"{}");
        buf[0..4].copy_from_slice(&0u32.to_be_bytes());
        assert!(split_frames(&buf).is_empty());
    }

    #[test]
    fn test_split_short_buffer() {
        assert!(split_frames(&[0u8; 15]).is_empty());
        assert!(split_frames(&[]).is_empty());
    }

    #[test]
    fn test_decompress_plain_is_identity() {
        let body = b"hello";
        assert_eq!(decompress(ver::RAW_JSON, body).unwrap().as_ref(), body);
        assert_eq!(decompress(ver::POPULARITY, body).unwrap().as_ref(), body);
    }

    #[test]
    fn test_decompress_zlib_and_brotli() {
        let payload = frame(0, Operation::SendMsgReply, b"{\"cmd\":\"DANMU_MSG\"}");
        assert_eq!(
            decompress(ver::ZLIB, &zlib(&payload)).unwrap().as_ref(),
            &payload[..]
        );
        assert_eq!(
            decompress(ver::BROTLI, &brotli_compress(&payload))
                .unwrap()
                .as_ref(),
            &payload[..]
        );
    }

    #[test]
    fn test_decompress_rejects_garbage_and_oversize() {
        assert!(decompress(ver::ZLIB, b"definitely not zlib").is_err());
        let big = vec![0u8; 4096];
        assert!(decompress_bounded(ver::ZLIB, &zlib(&big), 1024).is_err());
        assert!(decompress_bounded(ver::ZLIB, &zlib(&big), 4096).is_ok());
    }

    #[test]
    fn test_heartbeat_reply_synthesis() {
        let buf = frame(ver::POPULARITY, Operation::HeartbeatReply, &[0, 0, 0, 7]);
        assert_eq!(
            decode(&buf),
            vec![Inbound::Command(Command::heartbeat(7))]
        );
        assert_eq!(
            Command::heartbeat(7).as_value(),
            &serde_json::json!({"cmd": "_HEARTBEAT", "data": {"popularity": 7}})
        );
    }

    #[test]
    fn test_decode_auth_reply() {
        let ok = frame(ver::RAW_JSON, Operation::AuthReply, b"{\"code\":0}");
        assert_eq!(decode(&ok), vec![Inbound::AuthReply { code: 0 }]);

        let rejected = frame(ver::RAW_JSON, Operation::AuthReply, b"{\"code\":-101}");
        assert_eq!(decode(&rejected), vec![Inbound::AuthReply { code: -101 }]);
    }

    #[test]
    fn test_decode_nested_compressed_batch() {
        let mut inner = frame(0, Operation::SendMsgReply, b"{\"cmd\":\"A\"}");
        inner.extend(frame(0, Operation::SendMsgReply, b"not json"));
        inner.extend(frame(0, Operation::SendMsgReply, b"{\"cmd\":\"B\"}"));

        let mut buf = frame(ver::BROTLI, Operation::SendMsgReply, &brotli_compress(&inner));
        buf.extend(frame(ver::ZLIB, Operation::SendMsgReply, &zlib(&inner)));

        let cmds: Vec<String> = decode(&buf)
            .into_iter()
            .filter_map(|item| match item {
                Inbound::Command(c) => Some(c.cmd().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(cmds, vec!["A", "B", "A", "B"]);
    }

    #[test]
    fn test_decode_stops_at_nesting_limit() {
        let mut payload = frame(0, Operation::SendMsgReply, b"{\"cmd\":\"DEEP\"}");
        for _ in 0..=MAX_NESTING_DEPTH {
            payload = frame(ver::ZLIB, Operation::SendMsgReply, &zlib(&payload));
        }
        assert!(decode(&payload).is_empty());

        let mut shallow = frame(0, Operation::SendMsgReply, b"{\"cmd\":\"DEEP\"}");
        for _ in 0..MAX_NESTING_DEPTH {
            shallow = frame(ver::ZLIB, Operation::SendMsgReply, &zlib(&shallow));
        }
        assert_eq!(decode(&shallow).len(), 1);
    }

    #[test]
    fn test_expansion_budget_is_shared_across_frames() {
        // each inner frame is tiny on the wire but inflates to ~100 KB
        let big = format!("{{\"cmd\":\"BIG\",\"pad\":\"{}\"}}", "a".repeat(100_000));
        let plain = frame(0, Operation::SendMsgReply, big.as_bytes());
        let inner = frame(ver::ZLIB, Operation::SendMsgReply, &zlib(&plain));
        let mut batch = Vec::new();
        for _ in 0..64 {
            batch.extend_from_slice(&inner);
        }
        let mut buf = frame(ver::ZLIB, Operation::SendMsgReply, &zlib(&batch));
        buf.extend(frame(0, Operation::SendMsgReply, b"{\"cmd\":\"AFTER\"}"));

        // every single expansion fits a 350 KB budget, their sum does not
        let decoded = decode_with_budget(&buf, 350_000);
        assert_eq!(decoded.len(), 3);
        assert!(decoded.iter().all(|item| matches!(
            item,
            Inbound::Command(c) if c.cmd() == "BIG"
        )));

        // the full budget holds all of them
        assert_eq!(decode(&buf).len(), 65);
    }

    #[test]
    fn test_base_cmd_strips_suffix() {
        let cmd = Command::from_value(serde_json::json!({"cmd": "DANMU_MSG:4:0:2:2:2:0"})).unwrap();
        assert_eq!(cmd.base_cmd(), "DANMU_MSG");
        assert_eq!(cmd.cmd(), "DANMU_MSG:4:0:2:2:2:0");
        assert!(Command::from_value(serde_json::json!([1, 2])).is_none());
    }

    proptest! {
        #[test]
        fn prop_split_preserves_frames(bodies in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..64), 0..8)
        ) {
            let mut buf = Vec::new();
            for body in &bodies {
                buf.extend(frame(0, Operation::SendMsgReply, body));
            }

            let frames = split_frames(&buf);
            prop_assert_eq!(frames.len(), bodies.len());
            for (frame, body) in frames.iter().zip(&bodies) {
                prop_assert_eq!(
                    frame.body.len(),
                    frame.header.packet_len as usize - frame.header.header_len as usize
                );
                prop_assert_eq!(&frame.body[..], &body[..]);
            }
        }
    }
}
