// Copyright 2020 Joyent, Inc.

//! This module contains the types and functions used to encode and decode Fast
//! messages. The contents of this module are not needed for normal client or
//! server consumers of this crate, but they are exposed for the special case of
//! someone needing to implement custom client or server code.

use std::io::{Error, ErrorKind};
use std::time::{SystemTime, UNIX_EPOCH};
use std::{fmt, io, str};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use crc16::{State, ARC};
use num::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

const FP_OFF_TYPE: usize = 0x1;
const FP_OFF_STATUS: usize = 0x2;
const FP_OFF_MSGID: usize = 0x3;
const FP_OFF_CRC: usize = 0x7;
const FP_OFF_DATALEN: usize = 0xb;
const FP_OFF_DATA: usize = 0xf;

/// The size of a Fast message header
pub const FP_HEADER_SZ: usize = FP_OFF_DATA;

const FP_VERSION_1: u8 = 0x1;
const FP_VERSION_CURRENT: u8 = FP_VERSION_1;

/// Message ids wrap around in a 31-bit space
const FP_MSGID_MAX: u32 = i32::max_value() as u32;

/// Upper bound on a single payload; anything larger is treated as corruption.
pub const FP_MAX_DATA_LEN: usize = 64 * 1024 * 1024;

/// An error type representing a failure to parse a buffer as a Fast message.
#[derive(Debug)]
pub enum FastParseError {
    NotEnoughBytes(usize),
    IOError(Error),
}

impl From<io::Error> for FastParseError {
    fn from(error: io::Error) -> Self {
        FastParseError::IOError(error)
    }
}

impl From<FastParseError> for Error {
    fn from(pfr: FastParseError) -> Self {
        match pfr {
            FastParseError::NotEnoughBytes(_) => {
                let msg = "Unable to parse message: not enough bytes";
                Error::new(ErrorKind::Other, msg)
            }
            FastParseError::IOError(e) => e,
        }
    }
}

/// Represents the Type field of a Fast message. Currently there is only one
/// valid value, JSON.
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq)]
pub enum FastMessageType {
    Json = 1,
}

/// Represents the Status field of a Fast message.
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq)]
pub enum FastMessageStatus {
    Data = 1,
    End = 2,
    Error = 3,
}

/// The header of a Fast message, parsed ahead of its payload
#[derive(Debug)]
struct FastMessageHeader {
    msg_type: FastMessageType,
    status: FastMessageStatus,
    id: u32,
    crc: u32,
    data_len: usize,
}

/// The metadata portion of a Fast message payload: a microsecond timestamp
/// and the name of the method the message belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FastMessageMetaData {
    pub uts: u64,
    pub name: String,
}

impl FastMessageMetaData {
    pub fn new(n: String) -> FastMessageMetaData {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let now_micros = now.as_secs() * 1_000_000 + u64::from(now.subsec_micros());

        FastMessageMetaData {
            uts: now_micros,
            name: n,
        }
    }
}

/// The payload of a Fast message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FastMessageData {
    pub m: FastMessageMetaData,
    pub d: Value,
}

impl FastMessageData {
    pub fn new(n: String, d: Value) -> FastMessageData {
        FastMessageData {
            m: FastMessageMetaData::new(n),
            d,
        }
    }
}

/// A single decoded Fast message
#[derive(Debug, Clone)]
pub struct FastMessage {
    pub msg_type: FastMessageType,
    pub status: FastMessageStatus,
    pub id: u32,
    /// Encoded size of the message, populated when the message was parsed
    /// from a buffer.
    pub msg_size: Option<usize>,
    pub data: FastMessageData,
}

impl PartialEq for FastMessage {
    fn eq(&self, other: &FastMessage) -> bool {
        self.msg_type == other.msg_type
            && self.status == other.status
            && self.id == other.id
            && self.data == other.data
    }
}

impl FastMessage {
    /// Parse a byte buffer into a `FastMessage`. Returns a
    /// `FastParseError::NotEnoughBytes` error if the buffer does not yet hold
    /// a complete message.
    pub fn parse(buf: &[u8]) -> Result<FastMessage, FastParseError> {
        FastMessage::check_buffer_size(buf)?;
        let header = FastMessage::parse_header(buf)?;

        FastMessage::validate_data_length(buf, header.data_len)?;
        let raw_data = &buf[FP_OFF_DATA..FP_OFF_DATA + header.data_len];
        FastMessage::validate_crc(raw_data, header.crc)?;
        let data = FastMessage::parse_data(raw_data)?;

        Ok(FastMessage {
            msg_type: header.msg_type,
            status: header.status,
            id: header.id,
            msg_size: Some(FP_HEADER_SZ + header.data_len),
            data,
        })
    }

    fn check_buffer_size(buf: &[u8]) -> Result<(), FastParseError> {
        if buf.len() < FP_HEADER_SZ {
            Err(FastParseError::NotEnoughBytes(buf.len()))
        } else {
            Ok(())
        }
    }

    fn parse_header(buf: &[u8]) -> Result<FastMessageHeader, FastParseError> {
        if buf[0] != FP_VERSION_CURRENT {
            let msg = format!("Unsupported protocol version: {}", buf[0]);
            return Err(FastParseError::IOError(Error::new(ErrorKind::Other, msg)));
        }
        let msg_type = FromPrimitive::from_u8(buf[FP_OFF_TYPE]).ok_or_else(|| {
            let msg = "Failed to parse message type";
            Error::new(ErrorKind::Other, msg)
        })?;
        let status = FromPrimitive::from_u8(buf[FP_OFF_STATUS]).ok_or_else(|| {
            let msg = "Failed to parse message status";
            Error::new(ErrorKind::Other, msg)
        })?;
        let msg_id = BigEndian::read_u32(&buf[FP_OFF_MSGID..FP_OFF_MSGID + 4]);
        let expected_crc = BigEndian::read_u32(&buf[FP_OFF_CRC..FP_OFF_CRC + 4]);
        let data_len =
            BigEndian::read_u32(&buf[FP_OFF_DATALEN..FP_OFF_DATALEN + 4]) as usize;

        if data_len > FP_MAX_DATA_LEN {
            let msg = format!("Data length {} exceeds maximum payload size", data_len);
            return Err(FastParseError::IOError(Error::new(ErrorKind::Other, msg)));
        }

        Ok(FastMessageHeader {
            msg_type,
            status,
            id: msg_id,
            crc: expected_crc,
            data_len,
        })
    }

    fn validate_data_length(buf: &[u8], data_length: usize) -> Result<(), FastParseError> {
        if buf.len() < (FP_HEADER_SZ + data_length) {
            Err(FastParseError::NotEnoughBytes(buf.len()))
        } else {
            Ok(())
        }
    }

    fn validate_crc(data_buf: &[u8], crc: u32) -> Result<(), FastParseError> {
        let calculated_crc = u32::from(State::<ARC>::calculate(data_buf));
        if crc != calculated_crc {
            let msg = "Calculated CRC does not match the provided CRC";
            Err(FastParseError::IOError(Error::new(ErrorKind::Other, msg)))
        } else {
            Ok(())
        }
    }

    fn parse_data(data_buf: &[u8]) -> Result<FastMessageData, FastParseError> {
        match str::from_utf8(data_buf) {
            Ok(data_str) => serde_json::from_str(data_str).map_err(|_e| {
                let msg = "Failed to parse data payload as JSON";
                FastParseError::IOError(Error::new(ErrorKind::Other, msg))
            }),
            Err(_) => {
                let msg = "Failed to parse data payload as UTF-8";
                Err(FastParseError::IOError(Error::new(ErrorKind::Other, msg)))
            }
        }
    }

    /// Returns a `FastMessage` that represents a Fast protocol `DATA` message
    /// with the provided message identifer and data payload.
    pub fn data(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::Data,
            id: msg_id,
            msg_size: None,
            data,
        }
    }

    /// Returns a `FastMessage` that represents a Fast protocol `END` message
    /// for the named method.
    pub fn end(msg_id: u32, method: String) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::End,
            id: msg_id,
            msg_size: None,
            data: FastMessageData::new(method, Value::Array(vec![])),
        }
    }

    /// Returns a `FastMessage` that represents a Fast protocol `ERROR`
    /// message. The payload is the serialized error object.
    pub fn error(msg_id: u32, method: String, error: Value) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::Error,
            id: msg_id,
            msg_size: None,
            data: FastMessageData::new(method, error),
        }
    }

    /// The name of the method this message belongs to
    pub fn method(&self) -> &str {
        self.data.m.name.as_str()
    }
}

impl fmt::Display for FastMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} message {} for {}",
            self.status, self.id, self.data.m.name
        )
    }
}

/// An iterator producing message ids for outgoing requests. Ids start at 1
/// and wrap around at the top of the 31-bit id space.
#[derive(Debug, Default)]
pub struct FastMessageId(u32);

impl FastMessageId {
    pub fn new() -> Self {
        FastMessageId(0)
    }
}

impl Iterator for FastMessageId {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        self.0 = if self.0 >= FP_MSGID_MAX { 1 } else { self.0 + 1 };
        Some(self.0)
    }
}

/// The Fast codec, for use with `tokio_util::codec::Framed`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FastRpc;

impl Decoder for FastRpc {
    type Item = FastMessage;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        match FastMessage::parse(&buf[..]) {
            Ok(parsed_msg) => {
                // parse() always fills in msg_size
                let size = parsed_msg.msg_size.unwrap_or(FP_HEADER_SZ);
                buf.advance(size);
                Ok(Some(parsed_msg))
            }
            Err(FastParseError::NotEnoughBytes(_)) => Ok(None),
            Err(FastParseError::IOError(e)) => {
                let msg = format!("failed to parse Fast request: {}", e);
                Err(Error::new(ErrorKind::Other, msg))
            }
        }
    }
}

impl Encoder<FastMessage> for FastRpc {
    type Error = Error;

    fn encode(&mut self, item: FastMessage, buf: &mut BytesMut) -> Result<(), Error> {
        encode_msg(&item, buf).map_err(|e| Error::new(ErrorKind::Other, e))
    }
}

/// Encode a `FastMessage` into a byte buffer.
pub fn encode_msg(msg: &FastMessage, buf: &mut BytesMut) -> Result<(), String> {
    let m_msg_type_u8 = msg.msg_type.to_u8();
    let m_status_u8 = msg.status.to_u8();
    match (m_msg_type_u8, m_status_u8) {
        (Some(msg_type_u8), Some(status_u8)) => {
            let data_str = serde_json::to_string(&msg.data)
                .map_err(|e| format!("Failed to serialize message data: {}", e))?;
            let data_len = data_str.len();
            if data_len > FP_MAX_DATA_LEN {
                return Err(format!(
                    "Data length {} exceeds maximum payload size",
                    data_len
                ));
            }
            buf.reserve(FP_HEADER_SZ + data_len);
            buf.put_u8(FP_VERSION_CURRENT);
            buf.put_u8(msg_type_u8);
            buf.put_u8(status_u8);
            buf.put_u32(msg.id);
            buf.put_u32(u32::from(State::<ARC>::calculate(data_str.as_bytes())));
            buf.put_u32(data_len as u32);
            buf.put_slice(data_str.as_bytes());
            Ok(())
        }
        (None, Some(_)) => Err(String::from("Invalid message type")),
        (Some(_), None) => Err(String::from("Invalid status")),
        (None, None) => Err(String::from("Invalid message type and status")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::{quickcheck, Arbitrary, Gen};
    use serde_json::json;

    fn random_string<G: Gen>(g: &mut G, len: usize) -> String {
        let chars: Vec<char> = (0..len)
            .map(|_| {
                let c = u8::arbitrary(g) % 26;
                char::from(b'a' + c)
            })
            .collect();
        chars.into_iter().collect()
    }

    impl Arbitrary for FastMessageStatus {
        fn arbitrary<G: Gen>(g: &mut G) -> FastMessageStatus {
            match u8::arbitrary(g) % 3 {
                0 => FastMessageStatus::Data,
                1 => FastMessageStatus::End,
                _ => FastMessageStatus::Error,
            }
        }
    }

    impl Arbitrary for FastMessage {
        fn arbitrary<G: Gen>(g: &mut G) -> FastMessage {
            let status = FastMessageStatus::arbitrary(g);
            let id = u32::arbitrary(g) % FP_MSGID_MAX;
            let name_len = (usize::arbitrary(g) % 16) + 1;
            let name = random_string(g, name_len);
            let payload = Vec::<u8>::arbitrary(g);
            let data = FastMessageData::new(name, json!([{ "data": payload }]));

            FastMessage {
                msg_type: FastMessageType::Json,
                status,
                id,
                msg_size: None,
                data,
            }
        }
    }

    quickcheck! {
        fn prop_decode_encoded_message(msg: FastMessage) -> bool {
            let mut buf = BytesMut::new();
            encode_msg(&msg, &mut buf).is_ok()
                && matches!(FastRpc.decode(&mut buf), Ok(Some(ref m)) if *m == msg)
                && buf.is_empty()
        }

        fn prop_decode_split_buffer(msg: FastMessage, split: usize) -> bool {
            let mut encoded = BytesMut::new();
            if encode_msg(&msg, &mut encoded).is_err() {
                return false;
            }
            let split = split % encoded.len();
            let mut buf = BytesMut::from(&encoded[..split]);
            let first = FastRpc.decode(&mut buf);
            buf.extend_from_slice(&encoded[split..]);
            let second = FastRpc.decode(&mut buf);

            matches!(first, Ok(None))
                && matches!(second, Ok(Some(ref m)) if *m == msg)
        }
    }

    #[test]
    fn decode_two_messages_from_one_buffer() {
        let first = FastMessage::data(1, FastMessageData::new("upload".into(), json!([1])));
        let second = FastMessage::end(1, "upload".into());
        let mut buf = BytesMut::new();
        encode_msg(&first, &mut buf).unwrap();
        encode_msg(&second, &mut buf).unwrap();

        let decoded_first = FastRpc.decode(&mut buf).unwrap().unwrap();
        let decoded_second = FastRpc.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded_first, first);
        assert_eq!(decoded_second.status, FastMessageStatus::End);
        assert!(FastRpc.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_crc_mismatch() {
        let msg = FastMessage::data(9, FastMessageData::new("register".into(), json!([{"id": 7}])));
        let mut buf = BytesMut::new();
        encode_msg(&msg, &mut buf).unwrap();
        buf[FP_OFF_CRC] ^= 0xff;

        assert!(FastRpc.decode(&mut buf).is_err());
    }

    #[test]
    fn decode_rejects_unknown_status() {
        let msg = FastMessage::end(3, "download".into());
        let mut buf = BytesMut::new();
        encode_msg(&msg, &mut buf).unwrap();
        buf[FP_OFF_STATUS] = 0x7;

        assert!(FastRpc.decode(&mut buf).is_err());
    }

    #[test]
    fn message_ids_wrap_in_31_bit_space() {
        let mut ids = FastMessageId(FP_MSGID_MAX - 1);
        assert_eq!(ids.next(), Some(FP_MSGID_MAX));
        assert_eq!(ids.next(), Some(1));
        assert_eq!(FastMessageId::new().next(), Some(1));
    }
}
