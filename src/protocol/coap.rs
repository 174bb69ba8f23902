//! CoAP message model and codec.
//!
//! Implements the subset of RFC 7252 the device firmware speaks: the fixed
//! header, tokens up to 8 bytes, Uri-Path and Uri-Query options, and the
//! 0xFF payload marker. Messages are always carried whole inside one chunk
//! frame, so no block-wise transfer or retransmission layer exists here.

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::error::SessionError;

/// CoAP protocol version carried in the header.
const COAP_VERSION: u8 = 1;

/// Payload marker separating options from payload.
const PAYLOAD_MARKER: u8 = 0xFF;

/// CoAP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoapType {
    /// Confirmable.
    Con,
    /// Non-confirmable.
    Non,
    /// Acknowledgement.
    Ack,
    /// Reset.
    Rst,
}

impl CoapType {
    fn to_bits(self) -> u8 {
        match self {
            Self::Con => 0,
            Self::Non => 1,
            Self::Ack => 2,
            Self::Rst => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Con,
            1 => Self::Non,
            2 => Self::Ack,
            _ => Self::Rst,
        }
    }
}

/// CoAP code: 3-bit class, 5-bit detail.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoapCode(pub u8);

impl CoapCode {
    pub const EMPTY: Self = Self(0x00);
    pub const GET: Self = Self(0x01);
    pub const POST: Self = Self(0x02);
    pub const PUT: Self = Self(0x03);

    pub const CREATED: Self = Self(0x41); // 2.01
    pub const DELETED: Self = Self(0x42); // 2.02
    pub const VALID: Self = Self(0x43); // 2.03
    pub const CHANGED: Self = Self(0x44); // 2.04
    pub const CONTENT: Self = Self(0x45); // 2.05

    pub const BAD_REQUEST: Self = Self(0x80); // 4.00
    pub const NOT_FOUND: Self = Self(0x84); // 4.04
    pub const INTERNAL_ERROR: Self = Self(0xA0); // 5.00

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    /// Request method code (class 0, nonzero detail).
    pub fn is_method(self) -> bool {
        self.class() == 0 && self.detail() != 0
    }

    /// Success response code (class 2).
    pub fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl fmt::Debug for CoapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Display for CoapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// Message token, 0 to 8 bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Token(Vec<u8>);

impl Token {
    pub const MAX_LEN: usize = 8;

    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn from_u8(v: u8) -> Self {
        Self(vec![v])
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SessionError> {
        if bytes.len() > Self::MAX_LEN {
            return Err(SessionError::MalformedMessage(format!(
                "token too long: {} bytes",
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Option numbers used by the device protocol.
pub mod option_number {
    pub const URI_PATH: u16 = 11;
    pub const URI_QUERY: u16 = 15;
}

/// A single CoAP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

impl CoapOption {
    pub fn uri_path(segment: impl Into<String>) -> Self {
        Self {
            number: option_number::URI_PATH,
            value: segment.into().into_bytes(),
        }
    }

    pub fn uri_query(value: impl Into<Vec<u8>>) -> Self {
        Self {
            number: option_number::URI_QUERY,
            value: value.into(),
        }
    }
}

/// A parsed CoAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub kind: CoapType,
    pub code: CoapCode,
    pub message_id: u16,
    pub token: Token,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl CoapMessage {
    /// Start a request message.
    pub fn request(kind: CoapType, code: CoapCode, message_id: u16) -> Self {
        Self {
            kind,
            code,
            message_id,
            token: Token::empty(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Start an acknowledgement for `message_id`.
    pub fn ack(code: CoapCode, message_id: u16) -> Self {
        Self {
            kind: CoapType::Ack,
            code,
            message_id,
            token: Token::empty(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// An empty CON ping.
    pub fn ping(message_id: u16) -> Self {
        Self::request(CoapType::Con, CoapCode::EMPTY, message_id)
    }

    pub fn with_token(mut self, token: Token) -> Self {
        self.token = token;
        self
    }

    pub fn with_uri_path(mut self, segment: impl Into<String>) -> Self {
        self.options.push(CoapOption::uri_path(segment));
        self
    }

    pub fn with_uri_query(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.options.push(CoapOption::uri_query(value));
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Joined Uri-Path segments.
    pub fn uri_path(&self) -> String {
        let segments: Vec<&str> = self
            .options
            .iter()
            .filter(|o| o.number == option_number::URI_PATH)
            .filter_map(|o| std::str::from_utf8(&o.value).ok())
            .collect();
        segments.join("/")
    }

    /// First Uri-Path segment, used for dispatch.
    pub fn uri_path_first(&self) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.number == option_number::URI_PATH)
            .and_then(|o| std::str::from_utf8(&o.value).ok())
    }

    /// All Uri-Query option values, in order.
    pub fn uri_queries(&self) -> Vec<&[u8]> {
        self.options
            .iter()
            .filter(|o| o.number == option_number::URI_QUERY)
            .map(|o| o.value.as_slice())
            .collect()
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, SessionError> {
        if self.token.as_bytes().len() > Token::MAX_LEN {
            return Err(SessionError::MalformedMessage("token too long".into()));
        }

        let mut buf = BytesMut::with_capacity(8 + self.payload.len());
        buf.put_u8(
            (COAP_VERSION << 6)
                | (self.kind.to_bits() << 4)
                | (self.token.as_bytes().len() as u8),
        );
        buf.put_u8(self.code.0);
        buf.put_u16(self.message_id);
        buf.put_slice(self.token.as_bytes());

        // Options must be emitted in ascending number order.
        let mut options: Vec<&CoapOption> = self.options.iter().collect();
        options.sort_by_key(|o| o.number);

        let mut previous = 0u16;
        for option in options {
            let delta = option.number - previous;
            previous = option.number;
            encode_option_header(&mut buf, delta, option.value.len())?;
            buf.put_slice(&option.value);
        }

        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER);
            buf.put_slice(&self.payload);
        }

        Ok(buf.to_vec())
    }

    /// Parse from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self, SessionError> {
        if data.len() < 4 {
            return Err(SessionError::MalformedMessage(format!(
                "message too short: {} bytes",
                data.len()
            )));
        }

        let version = data[0] >> 6;
        if version != COAP_VERSION {
            return Err(SessionError::MalformedMessage(format!(
                "unsupported version {version}"
            )));
        }

        let kind = CoapType::from_bits(data[0] >> 4);
        let token_len = (data[0] & 0x0F) as usize;
        if token_len > Token::MAX_LEN {
            return Err(SessionError::MalformedMessage(format!(
                "token length {token_len} out of range"
            )));
        }

        let code = CoapCode(data[1]);
        let message_id = u16::from_be_bytes([data[2], data[3]]);

        let mut pos = 4;
        if data.len() < pos + token_len {
            return Err(SessionError::MalformedMessage("truncated token".into()));
        }
        let token = Token::from_slice(&data[pos..pos + token_len])?;
        pos += token_len;

        let mut options = Vec::new();
        let mut number = 0u16;

        while pos < data.len() {
            if data[pos] == PAYLOAD_MARKER {
                pos += 1;
                if pos == data.len() {
                    return Err(SessionError::MalformedMessage(
                        "payload marker with empty payload".into(),
                    ));
                }
                break;
            }

            let (delta, length, consumed) = decode_option_header(&data[pos..])?;
            pos += consumed;
            number = number
                .checked_add(delta)
                .ok_or_else(|| SessionError::MalformedMessage("option delta overflow".into()))?;

            if data.len() < pos + length {
                return Err(SessionError::MalformedMessage("truncated option".into()));
            }
            options.push(CoapOption {
                number,
                value: data[pos..pos + length].to_vec(),
            });
            pos += length;
        }

        Ok(Self {
            kind,
            code,
            message_id,
            token,
            options,
            payload: data[pos..].to_vec(),
        })
    }
}

/// Emit a delta/length option header with extended nibbles as needed.
fn encode_option_header(
    buf: &mut BytesMut,
    delta: u16,
    length: usize,
) -> Result<(), SessionError> {
    let length = u16::try_from(length)
        .map_err(|_| SessionError::MalformedMessage("option too long".into()))?;

    let (delta_nibble, delta_ext) = nibble_of(delta);
    let (length_nibble, length_ext) = nibble_of(length);

    buf.put_u8((delta_nibble << 4) | length_nibble);
    put_ext(buf, delta_ext);
    put_ext(buf, length_ext);
    Ok(())
}

/// Split a value into its 4-bit nibble and optional extension bytes.
fn nibble_of(value: u16) -> (u8, Option<ExtValue>) {
    if value < 13 {
        (value as u8, None)
    } else if value < 269 {
        (13, Some(ExtValue::One((value - 13) as u8)))
    } else {
        (14, Some(ExtValue::Two(value - 269)))
    }
}

enum ExtValue {
    One(u8),
    Two(u16),
}

fn put_ext(buf: &mut BytesMut, ext: Option<ExtValue>) {
    match ext {
        None => {}
        Some(ExtValue::One(v)) => buf.put_u8(v),
        Some(ExtValue::Two(v)) => buf.put_u16(v),
    }
}

/// Parse a delta/length option header; returns (delta, length, bytes consumed).
fn decode_option_header(data: &[u8]) -> Result<(u16, usize, usize), SessionError> {
    let header = data[0];
    let mut pos = 1;
    let delta = read_ext_nibble(data, &mut pos, header >> 4)?;
    let length = read_ext_nibble(data, &mut pos, header & 0x0F)?;
    Ok((delta, length as usize, pos))
}

/// Resolve one 4-bit nibble plus its extension bytes.
fn read_ext_nibble(data: &[u8], pos: &mut usize, nibble: u8) -> Result<u16, SessionError> {
    match nibble {
        n @ 0..=12 => Ok(u16::from(n)),
        13 => {
            let v = *data
                .get(*pos)
                .ok_or_else(|| SessionError::MalformedMessage("truncated option header".into()))?;
            *pos += 1;
            Ok(u16::from(v) + 13)
        }
        14 => {
            if data.len() < *pos + 2 {
                return Err(SessionError::MalformedMessage(
                    "truncated option header".into(),
                ));
            }
            let v = u16::from_be_bytes([data[*pos], data[*pos + 1]]);
            *pos += 2;
            v.checked_add(269)
                .ok_or_else(|| SessionError::MalformedMessage("option value overflow".into()))
        }
        _ => Err(SessionError::MalformedMessage(
            "reserved option nibble 15".into(),
        )),
    }
}
