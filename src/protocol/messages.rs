//! Symbolic message names and their CoAP conventions.
//!
//! This table is the single source of truth for how symbolic operations map
//! onto the wire: request messages are identified by method code plus first
//! Uri-Path segment; response messages are piggybacked ACKs identified by
//! code class and matched to their request by token. Nothing else in the
//! crate re-declares codes or paths.

use super::coap::{CoapCode, CoapMessage, CoapType, Token};

/// Every symbolic message the core consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageName {
    Hello,
    Describe,
    DescribeReturn,
    UpdateBegin,
    UpdateReady,
    UpdateAbort,
    Chunk,
    ChunkReceived,
    ChunkMissed,
    ChunkMissedAck,
    UpdateDone,
    FunctionCall,
    FunctionReturn,
    VariableRequest,
    VariableValue,
    SignalStart,
    SignalStartReturn,
    Event,
    Subscribe,
    KeyChange,
    PrivateEvent,
    PublicEvent,
    GetTime,
    TimeReturn,
    Ping,
    PingAck,
    SocketPing,
}

/// Which ACK code classes satisfy a response name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// Success class (2.xx).
    Success,
    /// Client/server error class (4.xx / 5.xx).
    Error,
    /// Any piggybacked response, success or not.
    Any,
}

impl ResponseClass {
    fn matches(self, code: CoapCode) -> bool {
        match self {
            Self::Success => code.class() == 2,
            Self::Error => code.class() >= 4,
            Self::Any => code.class() >= 2,
        }
    }
}

/// Wire shape of one symbolic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSpec {
    /// Request carried as method code + first Uri-Path segment.
    Request {
        kind: CoapType,
        code: CoapCode,
        path: &'static str,
    },
    /// Empty-code message (ping family), identified by type alone.
    Empty { kind: CoapType },
    /// Piggybacked ACK matched by code class and token.
    Response { class: ResponseClass, code: CoapCode },
}

impl MessageName {
    /// The wire convention for this name.
    pub fn spec(self) -> MessageSpec {
        use CoapCode as C;
        use CoapType::{Ack, Con, Non};
        use MessageSpec::{Empty, Request, Response};
        use ResponseClass as R;

        match self {
            // Requests, device→server and server→device
            Self::Hello => Request { kind: Con, code: C::POST, path: "h" },
            Self::Describe => Request { kind: Con, code: C::GET, path: "d" },
            Self::UpdateBegin => Request { kind: Con, code: C::POST, path: "u" },
            Self::UpdateDone => Request { kind: Con, code: C::PUT, path: "u" },
            Self::Chunk => Request { kind: Con, code: C::POST, path: "c" },
            Self::ChunkMissed => Request { kind: Con, code: C::GET, path: "c" },
            Self::FunctionCall => Request { kind: Con, code: C::POST, path: "f" },
            Self::VariableRequest => Request { kind: Con, code: C::GET, path: "v" },
            Self::SignalStart => Request { kind: Con, code: C::PUT, path: "s" },
            Self::Subscribe => Request { kind: Con, code: C::GET, path: "e" },
            Self::KeyChange => Request { kind: Con, code: C::PUT, path: "k" },
            Self::GetTime => Request { kind: Con, code: C::GET, path: "t" },
            Self::PublicEvent | Self::Event => Request { kind: Non, code: C::POST, path: "e" },
            Self::PrivateEvent => Request { kind: Non, code: C::POST, path: "E" },

            // Ping family
            Self::Ping | Self::SocketPing => Empty { kind: Con },
            Self::PingAck => Empty { kind: Ack },

            // Responses
            Self::UpdateReady => Response { class: R::Success, code: C::CHANGED },
            Self::UpdateAbort => Response { class: R::Error, code: C::BAD_REQUEST },
            Self::ChunkReceived => Response { class: R::Any, code: C::CHANGED },
            Self::ChunkMissedAck => Response { class: R::Success, code: C::CHANGED },
            Self::FunctionReturn => Response { class: R::Success, code: C::CHANGED },
            Self::VariableValue => Response { class: R::Success, code: C::CONTENT },
            Self::SignalStartReturn => Response { class: R::Success, code: C::CHANGED },
            Self::TimeReturn => Response { class: R::Success, code: C::CONTENT },
            Self::DescribeReturn => Response { class: R::Success, code: C::CONTENT },
        }
    }

    /// Resolve the symbolic name of an inbound request message.
    ///
    /// Responses (ACKs) are intentionally not named here: they are matched
    /// to a pending listen by token, not by dispatch name.
    pub fn from_request(msg: &CoapMessage) -> Option<Self> {
        if msg.code == CoapCode::EMPTY {
            return match msg.kind {
                CoapType::Con => Some(Self::Ping),
                CoapType::Ack => Some(Self::PingAck),
                _ => None,
            };
        }

        if !msg.code.is_method() {
            return None;
        }

        let path = msg.uri_path_first()?;
        let candidates = [
            Self::Hello,
            Self::Describe,
            Self::UpdateBegin,
            Self::UpdateDone,
            Self::Chunk,
            Self::ChunkMissed,
            Self::FunctionCall,
            Self::VariableRequest,
            Self::SignalStart,
            Self::Subscribe,
            Self::KeyChange,
            Self::GetTime,
            Self::PublicEvent,
            Self::PrivateEvent,
        ];

        candidates.into_iter().find(|name| {
            matches!(
                name.spec(),
                MessageSpec::Request { code, path: p, .. } if code == msg.code && p == path
            )
        })
    }

    /// Whether an inbound message satisfies a listen for this name.
    ///
    /// For requests the method/path must match; for responses the ACK code
    /// class must match. The caller additionally matches tokens.
    pub fn matches(self, msg: &CoapMessage) -> bool {
        match self.spec() {
            MessageSpec::Request { code, path, .. } => {
                msg.code == code && msg.uri_path_first() == Some(path)
            }
            MessageSpec::Empty { kind } => msg.code == CoapCode::EMPTY && msg.kind == kind,
            MessageSpec::Response { class, .. } => msg.kind == CoapType::Ack && class.matches(msg.code),
        }
    }

    /// Build the skeleton outbound message for this name.
    ///
    /// Requests get their method, type, and Uri-Path; responses get an ACK
    /// with the canonical code and the id they acknowledge.
    pub fn build(self, message_id: u16) -> CoapMessage {
        match self.spec() {
            MessageSpec::Request { kind, code, path } => {
                CoapMessage::request(kind, code, message_id).with_uri_path(path)
            }
            MessageSpec::Empty { kind } => CoapMessage {
                kind,
                code: CoapCode::EMPTY,
                message_id,
                token: Token::empty(),
                options: Vec::new(),
                payload: Vec::new(),
            },
            MessageSpec::Response { code, .. } => CoapMessage::ack(code, message_id),
        }
    }
}

impl std::fmt::Display for MessageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
