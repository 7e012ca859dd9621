//! Relay protocol messages.
//!
//! Every frame is a one-byte tag followed by a tag-specific body:
//!
//! ```text
//! 0x01 Hello      identity          client → relay
//! 0x02 HelloAck   -                 relay → client
//! 0x03 Bind       target identity   client → relay
//! 0x04 Condition  code, identity    relay → client
//! 0x05 Transport  payload           both ways, forwarded verbatim
//! 0x06 Close      -                 both ways
//! ```
//!
//! Both members of a session receive `Condition(Paired)` before any
//! `Transport` from the other side.

use bytes::{BufMut, Bytes, BytesMut};

/// Longest identity accepted, in bytes.
pub const MAX_IDENTITY_LEN: usize = 255;

const TAG_HELLO: u8 = 0x01;
const TAG_HELLO_ACK: u8 = 0x02;
const TAG_BIND: u8 = 0x03;
const TAG_CONDITION: u8 = 0x04;
const TAG_TRANSPORT: u8 = 0x05;
const TAG_CLOSE: u8 = 0x06;

/// Protocol-level outcome reported back to a client. Never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConditionCode {
    /// A session with the named peer is now active.
    Paired = 0,
    /// No peer is registered under the requested identity.
    PeerNotFound = 1,
    /// The requested peer is already in a session.
    PeerBusy = 2,
    /// A payload arrived on a connection that has no session.
    NotPaired = 3,
    /// A pairing request arrived on a connection that already has a session.
    AlreadyPaired = 4,
    /// The request named the requester itself.
    InvalidTarget = 5,
}

impl ConditionCode {
    fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Paired,
            1 => Self::PeerNotFound,
            2 => Self::PeerBusy,
            3 => Self::NotPaired,
            4 => Self::AlreadyPaired,
            5 => Self::InvalidTarget,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paired => "paired",
            Self::PeerNotFound => "peer_not_found",
            Self::PeerBusy => "peer_busy",
            Self::NotPaired => "not_paired",
            Self::AlreadyPaired => "already_paired",
            Self::InvalidTarget => "invalid_target",
        }
    }
}

/// A decoded relay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello { identity: String },
    HelloAck,
    Bind { target: String },
    Condition { code: ConditionCode, peer: String },
    Transport { payload: Bytes },
    Close,
}

/// Why a frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("identity must be 1..={MAX_IDENTITY_LEN} bytes of UTF-8")]
    InvalidIdentity,
    #[error("unknown condition code {0}")]
    UnknownCondition(u8),
    #[error("truncated {0} message")]
    Truncated(&'static str),
}

impl Message {
    /// Decode one frame. `Transport` payloads share the frame's buffer.
    pub fn parse(frame: &Bytes) -> Result<Self, MessageError> {
        let (&tag, _) = frame.split_first().ok_or(MessageError::Empty)?;
        let body = frame.slice(1..);

        match tag {
            TAG_HELLO => Ok(Message::Hello {
                identity: parse_identity(&body)?,
            }),
            TAG_HELLO_ACK => Ok(Message::HelloAck),
            TAG_BIND => Ok(Message::Bind {
                target: parse_identity(&body)?,
            }),
            TAG_CONDITION => {
                let (&code, peer) = body.split_first().ok_or(MessageError::Truncated("condition"))?;
                let code = ConditionCode::from_u8(code).ok_or(MessageError::UnknownCondition(code))?;
                let peer = std::str::from_utf8(peer)
                    .map_err(|_| MessageError::InvalidIdentity)?
                    .to_owned();
                Ok(Message::Condition { code, peer })
            }
            TAG_TRANSPORT => Ok(Message::Transport { payload: body }),
            TAG_CLOSE => Ok(Message::Close),
            other => Err(MessageError::UnknownTag(other)),
        }
    }

    /// Encode into a frame ready for `Connection::send`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.body_len());
        match self {
            Message::Hello { identity } => {
                buf.put_u8(TAG_HELLO);
                buf.put_slice(identity.as_bytes());
            }
            Message::HelloAck => buf.put_u8(TAG_HELLO_ACK),
            Message::Bind { target } => {
                buf.put_u8(TAG_BIND);
                buf.put_slice(target.as_bytes());
            }
            Message::Condition { code, peer } => {
                buf.put_u8(TAG_CONDITION);
                buf.put_u8(*code as u8);
                buf.put_slice(peer.as_bytes());
            }
            Message::Transport { payload } => {
                buf.put_u8(TAG_TRANSPORT);
                buf.put_slice(payload);
            }
            Message::Close => buf.put_u8(TAG_CLOSE),
        }
        buf.freeze()
    }

    fn body_len(&self) -> usize {
        match self {
            Message::Hello { identity } => identity.len(),
            Message::Bind { target } => target.len(),
            Message::Condition { peer, .. } => 1 + peer.len(),
            Message::Transport { payload } => payload.len(),
            Message::HelloAck | Message::Close => 0,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::HelloAck => "hello_ack",
            Message::Bind { .. } => "bind",
            Message::Condition { .. } => "condition",
            Message::Transport { .. } => "transport",
            Message::Close => "close",
        }
    }
}

/// Check an identity claim: non-empty, bounded, UTF-8.
pub fn parse_identity(raw: &[u8]) -> Result<String, MessageError> {
    if raw.is_empty() || raw.len() > MAX_IDENTITY_LEN {
        return Err(MessageError::InvalidIdentity);
    }
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| MessageError::InvalidIdentity)
}
