//! Messages and payloads
//!
//! A [`Message`] carries its type and payload length packed into one word,
//! the representation the mailboxes store. [`Payload`] makes buffer
//! ownership explicit across the callback boundary.

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Shift that places the message type in the top byte of the size word
pub const MESSAGE_TYPE_SHIFT: u32 = usize::BITS - 8;

/// Mask selecting the length part of the size word
pub const MESSAGE_TYPE_MASK: usize = usize::MAX >> 8;

/// Protocol type of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(u8);

impl MessageType {
    pub const TEXT: MessageType = MessageType(0);
    /// Reply correlated with a session
    pub const RESPONSE: MessageType = MessageType(1);
    pub const MULTICAST: MessageType = MessageType(2);
    pub const CLIENT: MessageType = MessageType(3);
    /// Runtime control, e.g. logger reopen
    pub const SYSTEM: MessageType = MessageType(4);
    pub const HARBOR: MessageType = MessageType(5);
    /// Socket layer events
    pub const SOCKET: MessageType = MessageType(6);
    /// Failure notice sent back to the source of an undeliverable message
    pub const ERROR: MessageType = MessageType(7);
    pub const RESERVED_QUEUE: MessageType = MessageType(8);
    pub const RESERVED_DEBUG: MessageType = MessageType(9);
    pub const RESERVED_LUA: MessageType = MessageType(10);
    pub const RESERVED_SNAX: MessageType = MessageType(11);

    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0 => "text",
            1 => "response",
            2 => "multicast",
            3 => "client",
            4 => "system",
            5 => "harbor",
            6 => "socket",
            7 => "error",
            8 => "queue",
            9 => "debug",
            10 => "lua",
            11 => "snax",
            _ => return None,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "type({})", self.0),
        }
    }
}

/// Message body with explicit ownership
///
/// `Owned` is a private buffer the holder may mutate or free; `Shared` is a
/// reference-counted view that can be handed to several destinations without
/// copying.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
    #[default]
    Empty,
    Owned(Vec<u8>),
    Shared(Bytes),
}

impl Payload {
    /// Copy a borrowed slice into a fresh owned buffer
    pub fn copied(data: &[u8]) -> Self {
        if data.is_empty() {
            Payload::Empty
        } else {
            Payload::Owned(data.to_vec())
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Owned(buf) => buf,
            Payload::Shared(bytes) => bytes,
        }
    }

    /// Move the body out, leaving `Empty` behind
    pub fn take(&mut self) -> Payload {
        std::mem::take(self)
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Payload::Empty => Bytes::new(),
            Payload::Owned(buf) => Bytes::from(buf),
            Payload::Shared(bytes) => bytes,
        }
    }

    /// Lossy UTF-8 view, used for text protocol messages
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(buf: Vec<u8>) -> Self {
        Payload::Owned(buf)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Shared(bytes)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Owned(text.into_bytes())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::copied(text.as_bytes())
    }
}

/// Payload length does not fit the packed size word
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("payload of {len} bytes exceeds the packed length limit")]
pub struct PayloadTooLarge {
    pub len: usize,
}

/// Pack a type and a length into one size word
pub fn pack_size(ty: MessageType, len: usize) -> Result<usize, PayloadTooLarge> {
    if len & MESSAGE_TYPE_MASK != len {
        return Err(PayloadTooLarge { len });
    }
    Ok(len | (ty.raw() as usize) << MESSAGE_TYPE_SHIFT)
}

/// Split a size word back into type and length
pub fn unpack_size(sz: usize) -> (MessageType, usize) {
    (
        MessageType::new((sz >> MESSAGE_TYPE_SHIFT) as u8),
        sz & MESSAGE_TYPE_MASK,
    )
}

/// A message as stored in a mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: crate::Handle,
    pub session: i32,
    pub payload: Payload,
    sz: usize,
}

impl Message {
    pub fn new(
        source: crate::Handle,
        session: i32,
        ty: MessageType,
        payload: Payload,
    ) -> Result<Self, PayloadTooLarge> {
        let sz = pack_size(ty, payload.len())?;
        Ok(Self {
            source,
            session,
            payload,
            sz,
        })
    }

    /// Empty-bodied message, used for error replies and timer responses
    pub fn signal(source: crate::Handle, session: i32, ty: MessageType) -> Self {
        Self {
            source,
            session,
            payload: Payload::Empty,
            sz: (ty.raw() as usize) << MESSAGE_TYPE_SHIFT,
        }
    }

    pub fn ty(&self) -> MessageType {
        unpack_size(self.sz).0
    }

    /// Length recorded at send time
    pub fn len(&self) -> usize {
        unpack_size(self.sz).1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The packed type/length word
    pub fn packed_size(&self) -> usize {
        self.sz
    }

    /// Take ownership of the body; the framework will not free it
    pub fn take_payload(&mut self) -> Payload {
        self.payload.take()
    }
}
