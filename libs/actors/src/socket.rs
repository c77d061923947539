//! Socket event seam
//!
//! The socket thread repeatedly calls [`SocketPoller::poll`] and pushes each
//! produced event to its owning service as a `SOCKET` message. The event is
//! encoded little-endian as `kind, id, ud` (three `i32`) followed by the data.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io::{self, Cursor, Read};
use std::time::Duration;
use types::{Handle, Message, MessageType, Payload};

const EVENT_HEADER_LEN: usize = 12;

/// Socket event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SocketEventKind {
    Data = 1,
    Connect = 2,
    Close = 3,
    Accept = 4,
    Error = 5,
    Udp = 6,
    Warning = 7,
}

impl SocketEventKind {
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            1 => Self::Data,
            2 => Self::Connect,
            3 => Self::Close,
            4 => Self::Accept,
            5 => Self::Error,
            6 => Self::Udp,
            7 => Self::Warning,
            _ => return None,
        })
    }
}

/// One socket-layer event addressed to a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEvent {
    pub kind: SocketEventKind,
    pub id: i32,
    pub ud: i32,
    pub data: Bytes,
}

impl SocketEvent {
    pub fn new(kind: SocketEventKind, id: i32, ud: i32, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            id,
            ud,
            data: data.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(EVENT_HEADER_LEN + self.data.len());
        // Writes into a Vec cannot fail
        let _ = buf.write_i32::<LittleEndian>(self.kind as i32);
        let _ = buf.write_i32::<LittleEndian>(self.id);
        let _ = buf.write_i32::<LittleEndian>(self.ud);
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        let mut cursor = Cursor::new(buf);
        let raw_kind = cursor.read_i32::<LittleEndian>()?;
        let kind = SocketEventKind::from_raw(raw_kind).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown socket event kind {}", raw_kind),
            )
        })?;
        let id = cursor.read_i32::<LittleEndian>()?;
        let ud = cursor.read_i32::<LittleEndian>()?;
        let mut data = Vec::new();
        cursor.read_to_end(&mut data)?;
        Ok(Self {
            kind,
            id,
            ud,
            data: Bytes::from(data),
        })
    }

    /// Wrap as a `SOCKET` message from the socket layer
    pub fn into_message(self) -> Message {
        let payload = Payload::Owned(self.encode());
        // The header keeps the length far below the packed limit
        Message::new(Handle::NONE, 0, MessageType::SOCKET, payload)
            .unwrap_or_else(|_| Message::signal(Handle::NONE, 0, MessageType::SOCKET))
    }
}

/// Result of one poll
#[derive(Debug)]
pub enum SocketPoll {
    /// The poller has shut down
    Exit,
    /// Nothing happened within the poll window
    Idle,
    /// Deliver `message` to `destination`
    Message {
        destination: Handle,
        message: Message,
    },
}

/// Producer of socket events
pub trait SocketPoller: Send + Sync {
    fn poll(&self) -> SocketPoll;

    /// Make the next `poll` return [`SocketPoll::Exit`]
    fn exit(&self);
}

enum PollerCommand {
    Event(Handle, SocketEvent),
    Exit,
}

/// Poller fed through a channel
#[derive(Clone)]
pub struct ChannelPoller {
    tx: Sender<PollerCommand>,
    rx: Receiver<PollerCommand>,
    timeout: Duration,
}

/// Cloneable handle for injecting socket events
#[derive(Clone)]
pub struct SocketSender {
    tx: Sender<PollerCommand>,
}

impl SocketSender {
    /// Queue `event` for `destination`; false once the poller is gone
    pub fn send(&self, destination: Handle, event: SocketEvent) -> bool {
        self.tx.send(PollerCommand::Event(destination, event)).is_ok()
    }
}

impl ChannelPoller {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            timeout: Duration::from_millis(10),
        }
    }

    pub fn sender(&self) -> SocketSender {
        SocketSender {
            tx: self.tx.clone(),
        }
    }
}

impl Default for ChannelPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketPoller for ChannelPoller {
    fn poll(&self) -> SocketPoll {
        match self.rx.recv_timeout(self.timeout) {
            Ok(PollerCommand::Event(destination, event)) => SocketPoll::Message {
                destination,
                message: event.into_message(),
            },
            Ok(PollerCommand::Exit) | Err(RecvTimeoutError::Disconnected) => SocketPoll::Exit,
            Err(RecvTimeoutError::Timeout) => SocketPoll::Idle,
        }
    }

    fn exit(&self) {
        let _ = self.tx.send(PollerCommand::Exit);
    }
}
