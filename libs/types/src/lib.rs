//! # Hive Types
//!
//! Shared value types for the Hive service runtime.
//!
//! ## Design Philosophy
//!
//! - **Opaque Handles**: services are addressed by a 32-bit [`Handle`] whose
//!   high byte names the harbor (node) and whose low 24 bits are a local slot
//! - **Explicit Ownership**: message bodies travel as a [`Payload`] that says
//!   whether the runtime owns a private buffer or shares a reference-counted one
//! - **Packed Wire Word**: a message's type and length share one machine word,
//!   type in the top byte, exactly as the mailbox stores them
//!
//! ## Quick Start
//!
//! ```rust
//! use types::{Handle, Message, MessageType, Payload};
//!
//! let source: Handle = ":01000002".parse().unwrap();
//! let msg = Message::new(source, 7, MessageType::TEXT, Payload::from("ping")).unwrap();
//!
//! assert_eq!(msg.ty(), MessageType::TEXT);
//! assert_eq!(msg.len(), 4);
//! assert_eq!(source.harbor(), 1);
//! ```

pub mod handle;
pub mod message;

pub use handle::{Handle, HandleParseError, HANDLE_MASK, HANDLE_REMOTE_SHIFT};
pub use message::{
    pack_size, unpack_size, Message, MessageType, Payload, PayloadTooLarge, MESSAGE_TYPE_MASK,
    MESSAGE_TYPE_SHIFT,
};
