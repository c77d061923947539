//! Service handles
//!
//! A handle is the only way to address a service. The high byte is the harbor
//! id assigned at process start, the low 24 bits are the registry slot index.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bits available for the local part of a handle
pub const HANDLE_MASK: u32 = 0x00ff_ffff;

/// Shift that moves a harbor id into the high byte
pub const HANDLE_REMOTE_SHIFT: u32 = 24;

/// Opaque 32-bit service identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle(u32);

impl Handle {
    /// The reserved "no service" handle
    pub const NONE: Handle = Handle(0);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Harbor (node) this handle belongs to
    pub const fn harbor(self) -> u8 {
        (self.0 >> HANDLE_REMOTE_SHIFT) as u8
    }

    /// Locally unique slot index
    pub const fn local(self) -> u32 {
        self.0 & HANDLE_MASK
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Prefix OR'd into every handle registered on `harbor`
    pub const fn harbor_prefix(harbor: u8) -> u32 {
        (harbor as u32) << HANDLE_REMOTE_SHIFT
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{:08x}", self.0)
    }
}

impl From<u32> for Handle {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Errors from parsing the `:hex` textual form
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleParseError {
    #[error("handle must start with ':' (got {0:?})")]
    MissingPrefix(String),

    #[error("invalid hex digits in handle {0:?}")]
    InvalidHex(String),
}

impl FromStr for Handle {
    type Err = HandleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix(':')
            .ok_or_else(|| HandleParseError::MissingPrefix(s.to_string()))?;
        u32::from_str_radix(digits.trim(), 16)
            .map(Handle)
            .map_err(|_| HandleParseError::InvalidHex(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harbor_and_local_split() {
        let handle = Handle::from_raw(Handle::harbor_prefix(3) | 0x42);
        assert_eq!(handle.harbor(), 3);
        assert_eq!(handle.local(), 0x42);
        assert!(!handle.is_none());
        assert!(Handle::NONE.is_none());
    }

    #[test]
    fn test_display_parse_roundtrip() {
        let handle = Handle::from_raw(0x0100_00ab);
        let text = handle.to_string();
        assert_eq!(text, ":010000ab");
        assert_eq!(text.parse::<Handle>().unwrap(), handle);

        // Unpadded and uppercase forms are accepted too
        assert_eq!(":1A".parse::<Handle>().unwrap(), Handle::from_raw(0x1a));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "12".parse::<Handle>(),
            Err(HandleParseError::MissingPrefix("12".to_string()))
        );
        assert!(matches!(
            ":zz".parse::<Handle>(),
            Err(HandleParseError::InvalidHex(_))
        ));
    }
}
