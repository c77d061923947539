//! Per-service message log
//!
//! `LOGON` opens `<logpath>/<handle>.log` and mirrors every message the
//! service receives into it until `LOGOFF` or the service is released.

use crate::socket::SocketEvent;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use types::{Handle, Message, MessageType};

/// Open log sink of one service
pub struct ServiceLog {
    path: PathBuf,
    out: BufWriter<File>,
}

fn timestamp() -> String {
    let now = chrono::Utc::now();
    format!("{}.{:02}", now.timestamp(), now.timestamp_subsec_millis() / 10)
}

impl ServiceLog {
    pub fn path_for(dir: &Path, handle: Handle) -> PathBuf {
        dir.join(format!("{:08x}.log", handle.raw()))
    }

    pub fn open(dir: &Path, handle: Handle) -> io::Result<Self> {
        let path = Self::path_for(dir, handle);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut out = BufWriter::new(file);
        writeln!(out, "open time: {}", timestamp())?;
        out.flush()?;
        Ok(Self { path, out })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one received message
    pub fn output(&mut self, msg: &Message) {
        if let Err(e) = self.write_message(msg) {
            warn!("Failed to write service log {:?}: {}", self.path, e);
        }
    }

    fn write_message(&mut self, msg: &Message) -> io::Result<()> {
        let body = msg.payload.as_bytes();
        if msg.ty() == MessageType::SOCKET {
            match SocketEvent::decode(body) {
                Ok(event) => writeln!(
                    self.out,
                    "[socket] {:?} {} {} {}",
                    event.kind,
                    event.id,
                    event.ud,
                    hex::encode(&event.data)
                )?,
                Err(_) => writeln!(self.out, "[socket] {}", hex::encode(body))?,
            }
        } else {
            writeln!(
                self.out,
                "{} {} {} {} {}",
                msg.source,
                msg.ty().raw(),
                msg.session,
                timestamp(),
                hex::encode(body)
            )?;
        }
        self.out.flush()
    }

    pub fn close(mut self, handle: Handle) {
        if let Err(e) = writeln!(self.out, "close time: {}", timestamp()).and_then(|_| self.out.flush()) {
            warn!("Failed to close service log for {}: {}", handle, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketEventKind;
    use std::fs;
    use tempfile::tempdir;
    use types::Payload;

    #[test]
    fn test_log_lines() {
        let dir = tempdir().unwrap();
        let handle = Handle::from_raw(0x0100_000a);
        let mut log = ServiceLog::open(dir.path(), handle).unwrap();
        assert!(log.path().ends_with("0100000a.log"));

        let text = Message::new(
            Handle::from_raw(0x0100_0002),
            7,
            MessageType::TEXT,
            Payload::from("hi"),
        )
        .unwrap();
        log.output(&text);
        log.output(&SocketEvent::new(SocketEventKind::Data, 4, 0, &b"\x01\x02"[..]).into_message());
        log.close(handle);

        let content = fs::read_to_string(dir.path().join("0100000a.log")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("open time: "));
        assert!(lines[1].starts_with(":01000002 0 7 "));
        assert!(lines[1].ends_with(" 6869"));
        assert_eq!(lines[2], "[socket] Data 4 0 0102");
        assert!(lines[3].starts_with("close time: "));
    }
}
