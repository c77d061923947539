//! Built-in logger service
//!
//! Writes every `TEXT` message it receives as `[:source] text` to a file (or
//! stdout when no file is configured) and reopens the file on a `SYSTEM`
//! message, which is how log rotation is requested.

use crate::context::{Disposition, ServiceContext};
use crate::module::{Module, ServiceInstance};
use anyhow::Context as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::Arc;
use tracing::warn;
use types::{Message, MessageType};

/// Module name of the built-in logger
pub const LOGGER_MODULE: &str = "logger";

pub struct LoggerModule;

impl Module for LoggerModule {
    fn name(&self) -> &str {
        LOGGER_MODULE
    }

    fn create(&self) -> Option<Box<dyn ServiceInstance>> {
        Some(Box::new(LoggerService))
    }
}

struct LoggerService;

enum Sink {
    Stdout(io::Stdout),
    File { path: String, file: File },
}

impl Sink {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Sink::Stdout(out) => out,
            Sink::File { file, .. } => file,
        }
    }

    fn write_line(&mut self, msg: &Message) -> io::Result<()> {
        let out = self.writer();
        write!(out, "[{}] ", msg.source)?;
        out.write_all(msg.payload.as_bytes())?;
        writeln!(out)?;
        out.flush()
    }

    fn reopen(&mut self) -> io::Result<()> {
        if let Sink::File { path, file } = self {
            *file = OpenOptions::new().create(true).append(true).open(&*path)?;
        }
        Ok(())
    }
}

impl ServiceInstance for LoggerService {
    fn init(&self, ctx: &Arc<ServiceContext>, params: Option<&str>) -> anyhow::Result<()> {
        let mut sink = match params.map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => Sink::File {
                path: path.to_string(),
                file: File::create(path)
                    .with_context(|| format!("Failed to open log file {}", path))?,
            },
            None => Sink::Stdout(io::stdout()),
        };

        ctx.set_callback(move |_ctx, msg| {
            let result = match msg.ty() {
                MessageType::SYSTEM => sink.reopen(),
                MessageType::TEXT => sink.write_line(msg),
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!("Logger write failed: {}", e);
            }
            Disposition::Release
        });

        if ctx.command("REG", Some(".logger")).is_none() {
            warn!("Name .logger already bound; {} not registered", ctx.handle());
        }
        Ok(())
    }
}
