//! Demo service modules shipped with the node

use actors::{Disposition, FnModule, RuntimeBuilder};
use anyhow::Context;
use types::{Handle, MessageType};

/// Register every bundled module
pub fn register(builder: RuntimeBuilder) -> RuntimeBuilder {
    builder.module(echo()).module(pinger())
}

/// Replies to every message with a `RESPONSE` carrying the same body
pub fn echo() -> FnModule {
    FnModule::new("echo", |ctx, _| {
        ctx.set_callback(|ctx, msg| {
            if msg.source.is_none() || msg.ty() == MessageType::ERROR {
                return Disposition::Release;
            }
            let body = msg.take_payload();
            if let Err(e) = ctx.send(msg.source, MessageType::RESPONSE, msg.session, body) {
                ctx.report(format!("echo reply to {} failed: {}", msg.source, e));
            }
            Disposition::Retain
        });
        Ok(())
    })
}

/// Launches an echo service and sends it `params` requests (default 3),
/// reporting each round trip, then exits
pub fn pinger() -> FnModule {
    FnModule::new("pinger", |ctx, params| {
        let count: u32 = match params {
            Some(p) => p.trim().parse().context("pinger count")?,
            None => 3,
        };
        let target: Handle = ctx
            .command("LAUNCH", Some("echo"))
            .context("Can't launch echo")?
            .parse()?;

        let mut remaining = count;
        ctx.set_callback(move |ctx, msg| {
            if msg.ty() == MessageType::RESPONSE && msg.source == target {
                ctx.report(format!(
                    "pong {} from {}: {}",
                    msg.session,
                    msg.source,
                    msg.payload.to_text()
                ));
                remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    ctx.command("KILL", Some(&target.to_string()));
                    ctx.command("EXIT", None);
                }
            }
            Disposition::Release
        });

        for i in 0..count {
            ctx.request(target, MessageType::TEXT, format!("ping {}", i))?;
        }
        if count == 0 {
            ctx.command("KILL", Some(&target.to_string()));
            ctx.command("EXIT", None);
        }
        Ok(())
    })
}
