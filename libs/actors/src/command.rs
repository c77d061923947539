//! Text command protocol
//!
//! Services control the runtime through `(name, param)` string commands.
//! Every command answers with an optional string; unknown commands and
//! failures answer `None`.

use crate::context::ServiceContext;
use crate::runtime::Runtime;
use crate::service_log::ServiceLog;
use std::sync::Arc;
use tracing::debug;
use types::{Handle, MessageType, Payload};

/// Split `"module args..."` at the first whitespace
pub fn split_command(cmdline: &str) -> (&str, Option<&str>) {
    let cmdline = cmdline.trim();
    match cmdline.split_once(char::is_whitespace) {
        Some((name, args)) => {
            let args = args.trim();
            (name, (!args.is_empty()).then_some(args))
        }
        None => (cmdline, None),
    }
}

fn param_or_empty(param: Option<&str>) -> &str {
    param.map(str::trim).unwrap_or("")
}

/// Resolve a `:hex` or `.name` argument, reporting anything else
fn to_handle(rt: &Runtime, ctx: &ServiceContext, param: &str) -> Handle {
    if param.starts_with(':') {
        param.parse().unwrap_or(Handle::NONE)
    } else if let Some(name) = param.strip_prefix('.') {
        rt.registry().find_by_name(name)
    } else {
        rt.report(Some(ctx), &format!("Can't convert {} to handle", param));
        Handle::NONE
    }
}

/// Retire `handle` (or the caller for `NONE`), notifying the exit monitor
fn handle_exit(rt: &Runtime, ctx: &ServiceContext, handle: Handle) {
    let handle = if handle.is_none() {
        rt.report(Some(ctx), "KILL self");
        ctx.handle()
    } else {
        rt.report(Some(ctx), &format!("KILL {}", handle));
        handle
    };

    let monitor = rt.monitor_exit();
    if !monitor.is_none() {
        if let Err(e) = rt.send(Some(ctx), handle, monitor, MessageType::CLIENT, 0, Payload::Empty) {
            debug!("Exit notice for {} not delivered: {}", handle, e);
        }
    }
    rt.registry().retire(handle);
}

/// Execute `name` on behalf of `ctx`
pub fn execute(
    rt: &Arc<Runtime>,
    ctx: &ServiceContext,
    name: &str,
    param: Option<&str>,
) -> Option<String> {
    match name {
        "TIMEOUT" => cmd_timeout(rt, ctx, param),
        "REG" => cmd_reg(rt, ctx, param),
        "QUERY" => cmd_query(rt, param),
        "NAME" => cmd_name(rt, ctx, param),
        "EXIT" => {
            handle_exit(rt, ctx, Handle::NONE);
            None
        }
        "KILL" => {
            let handle = to_handle(rt, ctx, param_or_empty(param));
            if !handle.is_none() {
                handle_exit(rt, ctx, handle);
            }
            None
        }
        "LAUNCH" => cmd_launch(rt, param),
        "GETENV" => rt.env().get(param_or_empty(param)),
        "SETENV" => cmd_setenv(rt, ctx, param),
        "STARTTIME" => Some(rt.timer().start_time().to_string()),
        "ABORT" => {
            rt.abort();
            None
        }
        "MONITOR" => cmd_monitor(rt, ctx, param),
        "STAT" => cmd_stat(ctx, param),
        "LOGON" => cmd_logon(rt, ctx, param),
        "LOGOFF" => cmd_logoff(rt, ctx, param),
        "SIGNAL" => cmd_signal(rt, ctx, param),
        _ => None,
    }
}

fn cmd_timeout(rt: &Runtime, ctx: &ServiceContext, param: Option<&str>) -> Option<String> {
    let delay = param_or_empty(param).parse::<i32>().unwrap_or(0);
    Some(rt.timeout(ctx, delay).to_string())
}

fn cmd_reg(rt: &Runtime, ctx: &ServiceContext, param: Option<&str>) -> Option<String> {
    let param = param_or_empty(param);
    if param.is_empty() {
        return Some(ctx.handle().to_string());
    }
    match param.strip_prefix('.') {
        Some(name) => rt.registry().bind_name(ctx.handle(), name),
        None => {
            rt.report(Some(ctx), &format!("Can't register global name {}", param));
            None
        }
    }
}

fn cmd_query(rt: &Runtime, param: Option<&str>) -> Option<String> {
    let name = param_or_empty(param).strip_prefix('.')?;
    let handle = rt.registry().find_by_name(name);
    (!handle.is_none()).then(|| handle.to_string())
}

fn cmd_name(rt: &Runtime, ctx: &ServiceContext, param: Option<&str>) -> Option<String> {
    let mut parts = param_or_empty(param).split_whitespace();
    let (name, target) = (parts.next()?, parts.next()?);
    if !target.starts_with(':') {
        return None;
    }
    let handle: Handle = target.parse().ok()?;
    if handle.is_none() {
        return None;
    }
    match name.strip_prefix('.') {
        Some(name) => rt.registry().bind_name(handle, name),
        None => {
            rt.report(Some(ctx), &format!("Can't set global name {}", name));
            None
        }
    }
}

fn cmd_launch(rt: &Arc<Runtime>, param: Option<&str>) -> Option<String> {
    let (module, args) = split_command(param_or_empty(param));
    if module.is_empty() {
        return None;
    }
    match rt.launch(module, args) {
        Ok(launched) => Some(launched.handle().to_string()),
        Err(e) => {
            debug!("LAUNCH {} failed: {}", module, e);
            None
        }
    }
}

fn cmd_setenv(rt: &Runtime, ctx: &ServiceContext, param: Option<&str>) -> Option<String> {
    let (key, value) = split_command(param_or_empty(param));
    if key.is_empty() {
        return None;
    }
    if !rt.env().set(key, value.unwrap_or("")) {
        rt.report(Some(ctx), &format!("Can't setenv {}: already set", key));
    }
    None
}

fn cmd_monitor(rt: &Runtime, ctx: &ServiceContext, param: Option<&str>) -> Option<String> {
    let param = param_or_empty(param);
    if param.is_empty() {
        let monitor = rt.monitor_exit();
        return (!monitor.is_none()).then(|| monitor.to_string());
    }
    rt.set_monitor_exit(to_handle(rt, ctx, param));
    None
}

fn cmd_stat(ctx: &ServiceContext, param: Option<&str>) -> Option<String> {
    let stat = match param_or_empty(param) {
        "mqlen" => ctx.queue_len().to_string(),
        "endless" => (if ctx.take_endless() { "1" } else { "0" }).to_string(),
        "cpu" => format!("{:.6}", ctx.cpu_cost()),
        "time" => format!("{:.6}", ctx.current_dispatch_time()),
        "message" => ctx.message_count().to_string(),
        _ => String::new(),
    };
    Some(stat)
}

fn cmd_logon(rt: &Runtime, ctx: &ServiceContext, param: Option<&str>) -> Option<String> {
    let handle = to_handle(rt, ctx, param_or_empty(param));
    let target = rt.registry().grab(handle)?;
    let dir = rt.config().logpath.as_ref()?;
    if target.is_logging() {
        return None;
    }
    match ServiceLog::open(dir, handle) {
        Ok(log) => {
            if target.open_log(log) {
                rt.report(Some(ctx), &format!("Open log file {:?}", ServiceLog::path_for(dir, handle)));
            }
        }
        Err(e) => rt.report(Some(ctx), &format!("Open log file failed for {}: {}", handle, e)),
    }
    None
}

fn cmd_logoff(rt: &Runtime, ctx: &ServiceContext, param: Option<&str>) -> Option<String> {
    let handle = to_handle(rt, ctx, param_or_empty(param));
    let target = rt.registry().grab(handle)?;
    if target.close_log() {
        rt.report(Some(ctx), &format!("Close log file {}", handle));
    }
    None
}

fn cmd_signal(rt: &Runtime, ctx: &ServiceContext, param: Option<&str>) -> Option<String> {
    let (target, code) = split_command(param_or_empty(param));
    let handle = to_handle(rt, ctx, target);
    let target = rt.registry().grab(handle)?;
    let code = code.and_then(|c| c.parse::<i32>().ok()).unwrap_or(0);
    target.instance().signal(code);
    None
}
