//! Lifecycle Tests
//!
//! Launch failures, retirement, timeouts and hang detection as seen from
//! running services.

mod common;

use actors::{Disposition, FnModule, Runtime, RuntimeError};
use common::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use types::{Handle, MessageType, Payload};

/// Sends itself three messages on behalf of the observer named in its
/// params, then refuses to start
fn refusing_module() -> FnModule {
    FnModule::new("refusing", |ctx, params| {
        let observer: Handle = params.unwrap_or_default().parse()?;
        let rt = ctx.runtime().expect("runtime alive during init");
        for session in 1..=3 {
            rt.send(Some(&**ctx), observer, ctx.handle(), MessageType::TEXT, session, Payload::from("early"))?;
        }
        anyhow::bail!("refusing to start")
    })
}

#[test]
fn test_init_failure_answers_queued_messages_with_errors() {
    let rt = Runtime::builder(config(1, -1))
        .module(sink_module())
        .module(refusing_module())
        .build()
        .unwrap();
    let observer = rt.launch("sink", None).unwrap();

    let err = rt
        .launch("refusing", Some(&observer.handle().to_string()))
        .unwrap_err();
    let dead = match err {
        RuntimeError::InitFailed { handle, .. } => handle,
        other => panic!("unexpected error {:?}", other),
    };

    assert!(!rt.registry().contains(dead));
    assert!(rt.registry().grab(dead).is_none());
    assert_eq!(rt.live_services(), 1);
    assert_eq!(rt.global().occurrences(dead), 0);

    let mailbox = observer.mailbox().unwrap();
    let replies: Vec<_> = std::iter::from_fn(|| mailbox.pop()).collect();
    assert_eq!(replies.len(), 3);
    for (i, reply) in replies.iter().enumerate() {
        assert_eq!(reply.ty(), MessageType::ERROR);
        assert_eq!(reply.source, dead);
        assert_eq!(reply.session, i as i32 + 1);
        assert!(reply.is_empty());
    }
}

#[test]
fn test_retire_unbinds_names() {
    let rt = Runtime::builder(config(1, -1))
        .module(sink_module())
        .build()
        .unwrap();
    let db = rt.launch("sink", None).unwrap();
    let other = rt.launch("sink", None).unwrap();
    rt.registry().bind_name(db.handle(), "db");
    rt.registry().bind_name(db.handle(), "primary");
    rt.registry().bind_name(other.handle(), "cache");

    assert!(rt.registry().retire(db.handle()));
    assert!(!rt.registry().retire(db.handle()));

    assert_eq!(rt.registry().find_by_name("db"), Handle::NONE);
    assert_eq!(rt.registry().find_by_name("primary"), Handle::NONE);
    assert_eq!(rt.registry().find_by_name("cache"), other.handle());
    assert_eq!(rt.live_services(), 1);

    // Sending to the retired handle now fails
    assert!(other.send(db.handle(), MessageType::TEXT, 0, "late").is_err());
}

#[test]
fn test_retired_service_stays_dead() {
    let rt = Runtime::builder(config(1, -1))
        .module(sink_module())
        .build()
        .unwrap();
    let svc = rt.launch("sink", None).unwrap();

    assert!(rt.registry().retire(svc.handle()));
    assert_eq!(svc.refs(), 0);
    assert_eq!(rt.metrics().snapshot().services_released, 1);

    assert!(!svc.grab());
    assert_eq!(svc.refs(), 0);
    assert_eq!(rt.metrics().snapshot().services_released, 1);
    assert_eq!(rt.global().occurrences(svc.handle()), 1);
}

#[test]
fn test_reserved_service_does_not_keep_node_alive() {
    let rt = Runtime::builder(config(1, -1))
        .module(sink_module())
        .build()
        .unwrap();
    let svc = rt.launch("sink", None).unwrap();
    assert_eq!(rt.live_services(), 1);

    assert!(svc.reserve());
    assert_eq!(svc.refs(), 2);
    assert_eq!(rt.live_services(), 0);

    assert!(svc.reserve());
    assert_eq!(svc.refs(), 3);
    assert_eq!(rt.live_services(), 0);

    // Nothing counts as live, so run() comes straight back
    rt.run().unwrap();
    assert!(rt.registry().contains(svc.handle()));

    assert!(rt.registry().retire(svc.handle()));
    assert!(!svc.release());
    assert!(svc.release());
    assert_eq!(rt.live_services(), 0);
    assert_eq!(rt.metrics().snapshot().services_released, 1);
}

#[test]
fn test_self_message_during_init_waits_for_init() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let module = {
        let seen = Arc::clone(&seen);
        FnModule::new("eager", move |ctx, _| {
            let seen = Arc::clone(&seen);
            ctx.set_callback(move |ctx, msg| {
                seen.lock().push((ctx.is_initialized(), msg.payload.to_text()));
                Disposition::Release
            });
            ctx.send(ctx.handle(), MessageType::TEXT, 0, "hello me")?;
            Ok(())
        })
    };
    let rt = Runtime::builder(config(2, -1)).module(module).build().unwrap();
    rt.launch("eager", None).unwrap();

    let runner = spawn_run(&rt);
    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 1));
    shutdown(&rt, runner);

    assert_eq!(seen.lock()[0], (true, "hello me".to_string()));
}

#[test]
fn test_timeout_delivers_response() {
    let fired = Arc::new(Mutex::new(Vec::new()));
    let scheduled = Arc::new(Mutex::new(Vec::new()));
    let module = {
        let (fired, scheduled) = (Arc::clone(&fired), Arc::clone(&scheduled));
        FnModule::new("sleeper", move |ctx, _| {
            let fired = Arc::clone(&fired);
            ctx.set_callback(move |_, msg| {
                if msg.ty() == MessageType::RESPONSE {
                    fired.lock().push((msg.source, msg.session));
                }
                Disposition::Release
            });
            for delay in ["5", "0"] {
                let session = ctx
                    .command("TIMEOUT", Some(delay))
                    .ok_or_else(|| anyhow::anyhow!("TIMEOUT refused"))?;
                scheduled.lock().push(session.parse::<i32>()?);
            }
            Ok(())
        })
    };
    let rt = Runtime::builder(config(1, -1)).module(module).build().unwrap();
    rt.launch("sleeper", None).unwrap();

    let runner = spawn_run(&rt);
    assert!(wait_until(Duration::from_secs(5), || fired.lock().len() == 2));
    shutdown(&rt, runner);

    // The immediate one lands first
    let scheduled = scheduled.lock().clone();
    assert_eq!(scheduled, [1, 2]);
    assert_eq!(*fired.lock(), [(Handle::NONE, 2), (Handle::NONE, 1)]);
}

#[test]
fn test_monitor_flags_stuck_callback() {
    let flagged = Arc::new(Mutex::new(None));
    let module = {
        let flagged = Arc::clone(&flagged);
        FnModule::new("stuck", move |ctx, _| {
            let flagged = Arc::clone(&flagged);
            ctx.set_callback(move |ctx, _| {
                thread::sleep(Duration::from_millis(1000));
                *flagged.lock() = ctx.command("STAT", Some("endless"));
                Disposition::Release
            });
            Ok(())
        })
    };
    let rt = Runtime::builder(node_config::RuntimeConfig {
        monitor_interval_ms: 200,
        ..config(2, -1)
    })
    .module(module)
    .build()
    .unwrap();
    let stuck = rt.launch("stuck", None).unwrap();
    rt.send(None, Handle::NONE, stuck.handle(), MessageType::TEXT, 0, Payload::Empty)
        .unwrap();

    let runner = spawn_run(&rt);
    assert!(wait_until(Duration::from_secs(5), || flagged.lock().is_some()));
    shutdown(&rt, runner);

    assert_eq!(flagged.lock().as_deref(), Some("1"));
    // STAT endless clears the flag
    assert!(!stuck.is_endless());
    assert!(rt.metrics().snapshot().endless_detections >= 1);
}

#[test]
fn test_exit_stops_runtime() {
    let handled = Arc::new(AtomicUsize::new(0));
    let module = {
        let handled = Arc::clone(&handled);
        FnModule::new("once", move |ctx, _| {
            let handled = Arc::clone(&handled);
            ctx.set_callback(move |ctx, _| {
                handled.fetch_add(1, Ordering::Relaxed);
                ctx.command("EXIT", None);
                Disposition::Release
            });
            Ok(())
        })
    };
    let rt = Runtime::builder(config(2, -1)).module(module).build().unwrap();
    let once = rt.launch("once", None).unwrap();
    rt.send(None, Handle::NONE, once.handle(), MessageType::TEXT, 0, Payload::Empty)
        .unwrap();

    // run returns on its own once the last service exits
    rt.run().unwrap();
    assert_eq!(handled.load(Ordering::Relaxed), 1);
    assert_eq!(rt.live_services(), 0);
    assert!(rt.registry().is_empty());
}
