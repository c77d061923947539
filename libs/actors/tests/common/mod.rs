//! Common test utilities for runtime integration tests

#![allow(dead_code)]

use actors::{FnModule, Runtime};
use node_config::RuntimeConfig;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poll `cond` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Config with `threads` workers and every worker on `weight`
pub fn config(threads: usize, weight: i32) -> RuntimeConfig {
    RuntimeConfig {
        thread: threads,
        weights: vec![weight; threads],
        ..RuntimeConfig::default()
    }
}

/// Module whose services accept messages and do nothing
pub fn sink_module() -> FnModule {
    FnModule::new("sink", |_, _| Ok(()))
}

/// Run the node's threads in the background
pub fn spawn_run(rt: &Arc<Runtime>) -> JoinHandle<actors::Result<()>> {
    let rt = Arc::clone(rt);
    thread::spawn(move || rt.run())
}

/// Retire everything and wait for the threads to wind down
pub fn shutdown(rt: &Arc<Runtime>, runner: JoinHandle<actors::Result<()>>) {
    rt.abort();
    runner
        .join()
        .expect("runtime thread panicked")
        .expect("runtime returned an error");
    assert_eq!(rt.live_services(), 0);
}
