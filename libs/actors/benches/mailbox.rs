//! Mailbox and dispatch throughput

use actors::{dispatch, Disposition, FnModule, GlobalQueue, Mailbox, MonitorSlot, Runtime, Weight};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use node_config::RuntimeConfig;
use std::sync::Arc;
use types::{Handle, Message, MessageType, Payload};

fn message(i: i32) -> Message {
    Message::new(Handle::from_raw(0x0100_0001), i, MessageType::TEXT, Payload::Empty)
        .expect("empty payload fits")
}

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("mailbox_push_pop");
    for batch in [1usize, 64, 1024] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let global = GlobalQueue::new();
            let mailbox = Mailbox::new(Handle::from_raw(0x0100_0002), &global);
            global.push(Arc::clone(&mailbox));
            b.iter(|| {
                for i in 0..batch {
                    mailbox.push(message(i as i32));
                }
                // Take it off the queue like a worker, then drain to unlink
                let taken = global.pop().expect("mailbox linked");
                while let Some(msg) = taken.pop() {
                    black_box(msg);
                }
            });
        });
    }
    group.finish();
}

fn bench_dispatch_turns(c: &mut Criterion) {
    let rt = Runtime::builder(RuntimeConfig {
        thread: 1,
        ..RuntimeConfig::default()
    })
    .module(FnModule::new("noop", |ctx, _| {
        ctx.set_callback(|_, msg| {
            black_box(msg.session);
            Disposition::Release
        });
        Ok(())
    }))
    .build()
    .expect("runtime");
    let services: Vec<Handle> = (0..8)
        .map(|_| rt.launch("noop", None).expect("launch").handle())
        .collect();
    let slot = MonitorSlot::new();

    let mut group = c.benchmark_group("dispatch");
    for (label, weight) in [("single", Weight::Single), ("fraction_0", Weight::Fraction(0))] {
        group.throughput(Throughput::Elements(services.len() as u64 * 16));
        group.bench_function(label, |b| {
            b.iter(|| {
                for &to in &services {
                    for i in 0..16 {
                        let _ = rt.push(to, message(i));
                    }
                }
                let mut held = None;
                loop {
                    held = dispatch(&rt, &slot, held, weight);
                    if held.is_none() {
                        break;
                    }
                }
            });
        });
    }
    group.finish();
    rt.abort();
}

criterion_group!(benches, bench_push_pop, bench_dispatch_turns);
criterion_main!(benches);
