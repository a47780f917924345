// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use spindle::{Handle, Runtime};

const PINGS: usize = 10_000;

fn ping_ping_10k(c: &mut Criterion) {
    let rt = Runtime::new(1);

    c.bench_function("ping_ping_10k", |b| {
        b.iter(|| {
            rt.block_on(async {
                for _ in 0..PINGS {
                    spindle::task::yield_now().await;
                }
            });
        });
    });
}

fn ping_pong_10k(c: &mut Criterion) {
    let rt = Runtime::new(1);

    c.bench_function("ping_pong_10k", |b| {
        b.iter(|| {
            rt.block_on(async {
                let h1 = Handle::current().unwrap().spawn(async {
                    for _ in 0..PINGS {
                        spindle::task::yield_now().await;
                    }
                });
                let h2 = Handle::current().unwrap().spawn(async {
                    for _ in 0..PINGS {
                        spindle::task::yield_now().await;
                    }
                });
                h1.await.unwrap();
                h2.await.unwrap();
            });
        });
    });
}

fn channel_round_trip_1k(c: &mut Criterion) {
    let rt = Runtime::new(2);

    c.bench_function("channel_round_trip_1k", |b| {
        b.iter(|| {
            let sum = rt.block_on(async {
                let (tx, mut rx) = spindle::sync::mpsc::channel(0);

                let consumer = Handle::current().unwrap().spawn(async move {
                    let mut sum = 0u64;
                    while let Ok(v) = rx.recv().await {
                        sum += v;
                    }
                    sum
                });

                for i in 0..1_000u64 {
                    tx.send(i).await.unwrap();
                }
                drop(tx);

                consumer.await.unwrap()
            });
            black_box(sum);
        });
    });
}

criterion_group!(benches, ping_ping_10k, ping_pong_10k, channel_round_trip_1k);
criterion_main!(benches);
