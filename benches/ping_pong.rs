// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Ping-pong throughput benchmark: two tasks bounce a value back and forth
//! over a rendezvous channel for a fixed number of round trips.
//!
//! The dispatcher is a process-wide singleton, so unlike a typical criterion
//! benchmark this starts exactly one dispatcher and uses `iter_custom` to
//! time repeated batches of round trips from inside it, rather than
//! restarting the runtime every iteration.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion};
use tasklet::channel::Channel;
use tasklet::dispatch::{dispatch, Config};
use tasklet::task::Builder;

const ROUND_TRIPS: u64 = 10_000;

fn bench_ping_pong(c: &mut Criterion) {
    let (iters_tx, iters_rx) = mpsc::channel::<u64>();
    let (elapsed_tx, elapsed_rx) = mpsc::channel::<Duration>();

    let dispatcher = std::thread::spawn(move || {
        let config = Config {
            profile: false,
            nogc: false,
            leak: false,
            version: false,
        };
        dispatch(
            &config,
            Some(move || {
                let ping: &'static Channel<u64> = Box::leak(Box::new(Channel::new()));
                let pong: &'static Channel<u64> = Box::leak(Box::new(Channel::new()));

                let responder = Builder::new("pong").spawn(move || loop {
                    match ping.receive(-1.0) {
                        Ok(v) => {
                            let _ = pong.send(v, -1.0);
                        }
                        Err(_) => break,
                    }
                });

                while let Ok(batches) = iters_rx.recv() {
                    let start = Instant::now();
                    for _ in 0..batches {
                        for i in 0..ROUND_TRIPS {
                            let _ = ping.send(i, -1.0);
                            let _ = pong.receive(-1.0);
                        }
                    }
                    let _ = elapsed_tx.send(start.elapsed());
                }

                tasklet::kill(responder.task());
                tasklet::quit(tasklet::ExitCode::Ok);
            }),
        );
    });

    c.bench_function("ping_pong_10k_round_trips", |b| {
        b.iter_custom(|iters| {
            iters_tx.send(iters).expect("dispatcher thread alive");
            elapsed_rx.recv().expect("dispatcher reports elapsed time")
        });
    });

    drop(iters_tx);
    let _ = dispatcher.join();
}

criterion_group!(benches, bench_ping_pong);
criterion_main!(benches);
