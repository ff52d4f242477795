//! Time a few candidate block sizes, killing any that overrun.
//!
//! Run with: cargo run -p isorun --example tune

use isorun::prelude::*;
use std::time::{Duration, Instant};

fn candidate(_ctx: &DeviceContext, args: &Args) -> anyhow::Result<f64> {
    let block = args.get(0).and_then(|v| v.as_u64()).unwrap_or(1);
    if block == 0 {
        anyhow::bail!("block size must be non-zero");
    }

    let data: Vec<u64> = (0..4_000_000).collect();
    let started = Instant::now();
    let mut sum = 0u64;
    for chunk in data.chunks(block as usize) {
        sum = sum.wrapping_add(chunk.iter().sum::<u64>());
    }
    std::hint::black_box(sum);

    // A pathological candidate that never finishes
    if block == 3 {
        loop {
            std::thread::sleep(Duration::from_secs(1));
        }
    }
    Ok(started.elapsed().as_secs_f64())
}

fn main() -> anyhow::Result<()> {
    let executor = Executor::new(ExecutorConfig::new(Duration::from_millis(500)))?;

    let futures = [0u64, 1, 3, 64, 4096]
        .into_iter()
        .map(|block| -> anyhow::Result<_> {
            Ok((block, executor.submit(candidate, "llvm", Args::new().arg(block))?))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    for (block, future) in futures {
        match future.into_outcome(None)? {
            Outcome::Success(secs) => println!("block {:>5}: {:.3} ms", block, secs * 1e3),
            Outcome::Failure(error) => println!("block {:>5}: failed ({})", block, error),
            Outcome::TimedOut => println!("block {:>5}: timed out", block),
        }
    }
    Ok(())
}
