//! Neighborhood Attention Benchmark Suite
//!
//! Forward-pass latency on the host device:
//! - 1D over growing sequence lengths and kernel sizes
//! - 2D over growing feature maps
//! - dense attention for comparison
//!
//! Run with: `cargo bench --bench na_bench`

use std::hint::black_box;
use std::time::{Duration, Instant};

use nattenforge::backend::{ComputeDevice, HostBuffer};
use nattenforge::{
    fmha_forward, host_context, na1d_forward, na2d_forward, HostContext, Na1dParams, Na2dParams,
    TensorRef,
};

// ============================================================================
// Benchmark Harness
// ============================================================================

struct Benchmark {
    name: String,
    iterations: usize,
    warmup_iterations: usize,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            warmup_iterations: iterations.min(5),
        }
    }

    fn run_time<F, R>(&self, mut f: F) -> BenchmarkResult
    where
        F: FnMut() -> R,
    {
        // Warmup (also compiles programs and fills the pool)
        for _ in 0..self.warmup_iterations {
            black_box(f());
        }

        let mut durations = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let start = Instant::now();
            black_box(f());
            durations.push(start.elapsed());
        }

        BenchmarkResult {
            name: self.name.clone(),
            iterations: self.iterations,
            durations,
        }
    }
}

struct BenchmarkResult {
    name: String,
    iterations: usize,
    durations: Vec<Duration>,
}

impl BenchmarkResult {
    fn report(&self) {
        let total: Duration = self.durations.iter().sum();
        let avg = total / self.iterations as u32;

        let mut sorted = self.durations.clone();
        sorted.sort();
        let min = sorted[0];
        let max = sorted[sorted.len() - 1];
        let p50 = sorted[sorted.len() / 2];
        let p95 = sorted[(sorted.len() * 95) / 100];

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", self.iterations);
        println!("Average: {:?} ({:.3} ms)", avg, avg.as_secs_f64() * 1000.0);
        println!("Min:     {:?} ({:.3} ms)", min, min.as_secs_f64() * 1000.0);
        println!("Max:     {:?} ({:.3} ms)", max, max.as_secs_f64() * 1000.0);
        println!("P50:     {:?} ({:.3} ms)", p50, p50.as_secs_f64() * 1000.0);
        println!("P95:     {:?} ({:.3} ms)", p95, p95.as_secs_f64() * 1000.0);
    }

    fn avg_ms(&self) -> f64 {
        let total: Duration = self.durations.iter().sum();
        (total / self.iterations as u32).as_secs_f64() * 1000.0
    }
}

// ============================================================================
// Test Data Generation
// ============================================================================

fn upload_pattern(ctx: &HostContext, len: usize, phase: f32) -> HostBuffer {
    let data: Vec<f32> = (0..len)
        .map(|i| ((i as f32 * 0.01) + phase).sin() * 0.1)
        .collect();
    let device = ctx.device();
    let buffer = device.allocate(len * 4).expect("allocate");
    device.write_buffer(&buffer, &data).expect("upload");
    buffer
}

// ============================================================================
// Benchmarks
// ============================================================================

fn benchmark_na1d(ctx: &HostContext) {
    println!("\n[1D Neighborhood Attention]");
    println!("===========================");

    let (batch, heads, dim) = (1, 4, 32);
    for &(length, kernel) in &[(256, 7), (1024, 7), (1024, 31), (4096, 13)] {
        let shape = vec![batch, heads, length, dim];
        let len = shape.iter().product();
        let q = upload_pattern(ctx, len, 0.0);
        let k = upload_pattern(ctx, len, 1.0);
        let v = upload_pattern(ctx, len, 2.0);
        let params = Na1dParams::new(kernel);

        let bench = Benchmark::new(&format!("na1d (L={}, K={})", length, kernel), 20);
        let result = bench.run_time(|| {
            match na1d_forward(
                ctx,
                &TensorRef::contiguous(&q, shape.clone()),
                &TensorRef::contiguous(&k, shape.clone()),
                &TensorRef::contiguous(&v, shape.clone()),
                None,
                &params,
            ) {
                Ok(out) => Some(out),
                Err(e) => {
                    eprintln!("na1d forward failed: {}", e);
                    None
                }
            }
        });
        result.report();
        println!("Tokens/sec: {:.2}", (length as f64 * 1000.0) / result.avg_ms());
    }
}

fn benchmark_na2d(ctx: &HostContext) {
    println!("\n[2D Neighborhood Attention]");
    println!("===========================");

    let (batch, heads, dim) = (1, 4, 32);
    for &(side, kernel) in &[(16, 7), (32, 7), (56, 7)] {
        let shape = vec![batch, heads, side, side, dim];
        let len = shape.iter().product();
        let q = upload_pattern(ctx, len, 0.0);
        let k = upload_pattern(ctx, len, 1.0);
        let v = upload_pattern(ctx, len, 2.0);
        let params = Na2dParams::new(kernel);

        let bench = Benchmark::new(&format!("na2d ({}x{}, K={})", side, side, kernel), 10);
        let result = bench.run_time(|| {
            na2d_forward(
                ctx,
                &TensorRef::contiguous(&q, shape.clone()),
                &TensorRef::contiguous(&k, shape.clone()),
                &TensorRef::contiguous(&v, shape.clone()),
                None,
                &params,
            )
            .ok()
        });
        result.report();
    }
}

fn benchmark_fmha(ctx: &HostContext) {
    println!("\n[Dense Attention]");
    println!("=================");

    let shape = vec![1, 4, 512, 32];
    let len = shape.iter().product();
    let q = upload_pattern(ctx, len, 0.0);
    let k = upload_pattern(ctx, len, 1.0);
    let v = upload_pattern(ctx, len, 2.0);

    let bench = Benchmark::new("fmha (L=512)", 10);
    let result = bench.run_time(|| {
        fmha_forward(
            ctx,
            &TensorRef::contiguous(&q, shape.clone()),
            &TensorRef::contiguous(&k, shape.clone()),
            &TensorRef::contiguous(&v, shape.clone()),
        )
        .ok()
    });
    result.report();
}

fn main() {
    nattenforge::logging::init_logging_default();
    println!("Neighborhood Attention Benchmarks");
    println!("=================================");

    let ctx = match host_context() {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("host context unavailable: {}", e);
            return;
        }
    };

    benchmark_na1d(ctx);
    benchmark_na2d(ctx);
    benchmark_fmha(ctx);

    if let Ok(stats) = ctx.pool().stats() {
        println!("\nPool: {:?}", stats);
    }
    println!("Device: {:?}", ctx.device().stats());
}
