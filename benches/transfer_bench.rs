//! Transfer and dispatch benchmarks
//!
//! Compares one-at-a-time buffer creation with batched creation, measures
//! device-to-host readback, and times replicated dispatch on the host
//! platform.
//!
//! Run with: `cargo bench --bench transfer_bench`

use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use replicaforge::executable::LocalExecutable;
use replicaforge::program::ComputationBuilder;
use replicaforge::{
    BuildOptions, ClientConfig, ElementType, HostPlatform, HostValue, LocalBuffer, LocalClient,
    Shape,
};

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
            durations,
        }
    }
}

struct BenchmarkResult {
    name: String,
    durations: Vec<Duration>,
}

impl BenchmarkResult {
    fn report(&self, bytes_per_iteration: Option<usize>) {
        if self.durations.is_empty() {
            return;
        }
        let mut sorted = self.durations.clone();
        sorted.sort();
        let total: Duration = sorted.iter().sum();
        let avg = total / sorted.len() as u32;
        let p50 = sorted[sorted.len() / 2];
        let p95 = sorted[(sorted.len() * 95) / 100];

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", sorted.len());
        println!("Average: {:?} ({:.3} ms)", avg, avg.as_secs_f64() * 1000.0);
        println!("P50:     {:?}", p50);
        println!("P95:     {:?}", p95);
        if let Some(bytes) = bytes_per_iteration {
            let secs = avg.as_secs_f64();
            if secs > 0.0 {
                println!("Throughput: {:.1} MB/s", bytes as f64 / secs / (1024.0 * 1024.0));
            }
        }
    }
}

fn host_client(devices: usize) -> Arc<LocalClient> {
    LocalClient::from_platform(
        Arc::new(HostPlatform::new(devices)),
        ClientConfig::default().with_thread_name_prefix("bench"),
    )
    .expect("host client should start")
}

fn batch(count: usize, elements: usize, devices: usize) -> Vec<(HostValue, usize)> {
    (0..count)
        .map(|i| {
            let data: Vec<f32> = (0..elements).map(|j| (i * elements + j) as f32).collect();
            (HostValue::vector(&data), i % devices)
        })
        .collect()
}

fn benchmark_buffer_creation() {
    println!("\n[Buffer Creation]");
    println!("=================");

    let devices = 4;
    let client = host_client(devices);
    for &(count, elements) in &[(64usize, 256usize), (16, 64 * 1024)] {
        let values = batch(count, elements, devices);
        let bytes = count * elements * 4;

        let sequential = Benchmark::new(&format!("from_host x{} ({} f32 each)", count, elements), 20)
            .run_time(|| {
                let buffers: Vec<LocalBuffer> = values
                    .iter()
                    .map(|(value, ordinal)| LocalBuffer::from_host(value, &client, *ordinal))
                    .collect::<Result<_, _>>()
                    .expect("from_host");
                for buffer in &buffers {
                    buffer.block_host_until_ready().expect("transfer");
                }
                buffers
            });
        sequential.report(Some(bytes));

        let batched =
            Benchmark::new(&format!("from_host_values x{} ({} f32 each)", count, elements), 20)
                .run_time(|| {
                    let buffers =
                        LocalBuffer::from_host_values(&values, &client).expect("from_host_values");
                    for buffer in &buffers {
                        buffer.block_host_until_ready().expect("transfer");
                    }
                    buffers
                });
        batched.report(Some(bytes));
    }
}

fn benchmark_readback() {
    println!("\n[Device To Host]");
    println!("================");

    let client = host_client(1);
    let value = HostValue::tuple(
        (0..8)
            .map(|i| HostValue::vector(&vec![i as f64; 32 * 1024]))
            .collect(),
    );
    let buffer = LocalBuffer::from_host(&value, &client, 0).expect("from_host");
    buffer.block_host_until_ready().expect("transfer");

    Benchmark::new("to_host 8-leaf tuple (2 MB)", 30)
        .run_time(|| buffer.to_host().expect("to_host"))
        .report(Some(8 * 32 * 1024 * 8));
}

fn benchmark_replicated_dispatch() {
    println!("\n[Replicated Dispatch]");
    println!("=====================");

    let len = 4096;
    let shape = Shape::array(ElementType::F32, &[len]);
    for &replicas in &[1usize, 2, 4] {
        let client = host_client(replicas);
        let mut b = ComputationBuilder::new("axpy");
        let x = b.parameter(0, shape.clone());
        let y = b.parameter(1, shape.clone());
        let xy = b.multiply(x, y);
        let root = b.add(xy, y);
        let program = b.build(root);

        let options = BuildOptions::new().with_num_replicas(replicas);
        let exe = LocalExecutable::compile(&program, vec![shape.clone(); 2], Some(&options), &client)
            .expect("compile");
        let inputs: Vec<LocalBuffer> = (0..replicas)
            .map(|r| {
                LocalBuffer::from_host(&HostValue::vector(&vec![1.5f32; len]), &client, r)
                    .expect("from_host")
            })
            .collect();
        let arguments: Vec<Vec<&LocalBuffer>> = inputs.iter().map(|b| vec![b, b]).collect();

        Benchmark::new(&format!("execute_per_replica x{} (f32[{}])", replicas, len), 50)
            .run_time(|| exe.execute_per_replica(&arguments).expect("execute"))
            .report(None);
    }
}

fn main() {
    println!("====================================");
    println!("replicaforge Transfer Benchmark Suite");
    println!("====================================");

    benchmark_buffer_creation();
    benchmark_readback();
    benchmark_replicated_dispatch();

    println!("\n====================================");
    println!("Benchmark Complete");
    println!("====================================");
}
