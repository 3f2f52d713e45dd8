// Warm-pool benchmark
// Measures dispatch latency with pre-created instances against creating one per request
// Target: warm p50 well below cold p50

use scorebox::{
    Dispatcher, EngineConfig, ExecutionRequest, IsolationConfig, PoolConfig, ProcessIsolation, ReusePolicy,
    SecurityMode,
};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ITERATIONS: usize = 50;
const WARMUP_ITERATIONS: usize = 5;
/// Gives background top-up a chance to replace the instance just retired
const SETTLE: Duration = Duration::from_millis(50);

/// Latency percentiles
struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    min: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();

        let p50_idx = (len as f64 * 0.50) as usize;
        let p95_idx = ((len as f64 * 0.95) as usize).min(len - 1);
        let p99_idx = ((len as f64 * 0.99) as usize).min(len - 1);

        let sum: Duration = samples.iter().sum();
        let mean = sum / len as u32;

        Self {
            p50: samples[p50_idx],
            p95: samples[p95_idx],
            p99: samples[p99_idx],
            min: samples[0],
            max: samples[len - 1],
            mean,
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  p99: {:?}", self.p99);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

struct BenchmarkResult {
    scenario: String,
    stats: LatencyStats,
    failures: usize,
}

impl BenchmarkResult {
    fn print(&self) {
        println!("\n=== {} ===", self.scenario);
        self.stats.print("Latency");
        if self.failures > 0 {
            println!("  failed requests: {}", self.failures);
        }
    }
}

fn engine(runtime_root: &Path, warmup: bool) -> EngineConfig {
    EngineConfig {
        pool: PoolConfig {
            min_warm: 2,
            max_size: 4,
            warmup,
            reuse: ReusePolicy::SingleUse,
            ..PoolConfig::default()
        },
        isolation: IsolationConfig {
            mode: SecurityMode::Dev,
            runner_path: PathBuf::from(env!("CARGO_BIN_EXE_scorebox-runner")),
            runtime_root: runtime_root.to_path_buf(),
            ..IsolationConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn request() -> ExecutionRequest {
    let kwargs: Map<String, Value> = json!({"output": "kitten", "reference": "sitting"})
        .as_object()
        .cloned()
        .unwrap_or_default();
    ExecutionRequest::catalog("LevenshteinRatio", Map::new(), kwargs)
}

fn benchmark_pool(scenario: &str, warmup: bool) -> BenchmarkResult {
    let runtime = tempfile::tempdir().expect("runtime dir");
    let config = engine(runtime.path(), warmup);
    let dispatcher = Dispatcher::with_adapter(Arc::new(ProcessIsolation::new(config.isolation.clone())), &config);
    if let Err(e) = dispatcher.pool().prefill() {
        println!("Prefill failed: {}", e);
    }

    let request = request();
    let mut samples = Vec::with_capacity(ITERATIONS);
    let mut failures = 0;

    for _ in 0..WARMUP_ITERATIONS {
        let _ = dispatcher.run_default(&request);
        std::thread::sleep(SETTLE);
    }

    for _ in 0..ITERATIONS {
        let start = Instant::now();
        let result = dispatcher.run_default(&request);
        samples.push(start.elapsed());
        if !result.is_success() {
            failures += 1;
        }
        std::thread::sleep(SETTLE);
    }

    dispatcher.shutdown();
    BenchmarkResult {
        scenario: scenario.to_string(),
        stats: LatencyStats::from_samples(samples),
        failures,
    }
}

fn main() {
    println!("scorebox warm-pool benchmark");
    println!("Iterations: {}, warmup: {}", ITERATIONS, WARMUP_ITERATIONS);

    let warm = benchmark_pool("Warm pool (single-use, min_warm=2)", true);
    let cold = benchmark_pool("Cold (instance created per request)", false);
    warm.print();
    cold.print();

    println!("\n=== Summary ===");
    let passed = warm.failures == 0 && cold.failures == 0 && warm.stats.p50 < cold.stats.p50;
    if passed {
        println!(
            "✅ PASS: warm p50 {:?} vs cold p50 {:?}",
            warm.stats.p50, cold.stats.p50
        );
    } else {
        println!(
            "❌ FAIL: warm p50 {:?} (failures {}) vs cold p50 {:?} (failures {})",
            warm.stats.p50, warm.failures, cold.stats.p50, cold.failures
        );
        std::process::exit(1);
    }
}
