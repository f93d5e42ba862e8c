use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use bookhold::catalog::MemoryCatalog;
use bookhold::clock::ManualClock;
use bookhold::engine::{Collaborators, Engine, EngineSettings};
use bookhold::model::RequesterAttributes;
use bookhold::notify::{LogNotifier, NotifyHub};
use bookhold::priority::DAY_MS;
use bookhold::standing::MemoryStanding;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

struct Bench {
    engine: Arc<Engine>,
    catalog: Arc<MemoryCatalog>,
    standing: Arc<MemoryStanding>,
    clock: Arc<ManualClock>,
}

fn open_bench() -> Bench {
    let dir = std::env::temp_dir().join(format!("bookhold_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    let catalog = Arc::new(MemoryCatalog::new());
    let standing = Arc::new(MemoryStanding::new());
    let clock = Arc::new(ManualClock::new(20_000 * DAY_MS));
    let engine = Engine::new(
        dir.join("bookhold.wal"),
        EngineSettings::default(),
        Collaborators {
            catalog: catalog.clone(),
            standing: standing.clone(),
            notifier: Arc::new(LogNotifier),
            clock: clock.clone(),
        },
        Arc::new(NotifyHub::new()),
    )
    .expect("open engine");
    Bench { engine, catalog, standing, clock }
}

impl Bench {
    fn books(&self, n: usize, copies: u32) -> Vec<Ulid> {
        (0..n)
            .map(|_| {
                let id = Ulid::new();
                self.catalog.insert(id, copies, 0);
                id
            })
            .collect()
    }

    fn readers(&self, n: usize) -> Vec<Ulid> {
        (0..n)
            .map(|i| {
                let id = Ulid::new();
                let attributes = RequesterAttributes {
                    urgency_flag: i % 7 == 0,
                    late_incident_count: (i % 4) as u32,
                    ..Default::default()
                };
                self.standing.insert(id, attributes);
                id
            })
            .collect()
    }
}

async fn phase1_sequential_joins(bench: &Bench) {
    let book = bench.books(1, 1)[0];
    let readers = bench.readers(2000);

    let mut latencies = Vec::with_capacity(readers.len());
    let start = Instant::now();
    for reader in &readers {
        let t = Instant::now();
        bench.engine.join_waitlist(*reader, book).await.expect("join");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = readers.len() as f64 / elapsed.as_secs_f64();
    println!(
        "  {} joins on one waitlist in {:.2}s = {ops:.0} ops/sec",
        readers.len(),
        elapsed.as_secs_f64()
    );
    print_latency("join latency", &mut latencies);
}

async fn phase2_concurrent_joins(bench: &Bench) {
    let n_tasks = 10;
    let n_per_task = 200;
    let books = bench.books(n_tasks, 3);

    let start = Instant::now();
    let mut handles = Vec::new();
    for book in books {
        let engine = bench.engine.clone();
        let readers = bench.readers(n_per_task);
        handles.push(tokio::spawn(async move {
            for reader in readers {
                engine.join_waitlist(reader, book).await.expect("join");
            }
        }));
    }
    for h in handles {
        h.await.expect("join task");
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} joins = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_release_under_load(bench: &Bench) {
    let copies = 50;
    let book = bench.books(1, copies)[0];
    for reader in bench.readers(500) {
        bench.engine.join_waitlist(reader, book).await.expect("join");
    }

    // Background joins on other resources while units come back.
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writers = Vec::new();
    for _ in 0..4 {
        let engine = bench.engine.clone();
        let stop = stop.clone();
        let other = bench.books(1, 1)[0];
        let readers = bench.readers(1000);
        writers.push(tokio::spawn(async move {
            for reader in readers {
                if stop.load(std::sync::atomic::Ordering::Relaxed) {
                    break;
                }
                let _ = engine.join_waitlist(reader, other).await;
            }
        }));
    }

    let mut latencies = Vec::with_capacity(copies as usize);
    for _ in 0..copies {
        let t = Instant::now();
        let opened = bench.engine.release_unit(book).await.expect("release");
        latencies.push(t.elapsed());
        assert_eq!(opened.len(), 1);
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("release + allocate", &mut latencies);
}

async fn phase4_sweep(bench: &Bench) {
    let books = bench.books(200, 2);
    for book in &books {
        for reader in bench.readers(4) {
            bench.engine.join_waitlist(reader, *book).await.expect("join");
        }
        bench.engine.release_unit(*book).await.expect("release");
        bench.engine.release_unit(*book).await.expect("release");
    }

    let now = bench.clock.advance(2 * DAY_MS);
    let start = Instant::now();
    let report = bench.engine.sweep_expired(now).await;
    println!(
        "  sweep over {} resources: {} expired, {} reallocated in {:.2}ms",
        books.len(),
        report.expired.len(),
        report.reallocated.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );

    let start = Instant::now();
    bench.engine.compact_wal().await.expect("compact");
    println!("  WAL compaction in {:.2}ms", start.elapsed().as_secs_f64() * 1000.0);
}

#[tokio::main]
async fn main() {
    println!("=== bookhold stress benchmark ===\n");

    println!("[phase 1] sequential joins");
    phase1_sequential_joins(&open_bench()).await;

    println!("\n[phase 2] concurrent joins");
    phase2_concurrent_joins(&open_bench()).await;

    println!("\n[phase 3] release latency under join load");
    phase3_release_under_load(&open_bench()).await;

    println!("\n[phase 4] expiry sweep and compaction");
    phase4_sweep(&open_bench()).await;

    println!("\n=== benchmark complete ===");
}
