use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_postgres::{Config, NoTls};

const HOUR: i64 = 3_600_000; // 1 hour in ms
/// 2030-01-01T00:00:00Z; bookings must lie in the future.
const EPOCH: i64 = 1_893_456_000_000;

#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
    user: String,
    password: String,
}

async fn connect(target: &Target) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname("slotd")
        .user(&target.user)
        .password(&target.password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

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
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

fn insert_booking(service_id: i64, start: i64) -> String {
    format!(
        r#"INSERT INTO bookings (service_id, start, "end") VALUES ({service_id}, {start}, {})"#,
        start + HOUR
    )
}

/// Service ids are client-chosen; derive a fresh block per run.
fn service_id_base() -> i64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64);
    (secs % 100_000) * 100
}

async fn create_services(target: &Target, ids: impl IntoIterator<Item = i64>) {
    let client = connect(target).await;
    let mut n = 0;
    for id in ids {
        client
            .batch_execute(&format!(
                "INSERT INTO services (id, title, description, price_cents, duration_minutes) \
                 VALUES ({id}, 'bench {id}', '', 1000, 60)"
            ))
            .await
            .unwrap();
        n += 1;
    }
    println!("  created {n} services");
}

async fn phase1_sequential(target: &Target, service_id: i64) {
    let client = connect(target).await;
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&insert_booking(service_id, EPOCH + i as i64 * HOUR))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(target: &Target, service_ids: &[i64]) {
    let n_tasks = service_ids.len();
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for &service_id in service_ids {
        let target = target.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target).await;
            for j in 0..n_per_task {
                client
                    .batch_execute(&insert_booking(service_id, EPOCH + j as i64 * HOUR))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

/// Every task competes for the same slots; exactly one create per slot may win.
async fn phase3_contended(target: &Target, service_id: i64) {
    let n_tasks = 20;
    let n_slots = 100;
    let won = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let target = target.clone();
        let won = won.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target).await;
            for slot in 0..n_slots {
                match client.batch_execute(&insert_booking(service_id, EPOCH + slot * HOUR)).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.code().is_some_and(|c| c.code() == "23P01") => {
                        conflicts.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let won = won.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_slots} slots in {:.2}s: {won} won, {} conflicts",
        start.elapsed().as_secs_f64(),
        conflicts.load(Ordering::Relaxed)
    );
    assert_eq!(won, n_slots as usize, "double booking detected");
}

async fn phase4_reads_under_load(target: &Target, read_service: i64, write_service: i64) {
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let writer = {
        let target = target.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let client = connect(&target).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client
                    .batch_execute(&insert_booking(write_service, EPOCH + (10_000 + i) * HOUR))
                    .await;
                i += 1;
            }
        })
    };

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let target = target.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&target).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let from = EPOCH + ((r * reads_per_reader + i) as i64 % 2000) * HOUR;
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        r#"SELECT * FROM conflicts WHERE service_id = {read_service} AND start >= {from} AND "end" <= {}"#,
                        from + 24 * HOUR
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    let _ = writer.await;

    print_latency("conflict query", &mut all_latencies);
}

async fn phase5_connection_storm(target: &Target, service_base: i64) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let target = target.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target).await;
            for i in 0..ops_per_conn {
                let slot = (c * ops_per_conn + i) as i64;
                client
                    .batch_execute(&insert_booking(service_base, EPOCH + (20_000 + slot) * HOUR))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let target = Target {
        host: std::env::var("SLOTD_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("SLOTD_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid SLOTD_PORT"),
        user: std::env::var("SLOTD_ADMIN_USER").unwrap_or_else(|_| "admin".into()),
        password: std::env::var("SLOTD_ADMIN_PASSWORD").unwrap_or_else(|_| "admin".into()),
    };

    println!("=== slotd stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    let base = service_id_base();
    let concurrent: Vec<i64> = (base + 10..base + 20).collect();

    println!("[setup]");
    create_services(&target, [base, base + 1, base + 2, base + 3].into_iter().chain(concurrent.clone())).await;

    println!("\n[phase 1] sequential write throughput");
    phase1_sequential(&target, base).await;

    println!("\n[phase 2] concurrent writes, one service per task");
    phase2_concurrent(&target, &concurrent).await;

    println!("\n[phase 3] contended writes on one service");
    phase3_contended(&target, base + 1).await;

    println!("\n[phase 4] read latency under write load");
    phase4_reads_under_load(&target, base, base + 2).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&target, base + 3).await;

    println!("\n=== done ===");
}
