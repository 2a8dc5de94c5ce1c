use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const FIRST_NIGHT: i32 = 20_000;
const SEASON_NIGHTS: i32 = 365;

async fn connect(host: &str, port: u16, org: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(org)
        .user("bench")
        .password(std::env::var("ALLOTD_PASSWORD").unwrap_or_else(|_| "allotd".into()));

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_org() -> String {
    format!("bench_{}", Ulid::new())
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// One unit with `buckets` committed buckets of `quantity` rooms each and a
/// flat EUR rate for the whole season.
async fn seed_unit(client: &tokio_postgres::Client, buckets: usize, quantity: u32) -> Ulid {
    let unit_id = Ulid::new();
    let plan_id = Ulid::new();
    let end = FIRST_NIGHT + SEASON_NIGHTS;
    let mut sql = format!(
        r#"INSERT INTO units (id) VALUES ('{unit_id}');
           INSERT INTO rate_plans (id, unit_id, currency, market, channel, start, "end")
               VALUES ('{plan_id}', '{unit_id}', 'EUR', 'DE', 'web', {FIRST_NIGHT}, {end});
           INSERT INTO rate_seasons (id, rate_plan_id, start, "end", nightly_rate)
               VALUES ('{}', '{plan_id}', {FIRST_NIGHT}, {end}, 9900);"#,
        Ulid::new()
    );
    for priority in 0..buckets {
        let bucket_id = Ulid::new();
        sql.push_str(&format!(
            r#"INSERT INTO buckets (id, unit_id, supplier_id, allocation_type, priority)
                   VALUES ('{bucket_id}', '{unit_id}', '{}', 'committed', {priority});
               INSERT INTO bucket_nights (bucket_id, start, "end", quantity)
                   VALUES ('{bucket_id}', {FIRST_NIGHT}, {end}, {quantity});"#,
            Ulid::new()
        ));
    }
    client.batch_execute(&sql).await.unwrap();
    unit_id
}

fn hold_sql(hold_id: Ulid, unit_id: Ulid, start: i32, nights: i32) -> String {
    format!(
        r#"INSERT INTO holds (id, unit_id, start, "end", quantity, channel, market, currency)
           VALUES ('{hold_id}', '{unit_id}', {start}, {}, 1, 'web', 'DE', 'EUR')"#,
        start + nights
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_org()).await;
    let unit_id = seed_unit(&client, 3, 1_000).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let hold_id = Ulid::new();
        let night = FIRST_NIGHT + (i as i32 % (SEASON_NIGHTS - 7));
        let t = Instant::now();
        client
            .simple_query(&hold_sql(hold_id, unit_id, night, 3))
            .await
            .unwrap();
        client
            .batch_execute(&format!("INSERT INTO bookings (id) VALUES ('{hold_id}')"))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} hold+confirm in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("hold+confirm latency", &mut latencies);
}

/// Many clients race for the same nights. Accepted holds must never exceed
/// total capacity.
async fn phase2_contention(host: &str, port: u16) {
    let org = fresh_org();
    let buckets = 4;
    let quantity = 25;
    let unit_id = seed_unit(&connect(host, port, &org).await, buckets, quantity).await;

    let n_tasks = 20;
    let n_per_task = 20;
    let accepted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        let org = org.clone();
        let accepted = accepted.clone();
        let rejected = rejected.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &org).await;
            for _ in 0..n_per_task {
                match client.simple_query(&hold_sql(Ulid::new(), unit_id, FIRST_NIGHT, 2)).await {
                    Ok(_) => accepted.fetch_add(1, Ordering::Relaxed),
                    Err(_) => rejected.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let ok = accepted.load(Ordering::Relaxed);
    let capacity = buckets * quantity as usize;
    println!(
        "  {} requests in {:.2}s: {ok} accepted, {} rejected (capacity {capacity})",
        n_tasks * n_per_task,
        elapsed.as_secs_f64(),
        rejected.load(Ordering::Relaxed),
    );
    assert!(ok <= capacity, "oversold: {ok} holds for {capacity} rooms");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let org = fresh_org();
    let unit_id = seed_unit(&connect(host, port, &org).await, 5, 500).await;

    // Writers churn holds on the same unit: place then release.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let org = org.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &org).await;
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) {
                let hold_id = Ulid::new();
                let night = FIRST_NIGHT + (w * 50 + i) % (SEASON_NIGHTS - 7);
                if client.simple_query(&hold_sql(hold_id, unit_id, night, 5)).await.is_ok() {
                    let _ = client
                        .batch_execute(&format!("DELETE FROM holds WHERE id = '{hold_id}'"))
                        .await;
                }
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        let org = org.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &org).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                let rows = client
                    .simple_query(&format!(
                        r#"SELECT * FROM availability WHERE unit_id = '{unit_id}' AND start >= {FIRST_NIGHT} AND "end" <= {}"#,
                        FIRST_NIGHT + 30
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
                let data_rows = rows
                    .iter()
                    .filter(|m| matches!(m, SimpleQueryMessage::Row(_)))
                    .count();
                assert_eq!(data_rows, 5 * 30);
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_org()).await;
            let unit_id = seed_unit(&client, 1, 100).await;
            for i in 0..ops_per_conn {
                client
                    .simple_query(&hold_sql(Ulid::new(), unit_id, FIRST_NIGHT + i, 1))
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
        "  {n_conns} connections, {ops_per_conn} holds each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("ALLOTD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ALLOTD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid ALLOTD_PORT");

    println!("=== allotd stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential hold + confirm");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contention on shared nights");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] availability reads under hold churn");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
