use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use allotd::tenant::{TenantConfig, TenantManager};
use allotd::wire;

const PASSWORD: &str = "allotd";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("allotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, TenantConfig::default()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect_as(addr: SocketAddr, org: &str, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(org)
        .user("agent")
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, org: &str) -> Client {
    connect_as(addr, org, PASSWORD).await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

/// A unit with one committed bucket of `quantity` rooms over nights
/// 20000..20010, priced at 10000 per night in EUR on the web channel.
struct Fixture {
    unit_id: Ulid,
    bucket_id: Ulid,
}

async fn seed(client: &Client, quantity: u32) -> Fixture {
    let unit_id = Ulid::new();
    let bucket_id = Ulid::new();
    let supplier_id = Ulid::new();
    let plan_id = Ulid::new();
    let season_id = Ulid::new();
    client
        .batch_execute(&format!(
            r#"
            INSERT INTO units (id, name) VALUES ('{unit_id}', 'Double room');
            INSERT INTO buckets (id, unit_id, supplier_id, allocation_type, priority, cost_per_unit)
                VALUES ('{bucket_id}', '{unit_id}', '{supplier_id}', 'committed', 0, 7000);
            INSERT INTO bucket_nights (bucket_id, start, "end", quantity) VALUES ('{bucket_id}', 20000, 20010, {quantity});
            INSERT INTO rate_plans (id, unit_id, currency, market, channel, start, "end")
                VALUES ('{plan_id}', '{unit_id}', 'EUR', 'DE', 'web', 20000, 20010);
            INSERT INTO rate_seasons (id, rate_plan_id, start, "end", nightly_rate)
                VALUES ('{season_id}', '{plan_id}', 20000, 20010, 10000);
            "#
        ))
        .await
        .unwrap();
    Fixture { unit_id, bucket_id }
}

fn hold_sql(hold_id: Ulid, unit_id: Ulid, quantity: u32) -> String {
    format!(
        r#"INSERT INTO holds (id, unit_id, start, "end", quantity, channel, market, currency)
           VALUES ('{hold_id}', '{unit_id}', 20002, 20005, {quantity}, 'web', 'DE', 'EUR')"#
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn availability_after_seeding() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let fx = seed(&client, 10).await;

    client
        .batch_execute(&format!(
            r#"INSERT INTO adjustments (bucket_id, start, "end", delta_booked) VALUES ('{}', 20000, 20001, 8)"#,
            fx.bucket_id
        ))
        .await
        .unwrap();

    let days = rows(
        &client,
        &format!(
            r#"SELECT * FROM availability WHERE unit_id = '{}' AND start >= 20000 AND "end" <= 20002"#,
            fx.unit_id
        ),
    )
    .await;
    assert_eq!(days.len(), 2);
    assert_eq!(days[0].get("night"), Some("20000"));
    assert_eq!(days[0].get("booked"), Some("8"));
    assert_eq!(days[0].get("available"), Some("2"));
    assert_eq!(days[1].get("available"), Some("10"));
}

#[tokio::test]
async fn hold_confirm_lifecycle() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let fx = seed(&client, 5).await;

    let hold_id = Ulid::new();
    let allocation = rows(&client, &hold_sql(hold_id, fx.unit_id, 2)).await;
    assert_eq!(allocation.len(), 1);
    assert_eq!(allocation[0].get("hold_id"), Some(hold_id.to_string().as_str()));
    assert_eq!(allocation[0].get("bucket_id"), Some(fx.bucket_id.to_string().as_str()));
    assert_eq!(allocation[0].get("source"), Some("direct"));
    // 3 nights x 2 rooms x 10000
    assert_eq!(allocation[0].get("total"), Some("60000"));

    client
        .batch_execute(&format!("INSERT INTO bookings (id) VALUES ('{hold_id}')"))
        .await
        .unwrap();

    let holds = rows(&client, &format!("SELECT * FROM holds WHERE id = '{hold_id}'")).await;
    assert_eq!(holds[0].get("status"), Some("confirmed"));

    let days = rows(
        &client,
        &format!(
            r#"SELECT * FROM availability WHERE unit_id = '{}' AND start >= 20002 AND "end" <= 20003"#,
            fx.unit_id
        ),
    )
    .await;
    assert_eq!(days[0].get("booked"), Some("2"));
    assert_eq!(days[0].get("held"), Some("0"));
}

#[tokio::test]
async fn release_frees_capacity() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let fx = seed(&client, 2).await;

    let first = Ulid::new();
    rows(&client, &hold_sql(first, fx.unit_id, 2)).await;

    let err = client
        .simple_query(&hold_sql(Ulid::new(), fx.unit_id, 1))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0001");
    assert!(err.as_db_error().unwrap().message().contains("no availability"));

    client
        .batch_execute(&format!("DELETE FROM holds WHERE id = '{first}'"))
        .await
        .unwrap();
    let again = rows(&client, &hold_sql(Ulid::new(), fx.unit_id, 2)).await;
    assert_eq!(again.len(), 1);
}

#[tokio::test]
async fn quote_query_returns_totals() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let fx = seed(&client, 5).await;

    let quote = rows(
        &client,
        &format!(
            r#"SELECT * FROM quotes WHERE bucket_id = '{}' AND start >= 20000 AND "end" <= 20004
               AND quantity = 1 AND channel = 'web' AND market = 'DE' AND currency = 'EUR'"#,
            fx.bucket_id
        ),
    )
    .await;
    assert_eq!(quote[0].get("nights"), Some("4"));
    assert_eq!(quote[0].get("total"), Some("40000"));
    assert_eq!(quote[0].get("cost_total"), Some("28000"));
    let segments: serde_json::Value = serde_json::from_str(quote[0].get("segments").unwrap()).unwrap();
    assert_eq!(segments.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn bad_sql_reports_syntax_error() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;

    let err = client.simple_query("INSERT INTO nowhere (id) VALUES ('x')").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");

    let err = client
        .simple_query(&format!("INSERT INTO bookings (id) VALUES ('{}')", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0001");
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let fx = seed(&client, 5).await;

    let unit = Ulid::new().to_string();
    client
        .execute("INSERT INTO units (id, name) VALUES ($1, $2)", &[&unit, &"Suite"])
        .await
        .unwrap();

    let hold_id = Ulid::new();
    rows(&client, &hold_sql(hold_id, fx.unit_id, 1)).await;

    let found = client
        .query("SELECT * FROM holds WHERE id = $1", &[&hold_id.to_string()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let status: String = found[0].get("status");
    assert_eq!(status, "active");
}

#[tokio::test]
async fn organizations_do_not_share_inventory() {
    let (addr, _tm) = start_test_server().await;
    let acme = connect(addr, "acme").await;
    let globex = connect(addr, "globex").await;
    let fx = seed(&acme, 5).await;

    let buckets = rows(&acme, &format!("SELECT * FROM buckets WHERE unit_id = '{}'", fx.unit_id)).await;
    assert_eq!(buckets.len(), 1);
    let buckets = rows(&globex, &format!("SELECT * FROM buckets WHERE unit_id = '{}'", fx.unit_id)).await;
    assert!(buckets.is_empty());
}

#[tokio::test]
async fn wrong_password_rejected() {
    let (addr, _tm) = start_test_server().await;
    assert!(connect_as(addr, "acme", "not-the-password").await.is_err());
}

#[tokio::test]
async fn invalid_organization_name_rejected() {
    let (addr, _tm) = start_test_server().await;
    let err = connect_as(addr, "acme.", PASSWORD).await.err().unwrap();
    if let Some(db) = err.as_db_error() {
        assert_eq!(db.code().code(), "3D000");
    }
}
