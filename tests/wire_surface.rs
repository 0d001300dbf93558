use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use spotsense::tenant::TenantManager;
use spotsense::wire;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const MINUTE: i64 = 60_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("spotsense_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, "https://spotsense.test".into()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "spotsense".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    connect_db(addr, &format!("test_{}", Ulid::new())).await
}

async fn connect_db(addr: SocketAddr, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("spotsense")
        .password("spotsense");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Keep only the data rows of a simple-query response.
fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn create_facility(client: &tokio_postgres::Client, capacity: u32, rate: f64) -> Ulid {
    let fid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO facilities (id, name, capacity, hourly_rate) VALUES ('{fid}', 'Test Garage', {capacity}, {rate})"
        ))
        .await
        .unwrap();
    fid
}

async fn create_booking(
    client: &tokio_postgres::Client,
    fid: Ulid,
    start: i64,
    end: i64,
    amount: f64,
    status: &str,
) -> Ulid {
    let bid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, facility_id, user_id, vehicle_id, start, "end", amount, space_id, status) VALUES ('{bid}', '{fid}', '{}', '{}', {start}, {end}, {amount}, NULL, '{status}')"#,
            Ulid::new(),
            Ulid::new(),
        ))
        .await
        .unwrap();
    bid
}

async fn booking_row(client: &tokio_postgres::Client, bid: Ulid) -> SimpleQueryRow {
    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE id = '{bid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    rows.into_iter().next().unwrap()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn insert_and_select_facility() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let fid = create_facility(&client, 40, 3.5).await;

    let rows = data_rows(client.simple_query("SELECT * FROM facilities").await.unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(fid.to_string().as_str()));
    assert_eq!(rows[0].get("name"), Some("Test Garage"));
    assert_eq!(rows[0].get("capacity"), Some("40"));
}

#[tokio::test]
async fn booking_lifecycle_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let fid = create_facility(&client, 5, 4.0).await;
    let now = now_ms();
    let bid = create_booking(&client, fid, now - HOUR, now + HOUR, 8.0, "pending").await;

    let row = booking_row(&client, bid).await;
    assert_eq!(row.get("status"), Some("pending"));
    assert_eq!(row.get("duration_minutes"), Some("120"));
    assert!(row.get("number").unwrap().starts_with("BK"));

    client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'confirmed', method = 'credit_card', transaction_id = 'txn-1' WHERE id = '{bid}'"
        ))
        .await
        .unwrap();
    let row = booking_row(&client, bid).await;
    assert_eq!(row.get("status"), Some("confirmed"));
    assert_eq!(row.get("payment_status"), Some("paid"));

    client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'active', method = 'qr_code' WHERE id = '{bid}'"
        ))
        .await
        .unwrap();
    let row = booking_row(&client, bid).await;
    assert_eq!(row.get("status"), Some("active"));

    client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'completed', method = 'qr_code', charges = 2.5 WHERE id = '{bid}'"
        ))
        .await
        .unwrap();
    let row = booking_row(&client, bid).await;
    assert_eq!(row.get("status"), Some("completed"));
    assert_eq!(row.get("amount"), Some("10.5"));
}

#[tokio::test]
async fn cancel_far_ahead_refunds_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let fid = create_facility(&client, 5, 4.0).await;
    let now = now_ms();
    let bid = create_booking(&client, fid, now + 25 * HOUR, now + 27 * HOUR, 40.0, "confirmed").await;

    client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'cancelled', reason = 'change of plans', cancelled_by = '{}' WHERE id = '{bid}'",
            Ulid::new(),
        ))
        .await
        .unwrap();

    let row = booking_row(&client, bid).await;
    assert_eq!(row.get("status"), Some("refunded"));
    assert_eq!(row.get("payment_status"), Some("refunded"));
}

#[tokio::test]
async fn invalid_transition_surfaces_error() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let fid = create_facility(&client, 5, 4.0).await;
    let now = now_ms();
    let bid = create_booking(&client, fid, now + HOUR, now + 2 * HOUR, 8.0, "pending").await;

    // Check-in straight from pending is forbidden
    let err = client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'active', method = 'manual' WHERE id = '{bid}'"
        ))
        .await
        .unwrap_err();
    let message = err.as_db_error().unwrap().message();
    assert!(message.contains("pending"), "unexpected error: {message}");

    // The booking is untouched
    let row = booking_row(&client, bid).await;
    assert_eq!(row.get("status"), Some("pending"));
}

#[tokio::test]
async fn extension_request_and_approval() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let fid = create_facility(&client, 5, 4.0).await;
    let now = now_ms();
    let end = now + 2 * HOUR;
    let bid = create_booking(&client, fid, now + HOUR, end, 8.0, "confirmed").await;

    client
        .batch_execute(&format!(
            "INSERT INTO extensions (booking_id, minutes) VALUES ('{bid}', 30)"
        ))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM extensions WHERE booking_id = '{bid}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("pending"));
    assert_eq!(rows[0].get("minutes"), Some("30"));
    assert_eq!(rows[0].get("additional_amount"), Some("2")); // 4/h × 0.5h

    // Parent end time unchanged while the request is pending
    let row = booking_row(&client, bid).await;
    assert_eq!(row.get("end"), Some(end.to_string().as_str()));

    client
        .batch_execute(&format!(
            "UPDATE extensions SET status = 'approved', transaction_id = 'txn-3' WHERE booking_id = '{bid}' AND idx = 0"
        ))
        .await
        .unwrap();

    let row = booking_row(&client, bid).await;
    assert_eq!(
        row.get("end"),
        Some((end + 30 * MINUTE).to_string().as_str())
    );
    assert_eq!(row.get("amount"), Some("10"));
}

#[tokio::test]
async fn extension_auto_approves_with_payment() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let fid = create_facility(&client, 5, 4.0).await;
    let now = now_ms();
    let end = now + 2 * HOUR;
    let bid = create_booking(&client, fid, now + HOUR, end, 8.0, "confirmed").await;

    client
        .batch_execute(&format!(
            "INSERT INTO extensions (booking_id, minutes, payment_method, transaction_id) VALUES ('{bid}', 60, 'wallet', 'txn-7')"
        ))
        .await
        .unwrap();

    let row = booking_row(&client, bid).await;
    assert_eq!(row.get("end"), Some((end + HOUR).to_string().as_str()));
    assert_eq!(row.get("duration_minutes"), Some("120"));
    assert_eq!(row.get("amount"), Some("12"));
}

#[tokio::test]
async fn availability_reports_remaining_spaces() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let fid = create_facility(&client, 10, 4.0).await;
    let now = now_ms();
    for _ in 0..3 {
        create_booking(&client, fid, now + HOUR, now + 2 * HOUR, 4.0, "confirmed").await;
    }

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE facility_id = '{fid}' AND start >= {} AND \"end\" <= {}",
                now + HOUR,
                now + 2 * HOUR,
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("is_available"), Some("t"));
    assert_eq!(rows[0].get("available_spaces"), Some("7"));
    assert_eq!(rows[0].get("total_spaces"), Some("10"));
}

#[tokio::test]
async fn overbooking_rejected_with_conflict() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let fid = create_facility(&client, 1, 4.0).await;
    let now = now_ms();
    create_booking(&client, fid, now + HOUR, now + 2 * HOUR, 4.0, "confirmed").await;

    let bid = Ulid::new();
    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, facility_id, user_id, vehicle_id, start, "end", amount, space_id, status) VALUES ('{bid}', '{fid}', '{}', '{}', {}, {}, 4.0, NULL, 'confirmed')"#,
            Ulid::new(),
            Ulid::new(),
            now + HOUR,
            now + 2 * HOUR,
        ))
        .await
        .unwrap_err();
    let message = err.as_db_error().unwrap().message();
    assert!(message.contains("conflict"), "unexpected error: {message}");
}

#[tokio::test]
async fn rating_recorded_after_completion() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let fid = create_facility(&client, 5, 4.0).await;
    let now = now_ms();
    let bid = create_booking(&client, fid, now - HOUR, now + HOUR, 8.0, "confirmed").await;

    client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'active', method = 'manual' WHERE id = '{bid}'"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'completed', method = 'manual' WHERE id = '{bid}'"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO ratings (booking_id, score, comment) VALUES ('{bid}', 5, 'spotless')"
        ))
        .await
        .unwrap();

    // Rating a second lifecycle stage is rejected at the engine
    let err = client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'cancelled', reason = 'x', cancelled_by = '{}' WHERE id = '{bid}'",
            Ulid::new(),
        ))
        .await
        .unwrap_err();
    assert!(err.as_db_error().unwrap().message().contains("completed"));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let fid = create_facility(&client, 5, 4.0).await;
    let now = now_ms();
    let bid = create_booking(&client, fid, now + HOUR, now + 2 * HOUR, 8.0, "confirmed").await;

    let rows = client
        .query(
            "SELECT * FROM bookings WHERE id = $1",
            &[&bid.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let status: &str = rows[0].get("status");
    assert_eq!(status, "confirmed");
}

#[tokio::test]
async fn tenants_are_isolated_per_database() {
    let (addr, _tm) = start_test_server().await;
    let client_a = connect_db(addr, "operator_a").await;
    let client_b = connect_db(addr, "operator_b").await;

    create_facility(&client_a, 5, 4.0).await;

    let rows_a = data_rows(client_a.simple_query("SELECT * FROM facilities").await.unwrap());
    let rows_b = data_rows(client_b.simple_query("SELECT * FROM facilities").await.unwrap());
    assert_eq!(rows_a.len(), 1);
    assert!(rows_b.is_empty());
}

#[tokio::test]
async fn listen_is_acknowledged() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let fid = create_facility(&client, 5, 4.0).await;
    client
        .batch_execute(&format!("LISTEN facility_{fid}"))
        .await
        .unwrap();
}
