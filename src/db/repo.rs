use super::model::{CountSnapshot, StoredStatus};
use crate::model::{
    FulfillmentStatus, Order, OrderLineItem, ProgressKey, ProgressRecord, SkuKey, Stage,
    StockRecord, SyncStatus,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

/// Settings keyspace keys owned by the sync engine.
pub mod keys {
    pub const SYNC_STATUS: &str = "sync_status";
    pub const SYNC_HEARTBEAT: &str = "sync_heartbeat";
    pub const LAST_SYNC_AT: &str = "last_sync_at";
    pub const AUTO_SYNC: &str = "auto_sync";
    pub const EXPECTED_ORDERS: &str = "expected_order_count";
    pub const EXPECTED_LINE_ITEMS: &str = "expected_line_item_count";
}

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query_part {
        Some(q) => format!("sqlite://{}?{}", expanded_path, q),
        None => format!("sqlite://{}", expanded_path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Incoming order payload already decoded from the remote wire format.
#[derive(Debug, Clone)]
pub struct OrderImport {
    pub remote_id: i64,
    pub number: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub remote_created_at: Option<DateTime<Utc>>,
    pub fulfillment_status: FulfillmentStatus,
    pub items: Vec<LineItemImport>,
}

#[derive(Debug, Clone)]
pub struct LineItemImport {
    pub sku: Option<String>,
    pub title: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub location_id: Option<i64>,
}

/// Upsert one order and replace its line items wholesale. On re-sync only
/// number, fulfillment status and the sync timestamp change; customer fields
/// keep their first-import values.
#[instrument(skip_all, fields(remote_id = import.remote_id))]
pub async fn upsert_order_with_items(pool: &Pool, import: &OrderImport) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let order_id: i64 = sqlx::query(
        "INSERT INTO orders (remote_id, number, customer_name, customer_email, remote_created_at, fulfillment_status, synced_at) \
         VALUES (?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(remote_id) DO UPDATE SET \
           number = excluded.number, \
           fulfillment_status = excluded.fulfillment_status, \
           synced_at = CURRENT_TIMESTAMP \
         RETURNING id",
    )
    .bind(import.remote_id)
    .bind(&import.number)
    .bind(&import.customer_name)
    .bind(&import.customer_email)
    .bind(import.remote_created_at.map(|t| t.to_rfc3339()))
    .bind(import.fulfillment_status.as_str())
    .fetch_one(&mut *tx)
    .await?
    .get("id");

    sqlx::query("DELETE FROM order_line_items WHERE order_id = ?")
        .bind(order_id)
        .execute(&mut *tx)
        .await?;
    for item in &import.items {
        sqlx::query(
            "INSERT INTO order_line_items (order_id, sku, title, quantity, unit_price, location_id) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(order_id)
        .bind(&item.sku)
        .bind(&item.title)
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.location_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(order_id)
}

#[instrument(skip_all)]
pub async fn list_orders(pool: &Pool) -> Result<Vec<Order>> {
    let rows = sqlx::query(
        "SELECT id, remote_id, number, customer_name, customer_email, remote_created_at, fulfillment_status, synced_at \
         FROM orders ORDER BY remote_created_at, remote_id",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let status_str: String = row.get("fulfillment_status");
            let status = FulfillmentStatus::parse(&status_str)
                .ok_or_else(|| anyhow!("unknown fulfillment status {:?}", status_str))?;
            Ok(Order {
                id: row.get("id"),
                remote_id: row.get("remote_id"),
                number: row.get("number"),
                customer_name: row.try_get("customer_name").ok(),
                customer_email: row.try_get("customer_email").ok(),
                remote_created_at: row
                    .try_get::<Option<String>, _>("remote_created_at")
                    .ok()
                    .flatten()
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|t| t.with_timezone(&Utc)),
                fulfillment_status: status,
                synced_at: row
                    .try_get::<DateTime<Utc>, _>("synced_at")
                    .unwrap_or_else(|_| Utc::now()),
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn list_line_items(pool: &Pool) -> Result<Vec<OrderLineItem>> {
    let rows = sqlx::query(
        "SELECT id, order_id, sku, title, quantity, unit_price, location_id \
         FROM order_line_items ORDER BY order_id, id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| OrderLineItem {
            id: row.get("id"),
            order_id: row.get("order_id"),
            sku: row.try_get::<Option<String>, _>("sku").ok().flatten(),
            title: row.get("title"),
            quantity: row.get("quantity"),
            unit_price: row.get("unit_price"),
            location_id: row
                .try_get::<Option<i64>, _>("location_id")
                .ok()
                .flatten(),
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn list_stock(pool: &Pool) -> Result<Vec<StockRecord>> {
    let rows = sqlx::query("SELECT sku, quantity, bin_location, unit_cost FROM stock_records")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| StockRecord {
            sku: row.get("sku"),
            quantity: row.get("quantity"),
            bin_location: row.get("bin_location"),
            unit_cost: row.get("unit_cost"),
        })
        .collect())
}

/// Seam for the inventory extract loader; the sync engine itself only reads
/// stock.
#[instrument(skip_all)]
pub async fn upsert_stock_record(pool: &Pool, rec: &StockRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO stock_records (sku, quantity, bin_location, unit_cost) VALUES (?, ?, ?, ?) \
         ON CONFLICT(sku) DO UPDATE SET \
           quantity = excluded.quantity, \
           bin_location = excluded.bin_location, \
           unit_cost = excluded.unit_cost",
    )
    .bind(&rec.sku)
    .bind(rec.quantity)
    .bind(&rec.bin_location)
    .bind(rec.unit_cost)
    .execute(pool)
    .await?;
    Ok(())
}

fn progress_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ProgressRecord> {
    let sku_str: String = row.get("sku");
    let stage_str: String = row.get("stage");
    let stage = Stage::parse(&stage_str)
        .ok_or_else(|| anyhow!("unknown progress stage {:?}", stage_str))?;
    let sku = if sku_str == crate::model::NO_SKU {
        SkuKey::NoSku
    } else {
        SkuKey::Sku(sku_str)
    };
    Ok(ProgressRecord {
        remote_order_id: row.get("remote_order_id"),
        sku,
        stage,
        notes: row.get("notes"),
        qty_required: row
            .try_get::<Option<i64>, _>("qty_required")
            .ok()
            .flatten(),
        qty_picked: row.get("qty_picked"),
        partial: row.get::<i64, _>("partial") != 0,
        vendor_line_id: row
            .try_get::<Option<String>, _>("vendor_line_id")
            .ok()
            .flatten(),
        dealer_po: row.try_get::<Option<String>, _>("dealer_po").ok().flatten(),
    })
}

#[instrument(skip_all)]
pub async fn list_progress(pool: &Pool) -> Result<Vec<ProgressRecord>> {
    let rows = sqlx::query(
        "SELECT remote_order_id, sku, stage, notes, qty_required, qty_picked, partial, vendor_line_id, dealer_po \
         FROM progress_records",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(progress_from_row).collect()
}

#[instrument(skip_all)]
pub async fn get_progress(pool: &Pool, key: &ProgressKey) -> Result<Option<ProgressRecord>> {
    let row = sqlx::query(
        "SELECT remote_order_id, sku, stage, notes, qty_required, qty_picked, partial, vendor_line_id, dealer_po \
         FROM progress_records WHERE remote_order_id = ? AND sku = ?",
    )
    .bind(key.remote_order_id)
    .bind(key.sku.as_str())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(progress_from_row).transpose()
}

/// Record a stage transition: the old entry for the key is replaced, never
/// appended to. At most one row per (order, sku) holds by the unique index.
#[instrument(skip_all, fields(remote_order_id = rec.remote_order_id))]
pub async fn record_progress(pool: &Pool, rec: &ProgressRecord) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM progress_records WHERE remote_order_id = ? AND sku = ?")
        .bind(rec.remote_order_id)
        .bind(rec.sku.as_str())
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO progress_records \
           (remote_order_id, sku, stage, notes, qty_required, qty_picked, partial, vendor_line_id, dealer_po, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)",
    )
    .bind(rec.remote_order_id)
    .bind(rec.sku.as_str())
    .bind(rec.stage.as_str())
    .bind(&rec.notes)
    .bind(rec.qty_required)
    .bind(rec.qty_picked)
    .bind(rec.partial as i64)
    .bind(&rec.vendor_line_id)
    .bind(&rec.dealer_po)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_orders(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn count_line_items(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM order_line_items")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn count_snapshot(pool: &Pool) -> Result<CountSnapshot> {
    Ok(CountSnapshot {
        orders: count_orders(pool).await?,
        line_items: count_line_items(pool).await?,
    })
}

/// Bulk delete of the order mirror. Used only by the complete-refresh
/// workflow and always followed by a verification pass. Progress records are
/// deliberately untouched.
#[instrument(skip_all)]
pub async fn delete_all_orders(pool: &Pool) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM order_line_items")
        .execute(&mut *tx)
        .await?;
    let res = sqlx::query("DELETE FROM orders").execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn get_setting(pool: &Pool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

#[instrument(skip_all)]
pub async fn set_setting(pool: &Pool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .with_context(|| format!("failed to write setting {}", key))?;
    Ok(())
}

/// Write the sync status flag plus a fresh heartbeat in one transaction.
#[instrument(skip_all)]
pub async fn set_sync_status(pool: &Pool, status: SyncStatus) -> Result<()> {
    let mut tx = pool.begin().await?;
    for (key, value) in [
        (keys::SYNC_STATUS, status.as_str().to_string()),
        (keys::SYNC_HEARTBEAT, Utc::now().to_rfc3339()),
    ] {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Refresh the heartbeat without changing the flag. Called at every batch
/// boundary so observers can distinguish "running" from "crashed".
#[instrument(skip_all)]
pub async fn touch_sync_heartbeat(pool: &Pool) -> Result<()> {
    set_setting(pool, keys::SYNC_HEARTBEAT, &Utc::now().to_rfc3339()).await
}

#[instrument(skip_all)]
pub async fn read_sync_status(pool: &Pool) -> Result<StoredStatus> {
    let status = get_setting(pool, keys::SYNC_STATUS)
        .await?
        .and_then(|s| SyncStatus::parse(&s))
        .unwrap_or(SyncStatus::Idle);
    let heartbeat = get_setting(pool, keys::SYNC_HEARTBEAT)
        .await?
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc));
    Ok(StoredStatus { status, heartbeat })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample_import(remote_id: i64, items: Vec<LineItemImport>) -> OrderImport {
        OrderImport {
            remote_id,
            number: format!("#{}", 1000 + remote_id),
            customer_name: Some("Joe Dealer".into()),
            customer_email: Some("joe@example.com".into()),
            remote_created_at: Some(Utc::now()),
            fulfillment_status: FulfillmentStatus::Unfulfilled,
            items,
        }
    }

    fn sample_item(sku: Option<&str>, qty: i64) -> LineItemImport {
        LineItemImport {
            sku: sku.map(str::to_string),
            title: "Clutch lever".into(),
            quantity: qty,
            unit_price: 19.99,
            location_id: Some(7),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_line_items_wholesale() {
        let pool = setup_pool().await;
        let import = sample_import(42, vec![sample_item(Some("HD-1"), 2), sample_item(None, 1)]);
        let id1 = upsert_order_with_items(&pool, &import).await.unwrap();
        assert_eq!(count_line_items(&pool).await.unwrap(), 2);

        // Re-sync with a different item set replaces, not appends.
        let import2 = sample_import(42, vec![sample_item(Some("HD-2"), 3)]);
        let id2 = upsert_order_with_items(&pool, &import2).await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(count_orders(&pool).await.unwrap(), 1);

        let items = list_line_items(&pool).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].sku.as_deref(), Some("HD-2"));
        assert_eq!(items[0].quantity, 3);
    }

    #[tokio::test]
    async fn progress_upsert_replaces_on_key() {
        let pool = setup_pool().await;
        let rec = ProgressRecord {
            remote_order_id: 42,
            sku: SkuKey::Sku("HD-1".into()),
            stage: Stage::Picking,
            notes: "front shelf".into(),
            qty_required: Some(2),
            qty_picked: 1,
            partial: true,
            vendor_line_id: None,
            dealer_po: None,
        };
        record_progress(&pool, &rec).await.unwrap();

        let replaced = ProgressRecord {
            stage: Stage::Picked,
            qty_picked: 2,
            partial: false,
            ..rec.clone()
        };
        record_progress(&pool, &replaced).await.unwrap();

        let all = list_progress(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].stage, Stage::Picked);
        assert_eq!(all[0].qty_picked, 2);

        let got = get_progress(&pool, &rec.key()).await.unwrap().unwrap();
        assert_eq!(got.stage, Stage::Picked);
    }

    #[tokio::test]
    async fn sentinel_sku_round_trips() {
        let pool = setup_pool().await;
        let rec = ProgressRecord {
            remote_order_id: 7,
            sku: SkuKey::NoSku,
            stage: Stage::ToOrder,
            notes: "manual add".into(),
            qty_required: Some(1),
            qty_picked: 0,
            partial: false,
            vendor_line_id: Some("VL-9".into()),
            dealer_po: Some("PO-1".into()),
        };
        record_progress(&pool, &rec).await.unwrap();
        let got = get_progress(&pool, &rec.key()).await.unwrap().unwrap();
        assert!(got.sku.is_no_sku());
        assert_eq!(got.vendor_line_id.as_deref(), Some("VL-9"));
    }

    #[tokio::test]
    async fn delete_all_orders_leaves_progress() {
        let pool = setup_pool().await;
        upsert_order_with_items(&pool, &sample_import(1, vec![sample_item(Some("A"), 1)]))
            .await
            .unwrap();
        record_progress(
            &pool,
            &ProgressRecord {
                remote_order_id: 1,
                sku: SkuKey::Sku("A".into()),
                stage: Stage::Picked,
                notes: String::new(),
                qty_required: None,
                qty_picked: 1,
                partial: false,
                vendor_line_id: None,
                dealer_po: None,
            },
        )
        .await
        .unwrap();

        delete_all_orders(&pool).await.unwrap();
        assert_eq!(count_orders(&pool).await.unwrap(), 0);
        assert_eq!(count_line_items(&pool).await.unwrap(), 0);
        assert_eq!(list_progress(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_flag_round_trip() {
        let pool = setup_pool().await;
        let stored = read_sync_status(&pool).await.unwrap();
        assert_eq!(stored.status, SyncStatus::Idle);
        assert!(stored.heartbeat.is_none());

        set_sync_status(&pool, SyncStatus::Importing).await.unwrap();
        let stored = read_sync_status(&pool).await.unwrap();
        assert_eq!(stored.status, SyncStatus::Importing);
        assert!(stored.heartbeat.is_some());

        set_sync_status(&pool, SyncStatus::Idle).await.unwrap();
        let stored = read_sync_status(&pool).await.unwrap();
        assert_eq!(stored.status, SyncStatus::Idle);
    }
}
