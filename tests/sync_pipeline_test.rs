use anyhow::{anyhow, Result};
use async_trait::async_trait;
use partsdesk::db;
use partsdesk::model::SyncStatus;
use partsdesk::shopify::model::{OrderDetail, RemoteOrder};
use partsdesk::shopify::OrderSource;
use partsdesk::sync::{SyncController, SyncOptions, SyncOutcome, SyncPhase, SyncRunner};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn remote_order(id: i64) -> RemoteOrder {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "name": format!("#{}", 1000 + id),
        "email": "rider@example.com",
        "created_at": "2024-03-01T10:00:00+00:00",
        "fulfillment_status": "partial",
    }))
    .unwrap()
}

fn remote_detail(order_id: i64) -> OrderDetail {
    serde_json::from_value(serde_json::json!({
        "id": order_id,
        "name": format!("#{}", 1000 + order_id),
        "email": "rider@example.com",
        "customer": { "first_name": "Joe", "last_name": "Rider" },
        "created_at": "2024-03-01T10:00:00+00:00",
        "fulfillment_status": "partial",
        "line_items": [
            { "id": order_id * 10, "sku": format!("HD-{}", order_id), "title": "Part", "quantity": 2, "price": "15.00" },
            { "id": order_id * 10 + 1, "sku": null, "title": "Shop supply", "quantity": 1, "price": "0.50" },
        ],
    }))
    .unwrap()
}

/// Scripted order source: serves a fixed order set in pages, optionally
/// failing the first detail fetch for selected orders, optionally pausing
/// a controller on the Nth detail call.
#[derive(Clone, Default)]
struct ScriptedSource {
    orders: Vec<RemoteOrder>,
    fail_once: Arc<Mutex<HashSet<i64>>>,
    detail_calls: Arc<Mutex<Vec<i64>>>,
    pause_after: Option<(usize, SyncController)>,
    count_error: bool,
}

impl ScriptedSource {
    fn with_orders(n: i64) -> Self {
        Self {
            orders: (1..=n).map(remote_order).collect(),
            ..Default::default()
        }
    }

    async fn detail_calls(&self) -> Vec<i64> {
        self.detail_calls.lock().await.clone()
    }
}

#[async_trait]
impl OrderSource for ScriptedSource {
    async fn count_open_orders(&self) -> Result<i64> {
        if self.count_error {
            return Err(anyhow!("remote unreachable"));
        }
        Ok(self.orders.len() as i64)
    }

    async fn list_open_orders(&self, page: usize, page_size: usize) -> Result<Vec<RemoteOrder>> {
        let start = (page - 1) * page_size;
        Ok(self
            .orders
            .iter()
            .skip(start)
            .take(page_size)
            .cloned()
            .collect())
    }

    async fn order_detail(&self, remote_order_id: i64) -> Result<OrderDetail> {
        let calls = {
            let mut calls = self.detail_calls.lock().await;
            calls.push(remote_order_id);
            calls.len()
        };
        // One-shot trigger so a resumed run is not paused again.
        if let Some((after, controller)) = &self.pause_after {
            if calls == *after {
                controller.pause();
            }
        }
        if self.fail_once.lock().await.remove(&remote_order_id) {
            return Err(anyhow!("transient rate limit"));
        }
        Ok(remote_detail(remote_order_id))
    }
}

fn fast_opts(batch_size: usize, page_size: usize) -> SyncOptions {
    SyncOptions {
        batch_size,
        page_size,
        batch_delay: Duration::ZERO,
        retry_delay: Duration::ZERO,
    }
}

#[tokio::test]
async fn batch_partition_and_retry_convergence() {
    let pool = setup_pool().await;
    // 23 orders, batch size 5: primary batches of 5,5,5,5,3. Two orders in
    // the third batch fail their first attempt.
    let source = ScriptedSource::with_orders(23);
    source.fail_once.lock().await.extend([11, 13]);

    let mut runner = SyncRunner::new(&pool, &source, fast_opts(5, 50));
    let mut events = runner.subscribe();

    let outcome = runner.run(None).await.unwrap();
    let report = match outcome {
        SyncOutcome::Complete(report) => report,
        SyncOutcome::Paused(_) => panic!("run should not pause"),
    };

    assert_eq!(report.imported, 23);
    assert_eq!(report.failed, 0);
    assert_eq!(report.retried, 2);

    // 23 primary detail calls plus 2 sequential retries.
    assert_eq!(source.detail_calls().await.len(), 25);
    let retried: Vec<i64> = source.detail_calls().await[23..].to_vec();
    assert_eq!(retried, vec![11, 13]);

    let mut batch_sizes = Vec::new();
    let mut retry_events = 0;
    while let Ok(ev) = events.try_recv() {
        match ev.phase {
            SyncPhase::Importing => batch_sizes.push(ev.count),
            SyncPhase::Retrying => retry_events += 1,
            _ => {}
        }
    }
    assert_eq!(batch_sizes, vec![5, 5, 5, 5, 3]);
    assert_eq!(retry_events, 2);

    // End state: every order mirrored with its two line items.
    assert_eq!(db::count_orders(&pool).await.unwrap(), 23);
    assert_eq!(db::count_line_items(&pool).await.unwrap(), 46);
}

#[tokio::test]
async fn pause_resume_matches_uninterrupted_run() {
    // Straight-through run.
    let pool_a = setup_pool().await;
    let source_a = ScriptedSource::with_orders(12);
    let mut runner_a = SyncRunner::new(&pool_a, &source_a, fast_opts(4, 5));
    let report_a = match runner_a.run(None).await.unwrap() {
        SyncOutcome::Complete(report) => report,
        SyncOutcome::Paused(_) => panic!("unexpected pause"),
    };

    // Same input set, paused at a batch boundary mid-run. The source flips
    // the shared pause switch after the sixth detail call; the in-flight
    // batch still runs to completion before the pipeline yields.
    let pool_b = setup_pool().await;
    let controller = SyncController::new();
    let mut source_b = ScriptedSource::with_orders(12);
    source_b.pause_after = Some((6, controller.clone()));
    let mut runner_b =
        SyncRunner::new(&pool_b, &source_b, fast_opts(4, 5)).with_controller(controller.clone());

    let token = match runner_b.run(None).await.unwrap() {
        SyncOutcome::Paused(token) => token,
        SyncOutcome::Complete(_) => panic!("run should have paused"),
    };
    assert!(!token.done);
    assert!(token.imported < 12);

    // While paused, the persisted flag reports a still-running operation.
    let stored = db::read_sync_status(&pool_b).await.unwrap();
    assert_eq!(stored.status, SyncStatus::Background);

    controller.resume();
    let report_b = match runner_b.run(Some(token)).await.unwrap() {
        SyncOutcome::Complete(report) => report,
        SyncOutcome::Paused(_) => panic!("resumed run should complete"),
    };

    assert_eq!(report_a.imported, report_b.imported);
    assert_eq!(report_a.failed, report_b.failed);
    assert_eq!(
        db::count_orders(&pool_a).await.unwrap(),
        db::count_orders(&pool_b).await.unwrap()
    );
    assert_eq!(
        db::count_line_items(&pool_a).await.unwrap(),
        db::count_line_items(&pool_b).await.unwrap()
    );
}

#[tokio::test]
async fn pause_carries_pre_pause_failures_into_the_resumed_run() {
    // Order 2 fails its first attempt in batch 1 and the run pauses at the
    // next batch boundary. The failure must ride the token and converge in
    // the retry pass of the resumed run.
    let pool = setup_pool().await;
    let controller = SyncController::new();
    let mut source = ScriptedSource::with_orders(8);
    source.fail_once.lock().await.insert(2);
    source.pause_after = Some((4, controller.clone()));
    let mut runner =
        SyncRunner::new(&pool, &source, fast_opts(4, 10)).with_controller(controller.clone());

    let token = match runner.run(None).await.unwrap() {
        SyncOutcome::Paused(token) => token,
        SyncOutcome::Complete(_) => panic!("run should have paused"),
    };
    assert_eq!(token.failed, 1);
    assert_eq!(token.retry, vec![2]);

    controller.resume();
    let report = match runner.run(Some(token)).await.unwrap() {
        SyncOutcome::Complete(report) => report,
        SyncOutcome::Paused(_) => panic!("resumed run should complete"),
    };
    assert_eq!(report.imported, 8);
    assert_eq!(report.failed, 0);
    assert_eq!(report.retried, 1);
    assert_eq!(db::count_orders(&pool).await.unwrap(), 8);

    // The recovered order carries the header fields the detail endpoint
    // returns, not placeholders.
    let orders = db::list_orders(&pool).await.unwrap();
    let recovered = orders.iter().find(|o| o.remote_id == 2).unwrap();
    assert_eq!(recovered.number, "#1002");
    assert_eq!(recovered.customer_name.as_deref(), Some("Joe Rider"));
    assert_eq!(recovered.customer_email.as_deref(), Some("rider@example.com"));
}

#[tokio::test]
async fn terminal_token_short_circuits() {
    let pool = setup_pool().await;
    let source = ScriptedSource::with_orders(5);
    let mut runner = SyncRunner::new(&pool, &source, fast_opts(5, 10));

    let report = match runner.run(None).await.unwrap() {
        SyncOutcome::Complete(report) => report,
        SyncOutcome::Paused(_) => panic!("unexpected pause"),
    };
    let calls_after_first = source.detail_calls().await.len();

    // Synchronize of a terminal state is the identity.
    let mut token = partsdesk::sync::ContinuationToken::new(Some(5));
    token.imported = report.imported;
    token.done = true;
    let again = match runner.run(Some(token)).await.unwrap() {
        SyncOutcome::Complete(report) => report,
        SyncOutcome::Paused(_) => panic!("unexpected pause"),
    };
    assert_eq!(again.imported, report.imported);
    assert_eq!(source.detail_calls().await.len(), calls_after_first);
}

#[tokio::test]
async fn unreachable_remote_sets_error_status() {
    let pool = setup_pool().await;
    let source = ScriptedSource {
        count_error: true,
        ..ScriptedSource::with_orders(3)
    };
    let mut runner = SyncRunner::new(&pool, &source, fast_opts(5, 10));
    assert!(runner.run(None).await.is_err());

    let stored = db::read_sync_status(&pool).await.unwrap();
    assert_eq!(stored.status, SyncStatus::Error);
}

#[tokio::test]
async fn zero_expected_orders_is_fatal() {
    let pool = setup_pool().await;
    let source = ScriptedSource::with_orders(0);
    let mut runner = SyncRunner::new(&pool, &source, fast_opts(5, 10));
    assert!(runner.run(None).await.is_err());
    let stored = db::read_sync_status(&pool).await.unwrap();
    assert_eq!(stored.status, SyncStatus::Error);
}

#[tokio::test]
async fn completed_run_resets_status_to_idle() {
    let pool = setup_pool().await;
    let source = ScriptedSource::with_orders(3);
    let mut runner = SyncRunner::new(&pool, &source, fast_opts(2, 10));
    runner.run(None).await.unwrap();

    let stored = db::read_sync_status(&pool).await.unwrap();
    assert_eq!(stored.status, SyncStatus::Idle);
    assert!(db::get_setting(&pool, db::keys::LAST_SYNC_AT)
        .await
        .unwrap()
        .is_some());
}
