//! Batch Synchronization Pipeline.
//!
//! Pulls open orders from the remote source in pages, imports them into the
//! local mirror in fixed-size batches with bounded concurrency, and persists
//! enough state (continuation token + status flag) that a long run can be
//! paused between batches and resumed by a later invocation, possibly from a
//! different process.

use crate::audit::AuditLog;
use crate::config;
use crate::db::{self, Pool};
use crate::model::{FulfillmentStatus, SyncStatus};
use crate::shopify::model::{RemoteLineItem, RemoteOrder};
use crate::shopify::OrderSource;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

/// Throughput tunables. None of these change the end state; any batch size
/// >= 1 imports the same rows.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub page_size: usize,
    pub batch_delay: Duration,
    pub retry_delay: Duration,
}

impl SyncOptions {
    pub fn from_config(sync: &config::Sync) -> Self {
        Self {
            batch_size: sync.batch_size.max(1),
            page_size: sync.page_size.max(1),
            batch_delay: sync.batch_delay(),
            retry_delay: sync.retry_delay(),
        }
    }
}

/// Serialized resumption state of one synchronization session. Opaque to
/// callers; must round-trip through `encode`/`decode` without loss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContinuationToken {
    pub page: usize,
    /// Orders of the current page already processed; a resume skips them so
    /// counts match an uninterrupted run exactly.
    pub page_offset: usize,
    pub imported: u64,
    pub failed: u64,
    /// Remote ids that failed their first attempt before the pause. Seeds
    /// the retry pass of the resumed run.
    #[serde(default)]
    pub retry: Vec<i64>,
    pub started_at: DateTime<Utc>,
    pub total_estimate: Option<i64>,
    pub done: bool,
}

impl ContinuationToken {
    pub fn new(total_estimate: Option<i64>) -> Self {
        Self {
            page: 1,
            page_offset: 0,
            imported: 0,
            failed: 0,
            retry: Vec::new(),
            started_at: Utc::now(),
            total_estimate,
            done: false,
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("token serializes")
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("invalid continuation token")
    }
}

/// Per-run counters, discarded at completion.
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retry_queue: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Counting,
    Importing,
    Retrying,
    Done,
}

/// Structured progress notification for any subscriber (UI, log, tests).
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub phase: SyncPhase,
    pub count: u64,
    pub message: String,
}

/// Cooperative pause switch, checked only at batch boundaries. An in-flight
/// batch always runs to completion.
#[derive(Clone, Default)]
pub struct SyncController {
    paused: Arc<AtomicBool>,
}

impl SyncController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub imported: u64,
    pub failed: u64,
    pub requests: u64,
    pub retried: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Complete(SyncReport),
    /// Paused between batches; re-invoke with this token to continue.
    Paused(ContinuationToken),
}

pub struct SyncRunner<'a> {
    pool: &'a Pool,
    source: &'a dyn OrderSource,
    opts: SyncOptions,
    controller: SyncController,
    events: Option<mpsc::UnboundedSender<ProgressEvent>>,
    audit: AuditLog,
}

impl<'a> SyncRunner<'a> {
    pub fn new(pool: &'a Pool, source: &'a dyn OrderSource, opts: SyncOptions) -> Self {
        Self {
            pool,
            source,
            opts,
            controller: SyncController::new(),
            events: None,
            audit: AuditLog::new(500),
        }
    }

    pub fn with_audit_cap(mut self, cap: usize) -> Self {
        self.audit = AuditLog::new(cap);
        self
    }

    /// Share a pause switch created elsewhere (e.g. a signal handler).
    pub fn with_controller(mut self, controller: SyncController) -> Self {
        self.controller = controller;
        self
    }

    /// Handle for requesting pause/resume from another task.
    pub fn controller(&self) -> SyncController {
        self.controller.clone()
    }

    /// Subscribe to structured progress events.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn take_audit(&mut self) -> Vec<String> {
        std::mem::replace(&mut self.audit, AuditLog::new(1)).into_vec()
    }

    fn emit(&self, phase: SyncPhase, count: u64, message: impl Into<String>) {
        if let Some(tx) = &self.events {
            // Subscriber may be gone; progress is best-effort.
            let _ = tx.send(ProgressEvent {
                phase,
                count,
                message: message.into(),
            });
        }
    }

    /// Synchronize all open orders, resuming from `token` when given.
    ///
    /// Returns `Paused` with the unconsumed token when a pause was requested
    /// at a batch boundary; resuming with that token is indistinguishable
    /// from an uninterrupted run.
    #[instrument(skip_all)]
    pub async fn run(&mut self, token: Option<ContinuationToken>) -> Result<SyncOutcome> {
        // A terminal token is already a completed run.
        if let Some(tok) = &token {
            if tok.done {
                return Ok(SyncOutcome::Complete(SyncReport {
                    imported: tok.imported,
                    failed: tok.failed,
                    requests: 0,
                    retried: 0,
                    started_at: tok.started_at,
                    finished_at: Utc::now(),
                }));
            }
        }

        let resuming = token.is_some();
        let mut token = match token {
            Some(tok) => tok,
            None => {
                let estimate = match self.source.count_open_orders().await {
                    Ok(n) => n,
                    Err(err) => {
                        self.audit.push(format!("remote unreachable: {:#}", err));
                        db::set_sync_status(self.pool, SyncStatus::Error).await?;
                        return Err(err.context("failed to establish sync run"));
                    }
                };
                if estimate == 0 {
                    self.audit.push("zero orders expected, refusing to run");
                    db::set_sync_status(self.pool, SyncStatus::Error).await?;
                    return Err(anyhow!("remote reports zero open orders"));
                }
                self.emit(SyncPhase::Counting, estimate as u64, "counted open orders");
                ContinuationToken::new(Some(estimate))
            }
        };

        let status = if resuming {
            SyncStatus::Background
        } else {
            SyncStatus::Importing
        };
        db::set_sync_status(self.pool, status).await?;
        self.audit.push(format!(
            "sync started (page {}, {} imported so far)",
            token.page, token.imported
        ));

        // Failures recorded before a pause ride along in the token.
        let mut stats = BatchStats {
            retry_queue: std::mem::take(&mut token.retry),
            ..BatchStats::default()
        };
        let outcome = self.run_pages(&mut token, &mut stats).await;
        match outcome {
            Ok(true) => {}
            Ok(false) => {
                // Pause requested between batches; the operation is still in
                // flight from an observer's point of view.
                db::set_sync_status(self.pool, SyncStatus::Background).await?;
                token.retry = std::mem::take(&mut stats.retry_queue);
                self.audit.push(format!("paused at page {}", token.page));
                return Ok(SyncOutcome::Paused(token));
            }
            Err(err) => {
                db::set_sync_status(self.pool, SyncStatus::Error).await?;
                self.audit.push(format!("sync failed: {:#}", err));
                return Err(err);
            }
        }

        self.retry_failed(&mut token, &mut stats).await;
        token.done = true;

        db::set_setting(self.pool, db::keys::LAST_SYNC_AT, &Utc::now().to_rfc3339()).await?;
        db::set_sync_status(self.pool, SyncStatus::Idle).await?;
        self.emit(SyncPhase::Done, token.imported, "sync complete");
        self.audit.push(format!(
            "sync complete: {} imported, {} failed",
            token.imported, token.failed
        ));

        Ok(SyncOutcome::Complete(SyncReport {
            imported: token.imported,
            failed: token.failed,
            requests: stats.requests,
            retried: stats.retry_queue.len() as u64,
            started_at: token.started_at,
            finished_at: Utc::now(),
        }))
    }

    /// Primary batch phase. Returns Ok(false) when paused, Ok(true) when the
    /// listing is exhausted.
    async fn run_pages(
        &mut self,
        token: &mut ContinuationToken,
        stats: &mut BatchStats,
    ) -> Result<bool> {
        loop {
            if self.controller.is_paused() {
                return Ok(false);
            }

            stats.requests += 1;
            let page = self
                .source
                .list_open_orders(token.page, self.opts.page_size)
                .await
                .with_context(|| format!("failed to list orders page {}", token.page))?;
            if page.is_empty() {
                return Ok(true);
            }

            let pending = &page[token.page_offset.min(page.len())..];
            let mut batches = pending.chunks(self.opts.batch_size).peekable();
            while let Some(batch) = batches.next() {
                if self.controller.is_paused() {
                    return Ok(false);
                }
                self.process_batch(batch, token, stats).await;
                token.page_offset += batch.len();
                db::touch_sync_heartbeat(self.pool).await?;
                if batches.peek().is_some() {
                    tokio::time::sleep(self.opts.batch_delay).await;
                }
            }

            token.page += 1;
            token.page_offset = 0;
            tokio::time::sleep(self.opts.batch_delay).await;
        }
    }

    /// Dispatch one batch concurrently and join. In-flight count never
    /// exceeds the batch size.
    async fn process_batch(
        &mut self,
        batch: &[RemoteOrder],
        token: &mut ContinuationToken,
        stats: &mut BatchStats,
    ) {
        let results = join_all(
            batch
                .iter()
                .map(|order| import_order(self.pool, self.source, order)),
        )
        .await;

        let mut batch_ok = 0u64;
        for (order, result) in batch.iter().zip(results) {
            stats.requests += 1;
            match result {
                Ok(()) => {
                    stats.succeeded += 1;
                    batch_ok += 1;
                    token.imported += 1;
                }
                Err(err) => {
                    warn!(remote_id = order.id, ?err, "order import failed");
                    self.audit
                        .push(format!("order {} failed: {:#}", order.id, err));
                    stats.failed += 1;
                    token.failed += 1;
                    stats.retry_queue.push(order.id);
                }
            }
        }
        self.emit(
            SyncPhase::Importing,
            batch.len() as u64,
            format!("batch done ({}/{} ok)", batch_ok, batch.len()),
        );
    }

    /// Failed items are retried once, sequentially, with a longer delay.
    /// Sequential retry maximizes the odds against transient rate limits.
    async fn retry_failed(&mut self, token: &mut ContinuationToken, stats: &mut BatchStats) {
        let queue = std::mem::take(&mut stats.retry_queue);
        for (i, remote_id) in queue.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.opts.retry_delay).await;
            }
            stats.requests += 1;
            match import_order_by_id(self.pool, self.source, *remote_id).await {
                Ok(()) => {
                    token.imported += 1;
                    token.failed = token.failed.saturating_sub(1);
                    stats.succeeded += 1;
                    stats.failed = stats.failed.saturating_sub(1);
                    self.audit.push(format!("retry succeeded for order {}", remote_id));
                }
                Err(err) => {
                    warn!(remote_id, ?err, "retry failed");
                    self.audit
                        .push(format!("retry failed for order {}: {:#}", remote_id, err));
                }
            }
            self.emit(SyncPhase::Retrying, 1, format!("retried order {}", remote_id));
        }
        stats.retry_queue = queue;
    }

    /// Narrow target: refresh a single order's mirror row and line items.
    #[instrument(skip_all, fields(remote_id))]
    pub async fn sync_order(&mut self, remote_id: i64) -> Result<()> {
        db::set_sync_status(self.pool, SyncStatus::Importing).await?;
        let res = import_order_by_id(self.pool, self.source, remote_id).await;
        match &res {
            Ok(()) => {
                self.audit.push(format!("order {} refreshed", remote_id));
                db::set_sync_status(self.pool, SyncStatus::Idle).await?;
            }
            Err(err) => {
                self.audit
                    .push(format!("order {} refresh failed: {:#}", remote_id, err));
                db::set_sync_status(self.pool, SyncStatus::Error).await?;
            }
        }
        res
    }
}

/// Fetch the detail for one listed order and upsert the mirror. A failure
/// here never unwinds the batch; callers record it and continue.
async fn import_order(pool: &Pool, source: &dyn OrderSource, order: &RemoteOrder) -> Result<()> {
    let detail = source
        .order_detail(order.id)
        .await
        .with_context(|| format!("failed to fetch detail for order {}", order.id))?;
    store_order(pool, order, &detail.line_items).await
}

/// Retry and single-order path: the detail endpoint returns the same header
/// fields as the listing, so a recovered order keeps its customer data.
async fn import_order_by_id(pool: &Pool, source: &dyn OrderSource, remote_id: i64) -> Result<()> {
    let detail = source
        .order_detail(remote_id)
        .await
        .with_context(|| format!("failed to fetch detail for order {}", remote_id))?;
    store_order(pool, &detail.order, &detail.line_items).await
}

async fn store_order(
    pool: &Pool,
    order: &RemoteOrder,
    line_items: &[RemoteLineItem],
) -> Result<()> {
    let import = db::OrderImport {
        remote_id: order.id,
        number: order.name.clone(),
        customer_name: order.customer.as_ref().and_then(|c| c.display_name()),
        customer_email: order.email.clone(),
        remote_created_at: order
            .created_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)),
        fulfillment_status: order
            .fulfillment_status
            .as_deref()
            .and_then(FulfillmentStatus::parse)
            .unwrap_or(FulfillmentStatus::Unfulfilled),
        items: line_items
            .iter()
            .map(|item| db::LineItemImport {
                sku: item.sku.clone(),
                title: item.title.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price(),
                location_id: item.assigned_location_id,
            })
            .collect(),
    };

    db::upsert_order_with_items(pool, &import)
        .await
        .with_context(|| format!("failed to store order {}", order.id))?;
    info!(remote_id = order.id, items = import.items.len(), "order imported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_through_json() {
        let tok = ContinuationToken {
            page: 7,
            page_offset: 10,
            imported: 31,
            failed: 2,
            retry: vec![101, 104],
            started_at: Utc::now(),
            total_estimate: Some(40),
            done: false,
        };
        let decoded = ContinuationToken::decode(&tok.encode()).unwrap();
        assert_eq!(decoded, tok);
    }

    #[test]
    fn token_decode_defaults_missing_retry_queue() {
        let raw = r#"{"page":2,"page_offset":0,"imported":5,"failed":1,"started_at":"2024-03-01T10:00:00Z","total_estimate":9,"done":false}"#;
        let tok = ContinuationToken::decode(raw).unwrap();
        assert!(tok.retry.is_empty());
        assert_eq!(tok.failed, 1);
    }

    #[test]
    fn token_decode_rejects_garbage() {
        assert!(ContinuationToken::decode("not json").is_err());
        assert!(ContinuationToken::decode("{}").is_err());
    }

    #[test]
    fn controller_toggles() {
        let ctl = SyncController::new();
        assert!(!ctl.is_paused());
        ctl.pause();
        assert!(ctl.is_paused());
        ctl.resume();
        assert!(!ctl.is_paused());
    }
}
