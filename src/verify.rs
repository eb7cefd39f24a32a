//! Reconciliation & Verification.
//!
//! Compares counts captured from the remote before a run against the local
//! mirror afterwards, and drives the complete-refresh workflow as one state
//! machine with a single transition function. A mismatch is a first-class
//! outcome, not an exception: a complete refresh enters Recovery Mode (import
//! retried, the delete never repeated), an incremental sync surfaces it as a
//! warning.

use crate::db::{self, CountSnapshot, Pool};
use crate::model::{SyncStatus, WorkflowState};
use crate::shopify::OrderSource;
use crate::sync::{ContinuationToken, SyncOptions, SyncOutcome, SyncReport, SyncRunner};
use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Counts captured against a known-good baseline before the destructive part
/// of a refresh begins. The remote count endpoint covers orders; a line-item
/// expectation is only present when a caller recorded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedCounts {
    pub orders: i64,
    pub line_items: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub expected: ExpectedCounts,
    pub actual: CountSnapshot,
    pub mismatch: bool,
}

/// Compare expected remote counts to the post-sync local mirror.
pub async fn verify(pool: &Pool, expected: ExpectedCounts) -> Result<VerifyReport> {
    let actual = db::count_snapshot(pool)
        .await
        .context("failed to count local mirror")?;
    let mismatch = actual.orders != expected.orders
        || expected
            .line_items
            .map(|e| e != actual.line_items)
            .unwrap_or(false);
    Ok(VerifyReport {
        expected,
        actual,
        mismatch,
    })
}

/// A local-store error during verification skips the pass instead of failing
/// the run.
pub async fn verify_or_skip(pool: &Pool, expected: ExpectedCounts) -> Option<VerifyReport> {
    match verify(pool, expected).await {
        Ok(report) => Some(report),
        Err(err) => {
            warn!(?err, "verification pass skipped");
            None
        }
    }
}

/// Capture the remote's own count before anything destructive runs, and
/// snapshot it to the settings keyspace for out-of-process observers.
pub async fn capture_expected_counts(
    pool: &Pool,
    source: &dyn OrderSource,
) -> Result<ExpectedCounts> {
    let orders = source
        .count_open_orders()
        .await
        .context("failed to fetch expected order count")?;
    db::set_setting(pool, db::keys::EXPECTED_ORDERS, &orders.to_string()).await?;
    Ok(ExpectedCounts {
        orders,
        line_items: None,
    })
}

/// Minimum interval between count queries while polling a background sync,
/// so verification never hammers the store.
#[derive(Debug)]
pub struct VerifyThrottle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl VerifyThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    fn ready_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Inputs to the refresh state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEvent {
    Start,
    DeleteFinished,
    ImportFinished,
    PauseRequested,
    Resumed,
    CountsMatch,
    CountsMismatch,
    RecoveryFinished,
    Fault,
}

/// The single transition function for the refresh workflow. Any combination
/// not listed is a fault.
pub fn step(state: WorkflowState, event: WorkflowEvent) -> WorkflowState {
    use WorkflowEvent as E;
    use WorkflowState as S;
    match (state, event) {
        (S::Idle, E::Start) => S::Deleting,
        (S::Deleting, E::DeleteFinished) => S::Importing,
        (S::Importing, E::ImportFinished) => S::Verifying,
        (S::Importing, E::PauseRequested) => S::Background,
        (S::Background, E::Resumed) => S::Importing,
        (S::Verifying, E::CountsMatch) => S::Success,
        (S::Verifying, E::CountsMismatch) => S::RecoveryMode,
        (S::RecoveryMode, E::RecoveryFinished) => S::Verifying,
        (S::RecoveryMode, E::PauseRequested) => S::Background,
        (S::RecoveryMode, E::CountsMismatch) => S::Error,
        (_, E::Fault) => S::Error,
        _ => S::Error,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    Success,
    SuccessWithMismatch,
    Failed,
}

#[derive(Debug)]
pub struct RefreshReport {
    pub status: FinalStatus,
    pub sync: Option<SyncReport>,
    pub verify: Option<VerifyReport>,
    pub recovered: bool,
    pub audit: Vec<String>,
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Finished(RefreshReport),
    /// Paused mid-import; re-invoke `RefreshDriver::run` with this token.
    /// `recovering` distinguishes the recovery import from the primary one so
    /// the delete phase is never repeated.
    Paused {
        token: ContinuationToken,
        recovering: bool,
    },
}

/// Drives the complete-refresh workflow: capture expected counts, bulk-delete
/// the mirror, re-import, verify, and recover from import divergence without
/// repeating the delete.
pub struct RefreshDriver<'a> {
    pool: &'a Pool,
    source: &'a dyn OrderSource,
    opts: SyncOptions,
    audit_cap: usize,
    state: WorkflowState,
}

impl<'a> RefreshDriver<'a> {
    pub fn new(pool: &'a Pool, source: &'a dyn OrderSource, opts: SyncOptions) -> Self {
        Self {
            pool,
            source,
            opts,
            audit_cap: 500,
            state: WorkflowState::Idle,
        }
    }

    pub fn with_audit_cap(mut self, cap: usize) -> Self {
        self.audit_cap = cap;
        self
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Run the workflow, optionally resuming a paused import. The resumed
    /// path skips Deleting entirely; a resumed recovery import goes straight
    /// back to RecoveryMode.
    pub async fn run(&mut self, resume: Option<(ContinuationToken, bool)>) -> Result<RefreshOutcome> {
        let mut runner =
            SyncRunner::new(self.pool, self.source, self.opts.clone()).with_audit_cap(self.audit_cap);

        let (token, mut recovering) = match resume {
            Some((token, recovering)) => {
                self.state = step(WorkflowState::Background, WorkflowEvent::Resumed);
                if recovering {
                    self.state = WorkflowState::RecoveryMode;
                }
                (Some(token), recovering)
            }
            None => {
                // Expectation first: captured against a known-good baseline
                // before anything is deleted.
                let expected = match capture_expected_counts(self.pool, self.source).await {
                    Ok(expected) if expected.orders > 0 => expected,
                    Ok(_) => {
                        self.state = step(self.state, WorkflowEvent::Fault);
                        db::set_sync_status(self.pool, SyncStatus::Error).await?;
                        return Err(anyhow::anyhow!(
                            "remote reports zero open orders; refusing to delete the mirror"
                        ));
                    }
                    Err(err) => {
                        self.state = step(self.state, WorkflowEvent::Fault);
                        db::set_sync_status(self.pool, SyncStatus::Error).await?;
                        return Err(err);
                    }
                };
                info!(expected = expected.orders, "starting complete refresh");

                self.state = step(self.state, WorkflowEvent::Start);
                let removed = db::delete_all_orders(self.pool).await?;
                info!(removed, "order mirror cleared");
                self.state = step(self.state, WorkflowEvent::DeleteFinished);
                (None, false)
            }
        };

        let mut sync_report = None;
        let mut verify_report = None;
        let mut recovered = false;
        let mut token = token;

        loop {
            match runner.run(token.take()).await {
                Ok(SyncOutcome::Paused(tok)) => {
                    self.state = step(self.state, WorkflowEvent::PauseRequested);
                    return Ok(RefreshOutcome::Paused {
                        token: tok,
                        recovering,
                    });
                }
                Ok(SyncOutcome::Complete(report)) => {
                    sync_report = Some(report);
                    let event = if recovering {
                        WorkflowEvent::RecoveryFinished
                    } else {
                        WorkflowEvent::ImportFinished
                    };
                    self.state = step(self.state, event);
                }
                Err(err) => {
                    self.state = step(self.state, WorkflowEvent::Fault);
                    return Ok(RefreshOutcome::Finished(RefreshReport {
                        status: FinalStatus::Failed,
                        sync: None,
                        verify: None,
                        recovered,
                        audit: {
                            let mut audit = runner.take_audit();
                            audit.push(format!("refresh failed: {:#}", err));
                            audit
                        },
                    }));
                }
            }

            let expected = self.load_expected().await?;
            match verify_or_skip(self.pool, expected).await {
                None => {
                    // Count query failed; skip this pass and call it clean.
                    self.state = step(self.state, WorkflowEvent::CountsMatch);
                    break;
                }
                Some(report) if !report.mismatch => {
                    self.state = step(self.state, WorkflowEvent::CountsMatch);
                    verify_report = Some(report);
                    break;
                }
                Some(report) => {
                    verify_report = Some(report);
                    if recovering {
                        // Recovery already ran once; surface the divergence.
                        self.state = step(WorkflowState::RecoveryMode, WorkflowEvent::CountsMismatch);
                        return Ok(RefreshOutcome::Finished(RefreshReport {
                            status: FinalStatus::SuccessWithMismatch,
                            sync: sync_report,
                            verify: verify_report,
                            recovered: true,
                            audit: runner.take_audit(),
                        }));
                    }
                    warn!("count mismatch after refresh import; entering recovery mode");
                    self.state = step(self.state, WorkflowEvent::CountsMismatch);
                    recovering = true;
                    recovered = true;
                    // Import only; the delete phase is never repeated.
                    token = None;
                }
            }
        }

        Ok(RefreshOutcome::Finished(RefreshReport {
            status: FinalStatus::Success,
            sync: sync_report,
            verify: verify_report,
            recovered,
            audit: runner.take_audit(),
        }))
    }

    async fn load_expected(&self) -> Result<ExpectedCounts> {
        let orders = db::get_setting(self.pool, db::keys::EXPECTED_ORDERS)
            .await?
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let line_items = db::get_setting(self.pool, db::keys::EXPECTED_LINE_ITEMS)
            .await?
            .and_then(|s| s.parse::<i64>().ok());
        Ok(ExpectedCounts { orders, line_items })
    }
}

#[derive(Debug)]
pub enum IncrementalOutcome {
    Finished {
        status: FinalStatus,
        sync: Option<SyncReport>,
        verify: Option<VerifyReport>,
        audit: Vec<String>,
    },
    Paused(ContinuationToken),
}

/// Incremental sync: no delete phase, mismatch is a warning rather than a
/// recovery trigger.
pub async fn run_incremental(
    pool: &Pool,
    source: &dyn OrderSource,
    opts: SyncOptions,
    resume: Option<ContinuationToken>,
) -> Result<IncrementalOutcome> {
    let expected = if resume.is_none() {
        Some(capture_expected_counts(pool, source).await?)
    } else {
        None
    };

    let mut runner = SyncRunner::new(pool, source, opts);
    match runner.run(resume).await {
        Ok(SyncOutcome::Paused(token)) => Ok(IncrementalOutcome::Paused(token)),
        Ok(SyncOutcome::Complete(report)) => {
            let expected = match expected {
                Some(expected) => expected,
                None => {
                    let orders = db::get_setting(pool, db::keys::EXPECTED_ORDERS)
                        .await?
                        .and_then(|s| s.parse::<i64>().ok())
                        .unwrap_or(0);
                    ExpectedCounts {
                        orders,
                        line_items: None,
                    }
                }
            };
            let verify = verify_or_skip(pool, expected).await;
            let status = match &verify {
                Some(report) if report.mismatch => {
                    warn!(
                        expected = report.expected.orders,
                        actual = report.actual.orders,
                        "incremental sync count mismatch"
                    );
                    FinalStatus::SuccessWithMismatch
                }
                _ => FinalStatus::Success,
            };
            Ok(IncrementalOutcome::Finished {
                status,
                sync: Some(report),
                verify,
                audit: runner.take_audit(),
            })
        }
        Err(_) => Ok(IncrementalOutcome::Finished {
            status: FinalStatus::Failed,
            sync: None,
            verify: None,
            audit: runner.take_audit(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkflowEvent as E;
    use WorkflowState as S;

    #[test]
    fn happy_path_transitions() {
        let mut state = S::Idle;
        for (event, expected) in [
            (E::Start, S::Deleting),
            (E::DeleteFinished, S::Importing),
            (E::ImportFinished, S::Verifying),
            (E::CountsMatch, S::Success),
        ] {
            state = step(state, event);
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn mismatch_enters_recovery_then_verifies_again() {
        let state = step(S::Verifying, E::CountsMismatch);
        assert_eq!(state, S::RecoveryMode);
        let state = step(state, E::RecoveryFinished);
        assert_eq!(state, S::Verifying);
    }

    #[test]
    fn pause_and_resume_round_trip() {
        let state = step(S::Importing, E::PauseRequested);
        assert_eq!(state, S::Background);
        assert_eq!(step(state, E::Resumed), S::Importing);
    }

    #[test]
    fn invalid_transitions_are_faults() {
        assert_eq!(step(S::Idle, E::CountsMatch), S::Error);
        assert_eq!(step(S::Success, E::Start), S::Error);
        assert_eq!(step(S::Deleting, E::Fault), S::Error);
    }

    #[test]
    fn throttle_enforces_min_interval() {
        let mut throttle = VerifyThrottle::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(throttle.ready_at(t0));
        assert!(!throttle.ready_at(t0 + Duration::from_secs(2)));
        assert!(throttle.ready_at(t0 + Duration::from_secs(6)));
    }
}
