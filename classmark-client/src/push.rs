//! Push Engine
//!
//! Drains the outbox in batches while the device is online. Each batch is
//! one `POST /sync/push` call; per-item results decide whether a mutation
//! is acknowledged, retried later, or given up on. Whole-call failures are
//! classified by [`TransportError::failure_class`].

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use classmark_core::{
    ClassmarkResult, FailureClass, FailureKind, PushErrorKind, PushItemResult, PushRequest,
    PushStatus, QueuedMutation, SyncConfig, TempId, TransportError,
};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::connectivity::ConnectivityMonitor;
use crate::flight::FlightGuard;
use crate::outbox::{FailureOutcome, Outbox};
use crate::transport::SyncTransport;

/// A mutation the user needs to look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalFailure {
    pub temp_id: TempId,
    pub entity_type: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of one push cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Push calls made.
    pub batches: usize,
    pub synced: usize,
    /// Items rescheduled for a later attempt.
    pub retrying: usize,
    pub terminal: Vec<TerminalFailure>,
    /// The cycle stopped early because of cancellation, lost connectivity
    /// or a retryable whole-call failure.
    pub aborted: bool,
    /// Another cycle was already running, or the device was offline.
    pub skipped: bool,
}

impl PushReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

enum BatchOutcome {
    Continue,
    Stop,
}

/// Sends queued mutations to the server.
pub struct PushEngine {
    outbox: Arc<Outbox>,
    transport: Arc<dyn SyncTransport>,
    connectivity: ConnectivityMonitor,
    config: SyncConfig,
    in_flight: AtomicBool,
}

impl PushEngine {
    pub fn new(
        outbox: Arc<Outbox>,
        transport: Arc<dyn SyncTransport>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Self {
        Self {
            outbox,
            transport,
            connectivity,
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Send ready mutations until the outbox has nothing sendable, the
    /// per-cycle batch limit is hit, or the cycle is stopped.
    ///
    /// At most one cycle runs at a time; a concurrent call returns
    /// [`PushReport::skipped`].
    pub async fn run_push_cycle(&self, cancel: &CancelToken) -> ClassmarkResult<PushReport> {
        let Some(_guard) = FlightGuard::try_acquire(&self.in_flight) else {
            debug!("Push cycle already running");
            return Ok(PushReport::skipped());
        };
        if !self.connectivity.is_connected() {
            return Ok(PushReport::skipped());
        }

        let mut report = PushReport::default();
        while report.batches < self.config.max_batches_per_cycle {
            if cancel.is_cancelled() || !self.connectivity.is_connected() {
                report.aborted = true;
                break;
            }

            let batch = self.outbox.peek_batch(self.config.max_batch_size).await;
            if batch.is_empty() {
                break;
            }
            report.batches += 1;

            match self.send_batch(batch, &mut report).await {
                Ok(BatchOutcome::Continue) => {}
                Ok(BatchOutcome::Stop) => {
                    report.aborted = true;
                    break;
                }
                Err(err) => {
                    // Items of the failed batch would otherwise stay Sending
                    // and never be offered again.
                    if let Err(reset_err) = self.outbox.reset_in_flight().await {
                        warn!(error = %reset_err, "Failed to release in-flight mutations");
                    }
                    warn!(error = %err, batches = report.batches, "Push cycle failed");
                    return Err(err);
                }
            }
        }

        if report.aborted {
            self.outbox.reset_in_flight().await?;
        }
        info!(
            batches = report.batches,
            synced = report.synced,
            retrying = report.retrying,
            terminal = report.terminal.len(),
            aborted = report.aborted,
            "Push cycle finished"
        );
        Ok(report)
    }

    async fn send_batch(
        &self,
        batch: Vec<QueuedMutation>,
        report: &mut PushReport,
    ) -> ClassmarkResult<BatchOutcome> {
        let temp_ids: Vec<TempId> = batch.iter().map(|m| m.temp_id.clone()).collect();
        let request = PushRequest {
            items: batch.iter().map(QueuedMutation::to_push_item).collect(),
        };
        let mut sent: HashMap<TempId, QueuedMutation> = batch
            .into_iter()
            .map(|m| (m.temp_id.clone(), m))
            .collect();

        self.outbox.mark_sending(&temp_ids).await?;
        debug!(items = temp_ids.len(), "Sending push batch");

        let response = match tokio::time::timeout(
            self.config.request_timeout,
            self.transport.push(&request),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return self.fail_batch(&temp_ids, &sent, err, report).await,
            Err(_) => {
                let err = TransportError::Timeout(self.config.request_timeout);
                return self.fail_batch(&temp_ids, &sent, err, report).await;
            }
        };

        for result in response.results {
            let Some(mutation) = sent.remove(&result.temp_id) else {
                warn!(temp_id = %result.temp_id, "Push result for an item not in this batch");
                continue;
            };
            self.apply_result(&mutation, result, report).await?;
        }

        // Anything the server did not answer for has an unknown outcome.
        for mutation in sent.values() {
            self.record_failure(
                mutation,
                FailureClass::Retryable,
                FailureKind::Transport,
                "no result returned for item".to_string(),
                report,
            )
            .await?;
        }
        Ok(BatchOutcome::Continue)
    }

    async fn apply_result(
        &self,
        mutation: &QueuedMutation,
        result: PushItemResult,
        report: &mut PushReport,
    ) -> ClassmarkResult<()> {
        match (result.status, result.server_id) {
            (PushStatus::Success, Some(server_id)) => {
                self.outbox.mark_synced(&mutation.temp_id, &server_id).await?;
                report.synced += 1;
                Ok(())
            }
            (PushStatus::Success, None) => {
                self.record_failure(
                    mutation,
                    FailureClass::Retryable,
                    FailureKind::Server,
                    "success result without server id".to_string(),
                    report,
                )
                .await
            }
            (PushStatus::Error, _) => {
                let (class, kind) = match result.error_kind {
                    Some(PushErrorKind::Server) => (FailureClass::Retryable, FailureKind::Server),
                    Some(PushErrorKind::Conflict) => (FailureClass::Terminal, FailureKind::Conflict),
                    Some(PushErrorKind::Validation) | None => {
                        (FailureClass::Terminal, FailureKind::Validation)
                    }
                };
                let message = result
                    .error
                    .unwrap_or_else(|| "rejected by server".to_string());
                self.record_failure(mutation, class, kind, message, report)
                    .await
            }
        }
    }

    async fn fail_batch(
        &self,
        temp_ids: &[TempId],
        sent: &HashMap<TempId, QueuedMutation>,
        err: TransportError,
        report: &mut PushReport,
    ) -> ClassmarkResult<BatchOutcome> {
        warn!(error = %err, items = temp_ids.len(), "Push call failed");

        // The request never left the device, so the attempt does not count.
        if let TransportError::Connectivity(_) = err {
            self.outbox.requeue(temp_ids).await?;
            return Ok(BatchOutcome::Stop);
        }

        let class = err.failure_class();
        let kind = match (&err, class) {
            (TransportError::Http { status, .. }, _) if *status >= 500 => FailureKind::Server,
            (_, FailureClass::Terminal) => FailureKind::Validation,
            _ => FailureKind::Transport,
        };
        for temp_id in temp_ids {
            if let Some(mutation) = sent.get(temp_id) {
                self.record_failure(mutation, class, kind, err.to_string(), report)
                    .await?;
            }
        }

        Ok(match class {
            FailureClass::Retryable => BatchOutcome::Stop,
            FailureClass::Terminal => BatchOutcome::Continue,
        })
    }

    async fn record_failure(
        &self,
        mutation: &QueuedMutation,
        class: FailureClass,
        kind: FailureKind,
        message: String,
        report: &mut PushReport,
    ) -> ClassmarkResult<()> {
        let outcome = self
            .outbox
            .mark_failed(&mutation.temp_id, class, kind, message)
            .await?;
        match outcome {
            FailureOutcome::RetryScheduled { .. } => report.retrying += 1,
            FailureOutcome::Terminal { cascaded } => {
                if let Some(failed) = self.outbox.get(&mutation.temp_id).await {
                    report.terminal.push(terminal_failure(&failed));
                }
                for temp_id in cascaded {
                    if let Some(failed) = self.outbox.get(&temp_id).await {
                        report.terminal.push(terminal_failure(&failed));
                    }
                }
            }
        }
        Ok(())
    }
}

fn terminal_failure(mutation: &QueuedMutation) -> TerminalFailure {
    let (kind, message) = match &mutation.last_error {
        Some(err) => (err.kind, err.message.clone()),
        None => (FailureKind::Validation, String::new()),
    };
    TerminalFailure {
        temp_id: mutation.temp_id.clone(),
        entity_type: mutation.entity_type.clone(),
        kind,
        message,
    }
}
