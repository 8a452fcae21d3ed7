//! Background loop that drains the outbox into the bus.
//!
//! Each iteration: claim a batch under lease, publish rows in order, resolve
//! each row as processed or failed. Publish failures are recovered per row
//! through `mark_failed`; store failures are logged, counted, and followed by
//! an idle sleep (the affected leases expire on their own). Nothing escapes
//! the loop, and shutdown is only observed between iterations, so an
//! in-flight row always reaches processed/retry/dead-letter first.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bankrelay_core::Clock;
use bankrelay_events::{EventPublisher, OutboxEnvelope, SerializationError};

use crate::config::OutboxConfig;

use super::row::OutboxRow;
use super::store::{FailureOutcome, OutboxStore, OutboxStoreError};

/// Result of one claim/dispatch iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Rows whose resolution could not be written.
    pub store_errors: usize,
}

/// Processor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ProcessorStats {
    pub iterations: u64,
    pub rows_claimed: u64,
    pub rows_published: u64,
    pub rows_retried: u64,
    pub rows_dead_lettered: u64,
    pub store_errors: u64,
    pub uptime_secs: u64,
}

impl ProcessorStats {
    fn absorb(&mut self, report: &BatchReport) {
        self.rows_claimed += report.claimed as u64;
        self.rows_published += report.published as u64;
        self.rows_retried += report.retried as u64;
        self.rows_dead_lettered += report.dead_lettered as u64;
        self.store_errors += report.store_errors as u64;
    }
}

/// Handle to control a running processor.
#[derive(Debug)]
pub struct OutboxProcessorHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<ProcessorStats>>,
}

impl OutboxProcessorHandle {
    /// Request graceful shutdown and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "outbox processor task failed");
            }
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[derive(Debug, thiserror::Error)]
enum DeliveryError {
    #[error(transparent)]
    Envelope(#[from] SerializationError),
    #[error(transparent)]
    Publish(#[from] bankrelay_events::PublishError),
}

/// Outbox processor.
///
/// Any number of instances may run against the same store; the lease protocol
/// is the only coordination between them.
pub struct OutboxProcessor<S, P, C> {
    store: S,
    publisher: P,
    clock: C,
    config: OutboxConfig,
}

impl<S, P, C> OutboxProcessor<S, P, C>
where
    S: OutboxStore + 'static,
    P: EventPublisher + 'static,
    C: Clock + 'static,
{
    pub fn new(store: S, publisher: P, clock: C, config: OutboxConfig) -> Self {
        Self {
            store,
            publisher,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Run the loop on a tokio task.
    pub fn spawn(self) -> OutboxProcessorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ProcessorStats::default()));
        let join = tokio::spawn(self.run(shutdown_rx, stats.clone()));

        OutboxProcessorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    /// Loop until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, stats: Arc<Mutex<ProcessorStats>>) {
        let worker_id = self.config.worker_id.clone();
        info!(
            worker_id = %worker_id,
            topic = %self.config.topic,
            batch_size = self.config.batch_size,
            "outbox processor started"
        );
        let started = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.run_once().await {
                Ok(report) => {
                    let mut s = stats.lock().unwrap_or_else(|p| p.into_inner());
                    s.iterations += 1;
                    s.absorb(&report);
                    s.uptime_secs = started.elapsed().as_secs();
                    if report.claimed == 0 {
                        self.config.idle_interval
                    } else {
                        self.config.batch_pause
                    }
                }
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "failed to claim outbox batch");
                    let mut s = stats.lock().unwrap_or_else(|p| p.into_inner());
                    s.iterations += 1;
                    s.store_errors += 1;
                    s.uptime_secs = started.elapsed().as_secs();
                    self.config.idle_interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %worker_id, "outbox processor stopped");
    }

    /// One iteration: claim, publish, resolve.
    ///
    /// Only a failed claim is returned as an error; per-row failures are
    /// reflected in the report.
    pub async fn run_once(&self) -> Result<BatchReport, OutboxStoreError> {
        let now = self.clock.now();
        let batch = self
            .store
            .claim_batch(
                self.config.batch_size,
                &self.config.worker_id,
                self.config.lease,
                now,
            )
            .await?;

        let mut report = BatchReport {
            claimed: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }
        debug!(worker_id = %self.config.worker_id, claimed = batch.len(), "claimed outbox batch");

        for row in &batch {
            self.dispatch(row, &mut report).await;
        }
        Ok(report)
    }

    async fn dispatch(&self, row: &OutboxRow, report: &mut BatchReport) {
        let worker_id = self.config.worker_id.as_str();

        match self.deliver(row).await {
            Ok(()) => match self.store.mark_processed(row.id, self.clock.now()).await {
                Ok(()) => {
                    report.published += 1;
                    debug!(worker_id, outbox_id = %row.id, event_type = %row.event_type, "published");
                }
                Err(e) => {
                    report.store_errors += 1;
                    error!(worker_id, outbox_id = %row.id, error = %e, "failed to mark outbox row processed");
                }
            },
            Err(failure) => {
                let message = failure.to_string();
                warn!(
                    worker_id,
                    outbox_id = %row.id,
                    attempts = row.attempts + 1,
                    error = %message,
                    "publish failed"
                );

                match self
                    .store
                    .mark_failed(row.id, &message, self.clock.now(), &self.config.retry)
                    .await
                {
                    Ok(FailureOutcome::Retrying { attempts, next_attempt_at }) => {
                        report.retried += 1;
                        debug!(worker_id, outbox_id = %row.id, attempts, %next_attempt_at, "scheduled retry");
                    }
                    Ok(FailureOutcome::DeadLettered { attempts }) => {
                        report.dead_lettered += 1;
                        error!(worker_id, outbox_id = %row.id, attempts, error = %message, "outbox row dead-lettered");
                    }
                    Ok(FailureOutcome::Unchanged) => {}
                    Err(e) => {
                        report.store_errors += 1;
                        error!(worker_id, outbox_id = %row.id, error = %e, "failed to mark outbox row failed");
                    }
                }
            }
        }
    }

    async fn deliver(&self, row: &OutboxRow) -> Result<(), DeliveryError> {
        let envelope = OutboxEnvelope::new(
            row.event_type.clone(),
            row.id,
            row.occurred_at,
            row.correlation_id.clone(),
            row.aggregate_id.clone(),
            row.key.clone(),
            row.payload.clone(),
        )?;
        let message = envelope.to_json()?;

        self.publisher
            .publish(&self.config.topic, &envelope.partition_key(), &message)
            .await?;
        Ok(())
    }
}
