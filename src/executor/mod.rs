use crate::error::TransferError;
use crate::fk::{ConstraintCatalog, FkSuspension, ForeignKeyGuard};
use crate::mapper::{self, ColumnBinding, ResolvedMapping};
use crate::models::{ImportJob, TransferOutcome};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Forward-only, finite row cursor. Rows arrive through a bounded channel
/// from a reader task, so at most one batch worth of rows is ever buffered.
pub struct RowCursor {
    rx: mpsc::Receiver<Result<Vec<Value>, TransferError>>,
}

impl RowCursor {
    pub fn from_receiver(rx: mpsc::Receiver<Result<Vec<Value>, TransferError>>) -> Self {
        RowCursor { rx }
    }

    /// In-memory cursor over pre-built rows; used by fakes in tests.
    pub fn from_rows(rows: Vec<Vec<Value>>) -> Self {
        let (tx, rx) = mpsc::channel(rows.len().max(1));
        for row in rows {
            // Capacity covers every row, try_send cannot fail here.
            let _ = tx.try_send(Ok(row));
        }
        RowCursor { rx }
    }

    pub async fn next(&mut self) -> Result<Option<Vec<Value>>, TransferError> {
        match self.rx.recv().await {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn open_cursor(&self, query: &str) -> Result<RowCursor, TransferError>;
}

#[async_trait]
pub trait DestinationWriter: Send + Sync {
    /// Runs one command text on the destination management connection.
    async fn execute_command(&self, sql: &str) -> Result<(), TransferError>;

    /// Loads one batch through the resolved column bindings. Returns the
    /// number of rows written.
    async fn bulk_load(
        &self,
        table: &str,
        bindings: &[ColumnBinding],
        rows: &[Vec<Value>],
    ) -> Result<usize, TransferError>;
}

/// Per-job connection bundle: source read, destination write, destination
/// management (scripts, clears, constraint DDL). Dropping the session
/// releases all three.
pub struct TransferSession {
    pub source: Box<dyn SourceReader>,
    pub destination: Box<dyn DestinationWriter>,
    pub constraints: Box<dyn ConstraintCatalog>,
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, job: &ImportJob) -> Result<TransferSession, TransferError>;
}

/// Scheduler-facing execution boundary; the loop only sees outcomes, never
/// errors.
#[async_trait]
pub trait ImportExecutor: Send + Sync {
    async fn execute(&self, job: &ImportJob, cancel: &CancellationToken) -> TransferOutcome;
}

pub struct TransferExecutor {
    sessions: Arc<dyn SessionFactory>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl TransferExecutor {
    pub fn new(sessions: Arc<dyn SessionFactory>, batch_size: usize) -> Self {
        TransferExecutor {
            sessions,
            retry: RetryPolicy::default(),
            batch_size: batch_size.max(1),
        }
    }

    async fn run_steps(
        &self,
        job: &ImportJob,
        session: &TransferSession,
        mapping: &ResolvedMapping,
        suspension: &mut Option<FkSuspension>,
        messages: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let guard = ForeignKeyGuard::new(session.constraints.as_ref());
        let destination_table = mapper::table_reference(&job.to_table);

        // Step 1: suspend FK enforcement when the run clears or pre-scripts
        // the destination. A failed suspend is non-fatal.
        if job.needs_fk_suspension() {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            *suspension = guard.suspend(&destination_table).await;
            // A trivial suspension (no constraints found) issued no DDL, so
            // the run log stays quiet about it.
            if suspension
                .as_ref()
                .is_some_and(|suspension| !suspension.constraints.is_empty())
            {
                messages.push(format!(
                    "Foreign key constraints suspended on {}",
                    destination_table
                ));
            }
        }

        // Step 2: before-script plus truncate/delete as one command text.
        if let Some(command) = build_clear_command(job, &destination_table) {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            self.retry
                .run("destination clear command", || {
                    session.destination.execute_command(&command)
                })
                .await?;
            if job.truncate {
                log::info!("Truncated table {}", destination_table);
                messages.push(format!("Truncated {}", destination_table));
            } else if job.delete {
                log::info!("Deleted all rows from {}", destination_table);
                messages.push(format!("Deleted all rows from {}", destination_table));
            }
        }

        // Step 3: source projection on top of the pre-resolved mapping.
        let source_query = mapper::build_source_query(job, &mapping.select_list)?;
        log::debug!("Source query for job {}: {}", job.id, source_query);

        // Step 4: stream the cursor into fixed-size batches. Bulk loads are
        // deliberately outside the retry policy; a replayed batch would
        // duplicate rows.
        let mut cursor = session.source.open_cursor(&source_query).await?;
        let mut batch: Vec<Vec<Value>> = Vec::with_capacity(self.batch_size);
        let mut total_rows = 0u64;

        while let Some(row) = cursor.next().await? {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            batch.push(row);
            if batch.len() >= self.batch_size {
                let written = session
                    .destination
                    .bulk_load(&destination_table, &mapping.bindings, &batch)
                    .await?;
                total_rows += written as u64;
                log::debug!(
                    "Copied {} rows to {}, total {}",
                    written,
                    destination_table,
                    total_rows
                );
                batch.clear();
            }
        }

        if !batch.is_empty() {
            let written = session
                .destination
                .bulk_load(&destination_table, &mapping.bindings, &batch)
                .await?;
            total_rows += written as u64;
            log::debug!(
                "Copied final {} rows to {}, total {}",
                written,
                destination_table,
                total_rows
            );
        }

        messages.push(format!(
            "Transferred {} rows to {}",
            total_rows, destination_table
        ));

        // Step 5: after-script.
        if let Some(after) = job.trimmed_after_script() {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            log::info!("Executing after-script for job {}", job.id);
            self.retry
                .run("after-script", || session.destination.execute_command(after))
                .await?;
            messages.push("After-script executed".to_string());
        }

        Ok(total_rows)
    }
}

#[async_trait]
impl ImportExecutor for TransferExecutor {
    async fn execute(&self, job: &ImportJob, cancel: &CancellationToken) -> TransferOutcome {
        log::info!("Starting import job: {} (ID: {})", job.name, job.id);
        let started = Instant::now();
        let mut messages = Vec::new();

        // Definition errors abort before any database I/O, including the
        // destructive clear.
        let mapping = match mapper::resolve_mapping(&job.mapping)
            .and_then(|mapping| mapper::validate_source(job).map(|_| mapping))
        {
            Ok(mapping) => mapping,
            Err(err) => {
                log::error!(
                    "Invalid mapping for import job {} (ID: {}): {}",
                    job.name,
                    job.id,
                    err
                );
                return TransferOutcome::failed(
                    err.to_string(),
                    started.elapsed().as_millis() as u64,
                    messages,
                );
            }
        };

        let session = match self.sessions.open(job).await {
            Ok(session) => session,
            Err(err) => {
                log::error!(
                    "Could not open connections for import job {} (ID: {}): {}",
                    job.name,
                    job.id,
                    err
                );
                return TransferOutcome::failed(
                    err.to_string(),
                    started.elapsed().as_millis() as u64,
                    messages,
                );
            }
        };

        let mut suspension: Option<FkSuspension> = None;
        let result = self
            .run_steps(job, &session, &mapping, &mut suspension, &mut messages, cancel)
            .await;

        // Step 6: resume runs on every exit path, including cancellation.
        if let Some(suspension) = &suspension {
            ForeignKeyGuard::new(session.constraints.as_ref())
                .resume(suspension)
                .await;
            if !suspension.constraints.is_empty() {
                messages.push(format!(
                    "Foreign key constraints resumed on {}",
                    suspension.table
                ));
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(rows) => {
                log::info!(
                    "Import job completed successfully: {} (ID: {}), {} rows in {}ms",
                    job.name,
                    job.id,
                    rows,
                    duration_ms
                );
                TransferOutcome {
                    success: true,
                    rows_transferred: rows,
                    duration_ms,
                    messages,
                    error: None,
                }
            }
            Err(err) => {
                log::error!(
                    "Error executing import job {} (ID: {}): {}",
                    job.name,
                    job.id,
                    err
                );
                TransferOutcome::failed(err.to_string(), duration_ms, messages)
            }
        }
    }
}

/// One command text combining the before-script and the requested clear.
/// The before-script is semicolon-terminated before the clear is appended.
fn build_clear_command(job: &ImportJob, destination_table: &str) -> Option<String> {
    let mut command = String::new();

    if let Some(before) = job.trimmed_before_script() {
        command.push_str(before);
        if !command.ends_with(';') {
            command.push(';');
        }
    }

    if job.truncate {
        command.push_str(&format!(" TRUNCATE TABLE {};", destination_table));
    } else if job.delete {
        command.push_str(&format!(" DELETE FROM {};", destination_table));
    }

    let command = command.trim().to_string();
    if command.is_empty() {
        None
    } else {
        Some(command)
    }
}
