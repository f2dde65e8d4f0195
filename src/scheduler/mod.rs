use crate::cron::CronSchedule;
use crate::error::TransferError;
use crate::executor::ImportExecutor;
use crate::models::{CronJobSummary, LegacyScheduleEntry};
use crate::repository::JobRepository;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Polls the repository on a fixed interval and runs every job that has come
/// due. Each cycle makes two passes: the legacy fixed-interval Scheduler
/// table, then the jobs carrying their own cron expression. A job listed in
/// both places runs in both passes; run-state is persisted after every
/// attempt, success or not, so a failing job waits for its next slot instead
/// of retrying on every poll.
pub struct Scheduler {
    repository: Arc<dyn JobRepository>,
    executor: Arc<dyn ImportExecutor>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

/// Interval the legacy table re-arms with: hourly when the row carries a
/// cron-style hint, daily otherwise.
pub fn legacy_next_update(has_cron_hint: bool, now: DateTime<Utc>) -> DateTime<Utc> {
    if has_cron_hint {
        now + ChronoDuration::hours(1)
    } else {
        now + ChronoDuration::days(1)
    }
}

/// A cron job is due when the first occurrence after its last run (or its
/// creation, if it never ran) is not in the future.
pub fn cron_job_due(
    schedule: &CronSchedule,
    last_run: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    match schedule.next_after(last_run.unwrap_or(created_at)) {
        Some(next) => next <= now,
        None => false,
    }
}

impl Scheduler {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        executor: Arc<dyn ImportExecutor>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Scheduler {
            repository,
            executor,
            poll_interval,
            cancel,
        }
    }

    pub async fn run(&self) {
        let worker_id = format!("dbshuttle-{}", Uuid::new_v4());
        log::info!(
            "Import worker {} started, polling every {}s",
            worker_id,
            self.poll_interval.as_secs()
        );

        loop {
            self.run_cycle(Utc::now()).await;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        log::info!("Import worker {} stopped", worker_id);
    }

    /// One polling cycle. Pass-level failures (the repository itself being
    /// unreachable) are logged and end the pass; per-job failures never stop
    /// the cycle.
    pub async fn run_cycle(&self, now: DateTime<Utc>) {
        if let Err(err) = self.legacy_pass(now).await {
            log::error!("Legacy schedule pass failed: {}", err);
        }
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(err) = self.cron_pass(now).await {
            log::error!("Cron schedule pass failed: {}", err);
        }
    }

    async fn legacy_pass(&self, now: DateTime<Utc>) -> Result<(), TransferError> {
        let entries = self.repository.due_legacy_entries(now).await?;
        if !entries.is_empty() {
            log::info!("{} legacy schedule entr(ies) due", entries.len());
        }

        for entry in entries {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Err(err) = self.run_legacy_entry(&entry, now).await {
                log::error!(
                    "Legacy schedule entry {} (job {}) failed: {}",
                    entry.id,
                    entry.import_job_id,
                    err
                );
            }
        }
        Ok(())
    }

    async fn run_legacy_entry(
        &self,
        entry: &LegacyScheduleEntry,
        now: DateTime<Utc>,
    ) -> Result<(), TransferError> {
        let Some(job) = self.repository.full_job(entry.import_job_id).await? else {
            log::warn!(
                "Legacy schedule entry {} points at missing import job {}",
                entry.id,
                entry.import_job_id
            );
            return Ok(());
        };

        let outcome = self.executor.execute(&job, &self.cancel).await;

        // Run-state is recorded no matter how the run went, so the entry
        // waits out its interval instead of re-firing every poll.
        let next = legacy_next_update(entry.has_cron_hint(), now);
        self.repository
            .record_legacy_run(entry.id, now, next)
            .await?;
        if job.trimmed_cron().is_some() {
            self.repository.record_last_run(job.id, now).await?;
        }

        if outcome.success {
            log::info!(
                "Legacy entry {} ran job {} ({}): {} rows in {}ms, next run {}",
                entry.id,
                job.id,
                job.name,
                outcome.rows_transferred,
                outcome.duration_ms,
                next
            );
        } else {
            log::warn!(
                "Legacy entry {} ran job {} ({}) with failure: {}",
                entry.id,
                job.id,
                job.name,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(())
    }

    async fn cron_pass(&self, now: DateTime<Utc>) -> Result<(), TransferError> {
        let jobs = self.repository.cron_tagged_jobs().await?;

        for summary in jobs {
            if self.cancel.is_cancelled() {
                break;
            }

            // An unparsable expression skips the job without touching its
            // run-state; the rest of the cycle continues.
            let schedule = match CronSchedule::parse(&summary.cron) {
                Ok(schedule) => schedule,
                Err(err) => {
                    log::error!(
                        "Skipping import job {} ({}): {}",
                        summary.id,
                        summary.name,
                        err
                    );
                    continue;
                }
            };

            if !cron_job_due(&schedule, summary.last_run_at, summary.created_at, now) {
                continue;
            }

            if let Err(err) = self.run_cron_job(&summary, &schedule, now).await {
                log::error!(
                    "Cron run for import job {} ({}) failed: {}",
                    summary.id,
                    summary.name,
                    err
                );
            }
        }
        Ok(())
    }

    async fn run_cron_job(
        &self,
        summary: &CronJobSummary,
        schedule: &CronSchedule,
        now: DateTime<Utc>,
    ) -> Result<(), TransferError> {
        let Some(job) = self.repository.full_job(summary.id).await? else {
            log::warn!("Cron-tagged import job {} disappeared", summary.id);
            return Ok(());
        };

        log::info!("Processing cron job: {} (ID: {})", job.name, job.id);
        let outcome = self.executor.execute(&job, &self.cancel).await;

        // Recorded unconditionally; a failed run waits for the next slot.
        self.repository.record_last_run(summary.id, now).await?;
        if let Some(next) = schedule.next_after(now) {
            self.repository.record_next_run(summary.id, next).await?;
            log::info!(
                "Job {} ({}) next run scheduled for {}",
                job.id,
                job.name,
                next
            );
        }

        if !outcome.success {
            log::warn!(
                "Cron job {} ({}) failed: {}",
                job.id,
                job.name,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
