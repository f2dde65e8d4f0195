use crate::connection::map_db_error;
use crate::error::TransferError;
use crate::mapper;
use crate::models::{CronJobSummary, ImportJob, LegacyScheduleEntry};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use deadpool_tiberius::Pool;

/// Persistence boundary for job discovery and run-state bookkeeping. The
/// scheduler only talks to this trait; tests swap in an in-memory fake.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Legacy Scheduler rows with `next_update <= now` that are active.
    async fn due_legacy_entries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<LegacyScheduleEntry>, TransferError>;

    /// Every job carrying a non-empty cron expression.
    async fn cron_tagged_jobs(&self) -> Result<Vec<CronJobSummary>, TransferError>;

    /// Full job definition including mapping and scripts.
    async fn full_job(&self, job_id: i64) -> Result<Option<ImportJob>, TransferError>;

    /// Stores the derived last/next update pair for a legacy entry.
    async fn record_legacy_run(
        &self,
        entry_id: i64,
        last_update: DateTime<Utc>,
        next_update: DateTime<Utc>,
    ) -> Result<(), TransferError>;

    async fn record_last_run(&self, job_id: i64, when: DateTime<Utc>)
        -> Result<(), TransferError>;

    async fn record_next_run(&self, job_id: i64, when: DateTime<Utc>)
        -> Result<(), TransferError>;
}

/// Repository over the Scheduler / ImportData tables.
pub struct MssqlJobRepository {
    pool: Pool,
}

fn utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&naive)
}

impl MssqlJobRepository {
    pub fn new(pool: Pool) -> Self {
        MssqlJobRepository { pool }
    }

    /// Adds the LastRunDateTime / NextRunDateTime columns when an older
    /// ImportData schema predates them. Runs once at startup.
    pub async fn ensure_run_state_columns(&self) -> Result<(), TransferError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransferError::Connection(e.to_string()))?;
        conn.execute(
            "IF NOT EXISTS (SELECT 1 FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_NAME = 'ImportData' AND COLUMN_NAME = 'LastRunDateTime') \
             ALTER TABLE ImportData ADD LastRunDateTime DATETIME NULL;\n\
             IF NOT EXISTS (SELECT 1 FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_NAME = 'ImportData' AND COLUMN_NAME = 'NextRunDateTime') \
             ALTER TABLE ImportData ADD NextRunDateTime DATETIME NULL;",
            &[],
        )
        .await
        .map_err(map_db_error)?;
        Ok(())
    }
}

#[async_trait]
impl JobRepository for MssqlJobRepository {
    async fn due_legacy_entries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<LegacyScheduleEntry>, TransferError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransferError::Connection(e.to_string()))?;
        let rows = conn
            .query(
                "SELECT Id, Cron, LastUpdateDateTime, NextUpdateDatetime, ImportId, CreatedDate, IsActive \
                 FROM Scheduler \
                 WHERE NextUpdateDatetime <= @P1 AND IsActive = 1",
                &[&now.naive_utc()],
            )
            .await
            .map_err(map_db_error)?
            .into_first_result()
            .await
            .map_err(map_db_error)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(LegacyScheduleEntry {
                id: row
                    .try_get::<i32, _>("Id")
                    .map_err(map_db_error)?
                    .unwrap_or_default() as i64,
                cron: row
                    .try_get::<&str, _>("Cron")
                    .map_err(map_db_error)?
                    .map(str::to_string),
                last_update: row
                    .try_get::<NaiveDateTime, _>("LastUpdateDateTime")
                    .map_err(map_db_error)?
                    .map(utc)
                    .unwrap_or_else(Utc::now),
                next_update: row
                    .try_get::<NaiveDateTime, _>("NextUpdateDatetime")
                    .map_err(map_db_error)?
                    .map(utc)
                    .unwrap_or_else(Utc::now),
                import_job_id: row
                    .try_get::<i32, _>("ImportId")
                    .map_err(map_db_error)?
                    .unwrap_or_default() as i64,
                created_at: row
                    .try_get::<NaiveDateTime, _>("CreatedDate")
                    .map_err(map_db_error)?
                    .map(utc)
                    .unwrap_or_else(Utc::now),
                active: row
                    .try_get::<bool, _>("IsActive")
                    .map_err(map_db_error)?
                    .unwrap_or(true),
            });
        }
        Ok(entries)
    }

    async fn cron_tagged_jobs(&self) -> Result<Vec<CronJobSummary>, TransferError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransferError::Connection(e.to_string()))?;
        let rows = conn
            .query(
                "SELECT Id, Name, CronJob, CreatedDate, LastRunDateTime \
                 FROM ImportData \
                 WHERE CronJob IS NOT NULL AND CronJob <> ''",
                &[],
            )
            .await
            .map_err(map_db_error)?
            .into_first_result()
            .await
            .map_err(map_db_error)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(CronJobSummary {
                id: row
                    .try_get::<i32, _>("Id")
                    .map_err(map_db_error)?
                    .unwrap_or_default() as i64,
                name: row
                    .try_get::<&str, _>("Name")
                    .map_err(map_db_error)?
                    .unwrap_or_default()
                    .to_string(),
                cron: row
                    .try_get::<&str, _>("CronJob")
                    .map_err(map_db_error)?
                    .unwrap_or_default()
                    .to_string(),
                created_at: row
                    .try_get::<NaiveDateTime, _>("CreatedDate")
                    .map_err(map_db_error)?
                    .map(utc)
                    .unwrap_or_else(Utc::now),
                last_run_at: row
                    .try_get::<NaiveDateTime, _>("LastRunDateTime")
                    .map_err(map_db_error)?
                    .map(utc),
            });
        }
        Ok(jobs)
    }

    async fn full_job(&self, job_id: i64) -> Result<Option<ImportJob>, TransferError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransferError::Connection(e.to_string()))?;
        let row = conn
            .query(
                "SELECT Id, Name, FromConnectionId, ToConnectionId, FromTable, ToTable, \
                        Query, FromColumnList, ToColumnList, MappedColumnList, \
                        BeforeQuery, AfterQuery, IsTruncate, IsDelete, CronJob, \
                        CreatedDate, LastRunDateTime, NextRunDateTime, IsActive \
                 FROM ImportData WHERE Id = @P1",
                &[&(job_id as i32)],
            )
            .await
            .map_err(map_db_error)?
            .into_row()
            .await
            .map_err(map_db_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let text = |name: &str| -> Result<Option<String>, TransferError> {
            Ok(row
                .try_get::<&str, _>(name)
                .map_err(map_db_error)?
                .map(str::to_string))
        };

        let from_column_list = text("FromColumnList")?.unwrap_or_default();
        let to_column_list = text("ToColumnList")?.unwrap_or_default();
        let mapped_column_list = text("MappedColumnList")?.unwrap_or_default();

        // A malformed column-list triple is kept as an empty mapping so the
        // executor reports it as a definition failure with the job's name
        // attached, instead of the fetch silently swallowing the job.
        let mapping = match mapper::rules_from_delimited_lists(
            &from_column_list,
            &to_column_list,
            &mapped_column_list,
        ) {
            Ok(rules) => rules,
            Err(err) => {
                log::warn!("Import job {} has unusable column lists: {}", job_id, err);
                Vec::new()
            }
        };

        Ok(Some(ImportJob {
            id: job_id,
            name: text("Name")?.unwrap_or_default(),
            from_data_source_id: row
                .try_get::<i32, _>("FromConnectionId")
                .map_err(map_db_error)?
                .unwrap_or_default() as i64,
            to_data_source_id: row
                .try_get::<i32, _>("ToConnectionId")
                .map_err(map_db_error)?
                .unwrap_or_default() as i64,
            from_table: text("FromTable")?.unwrap_or_default(),
            to_table: text("ToTable")?.unwrap_or_default(),
            source_query: text("Query")?,
            mapping,
            before_script: text("BeforeQuery")?,
            after_script: text("AfterQuery")?,
            truncate: row
                .try_get::<bool, _>("IsTruncate")
                .map_err(map_db_error)?
                .unwrap_or(false),
            delete: row
                .try_get::<bool, _>("IsDelete")
                .map_err(map_db_error)?
                .unwrap_or(false),
            cron: text("CronJob")?,
            created_at: row
                .try_get::<NaiveDateTime, _>("CreatedDate")
                .map_err(map_db_error)?
                .map(utc)
                .unwrap_or_else(Utc::now),
            last_run_at: row
                .try_get::<NaiveDateTime, _>("LastRunDateTime")
                .map_err(map_db_error)?
                .map(utc),
            next_run_at: row
                .try_get::<NaiveDateTime, _>("NextRunDateTime")
                .map_err(map_db_error)?
                .map(utc),
            active: row
                .try_get::<bool, _>("IsActive")
                .map_err(map_db_error)?
                .unwrap_or(true),
        }))
    }

    async fn record_legacy_run(
        &self,
        entry_id: i64,
        last_update: DateTime<Utc>,
        next_update: DateTime<Utc>,
    ) -> Result<(), TransferError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransferError::Connection(e.to_string()))?;
        conn.execute(
            "UPDATE Scheduler SET LastUpdateDateTime = @P1, NextUpdateDatetime = @P2 WHERE Id = @P3",
            &[
                &last_update.naive_utc(),
                &next_update.naive_utc(),
                &(entry_id as i32),
            ],
        )
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn record_last_run(
        &self,
        job_id: i64,
        when: DateTime<Utc>,
    ) -> Result<(), TransferError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransferError::Connection(e.to_string()))?;
        conn.execute(
            "UPDATE ImportData SET LastRunDateTime = @P1 WHERE Id = @P2",
            &[&when.naive_utc(), &(job_id as i32)],
        )
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn record_next_run(
        &self,
        job_id: i64,
        when: DateTime<Utc>,
    ) -> Result<(), TransferError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransferError::Connection(e.to_string()))?;
        conn.execute(
            "UPDATE ImportData SET NextRunDateTime = @P1 WHERE Id = @P2",
            &[&when.naive_utc(), &(job_id as i32)],
        )
        .await
        .map_err(map_db_error)?;
        Ok(())
    }
}
