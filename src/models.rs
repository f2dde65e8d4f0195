use crate::mapper::ColumnMappingRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// One import job as authored by the management surface. The scheduler only
/// ever mutates `last_run_at` / `next_run_at` through the repository.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: i64,
    pub name: String,
    pub from_data_source_id: i64,
    pub to_data_source_id: i64,
    pub from_table: String,
    pub to_table: String,
    /// Ad-hoc source query; takes precedence over `from_table` when present.
    #[serde(default)]
    pub source_query: Option<String>,
    #[serde(default)]
    pub mapping: Vec<ColumnMappingRule>,
    #[serde(default)]
    pub before_script: Option<String>,
    #[serde(default)]
    pub after_script: Option<String>,
    #[serde(default)]
    pub truncate: bool,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub cron: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl ImportJob {
    pub fn trimmed_cron(&self) -> Option<&str> {
        self.cron
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn trimmed_source_query(&self) -> Option<&str> {
        self.source_query
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn trimmed_before_script(&self) -> Option<&str> {
        self.before_script
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn trimmed_after_script(&self) -> Option<&str> {
        self.after_script
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// True when the run starts with a destructive clear or a before-script,
    /// which is exactly when FK constraints get suspended.
    pub fn needs_fk_suspension(&self) -> bool {
        self.truncate || self.delete || self.trimmed_before_script().is_some()
    }
}

/// Light row used by the cron pass; the full job (with mapping and scripts)
/// is only fetched once the job is actually due.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CronJobSummary {
    pub id: i64,
    pub name: String,
    pub cron: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Row of the legacy fixed-interval Scheduler table. Predates cron-on-job;
/// `next_update` is always derived by the worker, never authored directly.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LegacyScheduleEntry {
    pub id: i64,
    #[serde(default)]
    pub cron: Option<String>,
    pub last_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
    pub import_job_id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl LegacyScheduleEntry {
    pub fn has_cron_hint(&self) -> bool {
        self.cron
            .as_deref()
            .map(str::trim)
            .map(|value| !value.is_empty())
            .unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionSide {
    Source,
    Destination,
}

impl ConnectionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionSide::Source => "source",
            ConnectionSide::Destination => "destination",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    SqlPassword,
    Windows,
}

/// Fully resolved, credentialed endpoint for one side of a job. The password
/// arrives already decrypted.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub auth_mode: AuthMode,
    pub username: String,
    pub password: String,
}

/// Result of one transfer attempt.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub success: bool,
    pub rows_transferred: u64,
    pub duration_ms: u64,
    pub messages: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TransferOutcome {
    pub fn failed(error: impl Into<String>, duration_ms: u64, messages: Vec<String>) -> Self {
        TransferOutcome {
            success: false,
            rows_transferred: 0,
            duration_ms,
            messages,
            error: Some(error.into()),
        }
    }
}
