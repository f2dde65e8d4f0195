use super::*;
use crate::models::{ImportJob, TransferOutcome};
use async_trait::async_trait;
use chrono::TimeZone;
use std::sync::Mutex;

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

fn job(id: i64, cron: Option<&str>) -> ImportJob {
    ImportJob {
        id,
        name: format!("job-{}", id),
        from_data_source_id: 1,
        to_data_source_id: 2,
        from_table: "Orders".to_string(),
        to_table: "OrdersArchive".to_string(),
        source_query: None,
        mapping: Vec::new(),
        before_script: None,
        after_script: None,
        truncate: false,
        delete: false,
        cron: cron.map(str::to_string),
        created_at: at(2024, 1, 1, 0, 0),
        last_run_at: None,
        next_run_at: None,
        active: true,
    }
}

fn summary(id: i64, cron: &str, last_run: Option<DateTime<Utc>>) -> CronJobSummary {
    CronJobSummary {
        id,
        name: format!("job-{}", id),
        cron: cron.to_string(),
        created_at: at(2024, 1, 1, 0, 0),
        last_run_at: last_run,
    }
}

fn entry(id: i64, job_id: i64, cron: Option<&str>) -> LegacyScheduleEntry {
    LegacyScheduleEntry {
        id,
        cron: cron.map(str::to_string),
        last_update: at(2024, 1, 1, 0, 0),
        next_update: at(2024, 1, 1, 1, 0),
        import_job_id: job_id,
        created_at: at(2024, 1, 1, 0, 0),
        active: true,
    }
}

#[derive(Default)]
struct RepoState {
    legacy_entries: Vec<LegacyScheduleEntry>,
    cron_jobs: Vec<CronJobSummary>,
    jobs: Vec<ImportJob>,
    legacy_runs: Vec<(i64, DateTime<Utc>, DateTime<Utc>)>,
    last_runs: Vec<(i64, DateTime<Utc>)>,
    next_runs: Vec<(i64, DateTime<Utc>)>,
    fail_full_job_for: Option<i64>,
}

struct FakeRepository {
    state: Mutex<RepoState>,
}

impl FakeRepository {
    fn new(state: RepoState) -> Self {
        FakeRepository {
            state: Mutex::new(state),
        }
    }
}

#[async_trait]
impl JobRepository for FakeRepository {
    async fn due_legacy_entries(
        &self,
        _now: DateTime<Utc>,
    ) -> Result<Vec<LegacyScheduleEntry>, TransferError> {
        Ok(self.state.lock().unwrap().legacy_entries.clone())
    }

    async fn cron_tagged_jobs(&self) -> Result<Vec<CronJobSummary>, TransferError> {
        Ok(self.state.lock().unwrap().cron_jobs.clone())
    }

    async fn full_job(&self, job_id: i64) -> Result<Option<ImportJob>, TransferError> {
        let state = self.state.lock().unwrap();
        if state.fail_full_job_for == Some(job_id) {
            return Err(TransferError::database(None, "deadlock victim"));
        }
        Ok(state.jobs.iter().find(|job| job.id == job_id).cloned())
    }

    async fn record_legacy_run(
        &self,
        entry_id: i64,
        last_update: DateTime<Utc>,
        next_update: DateTime<Utc>,
    ) -> Result<(), TransferError> {
        self.state
            .lock()
            .unwrap()
            .legacy_runs
            .push((entry_id, last_update, next_update));
        Ok(())
    }

    async fn record_last_run(
        &self,
        job_id: i64,
        when: DateTime<Utc>,
    ) -> Result<(), TransferError> {
        self.state.lock().unwrap().last_runs.push((job_id, when));
        Ok(())
    }

    async fn record_next_run(
        &self,
        job_id: i64,
        when: DateTime<Utc>,
    ) -> Result<(), TransferError> {
        self.state.lock().unwrap().next_runs.push((job_id, when));
        Ok(())
    }
}

struct FakeExecutor {
    executed: Mutex<Vec<i64>>,
    fail: bool,
}

impl FakeExecutor {
    fn new(fail: bool) -> Self {
        FakeExecutor {
            executed: Mutex::new(Vec::new()),
            fail,
        }
    }

    fn executed(&self) -> Vec<i64> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImportExecutor for FakeExecutor {
    async fn execute(&self, job: &ImportJob, _cancel: &CancellationToken) -> TransferOutcome {
        self.executed.lock().unwrap().push(job.id);
        if self.fail {
            TransferOutcome::failed("boom", 1, Vec::new())
        } else {
            TransferOutcome {
                success: true,
                rows_transferred: 10,
                duration_ms: 1,
                messages: Vec::new(),
                error: None,
            }
        }
    }
}

fn scheduler(repo: Arc<FakeRepository>, exec: Arc<FakeExecutor>) -> Scheduler {
    Scheduler::new(
        repo,
        exec,
        Duration::from_secs(30),
        CancellationToken::new(),
    )
}

#[test]
fn legacy_interval_is_hourly_with_a_cron_hint_and_daily_without() {
    let now = at(2024, 6, 1, 12, 0);
    assert_eq!(legacy_next_update(true, now), at(2024, 6, 1, 13, 0));
    assert_eq!(legacy_next_update(false, now), at(2024, 6, 2, 12, 0));
}

#[test]
fn due_check_uses_last_run_then_creation() {
    let schedule = CronSchedule::parse("0 * * * *").unwrap();
    let created = at(2024, 6, 1, 0, 0);

    // Never ran, created long ago: due.
    assert!(cron_job_due(&schedule, None, created, at(2024, 6, 1, 12, 30)));
    // Ran at 12:00, next slot 13:00 not reached yet.
    assert!(!cron_job_due(
        &schedule,
        Some(at(2024, 6, 1, 12, 0)),
        created,
        at(2024, 6, 1, 12, 30)
    ));
    // Slot reached exactly.
    assert!(cron_job_due(
        &schedule,
        Some(at(2024, 6, 1, 12, 0)),
        created,
        at(2024, 6, 1, 13, 0)
    ));
}

#[tokio::test]
async fn due_cron_job_executes_and_records_both_timestamps() {
    let now = at(2024, 6, 1, 13, 0);
    let repo = Arc::new(FakeRepository::new(RepoState {
        cron_jobs: vec![summary(7, "0 * * * *", Some(at(2024, 6, 1, 12, 0)))],
        jobs: vec![job(7, Some("0 * * * *"))],
        ..Default::default()
    }));
    let exec = Arc::new(FakeExecutor::new(false));

    scheduler(repo.clone(), exec.clone()).run_cycle(now).await;

    assert_eq!(exec.executed(), vec![7]);
    let state = repo.state.lock().unwrap();
    assert_eq!(state.last_runs, vec![(7, now)]);
    assert_eq!(state.next_runs, vec![(7, at(2024, 6, 1, 14, 0))]);
}

#[tokio::test]
async fn failed_run_still_records_run_state() {
    let now = at(2024, 6, 1, 13, 0);
    let repo = Arc::new(FakeRepository::new(RepoState {
        cron_jobs: vec![summary(7, "0 * * * *", Some(at(2024, 6, 1, 12, 0)))],
        jobs: vec![job(7, Some("0 * * * *"))],
        ..Default::default()
    }));
    let exec = Arc::new(FakeExecutor::new(true));

    scheduler(repo.clone(), exec.clone()).run_cycle(now).await;

    assert_eq!(exec.executed(), vec![7]);
    let state = repo.state.lock().unwrap();
    assert_eq!(state.last_runs.len(), 1);
    assert_eq!(state.next_runs.len(), 1);
}

#[tokio::test]
async fn not_due_job_is_left_alone() {
    let now = at(2024, 6, 1, 12, 30);
    let repo = Arc::new(FakeRepository::new(RepoState {
        cron_jobs: vec![summary(7, "0 * * * *", Some(at(2024, 6, 1, 12, 0)))],
        jobs: vec![job(7, Some("0 * * * *"))],
        ..Default::default()
    }));
    let exec = Arc::new(FakeExecutor::new(false));

    scheduler(repo.clone(), exec.clone()).run_cycle(now).await;

    assert!(exec.executed().is_empty());
    let state = repo.state.lock().unwrap();
    assert!(state.last_runs.is_empty());
    assert!(state.next_runs.is_empty());
}

#[tokio::test]
async fn invalid_cron_skips_the_job_but_not_the_cycle() {
    let now = at(2024, 6, 1, 13, 0);
    let repo = Arc::new(FakeRepository::new(RepoState {
        cron_jobs: vec![
            summary(1, "not a cron", None),
            summary(2, "0 * * * *", Some(at(2024, 6, 1, 12, 0))),
        ],
        jobs: vec![job(1, Some("not a cron")), job(2, Some("0 * * * *"))],
        ..Default::default()
    }));
    let exec = Arc::new(FakeExecutor::new(false));

    scheduler(repo.clone(), exec.clone()).run_cycle(now).await;

    // Job 1 is skipped with no state change; job 2 still runs.
    assert_eq!(exec.executed(), vec![2]);
    let state = repo.state.lock().unwrap();
    assert_eq!(state.last_runs, vec![(2, now)]);
}

#[tokio::test]
async fn repository_error_for_one_job_does_not_stop_the_next() {
    let now = at(2024, 6, 1, 13, 0);
    let repo = Arc::new(FakeRepository::new(RepoState {
        cron_jobs: vec![
            summary(1, "0 * * * *", None),
            summary(2, "0 * * * *", None),
        ],
        jobs: vec![job(1, Some("0 * * * *")), job(2, Some("0 * * * *"))],
        fail_full_job_for: Some(1),
        ..Default::default()
    }));
    let exec = Arc::new(FakeExecutor::new(false));

    scheduler(repo.clone(), exec.clone()).run_cycle(now).await;

    assert_eq!(exec.executed(), vec![2]);
}

#[tokio::test]
async fn legacy_entry_runs_and_rearms_daily_without_a_hint() {
    let now = at(2024, 6, 1, 12, 0);
    let repo = Arc::new(FakeRepository::new(RepoState {
        legacy_entries: vec![entry(100, 7, None)],
        jobs: vec![job(7, None)],
        ..Default::default()
    }));
    let exec = Arc::new(FakeExecutor::new(false));

    scheduler(repo.clone(), exec.clone()).run_cycle(now).await;

    assert_eq!(exec.executed(), vec![7]);
    let state = repo.state.lock().unwrap();
    assert_eq!(state.legacy_runs, vec![(100, now, at(2024, 6, 2, 12, 0))]);
    // No cron on the job, so no cron run-state is touched.
    assert!(state.last_runs.is_empty());
}

#[tokio::test]
async fn legacy_entry_with_hint_rearms_hourly_and_stamps_cron_state() {
    let now = at(2024, 6, 1, 12, 0);
    let repo = Arc::new(FakeRepository::new(RepoState {
        legacy_entries: vec![entry(100, 7, Some("0 * * * *"))],
        // The job also carries its own cron, so the legacy run stamps the
        // cron last-run and pushes the cron pass out to the next slot.
        jobs: vec![job(7, Some("0 * * * *"))],
        ..Default::default()
    }));
    let exec = Arc::new(FakeExecutor::new(false));

    scheduler(repo.clone(), exec.clone()).run_cycle(now).await;

    let state = repo.state.lock().unwrap();
    assert_eq!(state.legacy_runs, vec![(100, now, at(2024, 6, 1, 13, 0))]);
    assert_eq!(state.last_runs, vec![(7, now)]);
}

#[tokio::test]
async fn missing_job_behind_a_legacy_entry_is_skipped() {
    let now = at(2024, 6, 1, 12, 0);
    let repo = Arc::new(FakeRepository::new(RepoState {
        legacy_entries: vec![entry(100, 999, None)],
        ..Default::default()
    }));
    let exec = Arc::new(FakeExecutor::new(false));

    scheduler(repo.clone(), exec.clone()).run_cycle(now).await;

    assert!(exec.executed().is_empty());
    assert!(repo.state.lock().unwrap().legacy_runs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_stops_when_cancelled() {
    let repo = Arc::new(FakeRepository::new(RepoState::default()));
    let exec = Arc::new(FakeExecutor::new(false));
    let cancel = CancellationToken::new();
    let scheduler = Scheduler::new(repo, exec, Duration::from_secs(30), cancel.clone());

    let handle = tokio::spawn(async move { scheduler.run().await });
    tokio::task::yield_now().await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(60), handle)
        .await
        .expect("scheduler did not stop after cancellation")
        .unwrap();
}
