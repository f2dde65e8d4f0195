use clap::Parser;
use dbshuttle::config::WorkerSettings;
use dbshuttle::connection::{MssqlConnectionResolver, MssqlSessionFactory};
use dbshuttle::crypto;
use dbshuttle::executor::TransferExecutor;
use dbshuttle::models::{AuthMode, ResolvedEndpoint};
use dbshuttle::repository::MssqlJobRepository;
use dbshuttle::scheduler::Scheduler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Headless worker that copies rows between SQL Server databases on the
/// schedules stored in its job repository.
#[derive(Parser, Debug)]
#[command(name = "dbshuttle", version, about)]
struct Args {
    /// Path to the JSON worker configuration.
    #[arg(long, env = "DBSHUTTLE_CONFIG", default_value = "dbshuttle.json")]
    config: PathBuf,

    /// Run a single polling cycle and exit instead of looping.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(err) = run(args).await {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), String> {
    let settings = WorkerSettings::load(&args.config)?;
    let key = crypto::load_or_create_key(&settings.encryption_key_path)?;

    let repository_endpoint = ResolvedEndpoint {
        host: settings.repository.host.clone(),
        port: settings.repository.port,
        database: settings.repository.database.clone(),
        auth_mode: AuthMode::SqlPassword,
        username: settings.repository.username.clone(),
        password: settings.repository.password.clone(),
    };
    let repository_pool = dbshuttle::connection::create_pool(&repository_endpoint, 4)
        .map_err(|e| e.to_string())?;

    let repository = Arc::new(MssqlJobRepository::new(repository_pool.clone()));
    repository
        .ensure_run_state_columns()
        .await
        .map_err(|e| format!("Could not prepare the job repository schema: {}", e))?;

    let resolver = Arc::new(MssqlConnectionResolver::new(repository_pool, key));
    let command_timeout = Duration::from_secs(settings.command_timeout_seconds);
    let sessions = Arc::new(MssqlSessionFactory::new(resolver, command_timeout));
    let executor = Arc::new(TransferExecutor::new(sessions, settings.batch_size));

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutdown requested, finishing the current step");
            ctrl_c_cancel.cancel();
        }
    });

    let scheduler = Scheduler::new(
        repository,
        executor,
        Duration::from_secs(settings.polling_interval_seconds),
        cancel,
    );

    if args.once {
        scheduler.run_cycle(chrono::Utc::now()).await;
    } else {
        scheduler.run().await;
    }

    Ok(())
}
