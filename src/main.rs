use anyhow::Context;
use stepmon_lib::platform::local::{LocalTaskScheduler, StepLedger, TracingNotificationCenter};
use stepmon_lib::{init_tracing, App, Platform};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DATA_DIR_ENV: &str = "STEPMON_DATA_DIR";
const EXECUTION_BUDGET: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = std::env::var_os(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./stepmon-data"));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
    init_tracing(&data_dir).context("failed to initialize logging")?;

    let tasks = Arc::new(LocalTaskScheduler::new(EXECUTION_BUDGET));
    let platform = Platform {
        tasks: tasks.clone(),
        steps: Arc::new(StepLedger::new()),
        notifications: Arc::new(TracingNotificationCenter::new()),
    };
    let app = App::open(&data_dir, platform).context("failed to open app")?;
    tasks.start();

    let decision = app.on_launch().await;
    tracing::info!(
        ?decision,
        database = %app.database().path().display(),
        "stepmon host started"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    let decision = app.on_background_transition().await;
    tracing::info!(?decision, "stepmon host stopping");
    Ok(())
}
