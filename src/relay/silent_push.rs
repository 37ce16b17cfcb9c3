use crate::models::{CheckSource, FetchResult};
use crate::scheduler::BackgroundScheduler;
use std::sync::Arc;

/// Entry point for relay-originated silent pushes.
#[derive(Clone)]
pub struct SilentPushHandler {
    scheduler: Arc<BackgroundScheduler>,
}

impl SilentPushHandler {
    pub fn new(scheduler: Arc<BackgroundScheduler>) -> Self {
        Self { scheduler }
    }

    pub async fn handle(&self) -> FetchResult {
        tracing::info!("silent push received");
        match self.scheduler.run_check(CheckSource::SilentPush).await {
            Ok(Some(report)) => {
                tracing::info!(steps = report.steps, notified = report.notified, "silent push check done");
                FetchResult::NewData
            }
            Ok(None) => FetchResult::NoData,
            Err(error) => {
                tracing::warn!(error = %error, "silent push check failed");
                FetchResult::Failed
            }
        }
    }
}
