use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::fetch::PageFetcher;
use crate::runner::{run_and_persist, RunReport};
use crate::store::ListingStore;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("a run is already in progress (started {started_at})")]
pub struct AlreadyRunning {
    pub started_at: String,
}

/// Snapshot of the single background worker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStatus {
    pub running: bool,
    pub run_id: Option<String>,
    pub last_started: Option<String>,
    pub last_finished: Option<String>,
    pub last_error: Option<String>,
    pub last_pages: usize,
    pub last_listings: usize,
}

/// Allows at most one active run; a second start is rejected, never queued.
#[derive(Clone, Default)]
pub struct RunController {
    status: Arc<Mutex<RunStatus>>,
}

impl RunController {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RunStatus> {
        // A panicked run leaves plain data behind; keep serving it.
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> RunStatus {
        self.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Spawns a run on the tokio runtime and returns its id.
    pub fn try_start(
        &self,
        config: PipelineConfig,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Result<String, AlreadyRunning> {
        let run_id = {
            let mut status = self.lock();
            if status.running {
                return Err(AlreadyRunning {
                    started_at: status.last_started.clone().unwrap_or_default(),
                });
            }
            let run_id = Uuid::new_v4().to_string();
            status.running = true;
            status.run_id = Some(run_id.clone());
            status.last_started = Some(Utc::now().to_rfc3339());
            status.last_error = None;
            run_id
        };

        log::info!("Background run {} scheduled", run_id);
        let controller = self.clone();
        tokio::spawn(async move {
            let outcome = execute(&config, fetcher.as_ref()).await;
            controller.finish(outcome);
        });

        Ok(run_id)
    }

    fn finish(&self, outcome: Result<RunReport, String>) {
        let mut status = self.lock();
        status.running = false;
        status.last_finished = Some(Utc::now().to_rfc3339());
        match outcome {
            Ok(report) => {
                status.last_pages = report.pages_fetched();
                status.last_listings = report.listings_persisted;
                status.last_error = report.sites.iter().find_map(|s| s.error.clone());
            }
            Err(error) => {
                log::error!("Background run failed: {}", error);
                status.last_pages = 0;
                status.last_listings = 0;
                status.last_error = Some(error);
            }
        }
    }
}

async fn execute(config: &PipelineConfig, fetcher: &dyn PageFetcher) -> Result<RunReport, String> {
    let mut store = ListingStore::new(&config.database_path).map_err(|e| format!("{:#}", e))?;
    run_and_persist(config, fetcher, &mut store)
        .await
        .map_err(|failure| failure.to_string())
}
