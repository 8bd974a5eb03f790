use actix_web::{web, HttpResponse, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::background::{RunController, RunStatus};
use crate::config::PipelineConfig;
use crate::fetch::PageFetcher;
use crate::model::Site;

#[derive(Clone)]
pub struct AppState {
    pub controller: RunController,
    pub config: Arc<PipelineConfig>,
    pub fetcher: Arc<dyn PageFetcher>,
}

/// Optional body of `POST /api/runs`; omitted fields use the loaded config.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StartRunRequest {
    #[serde(default)]
    pub sites: Vec<Site>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub enrich_details: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRunResponse {
    pub success: bool,
    pub message: String,
    pub run_id: Option<String>,
}

pub async fn health_check() -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "listing-pipeline"
    })))
}

fn run_config(base: &PipelineConfig, req: &StartRunRequest) -> PipelineConfig {
    let mut config = base.clone();
    if !req.sites.is_empty() {
        config.sites.retain(|s| req.sites.contains(&s.site));
    }
    if let Some(max_pages) = req.max_pages.filter(|n| *n > 0) {
        for site in &mut config.sites {
            site.max_pages = max_pages;
        }
    }
    if let Some(enrich) = req.enrich_details {
        config.enrich_details = enrich;
    }
    config
}

pub async fn start_run(
    state: web::Data<AppState>,
    req: Option<web::Json<StartRunRequest>>,
) -> Result<HttpResponse> {
    let req = req.map(web::Json::into_inner).unwrap_or_default();
    let config = run_config(&state.config, &req);

    if config.sites.is_empty() {
        return Ok(HttpResponse::BadRequest().json(StartRunResponse {
            success: false,
            message: "No configured site matches the request".to_string(),
            run_id: None,
        }));
    }

    log::info!("Received run request for {} site(s)", config.sites.len());

    match state.controller.try_start(config, state.fetcher.clone()) {
        Ok(run_id) => Ok(HttpResponse::Accepted().json(StartRunResponse {
            success: true,
            message: "Run started".to_string(),
            run_id: Some(run_id),
        })),
        Err(e) => {
            log::warn!("Rejected run request: {}", e);
            Ok(HttpResponse::Conflict().json(StartRunResponse {
                success: false,
                message: e.to_string(),
                run_id: None,
            }))
        }
    }
}

pub async fn run_status(state: web::Data<AppState>) -> Result<HttpResponse> {
    let status: RunStatus = state.controller.status();
    Ok(HttpResponse::Ok().json(status))
}
