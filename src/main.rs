use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use listing_pipeline::api::{self, AppState};
use listing_pipeline::{run_and_persist, HttpFetcher, ListingStore, PipelineConfig, RunController};

#[derive(Parser, Debug)]
#[command(
    name = "listing-pipeline",
    version,
    about = "Extract, normalize and store used-vehicle listings"
)]
struct Cli {
    /// TOML pipeline config; built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline once and print the run report as JSON
    Run,
    /// Serve the run trigger API (HOST/PORT from the environment)
    Serve,
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path),
        None => Ok(PipelineConfig::default()),
    }
}

async fn run_once(config: PipelineConfig) -> Result<()> {
    let fetcher = HttpFetcher::new(config.request_timeout())?;
    let mut store = ListingStore::new(&config.database_path)?;

    match run_and_persist(&config, &fetcher, &mut store).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(failure) => {
            log::error!("{}", failure);
            Err(failure.error)
        }
    }
}

async fn serve(config: PipelineConfig) -> Result<()> {
    let fetcher = HttpFetcher::new(config.request_timeout())?;
    let state = web::Data::new(AppState {
        controller: RunController::new(),
        config: Arc::new(config),
        fetcher: Arc::new(fetcher),
    });

    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .context("PORT must be a valid number")?;

    log::info!("Starting listing pipeline");
    log::info!("Server running at http://{}:{}", host, port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .wrap(cors)
            .route("/api/health", web::get().to(api::health_check))
            .route("/api/runs", web::post().to(api::start_run))
            .route("/api/runs/status", web::get().to(api::run_status))
    })
    .bind((host.as_str(), port))?
    .run()
    .await?;

    Ok(())
}

#[actix_web::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run => run_once(config).await,
        Command::Serve => serve(config).await,
    }
}
