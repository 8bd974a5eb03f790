// Used-vehicle listing pipeline
//
// Decodes Japanese listing pages, extracts records from the Goo and CarSensor
// layouts, normalizes them into canonical listings and stores them in SQLite.

pub mod api;
pub mod assembler;
pub mod background;
pub mod carsensor;
pub mod config;
pub mod decoder;
pub mod extractor;
pub mod fetch;
pub mod goonet;
pub mod model;
pub mod normalize;
pub mod pagination;
pub mod patterns;
pub mod runner;
pub mod store;
pub mod utils;

// Re-export main types for convenience
pub use assembler::{assemble, enrich_listings, DetailOverlay};
pub use background::{AlreadyRunning, RunController, RunStatus};
pub use config::{PersistenceMode, PipelineConfig, SiteRunConfig};
pub use decoder::{decode_bytes, DecodeHints, DecodedPage};
pub use extractor::{extract_page, extractor_for, PageExtraction, SiteExtractor};
pub use fetch::{FetchedPage, HttpFetcher, PageFetcher};
pub use model::{CanonicalListing, Field, RawRecord, Site};
pub use pagination::{next_page_url, NextStrategy};
pub use runner::{run_and_persist, RunFailure, RunReport};
pub use store::ListingStore;
