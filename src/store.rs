use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;

use crate::decoder::DecodedPage;
use crate::model::{CanonicalListing, RawFragments, Site};
use crate::normalize::{Category, TransmissionCode};

/// Candidate scores kept per `encoding_log` row.
const LOGGED_CANDIDATES: usize = 5;

const LISTING_COLUMNS: &str = "site, id, manufacturer, name, price, year, mileage_km, engine_cc,
    transmission_code, transmission_raw, body_type, color, accident_note, dealer_location,
    options_text, drivetrain, seat_count, door_count, fuel_type, steering_side, fuel_economy,
    detail_url, category, suspicious, raw_json";

/// One row of `encoding_log`.
#[derive(Debug, Clone, Serialize)]
pub struct EncodingLogEntry {
    pub site: String,
    pub url: String,
    pub encoding: String,
    pub score: f64,
    pub confident: bool,
    pub candidates_json: String,
    pub logged_at: String,
}

/// SQLite-backed listing store keyed by `(site, id)`.
pub struct ListingStore {
    conn: Connection,
}

impl ListingStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open database connection")?;

        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    /// In-memory store for tests and dry runs.
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to create in-memory database")?;

        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS listings (
                site TEXT NOT NULL,
                id TEXT NOT NULL,
                manufacturer TEXT,
                name TEXT,
                price INTEGER,
                year INTEGER,
                mileage_km INTEGER,
                engine_cc INTEGER,
                transmission_code TEXT,
                transmission_raw TEXT,
                body_type TEXT,
                color TEXT,
                accident_note TEXT,
                dealer_location TEXT,
                options_text TEXT,
                drivetrain TEXT,
                seat_count INTEGER,
                door_count INTEGER,
                fuel_type TEXT,
                steering_side TEXT,
                fuel_economy REAL,
                detail_url TEXT,
                category TEXT,
                suspicious INTEGER NOT NULL DEFAULT 0,
                raw_json TEXT NOT NULL,
                first_seen_at TEXT NOT NULL,
                PRIMARY KEY (site, id)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_listings_price ON listings(site, price)",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS encoding_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site TEXT NOT NULL,
                url TEXT NOT NULL,
                encoding TEXT NOT NULL,
                score REAL NOT NULL,
                confident INTEGER NOT NULL,
                candidates_json TEXT NOT NULL,
                logged_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Insert-or-update on `(site, id)`. Never deletes; `first_seen_at` survives updates.
    pub fn upsert_listings(&mut self, listings: &[CanonicalListing]) -> Result<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.transaction().context("Failed to begin transaction")?;
        for listing in listings {
            write_listing(&tx, listing, &now)?;
        }
        tx.commit().context("Failed to commit listings")?;

        log::info!("Upserted {} listings", listings.len());
        Ok(listings.len())
    }

    /// Replaces every stored row of `site` with `listings`, atomically.
    pub fn replace_collection(&mut self, site: Site, listings: &[CanonicalListing]) -> Result<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.transaction().context("Failed to begin transaction")?;
        let removed = tx.execute("DELETE FROM listings WHERE site = ?1", [site.key()])?;
        for listing in listings.iter().filter(|l| l.site == site) {
            write_listing(&tx, listing, &now)?;
        }
        tx.commit().context("Failed to commit snapshot")?;

        log::info!(
            "Replaced {} stored {} listings with {}",
            removed,
            site,
            listings.len()
        );
        Ok(listings.len())
    }

    pub fn get(&self, site: Site, id: &str) -> Result<Option<CanonicalListing>> {
        let sql = format!("SELECT {} FROM listings WHERE site = ?1 AND id = ?2", LISTING_COLUMNS);
        let listing = self
            .conn
            .query_row(&sql, params![site.key(), id], listing_from_row)
            .optional()?;
        Ok(listing)
    }

    pub fn list(&self, site: Site) -> Result<Vec<CanonicalListing>> {
        let sql = format!("SELECT {} FROM listings WHERE site = ?1 ORDER BY id", LISTING_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let listings = stmt
            .query_map([site.key()], listing_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(listings)
    }

    pub fn count(&self, site: Site) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM listings WHERE site = ?1",
            [site.key()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn first_seen_at(&self, site: Site, id: &str) -> Result<Option<String>> {
        let first_seen = self
            .conn
            .query_row(
                "SELECT first_seen_at FROM listings WHERE site = ?1 AND id = ?2",
                params![site.key(), id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(first_seen)
    }

    /// Appends the decoding decision for one page to `encoding_log`.
    pub fn record_encoding(&self, site: Site, url: &str, page: &DecodedPage) -> Result<()> {
        let mut candidates = page.candidates.clone();
        candidates.sort_by(|a, b| {
            b.score
                .unwrap_or(-1.0)
                .partial_cmp(&a.score.unwrap_or(-1.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(LOGGED_CANDIDATES);
        let candidates_json = serde_json::to_string(&candidates)?;

        self.conn.execute(
            "INSERT INTO encoding_log (site, url, encoding, score, confident, candidates_json, logged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                site.key(),
                url,
                page.encoding,
                page.score,
                page.confident,
                candidates_json,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn encoding_log(&self, site: Site) -> Result<Vec<EncodingLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT site, url, encoding, score, confident, candidates_json, logged_at
             FROM encoding_log
             WHERE site = ?1
             ORDER BY id",
        )?;

        let entries = stmt
            .query_map([site.key()], |row| {
                Ok(EncodingLogEntry {
                    site: row.get(0)?,
                    url: row.get(1)?,
                    encoding: row.get(2)?,
                    score: row.get(3)?,
                    confident: row.get(4)?,
                    candidates_json: row.get(5)?,
                    logged_at: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }
}

fn write_listing(conn: &Connection, listing: &CanonicalListing, now: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO listings
        (site, id, manufacturer, name, price, year, mileage_km, engine_cc,
         transmission_code, transmission_raw, body_type, color, accident_note, dealer_location,
         options_text, drivetrain, seat_count, door_count, fuel_type, steering_side, fuel_economy,
         detail_url, category, suspicious, raw_json, first_seen_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
        ON CONFLICT(site, id) DO UPDATE SET
            manufacturer = excluded.manufacturer,
            name = excluded.name,
            price = excluded.price,
            year = excluded.year,
            mileage_km = excluded.mileage_km,
            engine_cc = excluded.engine_cc,
            transmission_code = excluded.transmission_code,
            transmission_raw = excluded.transmission_raw,
            body_type = excluded.body_type,
            color = excluded.color,
            accident_note = excluded.accident_note,
            dealer_location = excluded.dealer_location,
            options_text = excluded.options_text,
            drivetrain = excluded.drivetrain,
            seat_count = excluded.seat_count,
            door_count = excluded.door_count,
            fuel_type = excluded.fuel_type,
            steering_side = excluded.steering_side,
            fuel_economy = excluded.fuel_economy,
            detail_url = excluded.detail_url,
            category = excluded.category,
            suspicious = excluded.suspicious,
            raw_json = excluded.raw_json",
        params![
            listing.site.key(),
            listing.id,
            listing.manufacturer,
            listing.name,
            listing.price,
            listing.year,
            listing.mileage_km,
            listing.engine_cc,
            listing.transmission_code.map(|code| code.as_str()),
            listing.transmission_raw,
            listing.body_type,
            listing.color,
            listing.accident_note,
            listing.dealer_location,
            listing.options_text,
            listing.drivetrain,
            listing.seat_count,
            listing.door_count,
            listing.fuel_type,
            listing.steering_side,
            listing.fuel_economy,
            listing.detail_url,
            listing.category.map(|category| category.as_str()),
            listing.suspicious,
            listing.raw_fragments.to_json(),
            now,
        ],
    )
    .with_context(|| format!("Failed to write listing {}/{}", listing.site, listing.id))?;
    Ok(())
}

fn listing_from_row(row: &Row<'_>) -> rusqlite::Result<CanonicalListing> {
    let site: String = row.get("site")?;
    let site = site.parse::<Site>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })?;
    let transmission_code: Option<String> = row.get("transmission_code")?;
    let category: Option<String> = row.get("category")?;
    let raw_json: String = row.get("raw_json")?;

    Ok(CanonicalListing {
        site,
        id: row.get("id")?,
        manufacturer: row.get("manufacturer")?,
        name: row.get("name")?,
        price: row.get("price")?,
        year: row.get("year")?,
        mileage_km: row.get("mileage_km")?,
        engine_cc: row.get("engine_cc")?,
        transmission_code: transmission_code.as_deref().and_then(TransmissionCode::from_label),
        transmission_raw: row.get("transmission_raw")?,
        body_type: row.get("body_type")?,
        color: row.get("color")?,
        accident_note: row.get("accident_note")?,
        dealer_location: row.get("dealer_location")?,
        options_text: row.get("options_text")?,
        drivetrain: row.get("drivetrain")?,
        seat_count: row.get("seat_count")?,
        door_count: row.get("door_count")?,
        fuel_type: row.get("fuel_type")?,
        steering_side: row.get("steering_side")?,
        fuel_economy: row.get("fuel_economy")?,
        detail_url: row.get("detail_url")?,
        category: category.as_deref().and_then(|c| match c {
            "kei" => Some(Category::Kei),
            "standard" => Some(Category::Standard),
            _ => None,
        }),
        raw_fragments: serde_json::from_str::<RawFragments>(&raw_json).unwrap_or_default(),
        suspicious: row.get("suspicious")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{decode_bytes, DecodeHints};

    fn listing(site: Site, id: &str, price: u32) -> CanonicalListing {
        let mut listing = CanonicalListing::empty(site, id);
        listing.name = Some("プリウス".to_string());
        listing.price = Some(price);
        listing.engine_cc = Some(1800);
        listing.category = Category::from_engine_cc(listing.engine_cc);
        listing.transmission_code = Some(TransmissionCode::Cvt);
        listing.fuel_economy = Some(30.8);
        listing.raw_fragments.strategy = "structural".to_string();
        listing
            .raw_fragments
            .fields
            .insert("price".to_string(), format!("{}万円", price));
        listing
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut store = ListingStore::new_in_memory().unwrap();
        let x = listing(Site::Goo, "700001", 288);

        store.upsert_listings(std::slice::from_ref(&x)).unwrap();
        let first_seen = store.first_seen_at(Site::Goo, "700001").unwrap();
        store.upsert_listings(std::slice::from_ref(&x)).unwrap();

        assert_eq!(store.count(Site::Goo).unwrap(), 1);
        assert_eq!(store.get(Site::Goo, "700001").unwrap(), Some(x));
        assert_eq!(store.first_seen_at(Site::Goo, "700001").unwrap(), first_seen);
    }

    #[test]
    fn test_upsert_updates_in_place() {
        let mut store = ListingStore::new_in_memory().unwrap();
        store.upsert_listings(&[listing(Site::Goo, "1", 100)]).unwrap();
        store.upsert_listings(&[listing(Site::Goo, "1", 95)]).unwrap();

        let stored = store.get(Site::Goo, "1").unwrap().unwrap();
        assert_eq!(stored.price, Some(95));
        assert_eq!(store.count(Site::Goo).unwrap(), 1);
    }

    #[test]
    fn test_same_id_on_two_sites_is_two_rows() {
        let mut store = ListingStore::new_in_memory().unwrap();
        store
            .upsert_listings(&[listing(Site::Goo, "1", 100), listing(Site::CarSensor, "1", 100)])
            .unwrap();
        assert_eq!(store.count(Site::Goo).unwrap(), 1);
        assert_eq!(store.count(Site::CarSensor).unwrap(), 1);
    }

    #[test]
    fn test_replace_collection_is_a_snapshot() {
        let mut store = ListingStore::new_in_memory().unwrap();
        store
            .upsert_listings(&[
                listing(Site::CarSensor, "AU1", 100),
                listing(Site::CarSensor, "AU2", 200),
                listing(Site::Goo, "9", 300),
            ])
            .unwrap();

        store
            .replace_collection(Site::CarSensor, &[listing(Site::CarSensor, "AU3", 150)])
            .unwrap();

        let ids: Vec<String> = store
            .list(Site::CarSensor)
            .unwrap()
            .into_iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(ids, vec!["AU3".to_string()]);
        assert_eq!(store.count(Site::Goo).unwrap(), 1);
    }

    #[test]
    fn test_record_encoding() {
        let store = ListingStore::new_in_memory().unwrap();
        let page = decode_bytes("<p>中古車</p>".as_bytes(), &DecodeHints::default());
        store
            .record_encoding(Site::Goo, "https://www.goo-net.com/", &page)
            .unwrap();

        let log = store.encoding_log(Site::Goo).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].encoding, page.encoding);
        assert!(log[0].confident);
        assert!(log[0].candidates_json.starts_with('['));
    }
}
