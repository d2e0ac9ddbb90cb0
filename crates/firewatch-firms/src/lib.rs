//! NASA FIRMS hotspot source: CSV parsing with header aliasing, the area API
//! client, and a fixture-backed source for offline runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Utc};
use firewatch_core::{is_valid_coordinate, BoundingBox, Confidence, DayNight, Hotspot};
use firewatch_storage::{FetchError, HttpFetcher, PayloadArchive};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "firewatch-firms";

pub const DEFAULT_BASE_URL: &str = "https://firms.modaps.eosdis.nasa.gov/api/area/csv";
/// VIIRS S-NPP near real-time.
pub const DEFAULT_PRODUCT: &str = "VIIRS_SNPP_NRT";
/// The area endpoint accepts day ranges of 1..=10.
pub const MAX_DAY_RANGE: u32 = 10;

#[derive(Debug, Error)]
pub enum FirmsError {
    #[error("NASA_FIRMS_KEY not configured")]
    NoApiKey,
    #[error("FIRMS API error: {status}")]
    UpstreamStatus { status: u16 },
    #[error("FIRMS request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("reading fixture {}: {source}", path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<FetchError> for FirmsError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, .. } => FirmsError::UpstreamStatus { status },
            FetchError::Request(err) => FirmsError::Transport(err),
        }
    }
}

/// Canonical CSV columns understood by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Latitude,
    Longitude,
    Brightness,
    Scan,
    Track,
    AcqDate,
    AcqTime,
    Satellite,
    Confidence,
    Version,
    BrightT31,
    Frp,
    DayNight,
}

/// Accepted header spellings per column, in preference order.
const COLUMN_ALIASES: &[(Column, &[&str])] = &[
    (Column::Latitude, &["latitude", "lat"]),
    (Column::Longitude, &["longitude", "lon", "lng"]),
    (Column::Brightness, &["brightness", "bright_ti4"]),
    (Column::Scan, &["scan"]),
    (Column::Track, &["track"]),
    (Column::AcqDate, &["acq_date"]),
    (Column::AcqTime, &["acq_time"]),
    (Column::Satellite, &["satellite"]),
    (Column::Confidence, &["confidence"]),
    (Column::Version, &["version"]),
    (Column::BrightT31, &["bright_t31", "bright_ti5"]),
    (Column::Frp, &["frp"]),
    (Column::DayNight, &["daynight"]),
];

fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_ascii_lowercase()
}

/// Column positions resolved from a header row.
#[derive(Debug, Clone, Default)]
pub struct HeaderIndex {
    positions: HashMap<Column, usize>,
}

impl HeaderIndex {
    pub fn from_headers<'a>(headers: impl IntoIterator<Item = &'a str>) -> Self {
        let normalized = headers.into_iter().map(normalize_header).collect::<Vec<_>>();
        let mut positions = HashMap::new();
        for (column, aliases) in COLUMN_ALIASES {
            let found = aliases
                .iter()
                .find_map(|alias| normalized.iter().position(|h| h == alias));
            if let Some(pos) = found {
                positions.insert(*column, pos);
            }
        }
        Self { positions }
    }

    pub fn get(&self, column: Column) -> Option<usize> {
        self.positions.get(&column).copied()
    }

    pub fn has_coordinates(&self) -> bool {
        self.get(Column::Latitude).is_some() && self.get(Column::Longitude).is_some()
    }
}

/// Row accounting for one parse; observability only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
    pub rows: usize,
    pub accepted: usize,
    pub malformed: usize,
    pub invalid_coordinates: usize,
    pub outside_region: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBatch {
    pub hotspots: Vec<Hotspot>,
    pub stats: ParseStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowRejection {
    Malformed(&'static str),
    InvalidCoordinate,
    OutsideRegion,
}

fn parse_finite(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn number_or_zero(raw: &str) -> f64 {
    parse_finite(raw).unwrap_or(0.0)
}

/// `HHMM` with leading zeros optional (`142` is 01:42); a colon separator is tolerated.
pub fn parse_acq_time(raw: &str) -> Option<NaiveTime> {
    let digits = raw.trim().replace(':', "");
    if digits.is_empty() || digits.len() > 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let padded = format!("{digits:0>4}");
    let hour = padded[..2].parse().ok()?;
    let minute = padded[2..].parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn parse_row(
    record: &csv::StringRecord,
    index: &HeaderIndex,
    bbox: &BoundingBox,
) -> Result<Hotspot, RowRejection> {
    let field = |column: Column| {
        index
            .get(column)
            .and_then(|pos| record.get(pos))
            .unwrap_or("")
    };

    let latitude = parse_finite(field(Column::Latitude)).ok_or(RowRejection::InvalidCoordinate)?;
    let longitude = parse_finite(field(Column::Longitude)).ok_or(RowRejection::InvalidCoordinate)?;
    if !is_valid_coordinate(latitude, longitude) {
        return Err(RowRejection::InvalidCoordinate);
    }
    if !bbox.contains(latitude, longitude) {
        return Err(RowRejection::OutsideRegion);
    }

    let acq_date = NaiveDate::parse_from_str(field(Column::AcqDate), "%Y-%m-%d")
        .map_err(|_| RowRejection::Malformed("acq_date"))?;
    let acq_time = parse_acq_time(field(Column::AcqTime)).ok_or(RowRejection::Malformed("acq_time"))?;

    let satellite = match field(Column::Satellite) {
        "" => "VIIRS".to_string(),
        s => s.to_string(),
    };

    Ok(Hotspot {
        latitude,
        longitude,
        acq_date,
        acq_time,
        satellite,
        confidence: Confidence::normalize(field(Column::Confidence)),
        version: field(Column::Version).to_string(),
        frp: number_or_zero(field(Column::Frp)),
        brightness: number_or_zero(field(Column::Brightness)),
        bright_t31: number_or_zero(field(Column::BrightT31)),
        scan: number_or_zero(field(Column::Scan)),
        track: number_or_zero(field(Column::Track)),
        daynight: DayNight::from_flag(field(Column::DayNight)),
    })
}

/// Parse FIRMS CSV text into in-region hotspots. Bad rows are counted and skipped,
/// never returned as errors; output keeps input row order.
pub fn parse_hotspots_csv(text: &str, bbox: &BoundingBox) -> ParsedBatch {
    let mut batch = ParsedBatch::default();
    if text.trim().is_empty() {
        return batch;
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = match reader.headers() {
        Ok(headers) => headers.clone(),
        Err(err) => {
            warn!(error = %err, "unreadable FIRMS CSV header");
            return batch;
        }
    };
    let index = HeaderIndex::from_headers(headers.iter());
    if !index.has_coordinates() {
        warn!(header = ?headers, "FIRMS CSV has no latitude/longitude columns");
    }

    for (row_no, result) in reader.records().enumerate() {
        let stats = &mut batch.stats;
        stats.rows += 1;
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                stats.malformed += 1;
                debug!(row = row_no + 1, error = %err, "skipping unreadable row");
                continue;
            }
        };
        if record.len() != headers.len() {
            stats.malformed += 1;
            debug!(row = row_no + 1, fields = record.len(), expected = headers.len(), "skipping ragged row");
            continue;
        }

        match parse_row(&record, &index, bbox) {
            Ok(hotspot) => {
                stats.accepted += 1;
                batch.hotspots.push(hotspot);
            }
            Err(RowRejection::Malformed(field)) => {
                stats.malformed += 1;
                debug!(row = row_no + 1, field, "skipping row with malformed field");
            }
            Err(RowRejection::InvalidCoordinate) => {
                stats.invalid_coordinates += 1;
                debug!(row = row_no + 1, "skipping row with invalid coordinates");
            }
            Err(RowRejection::OutsideRegion) => {
                stats.outside_region += 1;
            }
        }
    }

    info!(
        rows = batch.stats.rows,
        accepted = batch.stats.accepted,
        malformed = batch.stats.malformed,
        invalid_coordinates = batch.stats.invalid_coordinates,
        outside_region = batch.stats.outside_region,
        "parsed FIRMS CSV"
    );
    batch
}

/// Something that yields hotspots for a lookback window of `days`.
#[async_trait]
pub trait HotspotSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn fetch_hotspots(&self, run_id: Uuid, days: u32) -> Result<ParsedBatch, FirmsError>;
}

#[derive(Debug, Clone)]
pub struct FirmsConfig {
    pub base_url: String,
    /// Rate limited per key; never logged.
    pub api_key: Option<String>,
    pub product: String,
    pub bbox: BoundingBox,
}

impl Default for FirmsConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            product: DEFAULT_PRODUCT.to_string(),
            bbox: BoundingBox::default(),
        }
    }
}

/// Client for the FIRMS area API:
/// `{base}/{MAP_KEY}/{SOURCE}/{west},{south},{east},{north}/{DAY_RANGE}`.
#[derive(Debug)]
pub struct FirmsClient {
    config: FirmsConfig,
    http: HttpFetcher,
    archive: Option<PayloadArchive>,
}

impl FirmsClient {
    pub fn new(config: FirmsConfig, http: HttpFetcher) -> Self {
        Self {
            config,
            http,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn config(&self) -> &FirmsConfig {
        &self.config
    }

    fn url_with_key(&self, key: &str, days: u32) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            key,
            self.config.product,
            self.config.bbox.to_query_segment(),
            days
        )
    }

    pub fn request_url(&self, days: u32) -> Result<String, FirmsError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(FirmsError::NoApiKey)?;
        Ok(self.url_with_key(key, days))
    }

    /// Request URL with the key masked, for logs.
    pub fn redacted_url(&self, days: u32) -> String {
        self.url_with_key("***", days)
    }

    async fn archive_payload(&self, body: &[u8]) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive.archive_csv(Utc::now(), &self.config.product, body).await {
            Ok(Some(path)) => debug!(path = %path.display(), "archived FIRMS payload"),
            Ok(None) => debug!("FIRMS payload already archived today"),
            Err(err) => warn!(error = %err, "failed to archive FIRMS payload"),
        }
    }
}

#[async_trait]
impl HotspotSource for FirmsClient {
    fn source_name(&self) -> &'static str {
        "nasa_firms"
    }

    async fn fetch_hotspots(&self, run_id: Uuid, days: u32) -> Result<ParsedBatch, FirmsError> {
        let url = self.request_url(days)?;
        let label = self.redacted_url(days);
        info!(%run_id, url = %label, "fetching FIRMS hotspots");

        let resp = self.http.fetch_bytes(run_id, &label, &url).await?;
        if !resp.from_cache {
            self.archive_payload(&resp.body).await;
        }

        let text = String::from_utf8_lossy(&resp.body);
        Ok(parse_hotspots_csv(&text, &self.config.bbox))
    }
}

/// Serves a fixed CSV document through the same parser; used for offline runs and tests.
#[derive(Debug)]
pub struct FixtureHotspotSource {
    csv: Mutex<String>,
    bbox: BoundingBox,
}

impl FixtureHotspotSource {
    pub fn from_text(csv: impl Into<String>, bbox: BoundingBox) -> Self {
        Self {
            csv: Mutex::new(csv.into()),
            bbox,
        }
    }

    pub async fn from_path(path: impl AsRef<Path>, bbox: BoundingBox) -> Result<Self, FirmsError> {
        let path = path.as_ref();
        let csv = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| FirmsError::Fixture {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_text(csv, bbox))
    }

    pub async fn replace_csv(&self, csv: impl Into<String>) {
        *self.csv.lock().await = csv.into();
    }
}

#[async_trait]
impl HotspotSource for FixtureHotspotSource {
    fn source_name(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_hotspots(&self, run_id: Uuid, days: u32) -> Result<ParsedBatch, FirmsError> {
        debug!(%run_id, days, "reading hotspots from fixture");
        let csv = self.csv.lock().await;
        Ok(parse_hotspots_csv(&csv, &self.bbox))
    }
}
