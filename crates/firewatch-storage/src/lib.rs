//! HTTP fetch utilities, raw FIRMS payload archive, and the fire report store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use firewatch_core::{ExistingReport, FireReport, NewFireReport, ReportSource};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "firewatch-storage";

/// Raw FIRMS CSV bodies on disk as `<root>/<YYYY-MM-DD>/<product>/<sha256[..16]>.csv`.
/// The same body fetched twice in a day is stored once.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Returns the written path, or `None` when today's copy already exists.
    pub async fn archive_csv(
        &self,
        fetched_at: DateTime<Utc>,
        product: &str,
        body: &[u8],
    ) -> std::io::Result<Option<PathBuf>> {
        let hash = Self::sha256_hex(body);
        let dir = self
            .root
            .join(fetched_at.format("%Y-%m-%d").to_string())
            .join(product);
        let path = dir.join(format!("{}.csv", &hash[..16]));
        if fs::try_exists(&path).await? {
            return Ok(None);
        }

        fs::create_dir_all(&dir).await?;
        let temp = dir.join(format!(".{hash}.tmp"));
        fs::write(&temp, body).await?;
        if let Err(err) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }
        Ok(Some(path))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Successful bodies are reused for this long; `None` disables caching.
    pub cache_ttl: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            cache_ttl: Some(Duration::from_secs(15 * 60)),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedBody {
    stored_at: Instant,
    body: Vec<u8>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    cache_ttl: Option<Duration>,
    cache: Mutex<HashMap<String, CachedBody>>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
    pub from_cache: bool,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {label}")]
    HttpStatus { status: u16, label: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            cache_ttl: config.cache_ttl.filter(|ttl| !ttl.is_zero()),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// GET `url` once. `label` names the request in logs and errors so that
    /// credentials embedded in the URL never leave this function.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        label: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, label);
        async {
            if let Some(body) = self.cached(url).await {
                debug!(bytes = body.len(), "serving cached response");
                return Ok(FetchedResponse {
                    status: StatusCode::OK,
                    body,
                    from_cache: true,
                });
            }

            let resp = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "text/csv")
                .send()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    label: label.to_string(),
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?
                .to_vec();
            self.remember(url, &body).await;
            Ok(FetchedResponse {
                status,
                body,
                from_cache: false,
            })
        }
        .instrument(span)
        .await
    }

    async fn cached(&self, url: &str) -> Option<Vec<u8>> {
        let ttl = self.cache_ttl?;
        let cache = self.cache.lock().await;
        cache
            .get(url)
            .filter(|entry| entry.stored_at.elapsed() < ttl)
            .map(|entry| entry.body.clone())
    }

    async fn remember(&self, url: &str, body: &[u8]) {
        let Some(ttl) = self.cache_ttl else {
            return;
        };
        let mut cache = self.cache.lock().await;
        cache.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        cache.insert(
            url.to_string(),
            CachedBody {
                stored_at: Instant::now(),
                body: body.to_vec(),
            },
        );
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Record store for fire reports.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Reports from `source` created at or after `since`.
    async fn recent_reports(
        &self,
        source: ReportSource,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExistingReport>, StoreError>;

    /// Insert all rows in one statement, returning the new identifiers.
    async fn insert_reports(&self, rows: &[NewFireReport]) -> Result<Vec<Uuid>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connections are opened on first use, so an unreachable database fails
    /// individual runs rather than process startup.
    pub fn connect_lazy(database_url: &str, acquire_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn recent_reports(
        &self,
        source: ReportSource,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExistingReport>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT latitude, longitude, source_id
              FROM fire_reports
             WHERE source = $1
               AND created_at >= $2
            "#,
        )
        .bind(source.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ExistingReport {
                latitude: row.try_get("latitude")?,
                longitude: row.try_get("longitude")?,
                source_id: row.try_get("source_id")?,
            });
        }
        Ok(out)
    }

    async fn insert_reports(&self, rows: &[NewFireReport]) -> Result<Vec<Uuid>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let inserted = insert_query(chunk)
                .build_query_scalar::<Uuid>()
                .fetch_all(&mut *tx)
                .await?;
            ids.extend(inserted);
        }
        tx.commit().await?;
        Ok(ids)
    }
}

const BINDS_PER_ROW: usize = 8;
/// Postgres caps a statement at 65535 bind parameters.
const INSERT_CHUNK_ROWS: usize = u16::MAX as usize / BINDS_PER_ROW;

fn insert_query(rows: &[NewFireReport]) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(
        "INSERT INTO fire_reports \
         (latitude, longitude, status, source, source_id, intensity, description, detected_at) ",
    );
    builder.push_values(rows, |mut b, row| {
        b.push_bind(row.latitude)
            .push_bind(row.longitude)
            .push_bind(row.status.as_str())
            .push_bind(row.source.as_str())
            .push_bind(row.source_id.clone())
            .push_bind(row.intensity.map(|i| i.as_str()))
            .push_bind(row.description.clone())
            .push_bind(row.detected_at);
    });
    // (source, source_id) is unique; overlapping runs lose the race quietly.
    builder.push(" ON CONFLICT (source, source_id) DO NOTHING RETURNING id");
    builder
}

/// In-process store used by tests and fixture runs.
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    reports: Mutex<Vec<FireReport>>,
    insert_calls: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reports(reports: Vec<FireReport>) -> Self {
        Self {
            reports: Mutex::new(reports),
            ..Self::default()
        }
    }

    pub async fn reports(&self) -> Vec<FireReport> {
        self.reports.lock().await.clone()
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn recent_reports(
        &self,
        source: ReportSource,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExistingReport>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }
        let reports = self.reports.lock().await;
        Ok(reports
            .iter()
            .filter(|r| r.source == source && r.created_at >= since)
            .map(ExistingReport::from)
            .collect())
    }

    async fn insert_reports(&self, rows: &[NewFireReport]) -> Result<Vec<Uuid>, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        let now = Utc::now();
        let mut reports = self.reports.lock().await;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let report = FireReport::from_new(row.clone(), now);
            ids.push(report.id);
            reports.push(report);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{routing::get, Router};
    use chrono::{Duration as ChronoDuration, NaiveDate, NaiveTime};
    use firewatch_core::{Confidence, DayNight, Hotspot};
    use tempfile::tempdir;

    fn sample_row() -> NewFireReport {
        NewFireReport::from_hotspot(&Hotspot {
            latitude: -42.23,
            longitude: -71.37,
            acq_date: NaiveDate::from_ymd_opt(2026, 1, 17).unwrap(),
            acq_time: NaiveTime::from_hms_opt(1, 42, 0).unwrap(),
            satellite: "N".into(),
            confidence: Confidence::High,
            version: String::new(),
            frp: 150.0,
            brightness: 0.0,
            bright_t31: 0.0,
            scan: 0.0,
            track: 0.0,
            daynight: DayNight::Day,
        })
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn payload_hashing_is_stable() {
        let hash = PayloadArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archive_keeps_one_copy_per_body_per_day() {
        let dir = tempdir().unwrap();
        let archive = PayloadArchive::new(dir.path());
        let morning = DateTime::parse_from_rfc3339("2026-01-17T02:00:00Z").unwrap().with_timezone(&Utc);
        let evening = morning + ChronoDuration::hours(18);
        let body = b"latitude,longitude\n";

        let first = archive.archive_csv(morning, "VIIRS_SNPP_NRT", body).await.unwrap();
        let path = first.expect("first copy is written");
        assert!(path.starts_with(dir.path().join("2026-01-17").join("VIIRS_SNPP_NRT")));
        assert!(path.to_string_lossy().ends_with(".csv"));
        assert_eq!(std::fs::read(&path).unwrap(), body);

        assert_eq!(archive.archive_csv(evening, "VIIRS_SNPP_NRT", body).await.unwrap(), None);
        let next_day = archive
            .archive_csv(morning + ChronoDuration::days(1), "VIIRS_SNPP_NRT", body)
            .await
            .unwrap();
        assert!(next_day.is_some());
    }

    #[test]
    fn insert_chunks_stay_under_bind_limit() {
        let rows = vec![sample_row(); INSERT_CHUNK_ROWS + 1];
        let mut chunks = rows.chunks(INSERT_CHUNK_ROWS);

        let full = insert_query(chunks.next().unwrap());
        let last_bind = format!("${}", INSERT_CHUNK_ROWS * BINDS_PER_ROW);
        assert!(INSERT_CHUNK_ROWS * BINDS_PER_ROW <= 65535);
        assert!(full.sql().contains(&last_bind));
        assert!(!full.sql().contains(&format!("${}", INSERT_CHUNK_ROWS * BINDS_PER_ROW + 1)));
        assert!(full.sql().ends_with("ON CONFLICT (source, source_id) DO NOTHING RETURNING id"));

        let rest = insert_query(chunks.next().unwrap());
        assert!(rest.sql().contains("$8)"));
        assert!(!rest.sql().contains("$9"));
        assert!(chunks.next().is_none());
    }

    #[tokio::test]
    async fn fetcher_caches_successful_bodies() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let base = serve(Router::new().route(
            "/csv",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "latitude,longitude\n"
                }
            }),
        ))
        .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let url = format!("{base}/csv");
        let first = fetcher.fetch_bytes(Uuid::new_v4(), "test", &url).await.unwrap();
        let second = fetcher.fetch_bytes(Uuid::new_v4(), "test", &url).await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.body, second.body);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetcher_reports_http_status_without_url() {
        let base = serve(Router::new().route(
            "/secret-key/csv",
            get(|| async { (axum::http::StatusCode::FORBIDDEN, "nope") }),
        ))
        .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            cache_ttl: None,
            ..Default::default()
        })
        .unwrap();
        let err = fetcher
            .fetch_bytes(Uuid::new_v4(), "firms", &format!("{base}/secret-key/csv"))
            .await
            .unwrap_err();

        match &err {
            FetchError::HttpStatus { status, label } => {
                assert_eq!(*status, 403);
                assert_eq!(label, "firms");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!err.to_string().contains("secret-key"));
    }

    #[tokio::test]
    async fn memory_store_filters_by_source_and_window() {
        let now = Utc::now();
        let mut old = FireReport::from_new(sample_row(), now - ChronoDuration::days(10));
        old.source_id = Some("old".into());
        let mut manual = FireReport::from_new(sample_row(), now);
        manual.source = ReportSource::Manual;
        let fresh = FireReport::from_new(sample_row(), now);
        let store = MemoryReportStore::with_reports(vec![old, manual, fresh.clone()]);

        let recent = store
            .recent_reports(ReportSource::NasaFirms, now - ChronoDuration::days(5))
            .await
            .unwrap();
        assert_eq!(recent, vec![ExistingReport::from(&fresh)]);
    }

    #[tokio::test]
    async fn memory_store_insert_returns_ids_and_counts_calls() {
        let store = MemoryReportStore::new();
        let ids = store.insert_reports(&[sample_row(), sample_row()]).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(store.insert_calls(), 1);
        assert_eq!(store.reports().await.len(), 2);

        store.set_fail_writes(true);
        assert!(matches!(
            store.insert_reports(&[sample_row()]).await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.reports().await.len(), 2);
    }
}
