//! Core domain model for the wildfire monitor: hotspots, fire reports, intensity
//! classification and great-circle distance.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "firewatch-core";

/// Mean Earth radius used by [`haversine_km`].
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Fire radiative power above which a hotspot is always `extreme`.
pub const EXTREME_FRP_MW: f64 = 100.0;

/// Great-circle distance in kilometers between two `(lat, lon)` pairs in decimal degrees.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// True if the pair is finite and inside [-90, 90] / [-180, 180].
pub fn is_valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

/// Satellite detection confidence, normalized from the upstream spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Nominal,
    High,
}

impl Confidence {
    /// `h`/`high` and `l`/`low` (any case) map to high/low; everything else is nominal.
    pub fn normalize(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("h") || raw.eq_ignore_ascii_case("high") {
            Confidence::High
        } else if raw.eq_ignore_ascii_case("l") || raw.eq_ignore_ascii_case("low") {
            Confidence::Low
        } else {
            Confidence::Nominal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Nominal => "nominal",
            Confidence::High => "high",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse fire intensity bucket stored on a fire report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Low,
    Medium,
    High,
    Extreme,
}

impl Intensity {
    /// FRP above [`EXTREME_FRP_MW`] wins over confidence; otherwise confidence decides.
    pub fn classify(confidence: Confidence, frp_mw: f64) -> Self {
        if frp_mw > EXTREME_FRP_MW {
            return Intensity::Extreme;
        }
        match confidence {
            Confidence::High => Intensity::High,
            Confidence::Nominal => Intensity::Medium,
            Confidence::Low => Intensity::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Intensity::Low => "low",
            Intensity::Medium => "medium",
            Intensity::High => "high",
            Intensity::Extreme => "extreme",
        }
    }
}

impl fmt::Display for Intensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DayNight {
    #[serde(rename = "D")]
    Day,
    #[serde(rename = "N")]
    Night,
}

impl DayNight {
    /// `N` (any case) is night; anything else, including empty, is day.
    pub fn from_flag(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("n") {
            DayNight::Night
        } else {
            DayNight::Day
        }
    }

    pub fn as_flag(&self) -> char {
        match self {
            DayNight::Day => 'D',
            DayNight::Night => 'N',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BoundingBoxError {
    #[error("bounding box needs 4 comma-separated numbers (west,south,east,north), got {0:?}")]
    Format(String),
    #[error("bounding box edge out of range: {0}")]
    OutOfRange(String),
    #[error("bounding box is empty: west must be < east and south < north")]
    Empty,
}

/// Rectangular region in decimal degrees, edges inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub const ARGENTINA: BoundingBox = BoundingBox {
        west: -73.5,
        south: -55.0,
        east: -53.5,
        north: -21.5,
    };

    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self, BoundingBoxError> {
        let bbox = Self {
            west,
            south,
            east,
            north,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    pub fn validate(&self) -> Result<(), BoundingBoxError> {
        for (name, value, limit) in [
            ("west", self.west, 180.0),
            ("east", self.east, 180.0),
            ("south", self.south, 90.0),
            ("north", self.north, 90.0),
        ] {
            if !value.is_finite() || value.abs() > limit {
                return Err(BoundingBoxError::OutOfRange(format!("{name}={value}")));
            }
        }
        if self.west >= self.east || self.south >= self.north {
            return Err(BoundingBoxError::Empty);
        }
        Ok(())
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.south..=self.north).contains(&latitude) && (self.west..=self.east).contains(&longitude)
    }

    /// `west,south,east,north`, the form the upstream area API expects.
    pub fn to_query_segment(&self) -> String {
        format!("{},{},{},{}", self.west, self.south, self.east, self.north)
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::ARGENTINA
    }
}

impl FromStr for BoundingBox {
    type Err = BoundingBoxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| BoundingBoxError::Format(s.to_string()))?;
        match parts.as_slice() {
            [west, south, east, north] => Self::new(*west, *south, *east, *north),
            _ => Err(BoundingBoxError::Format(s.to_string())),
        }
    }
}

/// Idempotency key for satellite detections: `{acq_date}_{acq_time}_{lat:.3}_{lon:.3}`.
pub fn derive_source_id(acq_date: NaiveDate, acq_time: NaiveTime, latitude: f64, longitude: f64) -> String {
    format!(
        "{}_{:02}{:02}_{:.3}_{:.3}",
        acq_date.format("%Y-%m-%d"),
        acq_time.hour(),
        acq_time.minute(),
        round_half_away(latitude),
        round_half_away(longitude)
    )
}

/// Three-decimal rounding with ties away from zero; `{:.3}` alone rounds ties to even.
fn round_half_away(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// One satellite thermal anomaly reading, as validated by the CSV parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub latitude: f64,
    pub longitude: f64,
    pub acq_date: NaiveDate,
    pub acq_time: NaiveTime,
    pub satellite: String,
    pub confidence: Confidence,
    pub version: String,
    pub frp: f64,
    pub brightness: f64,
    pub bright_t31: f64,
    pub scan: f64,
    pub track: f64,
    pub daynight: DayNight,
}

impl Hotspot {
    pub fn source_id(&self) -> String {
        derive_source_id(self.acq_date, self.acq_time, self.latitude, self.longitude)
    }

    pub fn intensity(&self) -> Intensity {
        Intensity::classify(self.confidence, self.frp)
    }

    pub fn detected_at(&self) -> DateTime<Utc> {
        self.acq_date.and_time(self.acq_time).and_utc()
    }

    /// Human-readable summary stored on the generated fire report.
    pub fn description(&self) -> String {
        let pass = match self.daynight {
            DayNight::Day => "daytime",
            DayNight::Night => "nighttime",
        };
        format!(
            "NASA FIRMS hotspot detected by {} | confidence: {} | FRP: {:.1} MW | {} {} UTC | {} pass",
            self.satellite,
            self.confidence,
            self.frp,
            self.acq_date.format("%Y-%m-%d"),
            self.acq_time.format("%H:%M"),
            pass
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportSource {
    Manual,
    NasaFirms,
    Twitter,
    Whatsapp,
    Telegram,
}

impl ReportSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportSource::Manual => "manual",
            ReportSource::NasaFirms => "nasa_firms",
            ReportSource::Twitter => "twitter",
            ReportSource::Whatsapp => "whatsapp",
            ReportSource::Telegram => "telegram",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Verified,
    Active,
    Contained,
    Extinguished,
    FalseAlarm,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Verified => "verified",
            ReportStatus::Active => "active",
            ReportStatus::Contained => "contained",
            ReportStatus::Extinguished => "extinguished",
            ReportStatus::FalseAlarm => "false_alarm",
        }
    }
}

/// Insert payload for the `fire_reports` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFireReport {
    pub latitude: f64,
    pub longitude: f64,
    pub status: ReportStatus,
    pub source: ReportSource,
    pub source_id: Option<String>,
    pub intensity: Option<Intensity>,
    pub description: Option<String>,
    pub detected_at: Option<DateTime<Utc>>,
}

impl NewFireReport {
    /// Pending `nasa_firms` report carrying the hotspot's key, intensity and summary.
    pub fn from_hotspot(hotspot: &Hotspot) -> Self {
        Self {
            latitude: hotspot.latitude,
            longitude: hotspot.longitude,
            status: ReportStatus::Pending,
            source: ReportSource::NasaFirms,
            source_id: Some(hotspot.source_id()),
            intensity: Some(hotspot.intensity()),
            description: Some(hotspot.description()),
            detected_at: Some(hotspot.detected_at()),
        }
    }
}

/// Persisted fire report row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireReport {
    pub id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub status: ReportStatus,
    pub source: ReportSource,
    pub source_id: Option<String>,
    pub intensity: Option<Intensity>,
    pub description: Option<String>,
    pub detected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FireReport {
    pub fn from_new(new: NewFireReport, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            latitude: new.latitude,
            longitude: new.longitude,
            status: new.status,
            source: new.source,
            source_id: new.source_id,
            intensity: new.intensity,
            description: new.description,
            detected_at: new.detected_at,
            created_at,
            updated_at: created_at,
        }
    }
}

/// The slice of an existing report that deduplication needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistingReport {
    pub latitude: f64,
    pub longitude: f64,
    pub source_id: Option<String>,
}

impl From<&FireReport> for ExistingReport {
    fn from(report: &FireReport) -> Self {
        Self {
            latitude: report.latitude,
            longitude: report.longitude,
            source_id: report.source_id.clone(),
        }
    }
}
