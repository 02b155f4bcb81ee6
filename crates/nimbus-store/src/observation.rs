//! Weather observation type and its persisted record mapping.
//!
//! A stored row is read into an [`ObservationRecord`] whose fields are all
//! optional, then converted into a [`WeatherObservation`]. The conversion
//! fails with [`IncompleteRecord`] when any field is missing or unreadable;
//! the history store drops such rows from read results.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A single weather lookup result, as kept in history.
///
/// Temperatures are degrees Celsius. Records are immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub id: Uuid,
    /// City name exactly as entered or returned; not normalized.
    pub city: String,
    pub temperature: f64,
    pub feels_like: f64,
    pub description: String,
    /// Icon identifier, also the icon cache key.
    pub icon: String,
    pub humidity: i32,
    pub timestamp: DateTime<Utc>,
}

impl WeatherObservation {
    /// Create an observation with a fresh id, timestamped now.
    pub fn new(
        city: impl Into<String>,
        temperature: f64,
        feels_like: f64,
        description: impl Into<String>,
        icon: impl Into<String>,
        humidity: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            city: city.into(),
            temperature,
            feels_like,
            description: description.into(),
            icon: icon.into(),
            humidity,
            timestamp: Utc::now().trunc_subsecs(6),
        }
    }

    /// Replace the timestamp. Storage keeps microsecond precision.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.trunc_subsecs(6);
        self
    }

    /// A handful of observations for previews and demos.
    pub fn samples() -> Vec<Self> {
        vec![
            Self::new("London", 15.5, 14.2, "Partly cloudy", "02d", 65),
            Self::new("Paris", 18.0, 17.5, "Clear sky", "01d", 55),
            Self::new("Tokyo", 22.0, 21.0, "Rainy", "10d", 80),
            Self::new("New York", 12.0, 10.5, "Cloudy", "04d", 70),
        ]
    }
}

/// A stored observation whose required fields could not all be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("incomplete observation record {}: missing {field}", .id.as_deref().unwrap_or("<no id>"))]
pub struct IncompleteRecord {
    pub id: Option<String>,
    pub field: &'static str,
}

/// Attribute mapping of one persisted observation row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationRecord {
    pub id: Option<String>,
    pub city: Option<String>,
    pub temperature: Option<f64>,
    pub feels_like: Option<f64>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub humidity: Option<i64>,
    /// Microseconds since the Unix epoch.
    pub timestamp_us: Option<i64>,
}

impl ObservationRecord {
    /// Column list matching [`ObservationRecord::from_row`].
    pub const COLUMNS: &'static str =
        "id, city, temperature, feels_like, description, icon, humidity, timestamp_us";

    /// Read a row selected with [`ObservationRecord::COLUMNS`].
    ///
    /// A column holding NULL or a value of the wrong type reads as `None`.
    pub fn from_row(row: &rusqlite::Row<'_>) -> Self {
        Self {
            id: row.get::<_, Option<String>>(0).ok().flatten(),
            city: row.get::<_, Option<String>>(1).ok().flatten(),
            temperature: row.get::<_, Option<f64>>(2).ok().flatten(),
            feels_like: row.get::<_, Option<f64>>(3).ok().flatten(),
            description: row.get::<_, Option<String>>(4).ok().flatten(),
            icon: row.get::<_, Option<String>>(5).ok().flatten(),
            humidity: row.get::<_, Option<i64>>(6).ok().flatten(),
            timestamp_us: row.get::<_, Option<i64>>(7).ok().flatten(),
        }
    }
}

impl From<&WeatherObservation> for ObservationRecord {
    fn from(obs: &WeatherObservation) -> Self {
        Self {
            id: Some(obs.id.to_string()),
            city: Some(obs.city.clone()),
            temperature: Some(obs.temperature),
            feels_like: Some(obs.feels_like),
            description: Some(obs.description.clone()),
            icon: Some(obs.icon.clone()),
            humidity: Some(i64::from(obs.humidity)),
            timestamp_us: Some(obs.timestamp.timestamp_micros()),
        }
    }
}

impl TryFrom<ObservationRecord> for WeatherObservation {
    type Error = IncompleteRecord;

    fn try_from(record: ObservationRecord) -> Result<Self, Self::Error> {
        let raw_id = record.id;
        let missing = |field: &'static str| IncompleteRecord {
            id: raw_id.clone(),
            field,
        };

        let id = raw_id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| missing("id"))?;
        let city = record.city.ok_or_else(|| missing("city"))?;
        let temperature = record.temperature.ok_or_else(|| missing("temperature"))?;
        let feels_like = record.feels_like.ok_or_else(|| missing("feels_like"))?;
        let description = record.description.ok_or_else(|| missing("description"))?;
        let icon = record.icon.ok_or_else(|| missing("icon"))?;
        let humidity = record
            .humidity
            .and_then(|h| i32::try_from(h).ok())
            .ok_or_else(|| missing("humidity"))?;
        let timestamp = record
            .timestamp_us
            .and_then(DateTime::<Utc>::from_timestamp_micros)
            .ok_or_else(|| missing("timestamp"))?;

        Ok(Self {
            id,
            city,
            temperature,
            feels_like,
            description,
            icon,
            humidity,
            timestamp,
        })
    }
}
