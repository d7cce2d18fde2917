//! InfluxDB v2 writer.
//!
//! Each record becomes one line-protocol point:
//! ```text
//! arduino_box_data,box_id=1 co2=450i,humidity=67,rhsp=71,box_temperature=34,bhsp=35,water_temperature=42,ihsp=40 1700000000000000000
//! ```
//! and is written synchronously through `POST /api/v2/write`.
//!
//! See: <https://docs.influxdata.com/influxdb/v2/reference/syntax/line-protocol/>

use crate::config::Settings;
use crate::error::{AppResult, LoggerError};
use crate::record::{RecordError, SensorRecord};
use crate::sink::RecordWriter;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Measurement every box point is written to.
pub const MEASUREMENT: &str = "arduino_box_data";

/// Tag carrying the record's `ID`.
pub const BOX_ID_TAG: &str = "box_id";

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Storage type of a mapped field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Written with the `i` suffix
    Integer,
    /// Written as a float
    Float,
}

/// Record key, field name, storage type.
pub const FIELD_MAP: [(&str, &str, FieldKind); 7] = [
    ("co2", "co2", FieldKind::Integer),
    ("%RH", "humidity", FieldKind::Float),
    ("RHSP", "rhsp", FieldKind::Float),
    ("boxTempC", "box_temperature", FieldKind::Float),
    ("BHSP", "bhsp", FieldKind::Float),
    ("waterTempC", "water_temperature", FieldKind::Float),
    ("IHSP", "ihsp", FieldKind::Float),
];

/// A value that can be stored in an InfluxDB field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit floating point.
    Float(f64),
    /// 64-bit signed integer.
    Integer(i64),
}

impl FieldValue {
    /// Format this value for InfluxDB line protocol.
    ///
    /// - Float: written as-is (e.g., `3.14`, `67`)
    /// - Integer: suffixed with `i` (e.g., `42i`)
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{}", v),
            FieldValue::Integer(v) => format!("{}i", v),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line_protocol())
    }
}

/// One point ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Measurement name
    pub measurement: String,
    /// Tag key-value pairs
    pub tags: Vec<(String, String)>,
    /// Field key-value pairs, in mapping order
    pub fields: Vec<(String, FieldValue)>,
    /// Nanoseconds since the Unix epoch
    pub timestamp_ns: i64,
}

impl Point {
    /// Tag value by key.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Field value by key.
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Render as one line of line protocol.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_measurement(&self.measurement);

        let mut sorted_tags: Vec<_> = self.tags.iter().collect();
        sorted_tags.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in sorted_tags {
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }

        line.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&value.to_line_protocol());
        }

        line.push(' ');
        line.push_str(&self.timestamp_ns.to_string());
        line
    }
}

/// Map a validated record onto a point.
pub fn to_point(record: &SensorRecord, timestamp_ns: i64) -> Result<Point, RecordError> {
    let mut fields = Vec::with_capacity(FIELD_MAP.len());
    for (key, field, kind) in FIELD_MAP {
        let value = match kind {
            FieldKind::Integer => FieldValue::Integer(record.integer(key)?),
            FieldKind::Float => FieldValue::Float(record.float(key)?),
        };
        fields.push((field.to_string(), value));
    }

    Ok(Point {
        measurement: MEASUREMENT.to_string(),
        tags: vec![(BOX_ID_TAG.to_string(), record.box_id())],
        fields,
        timestamp_ns,
    })
}

/// Spaces and commas must be escaped.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Commas, equals signs, and spaces must be escaped.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Current wall clock in nanoseconds since the epoch.
pub fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// [`RecordWriter`] posting to the InfluxDB v2 HTTP API.
#[derive(Clone)]
pub struct InfluxWriter {
    client: reqwest::Client,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxWriter {
    /// Build the writer from settings.
    ///
    /// An empty `INFLUXDB_TOKEN` is a startup-fatal
    /// [`LoggerError::MissingCredential`].
    pub fn new(settings: &Settings) -> AppResult<Self> {
        if settings.influxdb_token.trim().is_empty() {
            return Err(LoggerError::MissingCredential("INFLUXDB_TOKEN"));
        }

        let client = reqwest::Client::builder().timeout(WRITE_TIMEOUT).build()?;
        let write_url = format!("{}/api/v2/write", settings.influxdb_url());
        info!(url = %write_url, bucket = %settings.influxdb_bucket, "Created InfluxDB writer");

        Ok(Self {
            client,
            write_url,
            org: settings.influxdb_org.clone(),
            bucket: settings.influxdb_bucket.clone(),
            token: settings.influxdb_token.clone(),
        })
    }

    /// Write endpoint, without query parameters.
    pub fn write_url(&self) -> &str {
        &self.write_url
    }

    /// Send one point.
    pub async fn write_point(&self, point: &Point) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(point.to_line_protocol())
            .send()
            .await
            .context("InfluxDB write request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("InfluxDB rejected write ({}): {}", status, body.trim()));
        }
        Ok(())
    }
}

impl fmt::Debug for InfluxWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxWriter")
            .field("write_url", &self.write_url)
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl RecordWriter for InfluxWriter {
    fn name(&self) -> &str {
        "influx"
    }

    async fn write(&self, record: &SensorRecord) -> anyhow::Result<()> {
        let point = to_point(record, now_ns())?;
        self.write_point(&point).await?;
        info!(box_id = %record.box_id(), "Wrote data to Influx");
        Ok(())
    }
}
