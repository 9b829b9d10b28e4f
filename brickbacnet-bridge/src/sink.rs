//! Timeseries sinks.
//!
//! The polling scheduler hands every flushed batch to a [`TimeseriesSink`].
//! [`HttpSink`] posts batches to a timeseries endpoint, one request per value
//! column; [`LogSink`] writes them to the log for dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{SinkConfig, parse_value_columns};
use crate::error::{Error, Result};
use crate::model::Reading;
use crate::object::ObjectType;

/// Destination for polled readings.
#[async_trait]
pub trait TimeseriesSink: Send + Sync {
    /// Accept one batch. An empty batch is a no-op.
    async fn put_readings(&self, readings: &[Reading]) -> Result<()>;
}

/// Build the sink selected in the configuration.
pub fn from_config(config: &SinkConfig) -> Result<Arc<dyn TimeseriesSink>> {
    match config {
        SinkConfig::Http {
            url,
            token,
            timeout_secs,
            value_columns,
        } => {
            let columns = parse_value_columns(value_columns.as_ref())?;
            let sink = HttpSink::new(
                url.clone(),
                token.clone(),
                Duration::from_secs(*timeout_secs),
                columns,
            )?;
            Ok(Arc::new(sink))
        }
        SinkConfig::Log => Ok(Arc::new(LogSink)),
    }
}

/// One POST body: `{columns: ["uuid", "timestamp", <column>], data: [...]}`.
#[derive(Debug, Serialize)]
struct Batch<'a> {
    columns: [&'a str; 3],
    data: Vec<(Uuid, f64, serde_json::Value)>,
}

/// Posts batches to an HTTP timeseries endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    columns: HashMap<ObjectType, String>,
}

impl HttpSink {
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
        columns: HashMap<ObjectType, String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            token,
            columns,
        })
    }

    /// Group readings by value column. Unmapped object types are dropped.
    fn group<'a>(&'a self, readings: &[Reading]) -> BTreeMap<&'a str, Batch<'a>> {
        let mut groups: BTreeMap<&str, Batch> = BTreeMap::new();

        for reading in readings {
            let Some(column) = self.columns.get(&reading.object_type) else {
                debug!(
                    uuid = %reading.uuid,
                    object_type = %reading.object_type,
                    "No value column for object type, dropping reading"
                );
                continue;
            };

            let value = reading
                .value
                .as_ref()
                .map_or(serde_json::Value::Null, |v| v.to_json());
            let timestamp = reading.timestamp.timestamp_micros() as f64 / 1_000_000.0;

            groups
                .entry(column.as_str())
                .or_insert_with(|| Batch {
                    columns: ["uuid", "timestamp", column.as_str()],
                    data: Vec::new(),
                })
                .data
                .push((reading.uuid, timestamp, value));
        }
        groups
    }

    async fn post(&self, batch: &Batch<'_>) -> Result<()> {
        let mut request = self.client.post(&self.url).json(batch);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Sink(format!("{} returned {}: {}", self.url, status, body)))
        }
    }
}

#[async_trait]
impl TimeseriesSink for HttpSink {
    async fn put_readings(&self, readings: &[Reading]) -> Result<()> {
        for (column, batch) in self.group(readings) {
            debug!(column, rows = batch.data.len(), url = %self.url, "Posting readings");
            self.post(&batch).await?;
        }
        Ok(())
    }
}

/// Writes readings to the log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl TimeseriesSink for LogSink {
    async fn put_readings(&self, readings: &[Reading]) -> Result<()> {
        if readings.is_empty() {
            return Ok(());
        }
        info!("Received batch of {} reading(s)", readings.len());
        for reading in readings {
            match &reading.value {
                Some(value) => debug!(
                    uuid = %reading.uuid,
                    object_type = %reading.object_type,
                    timestamp = %reading.timestamp,
                    "{}",
                    value
                ),
                None => debug!(
                    uuid = %reading.uuid,
                    object_type = %reading.object_type,
                    timestamp = %reading.timestamp,
                    "null"
                ),
            }
        }
        Ok(())
    }
}

/// Keeps every batch in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    batches: Arc<Mutex<Vec<Vec<Reading>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches received so far, in order.
    pub fn batches(&self) -> Vec<Vec<Reading>> {
        self.batches.lock().clone()
    }

    /// All readings received so far.
    pub fn readings(&self) -> Vec<Reading> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl TimeseriesSink for MemorySink {
    async fn put_readings(&self, readings: &[Reading]) -> Result<()> {
        self.batches.lock().push(readings.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::config::default_value_columns;
    use crate::value::PropertyValue;

    type Captured = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    async fn capture(
        State((captured, status)): State<(Captured, StatusCode)>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        let auth = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        captured.lock().push((auth, body));
        status
    }

    async fn serve(status: StatusCode) -> (String, Captured) {
        let captured: Captured = Arc::default();
        let app = Router::new()
            .route("/timeseries", post(capture))
            .with_state((captured.clone(), status));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/timeseries", addr), captured)
    }

    fn reading(object_type: ObjectType, value: Option<PropertyValue>) -> Reading {
        Reading {
            uuid: Uuid::new_v4(),
            object_type,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            value,
        }
    }

    fn sink(url: String, token: Option<&str>) -> HttpSink {
        HttpSink::new(
            url,
            token.map(str::to_string),
            Duration::from_secs(5),
            default_value_columns(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_groups_by_value_column() {
        let (url, captured) = serve(StatusCode::OK).await;
        let sink = sink(url, Some("secret"));

        let temp = reading(ObjectType::AnalogInput, Some(PropertyValue::Real(21.5)));
        let fan = reading(ObjectType::BinaryOutput, None);
        let label = reading(
            ObjectType::CharacterstringValue,
            Some(PropertyValue::CharacterString("occupied".into())),
        );
        let unmapped = reading(ObjectType::Device, Some(PropertyValue::Integer(1)));

        sink.put_readings(&[temp.clone(), fan.clone(), label.clone(), unmapped])
            .await
            .unwrap();

        let requests = captured.lock().clone();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|(auth, _)| auth.as_deref() == Some("Bearer secret")));

        let number = &requests[0].1;
        assert_eq!(number["columns"], serde_json::json!(["uuid", "timestamp", "number"]));
        assert_eq!(number["data"][0][0], serde_json::json!(temp.uuid.to_string()));
        assert_eq!(number["data"][0][1], serde_json::json!(1714564800.0));
        assert_eq!(number["data"][0][2], serde_json::json!(21.5));
        assert_eq!(number["data"][1][2], serde_json::Value::Null);

        let text = &requests[1].1;
        assert_eq!(text["columns"][2], "text");
        assert_eq!(text["data"][0][2], "occupied");
    }

    #[tokio::test]
    async fn test_unmapped_batch_sends_nothing() {
        let (url, captured) = serve(StatusCode::OK).await;
        let sink = sink(url, None);

        sink.put_readings(&[reading(ObjectType::Device, None)]).await.unwrap();
        sink.put_readings(&[]).await.unwrap();
        assert!(captured.lock().is_empty());
    }

    #[tokio::test]
    async fn test_error_status_is_sink_error() {
        let (url, captured) = serve(StatusCode::INTERNAL_SERVER_ERROR).await;
        let sink = sink(url, None);

        let result = sink
            .put_readings(&[reading(ObjectType::AnalogValue, Some(PropertyValue::Real(1.0)))])
            .await;
        assert!(matches!(result, Err(Error::Sink(_))));
        assert_eq!(captured.lock()[0].0, None);
    }

    #[tokio::test]
    async fn test_from_config() {
        let log = from_config(&SinkConfig::Log).unwrap();
        log.put_readings(&[reading(ObjectType::AnalogInput, None)]).await.unwrap();

        let bad = SinkConfig::Http {
            url: "http://localhost/ts".into(),
            token: None,
            timeout_secs: 1,
            value_columns: Some(BTreeMap::from([("not-a-type".into(), "number".into())])),
        };
        assert!(matches!(from_config(&bad), Err(Error::Config(_))));
    }
}
