//! Cursor-based extraction from the origin's REST endpoint.
//!
//! Pages are requested in ascending id order with `id > cursor`. Each page fetch
//! is retried on transient failures; any page that still fails aborts the whole
//! extraction so nothing from a partial window reaches the store.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::OriginSettings;
use crate::error::{ExtractionError, TransformError};
use crate::models::{DateRange, RawRecord};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub after_id: Option<i64>,
    pub limit: usize,
    pub range: DateRange,
}

impl PageRequest {
    /// PostgREST query parameters. The end date is inclusive, so it becomes `< end + 1 day`.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("select", "*".to_string()),
            ("order", "id.asc".to_string()),
            ("limit", self.limit.to_string()),
        ];
        if let Some(after) = self.after_id {
            pairs.push(("id", format!("gt.{after}")));
        }
        if let Some(start) = self.range.start {
            pairs.push(("timestamp", format!("gte.{start}")));
        }
        if let Some(next_day) = self.range.end.and_then(|end| end.succ_opt()) {
            pairs.push(("timestamp", format!("lt.{next_day}")));
        }
        pairs
    }
}

/// One page of raw JSON rows from the origin.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Value>, ExtractionError>;
}

pub struct HttpSource {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpSource {
    pub fn new(settings: &OriginSettings) -> Result<Self, ExtractionError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: settings.endpoint(),
            token: settings.token.clone(),
        })
    }
}

#[async_trait]
impl PageSource for HttpSource {
    #[tracing::instrument(level = "debug", skip_all, fields(after_id = ?request.after_id))]
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Value>, ExtractionError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .bearer_auth(&self.token)
            .header("apikey", &self.token)
            .query(&request.query_pairs())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExtractionError::from_status(status.as_u16(), body));
        }

        let rows: Value = resp.json().await?;
        match rows {
            Value::Array(rows) => Ok(rows),
            other => Err(ExtractionError::Decode(format!(
                "expected a JSON array, found {}",
                kind_of(&other)
            ))),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Everything pulled in one extraction call.
#[derive(Debug, Default)]
pub struct Extraction {
    pub records: Vec<RawRecord>,
    pub malformed: Vec<TransformError>,
    pub pages: usize,
    /// Highest id seen, including rows that failed to decode.
    pub max_id: Option<i64>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.malformed.is_empty()
    }
}

pub struct Extractor<'a> {
    source: &'a dyn PageSource,
    page_size: usize,
    policy: RetryPolicy,
}

impl<'a> Extractor<'a> {
    pub fn new(source: &'a dyn PageSource, page_size: usize, policy: RetryPolicy) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
            policy,
        }
    }

    /// Pulls every row with `id > cursor` (all rows when `cursor` is `None`) inside `range`.
    pub async fn extract(
        &self,
        cursor: Option<i64>,
        range: DateRange,
        cancel: &CancellationToken,
    ) -> Result<Extraction, ExtractionError> {
        let mut out = Extraction::default();
        let mut cursor = cursor;

        loop {
            if cancel.is_cancelled() {
                return Err(ExtractionError::Cancelled { pages: out.pages });
            }

            let request = PageRequest {
                after_id: cursor,
                limit: self.page_size,
                range,
            };
            let rows = self.fetch(&request).await?;
            let fetched = rows.len();
            if fetched == 0 {
                break;
            }

            let page_max = rows
                .iter()
                .filter_map(|row| row.get("id").and_then(Value::as_i64))
                .max()
                .ok_or_else(|| ExtractionError::Decode("page has no row ids".to_string()))?;
            if let Some(current) = cursor {
                if page_max <= current {
                    return Err(ExtractionError::NonMonotonic {
                        cursor: current,
                        page_max,
                    });
                }
            }

            for row in rows {
                let id = row.get("id").and_then(Value::as_i64);
                if let (Some(id), Some(current)) = (id, cursor) {
                    if id <= current {
                        tracing::warn!(id, cursor = current, "origin returned a row at or below the cursor");
                        continue;
                    }
                }
                match serde_json::from_value::<RawRecord>(row) {
                    Ok(record) => out.records.push(record),
                    Err(err) => {
                        let error = TransformError::Decode {
                            id,
                            message: err.to_string(),
                        };
                        tracing::warn!(%error, "dropping malformed row");
                        out.malformed.push(error);
                    }
                }
            }

            out.pages += 1;
            out.max_id = Some(page_max);
            cursor = Some(page_max);
            tracing::debug!(page = out.pages, fetched, cursor = page_max, "page extracted");

            if fetched < self.page_size {
                break;
            }
        }

        Ok(out)
    }

    async fn fetch(&self, request: &PageRequest) -> Result<Vec<Value>, ExtractionError> {
        let source = self.source;
        self.policy
            .run(move |_| source.fetch_page(request))
            .await
            .map_err(|failure| {
                if failure.attempts > 1 {
                    ExtractionError::RetriesExhausted {
                        attempts: failure.attempts,
                        source: Box::new(failure.error),
                    }
                } else {
                    failure.error
                }
            })
    }
}
