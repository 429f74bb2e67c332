//! Collaboflow document-search adapter: credentials, the search request and
//! normalization of returned records into [`CanonicalDocument`]s.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use reqsync_core::{CanonicalDocument, FactoryMap, RawRecord, PURCHASE_REQUISITION_FORM_ID};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "reqsync-adapters";

pub const SEARCH_PATH: &str = "/v1/documents/search";
pub const AUTH_HEADER: &str = "X-Collaboflow-Authorization";
pub const APP_CD: u32 = 1;
pub const SEARCH_OFFSET: u32 = 0;
pub const SEARCH_LIMIT: u32 = 100;

const JAPAN_UTC_OFFSET: &str = "+09:00";
const LOCAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const BODY_EXCERPT_CHARS: usize = 200;

/// Base64 of `"{user_id}/apikey:{api_key}"`, sent as `Basic` credentials.
pub fn build_auth_key(user_id: &str, api_key: &str) -> String {
    STANDARD.encode(format!("{user_id}/apikey:{api_key}"))
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub api_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("api_key", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn auth_key(&self) -> String {
        build_auth_key(&self.user_id, &self.api_key)
    }
}

pub fn search_query(form_id: i64, today: NaiveDate) -> String {
    format!(
        "form_id = {form_id} AND end_date >= '{}' ORDER BY end_date DESC",
        today.format("%Y-%m-%d")
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchRequest {
    pub app_cd: u32,
    pub query: String,
    pub offset: u32,
    pub limit: u32,
}

impl SearchRequest {
    /// Documents of `form_id` approved on or after `today`, newest first.
    pub fn approved_since(form_id: i64, today: NaiveDate) -> Self {
        Self {
            app_cd: APP_CD,
            query: search_query(form_id, today),
            offset: SEARCH_OFFSET,
            limit: SEARCH_LIMIT,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding search response: {message}; body starts with {body_excerpt:?}")]
    Decode {
        message: String,
        body_excerpt: String,
    },
    #[error("unexpected search response shape: {0}")]
    UnexpectedShape(String),
}

impl FetchError {
    fn decode(err: serde_json::Error, body: &[u8]) -> Self {
        let body_excerpt = String::from_utf8_lossy(body)
            .chars()
            .take(BODY_EXCERPT_CHARS)
            .collect();
        Self::Decode {
            message: err.to_string(),
            body_excerpt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Anything that can answer the approved-document search for one form.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_documents(
        &self,
        form_id: i64,
        today: NaiveDate,
    ) -> Result<Vec<JsonValue>, FetchError>;
}

#[derive(Debug)]
pub struct CollaboflowClient {
    client: reqwest::Client,
    search_url: String,
    auth_header: String,
    backoff: BackoffPolicy,
}

impl CollaboflowClient {
    pub fn new(
        api_url: &str,
        credentials: &Credentials,
        config: HttpClientConfig,
    ) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FetchError::Client)?;
        Ok(Self {
            client,
            search_url: format!("{}{SEARCH_PATH}", api_url.trim_end_matches('/')),
            auth_header: format!("Basic {}", credentials.auth_key()),
            backoff: config.backoff,
        })
    }

    pub fn search_url(&self) -> &str {
        &self.search_url
    }

    async fn post_search(&self, request: &SearchRequest) -> Result<Vec<u8>, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self
                .client
                .post(&self.search_url)
                .header(AUTH_HEADER, &self.auth_header)
                .json(request)
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(attempt, status = status.as_u16(), "retrying document search");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(attempt, error = %err, "retrying document search");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::UnexpectedShape(
                "retry loop ended without a response".to_string(),
            )),
        }
    }
}

#[async_trait]
impl DocumentSource for CollaboflowClient {
    fn source_id(&self) -> &'static str {
        "collaboflow"
    }

    async fn fetch_documents(
        &self,
        form_id: i64,
        today: NaiveDate,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let request = SearchRequest::approved_since(form_id, today);
        let span = info_span!("collaboflow_search", form_id, since = %today, url = %self.search_url);
        async {
            let body = self.post_search(&request).await?;
            let value: JsonValue =
                serde_json::from_slice(&body).map_err(|err| FetchError::decode(err, &body))?;
            let records = extract_records(value)?;
            debug!(records = records.len(), "document search answered");
            Ok(records)
        }
        .instrument(span)
        .await
    }
}

/// Pulls the `records` array out of a search response; an absent key means no records.
pub fn extract_records(value: JsonValue) -> Result<Vec<JsonValue>, FetchError> {
    let JsonValue::Object(mut body) = value else {
        return Err(FetchError::UnexpectedShape(
            "expected a JSON object at the top level".to_string(),
        ));
    };
    match body.remove("records") {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::Array(records)) => Ok(records),
        Some(other) => Err(FetchError::UnexpectedShape(format!(
            "`records` is not an array: {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("record #{index}: malformed record: {message}")]
    Malformed {
        index: usize,
        document_id: Option<i64>,
        message: String,
    },
    #[error("record #{index} (document {document_id}): unparseable end_date {value:?}: {message}")]
    EndDate {
        index: usize,
        document_id: i64,
        value: String,
        message: String,
    },
}

impl NormalizationError {
    pub fn index(&self) -> usize {
        match self {
            Self::Malformed { index, .. } | Self::EndDate { index, .. } => *index,
        }
    }

    pub fn document_id(&self) -> Option<i64> {
        match self {
            Self::Malformed { document_id, .. } => *document_id,
            Self::EndDate { document_id, .. } => Some(*document_id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalized {
    pub documents: Vec<CanonicalDocument>,
    pub rejected: Vec<NormalizationError>,
}

fn japan_offset() -> Result<FixedOffset, chrono::ParseError> {
    JAPAN_UTC_OFFSET.parse()
}

/// Converts an ISO-8601 UTC instant to Japan local time (`YYYY-MM-DD HH:MM:SS`).
/// Timestamps without an offset are taken as UTC.
pub fn to_japan_local(end_date: &str) -> Result<String, chrono::ParseError> {
    let trimmed = end_date.trim();
    let utc: DateTime<Utc> = match DateTime::parse_from_rfc3339(trimmed) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(rfc_err) => NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(|_| rfc_err)?,
    };
    Ok(utc
        .with_timezone(&japan_offset()?)
        .format(LOCAL_TIMESTAMP_FORMAT)
        .to_string())
}

pub fn normalize_record(
    record: RawRecord,
    form_id: i64,
    factory_map: &FactoryMap,
) -> Result<CanonicalDocument, chrono::ParseError> {
    let end_date = to_japan_local(&record.end_date)?;
    let request_factory = (form_id == PURCHASE_REQUISITION_FORM_ID)
        .then(|| factory_map.resolve(&record.document_number));
    Ok(CanonicalDocument {
        document_id: record.document_id,
        document_number: record.document_number,
        title: record.title,
        request_user: record.request_user.name,
        request_group: record.request_group.name,
        end_date,
        form_id,
        request_factory,
    })
}

/// Normalizes a batch, keeping input order. Records that cannot be decoded or
/// dated are reported in `rejected` without affecting the rest.
pub fn normalize(raw_records: Vec<JsonValue>, form_id: i64, factory_map: &FactoryMap) -> Normalized {
    let mut out = Normalized::default();
    for (index, value) in raw_records.into_iter().enumerate() {
        let document_id = value.get("document_id").and_then(JsonValue::as_i64);
        let record: RawRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(err) => {
                out.rejected.push(NormalizationError::Malformed {
                    index,
                    document_id,
                    message: err.to_string(),
                });
                continue;
            }
        };
        let (document_id, raw_end_date) = (record.document_id, record.end_date.clone());
        match normalize_record(record, form_id, factory_map) {
            Ok(document) => out.documents.push(document),
            Err(err) => out.rejected.push(NormalizationError::EndDate {
                index,
                document_id,
                value: raw_end_date,
                message: err.to_string(),
            }),
        }
    }
    out
}
