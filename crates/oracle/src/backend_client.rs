//! Report store adapter: list analysis reports, mark one as submitted.
//!
//! Endpoints (relative to the configured base URL):
//!   GET  /reports                        -> [AnalysisReport]
//!   POST /reports/{id}/mark-submitted    {"tx_signature": "..."} -> 2xx
//!
//! The store owns the `submitted` flag. Marking is idempotent on the store
//! side: repeating the call with the same or a different signature is a no-op
//! once the flag is set.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode, Url};
use serde_json::json;
use thiserror::Error;

use securizz_common::AnalysisReport;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),

    #[error("backend request failed: {0}")]
    Network(String),

    #[error("backend request timed out")]
    Timeout,

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("report {0} not found")]
    NotFound(String),

    #[error("backend response could not be decoded: {0}")]
    Decode(String),
}

/// Narrow view of the report store used by the oracle.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Lists every report the store knows about.
    async fn list_reports(&self) -> Result<Vec<AnalysisReport>, BackendError>;

    /// Sets the report's `submitted` flag, recording `tx_signature`.
    async fn mark_submitted(&self, report_id: &str, tx_signature: &str)
        -> Result<(), BackendError>;
}

// ════════════════════════════════════════════════════════════════════════════════
// HTTP
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct HttpReportStore {
    base: Url,
    client: Client,
}

impl HttpReportStore {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, BackendError> {
        let base = Url::parse(base.trim_end_matches('/'))
            .map_err(|e| BackendError::InvalidUrl(format!("{}: {}", base, e)))?;
        if base.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl(base.to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Ok(HttpReportStore { base, client })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else if e.is_decode() {
        BackendError::Decode(e.to_string())
    } else {
        BackendError::Network(e.to_string())
    }
}

#[async_trait]
impl ReportStore for HttpReportStore {
    async fn list_reports(&self) -> Result<Vec<AnalysisReport>, BackendError> {
        let url = self.endpoint(&["reports"])?;
        let resp = self.client.get(url).send().await.map_err(map_reqwest_error)?;
        let status = resp.status();
        if !status.is_success() {
            let t = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: t,
            });
        }
        resp.json::<Vec<AnalysisReport>>()
            .await
            .map_err(map_reqwest_error)
    }

    async fn mark_submitted(
        &self,
        report_id: &str,
        tx_signature: &str,
    ) -> Result<(), BackendError> {
        let url = self.endpoint(&["reports", report_id, "mark-submitted"])?;
        let body = json!({ "tx_signature": tx_signature });
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_FOUND {
            Err(BackendError::NotFound(report_id.to_string()))
        } else {
            let t = resp.text().await.unwrap_or_default();
            Err(BackendError::Status {
                status: status.as_u16(),
                body: t,
            })
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// MOCK
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MockStoreInner {
    reports: Vec<AnalysisReport>,
    signatures: HashMap<String, String>,
    mark_calls: usize,
    list_failures: VecDeque<BackendError>,
    mark_failures: VecDeque<BackendError>,
}

/// In-memory report store with the same idempotent marking semantics as the
/// real backend. The first signature recorded for a report is kept.
#[derive(Default)]
pub struct MockReportStore {
    inner: Mutex<MockStoreInner>,
}

impl MockReportStore {
    pub fn new(reports: Vec<AnalysisReport>) -> Self {
        MockReportStore {
            inner: Mutex::new(MockStoreInner {
                reports,
                ..Default::default()
            }),
        }
    }

    pub fn insert(&self, report: AnalysisReport) {
        self.inner.lock().reports.push(report);
    }

    pub fn report(&self, id: &str) -> Option<AnalysisReport> {
        self.inner.lock().reports.iter().find(|r| r.id == id).cloned()
    }

    /// Signature recorded by the first successful mark.
    pub fn signature(&self, id: &str) -> Option<String> {
        self.inner.lock().signatures.get(id).cloned()
    }

    /// Successful and failed mark calls alike.
    pub fn mark_calls(&self) -> usize {
        self.inner.lock().mark_calls
    }

    pub fn fail_next_list(&self, err: BackendError) {
        self.inner.lock().list_failures.push_back(err);
    }

    pub fn fail_next_mark(&self, err: BackendError) {
        self.inner.lock().mark_failures.push_back(err);
    }

    /// Overwrites the stored content identifier (used to stage edits).
    pub fn set_content_id(&self, id: &str, content_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(r) = inner.reports.iter_mut().find(|r| r.id == id) {
            r.content_id = content_id.to_string();
        }
    }
}

#[async_trait]
impl ReportStore for MockReportStore {
    async fn list_reports(&self) -> Result<Vec<AnalysisReport>, BackendError> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.list_failures.pop_front() {
            return Err(err);
        }
        Ok(inner.reports.clone())
    }

    async fn mark_submitted(
        &self,
        report_id: &str,
        tx_signature: &str,
    ) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        inner.mark_calls += 1;
        if let Some(err) = inner.mark_failures.pop_front() {
            return Err(err);
        }
        let report = inner
            .reports
            .iter_mut()
            .find(|r| r.id == report_id)
            .ok_or_else(|| BackendError::NotFound(report_id.to_string()))?;
        report.submitted = true;
        inner
            .signatures
            .entry(report_id.to_string())
            .or_insert_with(|| tx_signature.to_string());
        Ok(())
    }
}
