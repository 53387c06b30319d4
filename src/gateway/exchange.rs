//! Message types passed through the gateway and the per-exchange audit guard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;
use url::Url;

use crate::dlp::catalog::PatternCatalog;
use crate::dlp::{Finding, merge_findings};
use crate::logging::{AuditRecord, AuditSink};
use crate::policy::whitelist::normalize_host;

/// Case-insensitive header lookup.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Replace every header called `name` with a single `name: value`.
pub fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: impl Into<String>) {
    headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    headers.push((name.to_string(), value.into()));
}

/// An intercepted outbound request.
///
/// `url` is the absolute-form target (`http://host/path?query`) or, for
/// origin-form requests, the path with the host in the `Host` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Normalized destination host, from the URL authority or the `Host` header.
    ///
    /// Absolute URLs are parsed the way the transport dials them. A URL that
    /// does not parse or carries userinfo has no destination host.
    pub fn destination_host(&self) -> String {
        if self.url.contains("://") {
            match Url::parse(&self.url) {
                Ok(url) if url.username().is_empty() && url.password().is_none() => {
                    url.host_str().map(normalize_host).unwrap_or_default()
                }
                _ => String::new(),
            }
        } else {
            self.header("host").map(normalize_host).unwrap_or_default()
        }
    }
}

/// A response travelling back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

/// Audit sink plus the side-channel accounting for failed writes.
pub(crate) struct Recorder {
    sink: Arc<dyn AuditSink>,
    failures: AtomicU64,
}

impl Recorder {
    pub(crate) fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            failures: AtomicU64::new(0),
        }
    }

    /// Append a record. Failures are reported on the diagnostics channel and
    /// counted; they never propagate to the exchange.
    pub(crate) fn write(&self, record: &AuditRecord) {
        if let Err(e) = self.sink.append(record) {
            let total = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "AUDIT WRITE FAILED for {} {} ({} failures so far): {}",
                record.method, record.host, total, e
            );
        }
    }

    pub(crate) fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// An allowed exchange between its request and its audit record.
///
/// Holds the catalog snapshot taken when the request was observed, so the
/// response is scrubbed with the same rules. Exactly one audit record is
/// written per exchange: by [`Exchange::complete`], by [`Exchange::fail`],
/// or on drop if the exchange is abandoned.
pub struct Exchange {
    pub(crate) host: String,
    pub(crate) method: String,
    pub(crate) url: String,
    pub(crate) reason: String,
    pub(crate) findings: Vec<Finding>,
    pub(crate) catalog: Arc<PatternCatalog>,
    pub(crate) recorder: Arc<Recorder>,
    logged: bool,
}

impl Exchange {
    pub(crate) fn new(
        host: String,
        method: String,
        url: String,
        reason: String,
        findings: Vec<Finding>,
        catalog: Arc<PatternCatalog>,
        recorder: Arc<Recorder>,
    ) -> Self {
        Self {
            host,
            method,
            url,
            reason,
            findings,
            catalog,
            recorder,
            logged: false,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request URL with query secrets redacted.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    /// Add a finding observed by the transport, e.g. a streamed body.
    pub fn record_finding(&mut self, finding: Finding) {
        merge_findings(&mut self.findings, [finding]);
    }

    /// Write the audit record for a finished exchange.
    pub fn complete(mut self) {
        self.log(None);
    }

    /// Write the audit record for an exchange that failed after the decision.
    pub fn fail(mut self, detail: &str) {
        self.log(Some(detail));
    }

    fn log(&mut self, detail: Option<&str>) {
        if self.logged {
            return;
        }
        self.logged = true;
        let reason = match detail {
            Some(detail) => format!("{}; {}", self.reason, detail),
            None => self.reason.clone(),
        };
        let record = AuditRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            host: self.host.clone(),
            method: self.method.clone(),
            url: self.url.clone(),
            allowed: true,
            reason,
            findings: std::mem::take(&mut self.findings),
        };
        self.recorder.write(&record);
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if !self.logged {
            warn!("Exchange {} {} aborted before completion", self.method, self.url);
            self.log(Some("exchange aborted before completion"));
        }
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("host", &self.host)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("findings", &self.findings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_host_from_absolute_url() {
        let req = HttpRequest::new("GET", "http://API.GitHub.com:8080/repos?q=1");
        assert_eq!(req.destination_host(), "api.github.com");
    }

    #[test]
    fn destination_host_ignores_fragment_and_rejects_userinfo() {
        let req = HttpRequest::new("GET", "http://github.com#@evil.example/x");
        assert_eq!(req.destination_host(), "github.com");
        let req = HttpRequest::new("GET", "http://github.com@evil.example/x");
        assert_eq!(req.destination_host(), "");
        let req = HttpRequest::new("GET", "http://[::1]:8080/");
        assert_eq!(req.destination_host(), "::1");
    }

    #[test]
    fn destination_host_from_host_header() {
        let req = HttpRequest::new("GET", "/path").with_header("Host", "example.com:80");
        assert_eq!(req.destination_host(), "example.com");
        assert_eq!(HttpRequest::new("GET", "/path").destination_host(), "");
    }

    #[test]
    fn set_header_replaces_case_insensitively() {
        let mut headers = vec![
            ("content-length".to_string(), "10".to_string()),
            ("Accept".to_string(), "*/*".to_string()),
        ];
        set_header(&mut headers, "Content-Length", "3");
        assert_eq!(header_value(&headers, "CONTENT-LENGTH"), Some("3"));
        assert_eq!(headers.len(), 2);
    }
}
