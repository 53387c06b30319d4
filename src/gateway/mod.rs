//! The policy gateway: one decision, one scrub pass and one audit record per exchange.
//!
//! A transport calls [`PolicyGateway::handle_request`] for every intercepted
//! request. A denied destination yields a ready-made rejection response and
//! the audit record is written before the call returns. An allowed request
//! comes back scrubbed together with an [`Exchange`] guard; the transport
//! forwards it and later hands the upstream response to
//! [`PolicyGateway::handle_response`], which scrubs it and writes the record.
//!
//! ```text
//! OBSERVED -> DECIDED --denied--> REJECTED -----------------------> LOGGED
//!                     --allowed-> SCRUBBED -> FORWARDED -> response -> LOGGED
//! ```
//!
//! The engine owns no sockets. Whitelist and catalog are read from atomic
//! snapshots, so a reload never blocks or tears an in-flight decision.

pub mod exchange;

use std::borrow::Cow;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{info, warn};

pub use exchange::{Exchange, HttpRequest, HttpResponse, header_value, set_header};
use exchange::Recorder;

use crate::dlp::catalog::PatternCatalog;
use crate::dlp::scrubber::{ContentClass, ContentScrubber, ScrubConfig, classify};
use crate::dlp::{Finding, Location, TUNNEL_NOT_INSPECTED, merge_findings};
use crate::error::Result;
use crate::logging::{AuditRecord, AuditSink, JsonlAuditLog};
use crate::policy::config::AppConfig;
use crate::policy::whitelist::{DomainMatcher, Verdict, Whitelist};

/// Status code of the rejection response.
pub const REJECT_STATUS: u16 = 403;
/// Header carrying the denial reason on rejection responses.
pub const REASON_HEADER: &str = "X-Vibedom-Reason";

/// Result of [`PolicyGateway::handle_request`].
#[derive(Debug)]
pub enum RequestDecision {
    /// Destination allowed; forward the scrubbed request, then call
    /// [`PolicyGateway::handle_response`] with the exchange.
    Forward(Exchange, HttpRequest),
    /// Destination denied and already logged; send this response to the client.
    Reject(HttpResponse),
}

/// Build the response sent to a client whose destination was denied.
pub fn rejection_response(reason: &str) -> HttpResponse {
    let header_safe: String = reason
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let body = format!("Domain not whitelisted by vibedom: {}\n", header_safe);
    HttpResponse::new(REJECT_STATUS, "Forbidden")
        .with_header("Content-Type", "text/plain; charset=utf-8")
        .with_header(REASON_HEADER, &header_safe)
        .with_header("Content-Length", &body.len().to_string())
        .with_header("Connection", "close")
        .with_body(body)
}

/// `502 Bad Gateway` for upstream connection failures.
pub fn bad_gateway_response(detail: &str) -> HttpResponse {
    let body = format!("vibedom: upstream unreachable: {}\n", detail);
    HttpResponse::new(502, "Bad Gateway")
        .with_header("Content-Type", "text/plain; charset=utf-8")
        .with_header("Content-Length", &body.len().to_string())
        .with_header("Connection", "close")
        .with_body(body)
}

/// Orchestrates domain policy, DLP scrubbing and audit for every exchange.
pub struct PolicyGateway {
    matcher: DomainMatcher,
    catalog: ArcSwap<PatternCatalog>,
    scrubber: ContentScrubber,
    recorder: Arc<Recorder>,
}

impl PolicyGateway {
    pub fn new(
        matcher: DomainMatcher,
        catalog: PatternCatalog,
        scrubber: ContentScrubber,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            matcher,
            catalog: ArcSwap::from_pointee(catalog),
            scrubber,
            recorder: Arc::new(Recorder::new(audit)),
        }
    }

    /// Build a gateway from configuration.
    ///
    /// An unreadable whitelist denies everything. A broken rule file or an
    /// unopenable audit log is an error.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let whitelist = Whitelist::load_or_deny_all(&config.whitelist.path);
        let catalog = PatternCatalog::load(config.dlp.patterns.as_deref(), config.dlp.builtin_pii)?;
        let audit = JsonlAuditLog::open(&config.audit.path)?;
        info!("Audit log: {}", config.audit.path.display());
        Ok(Self::new(
            DomainMatcher::new(whitelist),
            catalog,
            ContentScrubber::new(ScrubConfig::from(&config.dlp)),
            Arc::new(audit),
        ))
    }

    pub fn matcher(&self) -> &DomainMatcher {
        &self.matcher
    }

    /// The catalog snapshot new exchanges will use.
    pub fn catalog(&self) -> Arc<PatternCatalog> {
        self.catalog.load_full()
    }

    /// Atomically install a new catalog. In-flight exchanges keep theirs.
    pub fn replace_catalog(&self, catalog: PatternCatalog) {
        self.catalog.store(Arc::new(catalog));
    }

    pub fn scrubber(&self) -> &ContentScrubber {
        &self.scrubber
    }

    /// Number of audit records that could not be written.
    pub fn audit_failures(&self) -> u64 {
        self.recorder.failures()
    }

    /// Decide and scrub an intercepted request.
    pub fn handle_request(&self, mut request: HttpRequest) -> RequestDecision {
        let host = request.destination_host();
        let verdict = self.matcher.snapshot().evaluate(&host);
        let catalog = self.catalog.load_full();

        let (scrubbed_url, mut findings) = match self.scrubber.scrub_url(&request.url, &catalog) {
            (Cow::Owned(url), found) => (Some(url), found),
            (Cow::Borrowed(_), found) => (None, found),
        };
        if let Some(url) = scrubbed_url {
            request.url = url;
        }

        if !verdict.allowed {
            warn!("BLOCKED {} {} - {}", request.method, request.url, verdict.reason);
            let record = AuditRecord {
                timestamp: chrono::Utc::now().to_rfc3339(),
                host,
                method: request.method,
                url: request.url,
                allowed: false,
                reason: verdict.reason.clone(),
                findings,
            };
            self.recorder.write(&record);
            return RequestDecision::Reject(rejection_response(&verdict.reason));
        }

        merge_findings(
            &mut findings,
            self.scrubber.scrub_headers(&mut request.headers, &catalog),
        );
        merge_findings(
            &mut findings,
            self.scrub_body(
                &catalog,
                &mut request.headers,
                &mut request.body,
                Location::RequestBody,
            ),
        );
        // Bodies must stay readable for response scrubbing.
        if request.header("accept-encoding").is_some() {
            set_header(&mut request.headers, "Accept-Encoding", "identity");
        }

        info!("ALLOWED {} {} - {}", request.method, request.url, verdict.reason);
        log_findings(&request.method, &request.url, &findings);
        let exchange = Exchange::new(
            host,
            request.method.clone(),
            request.url.clone(),
            verdict.reason,
            findings,
            catalog,
            self.recorder.clone(),
        );
        RequestDecision::Forward(exchange, request)
    }

    /// Scrub the upstream response, write the exchange's audit record and
    /// return the response to send to the client.
    pub fn handle_response(
        &self,
        mut exchange: Exchange,
        mut response: HttpResponse,
    ) -> HttpResponse {
        let catalog = exchange.catalog.clone();
        let mut findings = self.scrubber.scrub_headers(&mut response.headers, &catalog);
        merge_findings(
            &mut findings,
            self.scrub_body(
                &catalog,
                &mut response.headers,
                &mut response.body,
                Location::ResponseBody,
            ),
        );
        log_findings(exchange.method(), exchange.url(), &findings);
        merge_findings(&mut exchange.findings, findings);
        exchange.complete();
        response
    }

    /// Decide a `CONNECT` tunnel on its host alone.
    ///
    /// Allowed tunnels return an exchange already marked as not inspected;
    /// the transport completes it when the tunnel closes.
    pub fn handle_connect(&self, authority: &str) -> std::result::Result<Exchange, HttpResponse> {
        let verdict = self.matcher.evaluate(authority);
        let host = crate::policy::whitelist::normalize_host(authority);
        if !verdict.allowed {
            warn!("BLOCKED CONNECT {} - {}", authority, verdict.reason);
            self.recorder.write(&AuditRecord {
                timestamp: chrono::Utc::now().to_rfc3339(),
                host,
                method: "CONNECT".to_string(),
                url: authority.to_string(),
                allowed: false,
                reason: verdict.reason.clone(),
                findings: Vec::new(),
            });
            return Err(rejection_response(&verdict.reason));
        }

        info!("ALLOWED CONNECT {} - {}", authority, verdict.reason);
        Ok(Exchange::new(
            host,
            "CONNECT".to_string(),
            authority.to_string(),
            verdict.reason,
            vec![Finding::new(TUNNEL_NOT_INSPECTED, Location::RequestBody, 1)],
            self.catalog.load_full(),
            self.recorder.clone(),
        ))
    }

    /// Check a host without creating an exchange.
    pub fn evaluate(&self, host: &str) -> Verdict {
        self.matcher.evaluate(host)
    }

    fn scrub_body(
        &self,
        catalog: &PatternCatalog,
        headers: &mut Vec<(String, String)>,
        body: &mut Option<Vec<u8>>,
        location: Location,
    ) -> Vec<Finding> {
        let Some(bytes) = body.as_ref().filter(|b| !b.is_empty()) else {
            return Vec::new();
        };
        let content_type = header_value(headers, "content-type").map(str::to_string);

        let encoded = header_value(headers, "content-encoding")
            .is_some_and(|enc| !enc.trim().eq_ignore_ascii_case("identity"));
        if encoded {
            return match classify(bytes, content_type.as_deref()) {
                ContentClass::Text if content_type.is_some() => {
                    vec![Finding::undecodable(location)]
                }
                _ => Vec::new(),
            };
        }

        let scrubbed = self
            .scrubber
            .scrub(bytes, content_type.as_deref(), catalog, location);
        let findings = scrubbed.findings;
        let replacement = match scrubbed.content {
            Cow::Owned(new_body) => Some(new_body),
            Cow::Borrowed(_) => None,
        };
        if let Some(new_body) = replacement {
            if header_value(headers, "content-length").is_some() {
                set_header(headers, "Content-Length", new_body.len().to_string());
            }
            *body = Some(new_body);
        }
        findings
    }
}

fn log_findings(method: &str, url: &str, findings: &[Finding]) {
    for finding in findings {
        if finding.is_degraded() {
            warn!(
                "NOT SCRUBBED {} {} - {} at {:?}",
                method, url, finding.rule_name, finding.location
            );
        } else {
            info!(
                "SCRUBBED {} {} - {} x{} at {:?}",
                method, url, finding.rule_name, finding.occurrence_count, finding.location
            );
        }
    }
}
