//! # vibedom proxy
//!
//! **Default-deny egress proxy with DLP scrubbing for sandboxed coding agents.**
//!
//! Every outbound HTTP request from the sandbox is checked against a domain
//! whitelist. Requests to allowed hosts have secrets and PII redacted from
//! their URL, sensitive headers and body; responses are scrubbed the same
//! way. Each exchange leaves exactly one JSON line in the audit log.
//!
//! ## Architecture
//!
//! - **[`gateway`]**: per-exchange state machine (decide, scrub, forward, log)
//! - **[`policy`]**: TOML configuration, the domain whitelist and hot reload
//! - **[`dlp`]**: detection rules (gitleaks-style plus built-in PII) and the content scrubber
//! - **[`logging`]**: append-only JSONL audit log with JSON/CSV export
//! - **[`proxy`]**: TCP forward proxy handling HTTP and HTTPS CONNECT tunneling
//! - **[`cli`]**: command-line interface (clap)
//! - **[`error`]**: unified error types using `thiserror`
//!
//! ## Quick Start
//!
//! ```bash
//! # Write vibedom.toml and trusted_domains.txt
//! vibedom-proxy init
//!
//! # Start the proxy (SIGHUP reloads whitelist and rules)
//! vibedom-proxy start --watch
//!
//! # Route agent traffic through the proxy
//! export HTTP_PROXY=http://127.0.0.1:8080 HTTPS_PROXY=http://127.0.0.1:8080
//! ```

pub mod cli;
pub mod dlp;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod policy;
pub mod proxy;
