//! Minimal HTTP/1.1 message parsing and framing for the forward proxy.
//!
//! Only what an intercepting forward proxy needs: request and status lines,
//! header blocks, `Content-Length` and chunked bodies, and re-encoding with
//! `Connection: close` framing. Readers are generic so the parsers can be
//! exercised on in-memory buffers.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::{Host, Url};

use crate::error::{Result, VibedomError};
use crate::gateway::{HttpResponse, header_value, set_header};

/// Upper bound on a request or response head (start line plus headers).
pub const MAX_HEAD_BYTES: u64 = 64 * 1024;

/// Headers that describe a single connection and are not forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

fn protocol_error(message: impl Into<String>) -> VibedomError {
    VibedomError::Proxy(message.into())
}

/// A start line and its header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
}

/// Read a message head up to and including the blank line.
///
/// Returns `Ok(None)` if the stream ends before any byte arrives.
pub async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<MessageHead>> {
    let mut budget = MAX_HEAD_BYTES;
    let mut start_line: Option<String> = None;
    let mut headers = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut line).await?;
        if n == 0 {
            return match start_line {
                None => Ok(None),
                Some(_) => Err(protocol_error("connection closed inside message head")),
            };
        }
        if !line.ends_with(b"\n") {
            return Err(protocol_error("message head too large"));
        }
        budget -= n as u64;

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);
        match &start_line {
            // Tolerate stray blank lines before the start line.
            None if text.is_empty() => continue,
            None => start_line = Some(text.to_string()),
            Some(_) if text.is_empty() => break,
            Some(_) => {
                let (name, value) = text
                    .split_once(':')
                    .ok_or_else(|| protocol_error(format!("malformed header line: {}", text)))?;
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
    }

    Ok(start_line.map(|start_line| MessageHead { start_line, headers }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

pub fn parse_request_line(line: &str) -> Result<RequestLine> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), version) => Ok(RequestLine {
            method: method.to_ascii_uppercase(),
            target: target.to_string(),
            version: version.unwrap_or("HTTP/1.1").to_string(),
        }),
        _ => Err(protocol_error(format!("malformed request line: {}", line))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub status: u16,
    pub reason: String,
}

pub fn parse_status_line(line: &str) -> Result<StatusLine> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(protocol_error(format!("malformed status line: {}", line)));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| protocol_error(format!("malformed status line: {}", line)))?;
    Ok(StatusLine {
        status,
        reason: parts.next().unwrap_or_default().trim().to_string(),
    })
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    header_value(headers, "transfer-encoding").is_some_and(|te| {
        te.rsplit(',')
            .next()
            .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
    })
}

fn content_length(headers: &[(String, String)]) -> Result<Option<u64>> {
    header_value(headers, "content-length")
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| protocol_error(format!("invalid Content-Length: {}", v)))
        })
        .transpose()
}

pub fn request_body_length(headers: &[(String, String)]) -> Result<BodyLength> {
    if is_chunked(headers) {
        return Ok(BodyLength::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(0) | None => BodyLength::Empty,
        Some(n) => BodyLength::Fixed(n),
    })
}

pub fn response_body_length(
    request_method: &str,
    status: u16,
    headers: &[(String, String)],
) -> Result<BodyLength> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyLength::Empty);
    }
    if is_chunked(headers) {
        return Ok(BodyLength::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(0) => BodyLength::Empty,
        Some(n) => BodyLength::Fixed(n),
        None => BodyLength::UntilClose,
    })
}

/// Read exactly `len` body bytes.
pub async fn read_fixed<R: AsyncRead + Unpin>(reader: &mut R, len: u64) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    (&mut *reader).take(len).read_to_end(&mut body).await?;
    if (body.len() as u64) < len {
        return Err(protocol_error(format!(
            "body ended after {} of {} bytes",
            body.len(),
            len
        )));
    }
    Ok(body)
}

/// A chunked body read up to the buffer limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkedBody {
    /// The whole body, decoded, with the trailer section consumed.
    Complete(Vec<u8>),
    /// The limit was reached. `prefix` holds the decoded chunks read so far and
    /// `pending` the size of the next chunk, whose size line is already consumed.
    Overflow { prefix: Vec<u8>, pending: usize },
}

async fn read_chunk_size<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<usize> {
    let mut line = String::new();
    let n = (&mut *reader).take(1024).read_line(&mut line).await?;
    if n == 0 {
        return Err(protocol_error("connection closed inside chunked body"));
    }
    let size_field = line.trim().split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size_field, 16)
        .map_err(|_| protocol_error(format!("invalid chunk size: {:?}", size_field)))
}

async fn skip_chunk_terminator<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<()> {
    let mut line = String::new();
    (&mut *reader).take(2).read_line(&mut line).await?;
    Ok(())
}

async fn skip_trailers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = (&mut *reader).take(MAX_HEAD_BYTES).read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            return Ok(());
        }
    }
}

/// Decode a chunked body, stopping before the chunk that would exceed `limit`.
pub async fn read_chunked<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> Result<ChunkedBody> {
    let mut body = Vec::new();
    loop {
        let size = read_chunk_size(reader).await?;
        if size == 0 {
            break;
        }
        if body.len().saturating_add(size) > limit {
            return Ok(ChunkedBody::Overflow {
                prefix: body,
                pending: size,
            });
        }
        let chunk = read_fixed(reader, size as u64).await?;
        body.extend_from_slice(&chunk);
        skip_chunk_terminator(reader).await?;
    }
    skip_trailers(reader).await?;
    Ok(ChunkedBody::Complete(body))
}

/// Relay the rest of an overflowing chunked body, keeping chunked framing.
///
/// `prefix` is re-sent as one chunk, then the `pending` chunk and every chunk
/// after it are copied through up to the terminating zero-size chunk.
/// Trailers are dropped. Returns the number of body bytes relayed.
pub async fn relay_chunked<R, W>(
    reader: &mut R,
    writer: &mut W,
    prefix: &[u8],
    pending: usize,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut relayed = 0u64;
    if !prefix.is_empty() {
        writer
            .write_all(format!("{:x}\r\n", prefix.len()).as_bytes())
            .await?;
        writer.write_all(prefix).await?;
        writer.write_all(b"\r\n").await?;
        relayed += prefix.len() as u64;
    }
    let mut size = pending;
    while size > 0 {
        writer.write_all(format!("{:x}\r\n", size).as_bytes()).await?;
        let copied = tokio::io::copy(&mut (&mut *reader).take(size as u64), writer).await?;
        if copied < size as u64 {
            return Err(protocol_error(format!(
                "chunk ended after {} of {} bytes",
                copied, size
            )));
        }
        writer.write_all(b"\r\n").await?;
        relayed += copied;
        skip_chunk_terminator(reader).await?;
        size = read_chunk_size(reader).await?;
    }
    skip_trailers(reader).await?;
    writer.write_all(b"0\r\n\r\n").await?;
    writer.flush().await?;
    Ok(relayed)
}

/// Read until EOF or until more than `limit` bytes arrive.
///
/// Returns the bytes read and whether EOF was reached. When it was not, the
/// caller must stream the rest.
pub async fn read_until_close<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> Result<(Vec<u8>, bool)> {
    let mut body = Vec::new();
    (&mut *reader)
        .take(limit as u64 + 1)
        .read_to_end(&mut body)
        .await?;
    let complete = body.len() <= limit;
    Ok((body, complete))
}

/// Where to send a proxied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
    /// Origin-form target (`/path?query`) for the upstream request line.
    pub path: String,
    /// Absolute URL of the request.
    pub url: String,
}

impl Upstream {
    pub fn address(&self) -> String {
        socket_address(&self.host, self.port)
    }
}

/// `host:port`, bracketing IPv6 literals.
pub fn socket_address(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split an authority (`host[:port]`) into host and port.
///
/// Userinfo is rejected: the host that is checked must be the host that is dialed.
pub fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    if authority.contains(['@', '/', '?', '#']) {
        return Err(protocol_error(format!("invalid authority: {}", authority)));
    }
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| protocol_error(format!("invalid authority: {}", authority)))?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| protocol_error(format!("invalid port in {}", authority)))?,
        None => default_port,
    };
    if host.is_empty() {
        return Err(protocol_error("missing host"));
    }
    Ok((host.to_ascii_lowercase(), port))
}

fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Parse an absolute-form `http://` target.
///
/// Targets carrying userinfo or a fragment are rejected.
fn parse_absolute_target(target: &str) -> Result<Url> {
    let url = Url::parse(target)
        .map_err(|e| protocol_error(format!("invalid request target {}: {}", target, e)))?;
    if url.scheme() != "http" {
        return Err(protocol_error(format!(
            "unsupported scheme in {}; use CONNECT for TLS",
            target
        )));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(protocol_error("userinfo is not allowed in a proxy request target"));
    }
    if url.fragment().is_some() {
        return Err(protocol_error("fragment is not allowed in a proxy request target"));
    }
    Ok(url)
}

/// Host of a parsed URL without IPv6 brackets.
fn url_host(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain(domain) => Some(domain.to_ascii_lowercase()),
        Host::Ipv4(addr) => Some(addr.to_string()),
        Host::Ipv6(addr) => Some(addr.to_string()),
    }
}

/// Resolve the upstream from an absolute-form target, or from the `Host`
/// header for origin-form targets.
///
/// [`Upstream::url`] is the canonical form of the target; it is what the
/// policy check sees, so the checked host and the dialed host are the same.
pub fn resolve_upstream(target: &str, headers: &[(String, String)]) -> Result<Upstream> {
    if target.contains("://") {
        let url = parse_absolute_target(target)?;
        let host = url_host(&url).ok_or_else(|| protocol_error("missing host"))?;
        let port = url.port_or_known_default().unwrap_or(80);
        return Ok(Upstream {
            host,
            port,
            path: origin_form(&url),
            url: url.to_string(),
        });
    }
    if target.starts_with('/') {
        let host = header_value(headers, "host")
            .ok_or_else(|| protocol_error("origin-form request without Host header"))?;
        let (host, port) = parse_authority(host, 80)?;
        let mut upstream = Upstream {
            host,
            port,
            path: target.to_string(),
            url: String::new(),
        };
        upstream.url = format!("http://{}{}", upstream.address(), upstream.path);
        return Ok(upstream);
    }
    Err(protocol_error(format!("unsupported request target: {}", target)))
}

/// Drop hop-by-hop headers and ask the peer to close after this message.
pub fn prepare_forward_headers(headers: &mut Vec<(String, String)>) {
    let listed: Vec<String> = header_value(headers, "connection")
        .map(|v| v.split(',').map(|t| t.trim().to_ascii_lowercase()).collect())
        .unwrap_or_default();
    headers.retain(|(name, _)| {
        let lower = name.to_ascii_lowercase();
        !HOP_BY_HOP.contains(&lower.as_str()) && !listed.contains(&lower)
    });
    headers.push(("Connection".to_string(), "close".to_string()));
}

/// Frame a fully buffered body with `Content-Length`.
pub fn set_fixed_length(headers: &mut Vec<(String, String)>, len: usize) {
    headers.retain(|(name, _)| !name.eq_ignore_ascii_case("transfer-encoding"));
    set_header(headers, "Content-Length", len.to_string());
}

fn encode_head(start_line: &str, headers: &[(String, String)]) -> Vec<u8> {
    let mut out = String::with_capacity(256);
    out.push_str(start_line);
    out.push_str("\r\n");
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}

pub fn encode_request_head(method: &str, path: &str, headers: &[(String, String)]) -> Vec<u8> {
    encode_head(&format!("{} {} HTTP/1.1", method, path), headers)
}

pub fn encode_response_head(status: u16, reason: &str, headers: &[(String, String)]) -> Vec<u8> {
    encode_head(&format!("HTTP/1.1 {} {}", status, reason), headers)
}

/// Serialize a complete response, head and body.
pub fn encode_response(response: &HttpResponse) -> Vec<u8> {
    let mut out = encode_response_head(response.status, &response.reason, &response.headers);
    if let Some(body) = &response.body {
        out.extend_from_slice(body);
    }
    out
}
