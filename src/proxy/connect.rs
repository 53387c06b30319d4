use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::http::{self, BodyLength, ChunkedBody};
use crate::dlp::{Finding, Location};
use crate::gateway::{
    Exchange, HttpRequest, HttpResponse, PolicyGateway, RequestDecision, bad_gateway_response,
};
use crate::policy::whitelist::normalize_host;

/// Transport limits shared by all connections.
#[derive(Debug, Clone, Copy)]
pub struct ProxySettings {
    pub upstream_timeout: Duration,
    pub max_buffer_bytes: usize,
}

type ClientReader = BufReader<OwnedReadHalf>;

/// Main accept loop: accept incoming connections and handle them.
pub async fn accept_loop(
    listener: TcpListener,
    gateway: Arc<PolicyGateway>,
    settings: ProxySettings,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("New connection from {}", peer_addr);
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &gateway, settings).await {
                        warn!("Error handling connection from {}: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn respond<W: AsyncWrite + Unpin>(
    client: &mut W,
    response: &HttpResponse,
) -> anyhow::Result<()> {
    client.write_all(&http::encode_response(response)).await?;
    client.flush().await?;
    Ok(())
}

fn bad_request(detail: &str) -> HttpResponse {
    let body = format!("vibedom: bad request: {}\n", detail);
    HttpResponse::new(400, "Bad Request")
        .with_header("Content-Type", "text/plain; charset=utf-8")
        .with_header("Content-Length", &body.len().to_string())
        .with_header("Connection", "close")
        .with_body(body)
}

/// Handle a single client connection: one request, then close.
async fn handle_connection(
    client: TcpStream,
    gateway: &PolicyGateway,
    settings: ProxySettings,
) -> anyhow::Result<()> {
    let (read_half, mut writer) = client.into_split();
    let mut reader = BufReader::new(read_half);

    let head = match http::read_head(&mut reader).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(e) => {
            respond(&mut writer, &bad_request(&e.to_string())).await?;
            return Ok(());
        }
    };
    let line = match http::parse_request_line(&head.start_line) {
        Ok(line) => line,
        Err(e) => {
            respond(&mut writer, &bad_request(&e.to_string())).await?;
            return Ok(());
        }
    };

    if line.method == "CONNECT" {
        handle_connect(reader, writer, &line.target, gateway, settings).await
    } else {
        handle_http_request(&mut reader, &mut writer, line, head.headers, gateway, settings).await
    }
}

async fn connect_upstream(address: &str, timeout: Duration) -> Result<TcpStream, String> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(format!("connect to {} failed: {}", address, e)),
        Err(_) => Err(format!("connect to {} timed out", address)),
    }
}

/// Handle CONNECT: policy on the host only, then an opaque tunnel.
///
/// The tunnel dials exactly the `host:port` the policy was asked about.
async fn handle_connect(
    mut client_reader: ClientReader,
    mut client_writer: OwnedWriteHalf,
    authority: &str,
    gateway: &PolicyGateway,
    settings: ProxySettings,
) -> anyhow::Result<()> {
    let address = match http::parse_authority(authority, 443) {
        Ok((host, port)) => http::socket_address(&host, port),
        Err(e) => {
            respond(&mut client_writer, &bad_request(&e.to_string())).await?;
            return Ok(());
        }
    };
    let exchange = match gateway.handle_connect(&address) {
        Ok(exchange) => exchange,
        Err(rejection) => {
            respond(&mut client_writer, &rejection).await?;
            return Ok(());
        }
    };

    let remote = match connect_upstream(&address, settings.upstream_timeout).await {
        Ok(remote) => remote,
        Err(detail) => {
            warn!("CONNECT {} failed: {}", address, detail);
            exchange.fail(&detail);
            respond(&mut client_writer, &bad_gateway_response(&detail)).await?;
            return Ok(());
        }
    };

    client_writer
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    let (mut remote_read, mut remote_write) = remote.into_split();
    let client_to_remote = tokio::io::copy(&mut client_reader, &mut remote_write);
    let remote_to_client = tokio::io::copy(&mut remote_read, &mut client_writer);

    tokio::select! {
        r = client_to_remote => {
            if let Err(e) = r { debug!("client->remote error: {}", e); }
        }
        r = remote_to_client => {
            if let Err(e) = r { debug!("remote->client error: {}", e); }
        }
    }
    exchange.complete();
    Ok(())
}

/// Request body as read from the client.
enum RequestBody {
    Buffered(Option<Vec<u8>>),
    /// Declared length above the buffer limit; relayed without inspection.
    Streamed(u64),
    /// Chunked body that outgrew the buffer; the rest is relayed chunked.
    StreamedChunked { prefix: Vec<u8>, pending: usize },
}

async fn read_request_body(
    client_reader: &mut ClientReader,
    headers: &mut Vec<(String, String)>,
    max_buffer_bytes: usize,
) -> crate::error::Result<RequestBody> {
    Ok(match http::request_body_length(headers)? {
        BodyLength::Fixed(n) if n > max_buffer_bytes as u64 => RequestBody::Streamed(n),
        BodyLength::Fixed(n) => {
            RequestBody::Buffered(Some(http::read_fixed(client_reader, n).await?))
        }
        BodyLength::Chunked => match http::read_chunked(client_reader, max_buffer_bytes).await? {
            ChunkedBody::Complete(body) => {
                http::set_fixed_length(headers, body.len());
                RequestBody::Buffered(Some(body))
            }
            ChunkedBody::Overflow { prefix, pending } => {
                headers.retain(|(name, _)| !name.eq_ignore_ascii_case("content-length"));
                RequestBody::StreamedChunked { prefix, pending }
            }
        },
        BodyLength::Empty | BodyLength::UntilClose => RequestBody::Buffered(None),
    })
}

/// Handle a plain HTTP request: decide, scrub, forward, scrub the response.
async fn handle_http_request(
    client_reader: &mut ClientReader,
    client_writer: &mut OwnedWriteHalf,
    line: http::RequestLine,
    mut headers: Vec<(String, String)>,
    gateway: &PolicyGateway,
    settings: ProxySettings,
) -> anyhow::Result<()> {
    let upstream = match http::resolve_upstream(&line.target, &headers) {
        Ok(upstream) => upstream,
        Err(e) => {
            respond(client_writer, &bad_request(&e.to_string())).await?;
            return Ok(());
        }
    };

    let mut request = HttpRequest::new(line.method.clone(), upstream.url.clone());
    if request.destination_host() != normalize_host(&upstream.host) {
        let detail = format!("ambiguous destination host in {}", line.target);
        respond(client_writer, &bad_request(&detail)).await?;
        return Ok(());
    }

    let mut body =
        match read_request_body(client_reader, &mut headers, settings.max_buffer_bytes).await {
            Ok(body) => body,
            Err(e) => {
                respond(client_writer, &bad_request(&e.to_string())).await?;
                return Ok(());
            }
        };
    request.headers = headers;
    if let RequestBody::Buffered(buffered) = &mut body {
        request.body = buffered.take();
    }

    let (mut exchange, request) = match gateway.handle_request(request) {
        RequestDecision::Forward(exchange, request) => (exchange, request),
        RequestDecision::Reject(rejection) => {
            respond(client_writer, &rejection).await?;
            return Ok(());
        }
    };
    let audit_url = exchange.url().to_string();

    let remote = match connect_upstream(&upstream.address(), settings.upstream_timeout).await {
        Ok(remote) => remote,
        Err(detail) => {
            warn!("{} {} failed: {}", line.method, exchange.url(), detail);
            exchange.fail(&detail);
            respond(client_writer, &bad_gateway_response(&detail)).await?;
            return Ok(());
        }
    };
    let (remote_read, mut remote_write) = remote.into_split();
    let mut remote_reader = BufReader::new(remote_read);

    // Upstream path keeps any query redaction applied to the URL.
    let path = http::resolve_upstream(exchange.url(), &request.headers)
        .map(|u| u.path)
        .unwrap_or(upstream.path);
    let mut forward_headers = request.headers;
    http::prepare_forward_headers(&mut forward_headers);
    remote_write
        .write_all(&http::encode_request_head(&line.method, &path, &forward_headers))
        .await?;
    match body {
        RequestBody::Buffered(_) => {
            if let Some(body) = &request.body {
                remote_write.write_all(body).await?;
            }
        }
        RequestBody::Streamed(len) => {
            exchange.record_finding(Finding::oversize(Location::RequestBody));
            let mut limited = (&mut *client_reader).take(len);
            let copied = tokio::io::copy(&mut limited, &mut remote_write).await?;
            debug!("Streamed {} request bytes to {}", copied, upstream.host);
        }
        RequestBody::StreamedChunked { prefix, pending } => {
            exchange.record_finding(Finding::oversize(Location::RequestBody));
            let relayed =
                http::relay_chunked(client_reader, &mut remote_write, &prefix, pending).await?;
            debug!("Streamed {} chunked request bytes to {}", relayed, upstream.host);
        }
    }
    remote_write.flush().await?;

    let read_timeout = settings.upstream_timeout;
    let head = match tokio::time::timeout(read_timeout, http::read_head(&mut remote_reader)).await {
        Ok(Ok(Some(head))) => head,
        Ok(Ok(None)) => {
            return upstream_failed(client_writer, exchange, "upstream closed without a response")
                .await;
        }
        Ok(Err(e)) => return upstream_failed(client_writer, exchange, &e.to_string()).await,
        Err(_) => {
            return upstream_failed(client_writer, exchange, "upstream response timed out").await;
        }
    };
    let status = match http::parse_status_line(&head.start_line) {
        Ok(status) => status,
        Err(e) => return upstream_failed(client_writer, exchange, &e.to_string()).await,
    };
    let mut response = HttpResponse::new(status.status, status.reason);
    response.headers = head.headers;

    let length = match http::response_body_length(&line.method, status.status, &response.headers)
    {
        Ok(length) => length,
        Err(e) => return upstream_failed(client_writer, exchange, &e.to_string()).await,
    };
    let tail = match length {
        BodyLength::Empty => None,
        BodyLength::Fixed(n) if n > settings.max_buffer_bytes as u64 => {
            Some(StreamTail::Raw(Vec::new()))
        }
        BodyLength::Fixed(n) => {
            match tokio::time::timeout(read_timeout, http::read_fixed(&mut remote_reader, n)).await
            {
                Ok(Ok(body)) => {
                    response.body = Some(body);
                    None
                }
                Ok(Err(e)) => {
                    return upstream_failed(client_writer, exchange, &e.to_string()).await;
                }
                Err(_) => {
                    return upstream_failed(client_writer, exchange, "upstream body timed out")
                        .await;
                }
            }
        }
        BodyLength::Chunked => {
            let read = http::read_chunked(&mut remote_reader, settings.max_buffer_bytes);
            match tokio::time::timeout(read_timeout, read).await {
                Ok(Ok(ChunkedBody::Complete(body))) => {
                    response.body = Some(body);
                    None
                }
                Ok(Ok(ChunkedBody::Overflow { prefix, pending })) => {
                    Some(StreamTail::Chunked { prefix, pending })
                }
                Ok(Err(e)) => {
                    return upstream_failed(client_writer, exchange, &e.to_string()).await;
                }
                Err(_) => {
                    return upstream_failed(client_writer, exchange, "upstream body timed out")
                        .await;
                }
            }
        }
        BodyLength::UntilClose => {
            let read = http::read_until_close(&mut remote_reader, settings.max_buffer_bytes);
            match tokio::time::timeout(read_timeout, read).await {
                Ok(Ok((body, true))) => {
                    response.body = Some(body);
                    None
                }
                Ok(Ok((prefix, false))) => Some(StreamTail::Raw(prefix)),
                Ok(Err(e)) => {
                    return upstream_failed(client_writer, exchange, &e.to_string()).await;
                }
                Err(_) => {
                    return upstream_failed(client_writer, exchange, "upstream body timed out")
                        .await;
                }
            }
        }
    };
    if let Some(tail) = tail {
        return stream_response(client_writer, &mut remote_reader, exchange, response, tail).await;
    }

    let mut response = gateway.handle_response(exchange, response);
    if let Some(body) = &response.body {
        let len = body.len();
        http::set_fixed_length(&mut response.headers, len);
    }
    http::prepare_forward_headers(&mut response.headers);
    respond(client_writer, &response).await?;
    info!("{} {} -> {}", line.method, audit_url, response.status);
    Ok(())
}

/// The part of a response body relayed without buffering.
enum StreamTail {
    /// Bytes already read, then everything until the upstream closes.
    Raw(Vec<u8>),
    /// Decoded chunks already read, then the rest of the chunked body.
    Chunked { prefix: Vec<u8>, pending: usize },
}

/// Relay an oversize response without buffering it.
async fn stream_response<R: AsyncBufRead + Unpin>(
    client_writer: &mut OwnedWriteHalf,
    remote_reader: &mut R,
    mut exchange: Exchange,
    mut response: HttpResponse,
    tail: StreamTail,
) -> anyhow::Result<()> {
    exchange.record_finding(Finding::oversize(Location::ResponseBody));
    if matches!(tail, StreamTail::Chunked { .. }) {
        response
            .headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case("content-length"));
    }
    http::prepare_forward_headers(&mut response.headers);
    let head = http::encode_response_head(response.status, &response.reason, &response.headers);
    client_writer.write_all(&head).await?;
    let relayed = match tail {
        StreamTail::Raw(prefix) => {
            client_writer.write_all(&prefix).await?;
            prefix.len() as u64 + tokio::io::copy(remote_reader, client_writer).await?
        }
        StreamTail::Chunked { prefix, pending } => {
            http::relay_chunked(remote_reader, client_writer, &prefix, pending).await?
        }
    };
    debug!("Streamed {} response bytes for {}", relayed, exchange.url());
    exchange.complete();
    Ok(())
}

async fn upstream_failed(
    client_writer: &mut OwnedWriteHalf,
    exchange: Exchange,
    detail: &str,
) -> anyhow::Result<()> {
    warn!("{} {} failed: {}", exchange.method(), exchange.url(), detail);
    exchange.fail(detail);
    respond(client_writer, &bad_gateway_response(detail)).await
}
