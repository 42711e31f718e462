//! HTTP(S) proxy handler: CONNECT tunnels and plain-HTTP forwarding.

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST};
use http::{Method, Request, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::Builder;
use hyper_util::rt::TokioIo;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, info, warn};

use crate::context::GatewayContext;
use crate::error::ProxyError;
use crate::registry::AccountRoute;
use crate::relay::relay;

const MAX_LINE_BYTES: u64 = 8 * 1024;
const MAX_HEADER_LINES: usize = 100;
const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Hop-by-hop headers dropped from the forwarded request
const STRIPPED_REQUEST_HEADERS: [&str; 4] = ["proxy-connection", "connection", "upgrade", "host"];
/// Dropped from the upstream response before it is written back
const STRIPPED_RESPONSE_HEADERS: [&str; 2] = ["transfer-encoding", "connection"];

/// Parsed request line and header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First header with this name, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Serve one accepted HTTP proxy connection for `route`
pub async fn handle_http<S>(
    client: S,
    route: &AccountRoute,
    ctx: &GatewayContext,
    conn_id: u64,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client = BufReader::new(client);

    let head = match read_head(&mut client).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(ProxyError::Protocol(reason)) => {
            respond_error(&mut client, StatusCode::BAD_REQUEST, &reason).await?;
            return Err(ProxyError::Protocol(reason));
        }
        Err(e) => return Err(e),
    };

    debug!(
        "#{} [{}] {} {} {}",
        conn_id, route.port, head.method, head.target, head.version
    );

    if head.method == "CONNECT" {
        handle_connect(client, &head, route, ctx, conn_id).await
    } else {
        handle_plain(&mut client, head, route, ctx, conn_id).await?;
        let _ = client.shutdown().await;
        Ok(())
    }
}

async fn handle_connect<S>(
    mut client: BufReader<S>,
    head: &RequestHead,
    route: &AccountRoute,
    ctx: &GatewayContext,
    conn_id: u64,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = match parse_connect_target(&head.target) {
        Ok(target) => target,
        Err(reason) => {
            respond_error(&mut client, StatusCode::BAD_REQUEST, &reason).await?;
            return Err(ProxyError::Protocol(reason));
        }
    };

    info!(
        "#{} [{}] CONNECT {}:{} via {}",
        conn_id, route.port, host, port, route.route_name
    );

    let dest = match ctx.connector.connect(&route.upstream, host, port).await {
        Ok(dest) => dest,
        Err(e) => {
            warn!("#{} [{}] {}", conn_id, route.port, e);
            respond_error(&mut client, StatusCode::BAD_GATEWAY, &e.to_string()).await?;
            return Err(e.into());
        }
    };

    let established = format!(
        "HTTP/1.1 200 Connection Established\r\nProxy-agent: {}\r\n\r\n",
        ctx.proxy_agent
    );
    client.write_all(established.as_bytes()).await?;
    client.flush().await?;

    // The BufReader goes into the relay as-is: anything the client pipelined
    // after the header block is still in its buffer and reaches the
    // destination first.
    let stats = relay(client, dest).await;
    debug!(
        "#{} [{}] tunnel to {}:{} closed: {} bytes up, {} bytes down",
        conn_id, route.port, host, port, stats.a_to_b, stats.b_to_a
    );
    Ok(())
}

/// Split a CONNECT target on its last colon so `[::1]:443` works
pub fn parse_connect_target(target: &str) -> Result<(&str, u16), String> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| format!("CONNECT target {:?} is not host:port", target))?;
    if host.is_empty() {
        return Err(format!("CONNECT target {:?} has no host", target));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("CONNECT target {:?} has an invalid port", target))?;
    Ok((host, port))
}

async fn handle_plain<S>(
    client: &mut BufReader<S>,
    head: RequestHead,
    route: &AccountRoute,
    ctx: &GatewayContext,
    conn_id: u64,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (method, carries_body) = match head.method.as_str() {
        "GET" => (Method::GET, false),
        "HEAD" => (Method::HEAD, false),
        "OPTIONS" => (Method::OPTIONS, false),
        "POST" => (Method::POST, true),
        "PUT" => (Method::PUT, true),
        "DELETE" => (Method::DELETE, true),
        "PATCH" => (Method::PATCH, true),
        other => {
            let reason = format!("Method {} not implemented", other);
            respond_error(client, StatusCode::NOT_IMPLEMENTED, &reason).await?;
            return Err(ProxyError::Protocol(reason));
        }
    };

    let uri = match absolute_target(&head) {
        Ok(uri) => uri,
        Err((status, reason)) => {
            respond_error(client, status, &reason).await?;
            return Err(ProxyError::Protocol(reason));
        }
    };

    let body = if carries_body {
        match read_body(client, &head).await {
            Ok(body) => body,
            Err(ProxyError::Protocol(reason)) => {
                respond_error(client, StatusCode::BAD_REQUEST, &reason).await?;
                return Err(ProxyError::Protocol(reason));
            }
            Err(e) => return Err(e),
        }
    } else {
        Bytes::new()
    };

    let request = match build_request(method.clone(), &uri, &head, body, carries_body) {
        Ok(request) => request,
        Err(reason) => {
            respond_error(client, StatusCode::BAD_REQUEST, &reason).await?;
            return Err(ProxyError::Protocol(reason));
        }
    };

    info!(
        "#{} [{}] {} {} via {}",
        conn_id, route.port, method, uri, route.route_name
    );

    let host = uri.host().unwrap_or_default();
    let port = uri.port_u16().unwrap_or(80);
    let exchange = forward(ctx, route, host, port, request);

    let (parts, body) = match tokio::time::timeout(ctx.http_timeout, exchange).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!("#{} [{}] {} failed: {}", conn_id, route.port, uri, e);
            respond_error(client, StatusCode::BAD_GATEWAY, &format!("Bad Gateway: {}", e))
                .await?;
            return Err(e);
        }
        Err(_) => {
            warn!(
                "#{} [{}] {} timed out after {:?}",
                conn_id, route.port, uri, ctx.http_timeout
            );
            respond_error(client, StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").await?;
            return Err(ProxyError::Timeout(ctx.http_timeout));
        }
    };

    write_response(client, &parts, &body, method == Method::HEAD).await?;
    debug!(
        "#{} [{}] {} -> {} ({} bytes)",
        conn_id,
        route.port,
        uri,
        parts.status,
        body.len()
    );
    Ok(())
}

/// Full request/response cycle over a connection opened through the route's upstream
async fn forward(
    ctx: &GatewayContext,
    route: &AccountRoute,
    host: &str,
    port: u16,
    request: Request<Full<Bytes>>,
) -> Result<(http::response::Parts, Bytes), ProxyError> {
    let stream = ctx.connector.connect(&route.upstream, host, port).await?;
    let io = TokioIo::new(stream);

    let (mut sender, conn) = Builder::new()
        .title_case_headers(true)
        .handshake::<_, Full<Bytes>>(io)
        .await?;

    let roundtrip = async move {
        let response = sender.send_request(request).await?;
        // No further requests on this connection; lets the driver finish once the body is read.
        drop(sender);
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok::<_, ProxyError>((parts, body))
    };

    let (result, driver) = tokio::join!(roundtrip, conn);
    if let Err(err) = driver {
        debug!("Upstream HTTP connection to {}:{} error: {}", host, port, err);
    }
    result
}

/// Absolute URL for a plain request: verbatim when the target already has a
/// scheme, otherwise rebuilt from the Host header.
fn absolute_target(head: &RequestHead) -> Result<Uri, (StatusCode, String)> {
    let text = if head.target.contains("://") {
        head.target.clone()
    } else {
        let host = head
            .header("host")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| (StatusCode::BAD_REQUEST, "Missing Host header".to_string()))?;
        if !head.target.starts_with('/') {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("Unsupported request target {:?}", head.target),
            ));
        }
        format!("http://{}{}", host, head.target)
    };

    let uri: Uri = text
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("Invalid URL {:?}", text)))?;

    match uri.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
        _ => {
            return Err((
                StatusCode::NOT_IMPLEMENTED,
                format!("Only http:// URLs can be forwarded, got {:?}", text),
            ))
        }
    }
    if uri.host().map_or(true, str::is_empty) {
        return Err((StatusCode::BAD_REQUEST, format!("URL {:?} has no host", text)));
    }
    Ok(uri)
}

fn build_request(
    method: Method,
    uri: &Uri,
    head: &RequestHead,
    body: Bytes,
    carries_body: bool,
) -> Result<Request<Full<Bytes>>, String> {
    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    let authority = uri.authority().map_or("", |a| a.as_str());

    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .version(Version::HTTP_11)
        .header(HOST, authority);

    for (name, value) in &head.headers {
        let lower = name.to_ascii_lowercase();
        if STRIPPED_REQUEST_HEADERS.contains(&lower.as_str())
            || lower == "content-length"
            || lower == "transfer-encoding"
        {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder = builder.header(CONNECTION, "close");
    if carries_body {
        builder = builder.header(CONTENT_LENGTH, body.len());
    }

    builder
        .body(Full::new(body))
        .map_err(|e| format!("Invalid request header: {}", e))
}

async fn write_response<W>(
    client: &mut W,
    parts: &http::response::Parts,
    body: &Bytes,
    head_only: bool,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let status = parts.status;
    // Responses that never carry a body keep the upstream's Content-Length.
    let bodiless = head_only
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in parts.headers.iter() {
        if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str())
            || (!bodiless && *name == CONTENT_LENGTH)
        {
            continue;
        }
        out.extend_from_slice(title_case(name.as_str()).as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !bodiless {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    if !bodiless {
        out.extend_from_slice(body);
    }

    client.write_all(&out).await?;
    client.flush().await
}

/// `content-type` -> `Content-Type`, the casing requests are sent upstream with
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}

/// Write a short plain-text error reply
pub async fn respond_error<W>(client: &mut W, status: StatusCode, message: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = format!("{}\n", message);
    let reply = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    );
    client.write_all(reply.as_bytes()).await?;
    client.flush().await
}

/// Read the request line and every header line up to the blank line.
/// The whole block is consumed so none of it leaks into a tunnel.
/// `Ok(None)` means the client closed before sending anything.
pub async fn read_head<R>(reader: &mut R) -> Result<Option<RequestHead>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let line = match read_line(reader).await? {
        Some(line) => line,
        None => return Ok(None),
    };

    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
        _ => return Err(ProxyError::protocol(format!("Malformed request line {:?}", line))),
    };

    let mut headers = Vec::new();
    let mut header_bytes = 0usize;
    loop {
        let line = read_line(reader).await?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client closed inside the header block",
            )
        })?;
        if line.is_empty() {
            break;
        }

        header_bytes += line.len();
        if headers.len() >= MAX_HEADER_LINES || header_bytes > MAX_HEADER_BYTES {
            return Err(ProxyError::protocol("Header block too large"));
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::protocol(format!("Malformed header line {:?}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
    }))
}

/// One line without its CRLF/LF terminator; `None` on EOF before any byte
async fn read_line<R>(reader: &mut R) -> Result<Option<String>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_BYTES)
        .read_until(b'\n', &mut raw)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if raw.last() != Some(&b'\n') {
        if n as u64 >= MAX_LINE_BYTES {
            return Err(ProxyError::protocol("Line too long"));
        }
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "client closed mid-line",
        )
        .into());
    }
    raw.pop();
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
}

async fn read_body<R>(reader: &mut R, head: &RequestHead) -> Result<Bytes, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let chunked = head
        .header("transfer-encoding")
        .map_or(false, |te| te.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return read_chunked_body(reader).await;
    }

    let length = match head.header("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| ProxyError::protocol(format!("Invalid Content-Length {:?}", value)))?,
        None => return Ok(Bytes::new()),
    };
    if length > MAX_BODY_BYTES {
        return Err(ProxyError::protocol("Request body too large"));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Bytes, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = read_line(reader)
            .await?
            .ok_or_else(|| ProxyError::protocol("Truncated chunked body"))?;
        let size_text = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| ProxyError::protocol(format!("Invalid chunk size {:?}", size_text)))?;

        if size == 0 {
            // Trailer section, ended by a blank line.
            while let Some(trailer) = read_line(reader).await? {
                if trailer.is_empty() {
                    break;
                }
            }
            return Ok(Bytes::from(body));
        }

        let start = body.len();
        let end = start
            .checked_add(size)
            .filter(|end| *end <= MAX_BODY_BYTES)
            .ok_or_else(|| ProxyError::protocol("Request body too large"))?;
        body.resize(end, 0);
        reader.read_exact(&mut body[start..]).await?;

        match read_line(reader).await? {
            Some(end) if end.is_empty() => {}
            _ => return Err(ProxyError::protocol("Chunk not terminated by CRLF")),
        }
    }
}
