//! Minimal HTTP/1.1 request-line/header reading and response writing over a
//! raw byte stream.
//!
//! The router needs access to the plaintext connection after it answers the
//! Bancho login POST, so requests are read by hand here instead of through
//! `hyper::Server`'s own connection state machine, which gives up the
//! underlying stream only on a proper `Upgrade`. Everything past the request
//! line and headers (bodies, and anything after a `BanchoSplice` route) is
//! streamed, never buffered whole.

use bytes::Bytes;
use http::header::{
    CONNECTION, CONTENT_LENGTH, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode};
use hyper::body::HttpBody;
use hyper::Body;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, ProxyResult};

const MAX_HEADER_BYTES: usize = 64 * 1024;
pub const STREAM_CHUNK_SIZE: usize = 8 * 1024;

/// Header name `Keep-Alive`, not present in `http::header` as a constant.
fn keep_alive_header_name() -> HeaderName {
    HeaderName::from_static("keep-alive")
}

/// Header name `Proxy-Connection`, a de-facto hop-by-hop header some HTTP/1.0
/// era clients (and this game client) still send.
fn proxy_connection_header_name() -> HeaderName {
    HeaderName::from_static("proxy-connection")
}

/// Hop-by-hop headers that must never be forwarded verbatim between the
/// client and the upstream connection.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    for name in [
        CONNECTION,
        keep_alive_header_name(),
        proxy_connection_header_name(),
        TRANSFER_ENCODING,
        TE,
        TRAILER,
        UPGRADE,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
    ] {
        headers.remove(name);
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
}

/// Read one HTTP/1.1 request line + headers. Returns `Ok(None)` if the peer
/// closed the connection before sending any bytes of a new request — the
/// ordinary way a keep-alive connection ends.
pub async fn read_request_head(
    stream: &mut (impl AsyncBufRead + Unpin),
) -> ProxyResult<Option<RequestHead>> {
    let request_line = match read_header_line(stream).await? {
        Some(line) => line,
        None => return Ok(None),
    };
    if request_line.is_empty() {
        // Tolerate a stray leading blank line some clients send between
        // pipelined requests.
        return match read_header_line(stream).await? {
            Some(line) if !line.is_empty() => parse_request_head(&line, stream).await,
            Some(_) => Err(ProxyError::protocol("empty request line")),
            None => Ok(None),
        };
    }
    parse_request_head(&request_line, stream)
        .await
        .map(Some)
}

async fn parse_request_head(
    request_line: &str,
    stream: &mut (impl AsyncBufRead + Unpin),
) -> ProxyResult<RequestHead> {
    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| ProxyError::protocol("missing method in request line"))?;
    let path = parts
        .next()
        .ok_or_else(|| ProxyError::protocol("missing path in request line"))?
        .to_owned();
    parts
        .next()
        .ok_or_else(|| ProxyError::protocol("missing HTTP version in request line"))?;

    let method = Method::from_bytes(method_str.as_bytes())
        .map_err(|_| ProxyError::protocol(format!("invalid method {method_str}")))?;

    let mut headers = HeaderMap::new();
    loop {
        let line = read_header_line(stream)
            .await?
            .ok_or_else(|| ProxyError::protocol("connection closed while reading headers"))?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::protocol(format!("malformed header line: {line}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| ProxyError::protocol("invalid header name"))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| ProxyError::protocol("invalid header value"))?;
        headers.append(name, value);
    }

    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    Ok(RequestHead {
        method,
        path,
        headers,
        content_length,
    })
}

async fn read_header_line(
    stream: &mut (impl AsyncBufRead + Unpin),
) -> ProxyResult<Option<String>> {
    let mut raw = Vec::new();
    let n = stream
        .take(MAX_HEADER_BYTES as u64)
        .read_until(b'\n', &mut raw)
        .await
        .map_err(|e| ProxyError::transport(format!("read error: {e}")))?;
    if n == 0 {
        return Ok(None);
    }
    while matches!(raw.last(), Some(b'\n') | Some(b'\r')) {
        raw.pop();
    }
    String::from_utf8(raw)
        .map(Some)
        .map_err(|_| ProxyError::protocol("non-utf8 header line"))
}

/// Extract the request's `Host` header, the fallback this router uses when
/// SNI alone is ambiguous (it never is in practice, since this proxy issues
/// one certificate per alias set, but a defensive second check is cheap).
pub fn request_host(head: &RequestHead) -> Option<String> {
    head.headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_owned())
}

/// Stream exactly `content_length` bytes from `reader` into a `hyper::Body`
/// channel, handing the receiving half to the caller to attach to an
/// outgoing request. Must be driven concurrently (e.g. via `tokio::join!`)
/// with whatever consumes the body, since the channel has a small buffer.
pub fn spawn_body_pump<R>(
    mut reader: R,
    content_length: u64,
) -> (Body, impl std::future::Future<Output = ProxyResult<()>>)
where
    R: AsyncRead + Unpin,
{
    let (mut sender, body) = Body::channel();
    let pump = async move {
        let mut remaining = content_length;
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        while remaining > 0 {
            let take = (remaining as usize).min(buf.len());
            let n = reader
                .read(&mut buf[..take])
                .await
                .map_err(|e| ProxyError::transport(format!("body read error: {e}")))?;
            if n == 0 {
                return Err(ProxyError::protocol(
                    "client disconnected before sending the full request body",
                ));
            }
            remaining -= n as u64;
            sender
                .send_data(Bytes::copy_from_slice(&buf[..n]))
                .await
                .map_err(|_| ProxyError::transport("client disconnected mid-body"))?;
        }
        Ok(())
    };
    (body, pump)
}

/// Read exactly `content_length` bytes into memory. Used only for the small,
/// size-bounded Bancho login POST body (spec explicitly allows buffering
/// there); everything else uses [`spawn_body_pump`].
pub async fn read_body_to_vec(
    reader: &mut (impl AsyncRead + Unpin),
    content_length: u64,
) -> ProxyResult<Vec<u8>> {
    let mut buf = vec![0u8; content_length as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| ProxyError::transport(format!("body read error: {e}")))?;
    Ok(buf)
}

/// Write a response to the client, streaming its body. Hop-by-hop headers
/// are assumed already stripped by the caller. If the upstream response
/// carries no `Content-Length` (e.g. it was chunked), the body is re-chunked
/// on the way out rather than forwarded with no length framing at all.
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: Response<Body>,
) -> ProxyResult<()> {
    let (mut parts, mut body) = response.into_parts();
    strip_hop_by_hop_headers(&mut parts.headers);

    let has_content_length = parts.headers.contains_key(CONTENT_LENGTH);
    if !has_content_length {
        parts
            .headers
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }

    write_status_and_headers(writer, parts.status, &parts.headers).await?;

    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| ProxyError::upstream(format!("body read error: {e}")))?;
        if has_content_length {
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| ProxyError::transport(format!("write error: {e}")))?;
        } else {
            write_chunk(writer, &chunk).await?;
        }
    }

    if !has_content_length {
        writer
            .write_all(b"0\r\n\r\n")
            .await
            .map_err(|e| ProxyError::transport(format!("write error: {e}")))?;
    }

    Ok(())
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &Bytes) -> ProxyResult<()> {
    let header = format!("{:x}\r\n", chunk.len());
    writer
        .write_all(header.as_bytes())
        .await
        .map_err(|e| ProxyError::transport(format!("write error: {e}")))?;
    writer
        .write_all(chunk)
        .await
        .map_err(|e| ProxyError::transport(format!("write error: {e}")))?;
    writer
        .write_all(b"\r\n")
        .await
        .map_err(|e| ProxyError::transport(format!("write error: {e}")))?;
    Ok(())
}

async fn write_status_and_headers<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: StatusCode,
    headers: &HeaderMap,
) -> ProxyResult<()> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in headers.iter() {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or(""));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    writer
        .write_all(out.as_bytes())
        .await
        .map_err(|e| ProxyError::transport(format!("write error: {e}")))
}

/// A decoded response status line + headers, read off the raw upstream
/// socket the Bancho splice path owns directly (bypassing `hyper::Client`,
/// since that connection is handed off to full-duplex byte copying the
/// moment the login response is sent).
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
}

pub async fn read_response_head(
    stream: &mut (impl AsyncBufRead + Unpin),
) -> ProxyResult<ResponseHead> {
    let status_line = read_header_line(stream)
        .await?
        .ok_or_else(|| ProxyError::upstream("connection closed before a status line"))?;

    let mut parts = status_line.splitn(3, ' ');
    parts
        .next()
        .ok_or_else(|| ProxyError::upstream("missing HTTP version in status line"))?;
    let code_str = parts
        .next()
        .ok_or_else(|| ProxyError::upstream("missing status code in status line"))?;
    let code: u16 = code_str
        .parse()
        .map_err(|_| ProxyError::upstream(format!("invalid status code: {code_str}")))?;
    let status =
        StatusCode::from_u16(code).map_err(|_| ProxyError::upstream("invalid status code"))?;

    let mut headers = HeaderMap::new();
    loop {
        let line = read_header_line(stream)
            .await?
            .ok_or_else(|| ProxyError::upstream("connection closed while reading response headers"))?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::upstream(format!("malformed response header: {line}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| ProxyError::upstream("invalid response header name"))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| ProxyError::upstream("invalid response header value"))?;
        headers.append(name, value);
    }

    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    Ok(ResponseHead {
        status,
        headers,
        content_length,
    })
}

/// Write a request line + headers to a raw outbound socket. Used only by the
/// Bancho splice path, which owns its upstream connection directly instead of
/// going through `hyper::Client`.
pub async fn write_request_head<W: AsyncWrite + Unpin>(
    writer: &mut W,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
) -> ProxyResult<()> {
    let mut out = format!("{method} {path} HTTP/1.1\r\n");
    for (name, value) in headers.iter() {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or(""));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    writer
        .write_all(out.as_bytes())
        .await
        .map_err(|e| ProxyError::transport(format!("write error: {e}")))
}

/// Build a simple text response with a framing `Content-Length` header, used
/// for the router's own direct responses (`302`, `400`, `421`).
pub fn simple_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
    let body = body.into();
    Response::builder()
        .status(status)
        .header(CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .expect("static response is always well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_request_line_and_headers() {
        let raw = b"GET /web/osu-search.php?q=abc HTTP/1.1\r\nHost: osu.ppy.sh\r\nContent-Length: 3\r\n\r\nfoo";
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));

        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.path, "/web/osu-search.php?q=abc");
        assert_eq!(request_host(&head).as_deref(), Some("osu.ppy.sh"));
        assert_eq!(head.content_length, Some(3));

        let body = read_body_to_vec(&mut reader, 3).await.unwrap();
        assert_eq!(body, b"foo");
    }

    #[tokio::test]
    async fn returns_none_on_clean_close() {
        let mut reader = BufReader::new(Cursor::new(Vec::<u8>::new()));
        let head = read_request_head(&mut reader).await.unwrap();
        assert!(head.is_none());
    }

    #[tokio::test]
    async fn rejects_malformed_header_line() {
        let raw = b"GET / HTTP/1.1\r\nNotAHeader\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        assert!(read_request_head(&mut reader).await.is_err());
    }

    #[test]
    fn strips_hop_by_hop_headers_only() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(HOST, HeaderValue::from_static("osu.ppy.sh"));
        strip_hop_by_hop_headers(&mut headers);
        assert!(!headers.contains_key(CONNECTION));
        assert!(headers.contains_key(HOST));
    }
}
