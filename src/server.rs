//! C3 (TLS terminator) through C5/C6 (upstream dispatcher / Bancho splicer)
//! wired into one accept loop. Bound to loopback by default; every accepted
//! connection gets its own task.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{HeaderValue, Request, Response, StatusCode, Uri};
use hyper::Body;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::bancho::BanchoSplicer;
use crate::config::ProxyConfig;
use crate::control::Counters;
use crate::error::{ProxyError, ProxyResult, UpstreamErrorKind};
use crate::httpio::{
    read_body_to_vec, read_request_head, read_response_head, simple_response,
    spawn_body_pump, strip_hop_by_hop_headers, write_request_head, write_response, RequestHead,
    STREAM_CHUNK_SIZE,
};
use crate::router::{classify, Route};
use crate::trust_anchor::CertificateBundle;
use crate::tls::build_server_config;
use crate::upstream::{total_deadline, UpstreamDispatcher};

/// No bytes in either direction for this long and the connection is closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// The TLS handshake itself must complete within this long.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long `shutdown` waits for in-flight connections before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running accept loop. Dropping this without calling `shutdown` leaves the
/// loop (and its connections) running in the background; callers are
/// expected to always call `shutdown`.
pub struct ServerHandle {
    shutdown_tx: watch::Sender<bool>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Signal the accept loop to stop taking new connections, then wait up to
    /// [`SHUTDOWN_GRACE`] for in-flight connections to finish on their own
    /// before aborting whatever is left.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let abort_handle = self.accept_task.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.accept_task)
            .await
            .is_err()
        {
            warn!("connections did not drain within the grace period, aborting");
            abort_handle.abort();
        }
    }
}

/// Bind the listener, build the TLS server config from `bundle`, and spawn
/// the accept loop as a background task.
pub async fn spawn(
    config: ProxyConfig,
    bundle: CertificateBundle,
    counters: Arc<Counters>,
) -> ProxyResult<ServerHandle> {
    let aliases = config.aliases();
    let tls_config = build_server_config(&bundle, &aliases)?;
    let tls_acceptor = TlsAcceptor::from(tls_config);

    let addr = SocketAddr::new(config.bind_address, config.https_port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Bind { addr, source: e })?;
    info!(%addr, "proxy listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = UpstreamDispatcher::new();
    let config = Arc::new(config);

    let accept_task = tokio::spawn(accept_loop(
        listener,
        tls_acceptor,
        config,
        dispatcher,
        counters,
        shutdown_rx,
    ));

    Ok(ServerHandle {
        shutdown_tx,
        accept_task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    tls_acceptor: TlsAcceptor,
    config: Arc<ProxyConfig>,
    dispatcher: UpstreamDispatcher,
    counters: Arc<Counters>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let tls_acceptor = tls_acceptor.clone();
                        let config = config.clone();
                        let dispatcher = dispatcher.clone();
                        let counters = counters.clone();
                        let conn_shutdown_rx = shutdown_rx.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(
                                stream,
                                tls_acceptor,
                                config,
                                dispatcher,
                                counters,
                                conn_shutdown_rx,
                            )
                            .await
                            {
                                warn!(%peer, error = %e, "connection ended with an error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        connections.abort_all();
    }
}

async fn handle_connection(
    stream: TcpStream,
    tls_acceptor: TlsAcceptor,
    config: Arc<ProxyConfig>,
    dispatcher: UpstreamDispatcher,
    counters: Arc<Counters>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> ProxyResult<()> {
    let tls_stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, tls_acceptor.accept(stream)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(ProxyError::transport(format!("TLS handshake failed: {e}"))),
        Err(_) => return Err(ProxyError::transport("TLS handshake timed out")),
    };

    let sni_host = {
        let (_, conn) = tls_stream.get_ref();
        conn.server_name().map(|s| s.to_owned())
    };
    let Some(sni_host) = sni_host else {
        return Err(ProxyError::protocol("client completed a handshake with no SNI"));
    };

    let mut reader = BufReader::new(tls_stream);

    loop {
        let head = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(());
                }
                continue;
            }
            result = tokio::time::timeout(IDLE_TIMEOUT, read_request_head(&mut reader)) => {
                match result {
                    Ok(Ok(Some(head))) => head,
                    Ok(Ok(None)) => return Ok(()),
                    Ok(Err(e @ ProxyError::Protocol(_))) => {
                        warn!(error = %e, "malformed request, closing connection");
                        write_response(
                            &mut reader,
                            simple_response(StatusCode::BAD_REQUEST, "malformed request"),
                        )
                        .await?;
                        return Ok(());
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(ProxyError::transport("connection idle for too long")),
                }
            }
        };

        let route = classify(&config, &sni_host, &head.method, &head.path);
        counters.requests_proxied.fetch_add(1, Ordering::Relaxed);

        match route {
            Route::MisdirectedRequest => {
                drain_body(&mut reader, head.content_length).await?;
                write_response(
                    &mut reader,
                    simple_response(StatusCode::MISDIRECTED_REQUEST, "misdirected request"),
                )
                .await?;
            }
            Route::MirrorRedirect { location } => {
                let is_download = head.path.starts_with("/d/");
                drain_body(&mut reader, head.content_length).await?;
                let response = Response::builder()
                    .status(StatusCode::FOUND)
                    .header(http::header::LOCATION, location)
                    .body(Body::empty())
                    .map_err(|e| ProxyError::internal(e.to_string()))?;
                write_response(&mut reader, response).await?;
                if is_download {
                    counters.beatmaps_downloaded.fetch_add(1, Ordering::Relaxed);
                }
            }
            Route::MirrorForward { target_base_url } => {
                forward_and_respond(&mut reader, &dispatcher, &head, &target_base_url).await?;
            }
            Route::UpstreamPassthrough { target_host } => {
                let base_url = format!("https://{target_host}");
                forward_and_respond(&mut reader, &dispatcher, &head, &base_url).await?;
            }
            Route::BanchoSplice => {
                splice_bancho(reader, &config, &head, &dispatcher, &counters).await?;
                return Ok(());
            }
        }
    }
}

/// Consume and discard a request body the router chose not to forward
/// anywhere, so the next request on this connection starts on a clean byte
/// boundary.
async fn drain_body(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    content_length: Option<u64>,
) -> ProxyResult<()> {
    let Some(mut remaining) = content_length else {
        return Ok(());
    };
    let mut buf = [0u8; STREAM_CHUNK_SIZE];
    while remaining > 0 {
        let take = (remaining as usize).min(buf.len());
        let n = reader
            .read(&mut buf[..take])
            .await
            .map_err(|e| ProxyError::transport(format!("body drain error: {e}")))?;
        if n == 0 {
            break;
        }
        remaining -= n as u64;
    }
    Ok(())
}

/// Build and forward one request to `target_base_url`'s host, streaming the
/// body (if any) concurrently with the dispatch.
async fn forward_simple(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    dispatcher: &UpstreamDispatcher,
    head: &RequestHead,
    target_base_url: &str,
) -> ProxyResult<Response<Body>> {
    let target_uri: Uri = target_base_url
        .parse()
        .map_err(|e| ProxyError::internal(format!("invalid target base url {target_base_url}: {e}")))?;
    let target_host = target_uri
        .host()
        .ok_or_else(|| ProxyError::internal(format!("target base url {target_base_url} has no host")))?
        .to_owned();

    let mut builder = Request::builder().method(head.method.clone()).uri(head.path.clone());
    for (name, value) in head.headers.iter() {
        builder = builder.header(name, value);
    }

    match head.content_length {
        Some(len) if len > 0 => {
            let (body, pump) = spawn_body_pump(reader, len);
            let request = builder
                .body(body)
                .map_err(|e| ProxyError::internal(e.to_string()))?;
            let (response, _) = tokio::try_join!(dispatcher.forward(request, &target_host), pump)?;
            Ok(response)
        }
        _ => {
            let request = builder
                .body(Body::empty())
                .map_err(|e| ProxyError::internal(e.to_string()))?;
            dispatcher.forward(request, &target_host).await
        }
    }
}

/// Translate an upstream-forwarding failure into the client-facing status
/// spec.md §4.5/§7 assigns it: a connect-time failure (DNS/TLS) is `502`, a
/// missed deadline is `504`, anything else upstream is `503`. A non-upstream
/// error reaching here is a bug, not a routing decision, so it gets `500`.
fn error_status(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::Upstream { kind, .. } => match kind {
            UpstreamErrorKind::Connect => StatusCode::BAD_GATEWAY,
            UpstreamErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            UpstreamErrorKind::Other => StatusCode::SERVICE_UNAVAILABLE,
        },
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Forward one request and write its response, racing the whole cycle
/// against [`total_deadline`] (spec.md §4.5's 5-minute header+body budget)
/// and translating a failure into an error response instead of aborting the
/// connection out from under the client.
async fn forward_and_respond<RW>(
    reader: &mut RW,
    dispatcher: &UpstreamDispatcher,
    head: &RequestHead,
    target_base_url: &str,
) -> ProxyResult<()>
where
    RW: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let deadline = total_deadline();
    let started = Instant::now();

    let response = match tokio::time::timeout(
        deadline,
        forward_simple(reader, dispatcher, head, target_base_url),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            let status = error_status(&err);
            warn!(error = %err, %status, "upstream request failed, answering with an error response");
            return write_response(reader, simple_response(status, "upstream request failed")).await;
        }
        Err(_) => {
            warn!("upstream request exceeded its total deadline");
            return write_response(
                reader,
                simple_response(StatusCode::GATEWAY_TIMEOUT, "upstream request timed out"),
            )
            .await;
        }
    };

    let remaining = deadline.saturating_sub(started.elapsed());
    match tokio::time::timeout(remaining, write_response(reader, response)).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::transport("timed out writing response to client")),
    }
}

/// Handle a connection the router has classified as `BanchoSplice`: forward
/// the login POST to the real Bancho host over our own raw TLS connection
/// (not the pooled HTTP client, since this socket never goes back in a
/// pool), then splice client<->server for the rest of the session's
/// lifetime, mutating `UserPrivileges` packets on the way back to the
/// client.
async fn splice_bancho(
    mut reader: BufReader<ServerTlsStream<TcpStream>>,
    config: &ProxyConfig,
    head: &RequestHead,
    dispatcher: &UpstreamDispatcher,
    counters: &Arc<Counters>,
) -> ProxyResult<()> {
    let bancho_host = config.bancho_host();

    let body = match head.content_length {
        Some(len) if len > 0 => read_body_to_vec(&mut reader, len).await?,
        _ => Vec::new(),
    };

    let upstream = dispatcher.open_raw_tls(&bancho_host).await?;
    let mut upstream_reader = BufReader::new(upstream);

    let mut request_headers = head.headers.clone();
    strip_hop_by_hop_headers(&mut request_headers);
    request_headers.insert(
        http::header::HOST,
        HeaderValue::from_str(&bancho_host)
            .map_err(|e| ProxyError::internal(format!("invalid bancho host {bancho_host}: {e}")))?,
    );
    request_headers.insert(
        http::header::CONTENT_LENGTH,
        HeaderValue::from_str(&body.len().to_string())
            .map_err(|e| ProxyError::internal(e.to_string()))?,
    );

    write_request_head(&mut upstream_reader, &head.method, &head.path, &request_headers).await?;
    upstream_reader
        .write_all(&body)
        .await
        .map_err(|e| ProxyError::upstream(format!("write error: {e}")))?;

    let response_head = read_response_head(&mut upstream_reader).await?;
    let response_body = match response_head.content_length {
        Some(len) if len > 0 => read_body_to_vec(&mut upstream_reader, len).await?,
        _ => Vec::new(),
    };

    let mut response_builder = Response::builder().status(response_head.status);
    for (name, value) in response_head.headers.iter() {
        response_builder = response_builder.header(name, value);
    }
    let response = response_builder
        .body(Body::from(response_body))
        .map_err(|e| ProxyError::internal(e.to_string()))?;
    write_response(&mut reader, response).await?;

    // From here the connection carries no further HTTP framing — it's an
    // opaque, full-duplex Bancho session. Client->server is copied verbatim;
    // server->client is fed through the splicer so any `UserPrivileges`
    // packet gets its `SUPPORTER` bit set in place.
    let (client_read, client_write) = tokio::io::split(reader.into_inner());
    let (upstream_read, upstream_write) = tokio::io::split(upstream_reader.into_inner());

    let splicer = BanchoSplicer::new(config.inject_supporter, counters.bancho_packets_injected.clone());

    tokio::select! {
        result = copy_raw(client_read, upstream_write) => result,
        result = copy_spliced(upstream_read, client_write, splicer) => result,
    }
}

/// Copy bytes verbatim from `from` to `to` until either side closes, per the
/// close-on-either-end rule. No bytes for [`IDLE_TIMEOUT`] on `from` and the
/// session is torn down, same as the pre-splice request-read loop.
async fn copy_raw<R, W>(mut from: R, mut to: W) -> ProxyResult<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        let n = match tokio::time::timeout(IDLE_TIMEOUT, from.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ProxyError::transport(format!("splice read error: {e}"))),
            Err(_) => return Err(ProxyError::transport("bancho splice idle for too long")),
        };
        if n == 0 {
            return Ok(());
        }
        to.write_all(&buf[..n])
            .await
            .map_err(|e| ProxyError::transport(format!("splice write error: {e}")))?;
    }
}

/// Copy bytes from `from` to `to`, running each chunk through `splicer`
/// first. Used for the server->client direction only. Subject to the same
/// [`IDLE_TIMEOUT`] as [`copy_raw`].
async fn copy_spliced<R, W>(mut from: R, mut to: W, mut splicer: BanchoSplicer) -> ProxyResult<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        let n = match tokio::time::timeout(IDLE_TIMEOUT, from.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ProxyError::transport(format!("splice read error: {e}"))),
            Err(_) => return Err(ProxyError::transport("bancho splice idle for too long")),
        };
        if n == 0 {
            return Ok(());
        }
        let out = splicer.feed(&buf[..n]);
        to.write_all(&out)
            .await
            .map_err(|e| ProxyError::transport(format!("splice write error: {e}")))?;
    }
}
