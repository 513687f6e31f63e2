use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use http::uri::{Authority, Scheme};
use http::{HeaderValue, Method, Request, Response, Uri};
use hyper::client::HttpConnector;
use hyper::{Body, Client};
use hyper_rustls::HttpsConnector;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::warn;

use crate::error::{ProxyError, ProxyResult};
use crate::httpio::strip_hop_by_hop_headers;

/// 30s to receive response headers.
const HEADER_TIMEOUT: Duration = Duration::from_secs(30);
/// 5 min total, covering header + full body.
const TOTAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Per-target-host pool of TLS client connections to the real upstream,
/// built on the system's default trust roots (not the proxy's own CA — this
/// is an outbound client, not a terminator). `hyper::Client`'s own
/// per-authority pool (capped at 4 idle connections per host, 60s idle
/// lifetime) stands in for the fine-grained per-host pool the spec
/// describes: each checkout is exclusive for the duration of one
/// request/response, exactly as `hyper::Client` already guarantees.
#[derive(Clone)]
pub struct UpstreamDispatcher {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    /// Separate from `client`: the Bancho splice path needs a raw, undecoded
    /// duplex socket (the session continues as an opaque byte stream past the
    /// login response), which `hyper::Client`'s request/response model can't
    /// hand back.
    raw_tls: TlsConnector,
}

impl UpstreamDispatcher {
    pub fn new() -> Self {
        let tls = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_native_roots()
            .with_no_client_auth();
        let raw_tls = TlsConnector::from(Arc::new(tls.clone()));

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_only()
            .enable_http1()
            .build();

        let client = Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(60))
            .build(https);

        Self { client, raw_tls }
    }

    /// Open a fresh, unpooled TLS connection to `host:443` for the Bancho
    /// splice path, which owns the raw socket for the lifetime of the
    /// session rather than checking it back into a pool.
    pub async fn open_raw_tls(&self, host: &str) -> ProxyResult<TlsStream<TcpStream>> {
        let tcp = TcpStream::connect((host, 443))
            .await
            .map_err(|e| ProxyError::upstream_connect(format!("failed to connect to {host}: {e}")))?;
        let server_name = rustls::ServerName::try_from(host)
            .map_err(|e| ProxyError::internal(format!("invalid upstream host {host}: {e}")))?;
        self.raw_tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::upstream_connect(format!("TLS connect to {host} failed: {e}")))
    }

    /// Forward one request to `target_host:443`, streaming the body through
    /// unchanged beyond the header rewrites spec.md §4.5 requires. Retries
    /// once on an idempotent method (`GET`/`HEAD`) if the pooled connection
    /// fails before any response byte arrives.
    pub async fn forward(
        &self,
        mut request: Request<Body>,
        target_host: &str,
    ) -> ProxyResult<Response<Body>> {
        rewrite_for_upstream(&mut request, target_host)?;
        let method = request.method().clone();
        let uri = request.uri().clone();
        let is_idempotent = matches!(method, Method::GET | Method::HEAD);

        match self.send_with_timeout(request).await {
            Ok(response) => Ok(response),
            Err(err) if is_idempotent && err.retryable => {
                warn!(
                    target_host,
                    "upstream request failed before any response bytes, retrying once"
                );
                // GET/HEAD requests carry no body, so a fresh, bodiless retry
                // is always faithful to the original request.
                let retry = Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .map_err(|e| ProxyError::internal(format!("failed to build retry request: {e}")))?;
                self.send_with_timeout(retry).await.map_err(ProxyError::from)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn send_with_timeout(&self, request: Request<Body>) -> Result<Response<Body>, DispatchError> {
        let send = self.client.request(request);
        match timeout(HEADER_TIMEOUT, send).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(DispatchError {
                retryable: true,
                kind: classify_hyper_error(&e),
            }),
            Err(_) => Err(DispatchError {
                retryable: false,
                kind: ProxyError::upstream_timeout("timed out waiting for response headers"),
            }),
        }
    }
}

impl Default for UpstreamDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

struct DispatchError {
    retryable: bool,
    kind: ProxyError,
}

impl From<DispatchError> for ProxyError {
    fn from(e: DispatchError) -> Self {
        e.kind
    }
}

fn classify_hyper_error(e: &hyper::Error) -> ProxyError {
    if e.is_connect() {
        ProxyError::upstream_connect(format!("DNS/connect failure: {e}"))
    } else {
        ProxyError::upstream(format!("{e}"))
    }
}

/// Rewrite the request the way spec.md §4.5 requires before it leaves for
/// the real upstream: target `target_host:443`, `Host` rewritten, hop-by-hop
/// headers stripped.
fn rewrite_for_upstream(request: &mut Request<Body>, target_host: &str) -> ProxyResult<()> {
    let mut uri_parts = request.uri().clone().into_parts();
    uri_parts.scheme.get_or_insert(Scheme::HTTPS);
    uri_parts.authority = Some(
        Authority::from_str(target_host)
            .map_err(|e| ProxyError::internal(format!("invalid target host {target_host}: {e}")))?,
    );
    *request.uri_mut() = Uri::from_parts(uri_parts)
        .map_err(|e| ProxyError::internal(format!("failed to rebuild URI: {e}")))?;

    strip_hop_by_hop_headers(request.headers_mut());
    request.headers_mut().insert(
        http::header::HOST,
        HeaderValue::from_str(target_host)
            .map_err(|e| ProxyError::internal(format!("invalid host header value: {e}")))?,
    );

    Ok(())
}

/// Total-request deadline (headers + full body) a caller should race the
/// whole forward/response-write pipeline against.
pub fn total_deadline() -> Duration {
    TOTAL_TIMEOUT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_sets_host_and_strips_hop_by_hop() {
        let mut request = Request::builder()
            .method(Method::GET)
            .uri("/web/osu-search.php")
            .header(http::header::CONNECTION, "keep-alive")
            .header(http::header::HOST, "osus.example")
            .body(Body::empty())
            .unwrap();

        rewrite_for_upstream(&mut request, "osu.ppy.sh").unwrap();

        assert_eq!(
            request.headers().get(http::header::HOST).unwrap(),
            "osu.ppy.sh"
        );
        assert!(!request.headers().contains_key(http::header::CONNECTION));
        assert_eq!(request.uri().authority().unwrap().as_str(), "osu.ppy.sh");
        assert_eq!(request.uri().scheme_str(), Some("https"));
    }
}
