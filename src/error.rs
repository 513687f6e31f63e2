use std::io;

/// Distinguishes *why* an upstream request failed, so the router can
/// translate it to the right client-facing status code (spec.md §4.5/§7:
/// DNS/TLS failure → `502`, timeout → `504`, anything else upstream → `503`)
/// instead of just a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// DNS resolution or the TLS handshake failed before any request left
    /// for the upstream.
    Connect,
    /// The upstream did not produce response headers, or the whole
    /// request/response cycle, within its deadline.
    Timeout,
    /// Any other upstream-originated failure once a connection was made.
    Other,
}

/// The error taxonomy from the control plane's perspective.
///
/// `Setup` and `Bind` are fatal to [`crate::control::ControlPlane::start`];
/// `Transport`, `Upstream`, `Protocol` and `Internal` are per-connection and
/// never take down the listener.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream error: {message}")]
    Upstream {
        kind: UpstreamErrorKind,
        message: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// An upstream failure of unspecified origin — translated to `503`.
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream {
            kind: UpstreamErrorKind::Other,
            message: msg.into(),
        }
    }

    /// DNS or TLS-handshake failure reaching the upstream — translated to
    /// `502`.
    pub fn upstream_connect(msg: impl Into<String>) -> Self {
        Self::Upstream {
            kind: UpstreamErrorKind::Connect,
            message: msg.into(),
        }
    }

    /// The upstream missed its response deadline — translated to `504`.
    pub fn upstream_timeout(msg: impl Into<String>) -> Self {
        Self::Upstream {
            kind: UpstreamErrorKind::Timeout,
            message: msg.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error should abort `start` (vs. just get logged).
    pub fn is_fatal_to_start(&self) -> bool {
        matches!(self, Self::Setup(_) | Self::Bind { .. })
    }
}

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;
