use std::process::ExitCode;
use std::sync::Arc;

use rai_connect::logging::RingLayer;
use rai_connect::{ControlPlane, LogRing, ProxyConfig, ProxyError};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Exit codes, per the spec's control-plane error taxonomy: a clean stop is
/// `0`; anything that stops `start` from binding/installing is `2`
/// (permission denied) or `3` (certificate generation failed); anything else
/// fatal to the process is `4`.
const EXIT_CLEAN: u8 = 0;
const EXIT_PERMISSION_DENIED: u8 = 2;
const EXIT_CERT_GENERATION_FAILED: u8 = 3;
const EXIT_INTERNAL: u8 = 4;

fn main() -> ExitCode {
    let log_ring = Arc::new(LogRing::new());

    let file_appender = tracing_appender::rolling::never("./", "rai-connect.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG),
        )
        .with(tracing_subscriber::fmt::layer().with_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        ))
        .with(RingLayer::new(log_ring.clone()))
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build the async runtime");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    runtime.block_on(run(log_ring))
}

async fn run(log_ring: Arc<rai_connect::LogRing>) -> ExitCode {
    let control = ControlPlane::new(data_dir(), log_ring);
    let config = ProxyConfig::default();

    if let Err(err) = control.start(config).await {
        error!(error = %err, "proxy failed to start");
        return exit_code_for(&err);
    }

    info!("proxy running, press Ctrl+C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl+C, stopping anyway");
    }

    match control.stop().await {
        Ok(()) => ExitCode::from(EXIT_CLEAN),
        Err(err) => {
            error!(error = %err, "proxy failed to stop cleanly");
            exit_code_for(&err)
        }
    }
}

fn exit_code_for(err: &ProxyError) -> ExitCode {
    let code = match err {
        ProxyError::Bind { .. } => EXIT_PERMISSION_DENIED,
        ProxyError::Setup(msg) if msg.contains("certificate") => EXIT_CERT_GENERATION_FAILED,
        ProxyError::Setup(_) => EXIT_PERMISSION_DENIED,
        ProxyError::Transport(_)
        | ProxyError::Upstream { .. }
        | ProxyError::Protocol(_)
        | ProxyError::Internal(_) => EXIT_INTERNAL,
    };
    ExitCode::from(code)
}

fn data_dir() -> std::path::PathBuf {
    dirs_data_dir().join("rai-connect")
}

/// A minimal stand-in for a full `dirs`-crate lookup: honors `XDG_DATA_HOME`
/// / `HOME` on Unix, falls back to the current directory if neither is set.
fn dirs_data_dir() -> std::path::PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return std::path::PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return std::path::PathBuf::from(home).join(".local/share");
    }
    std::path::PathBuf::from(".")
}
