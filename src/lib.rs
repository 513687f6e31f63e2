//! A local HTTPS interception proxy for the game client's beatmap mirror and
//! Bancho channel. See `SPEC_FULL.md` for the full component breakdown;
//! module names below follow the same component letters (C1-C7).

pub mod bancho;
pub mod config;
pub mod control;
pub mod error;
pub mod hosts;
pub mod httpio;
pub mod logging;
pub mod router;
mod server;
pub mod tls;
pub mod trust_anchor;
pub mod upstream;

pub use config::ProxyConfig;
pub use control::{ControlPlane, CountersSnapshot, ProxyState, Status};
pub use error::{ProxyError, ProxyResult};
pub use logging::{LogRecord, LogRing};
