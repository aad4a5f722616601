//! Single-origin reverse proxy for live previews.
//!
//! Sits between a live-preview iframe and an application's development
//! server: HTML responses are rewritten in flight to carry debugging
//! instrumentation, everything else — WebSocket upgrades included — is
//! forwarded unmodified. One instance serves one preview session against
//! one pinned upstream origin.

pub mod config;
pub mod inject;
pub mod rewrite;
pub mod server;
pub mod status;

pub use config::{ProxyConfig, UpstreamOrigin};
pub use server::spawn_proxy;
