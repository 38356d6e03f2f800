//! Real-time call runtime library.
//!
//! A voice-agent runtime that bridges a telephony carrier's media
//! WebSocket to a realtime model gateway: per-call audio ingress/egress
//! normalization, voice-activity detection, a 9-state call lifecycle
//! machine, barge-in handling, filler/hedge audio while the model is
//! thinking, voicemail screening, and a campaign dispatcher for outbound
//! batches.
//!
//! # Example
//!
//! ```ignore
//! use call_runtime::config::RuntimeConfig;
//! use call_runtime::server::ServerState;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RuntimeConfig::load()?;
//!     let persistence = std::sync::Arc::new(call_runtime::persistence::LoggingPersistence::default());
//!     let state = ServerState::new(config, persistence);
//!     call_runtime::server::start("0.0.0.0", 8080, state).await
//! }
//! ```

pub mod types;
pub mod error;
pub mod config;
pub mod audio;
pub mod adapter;
pub mod gateway;
pub mod hedge;
pub mod router;
pub mod limiter;
pub mod persistence;
pub mod orchestrator;
pub mod server;
pub mod cli;

pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use server::{start as start_server, ServerState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

pub fn info() -> String {
    format!("{} v{} - real-time call runtime", NAME, VERSION)
}
