//! Real-time voice-call pipeline core: VAD, ASR, LLM and TTS orchestration
//! over a WebSocket, with barge-in and speculative "pre-think" between
//! turns.
//!
//! ```ignore
//! use call_core::config::VoiceConfig;
//! use call_core::server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = VoiceConfig::load("config.toml")?;
//!     server::start("0.0.0.0", 8080, config).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod server;
pub mod voice;

pub use config::VoiceConfig;
pub use server::{start as start_server, ServerState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
