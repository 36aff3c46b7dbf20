//! Process entrypoint: parse CLI flags, load configuration, install the
//! tracing subscriber, and bind the voice-call WebSocket server.
//!
//! Grounded in the teacher's `src/main.rs` for the tracing-init/crypto-
//! provider/runtime idiom, trimmed to this crate's one binary (no cloud
//! orchestration, no skill system).

use clap::Parser;

use call_core::config::VoiceConfig;

/// Real-time voice-call pipeline core server.
#[derive(Parser, Debug)]
#[command(name = "call-core-server", version)]
struct Cli {
    /// Address to bind the WebSocket server to.
    #[arg(long, env = "CALL_CORE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the WebSocket server to.
    #[arg(long, env = "CALL_CORE_PORT", default_value_t = 8080)]
    port: u16,

    /// Path to a TOML configuration file. Falls back to built-in defaults
    /// if the file doesn't exist.
    #[arg(long, env = "CALL_CORE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) if path.exists() => VoiceConfig::load(&path)?,
        Some(path) => {
            tracing::warn!(path = %path.display(), "[Main] config file not found, using defaults");
            VoiceConfig::default()
        }
        None => VoiceConfig::default(),
    };

    call_core::start_server(&cli.host, cli.port, config).await
}
