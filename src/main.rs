use bedrock_claude_proxy::config::{Config, ConfigError};
use bedrock_claude_proxy::error::AppError;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "bedrock-claude-proxy", version, about = "Anthropic API proxy for AWS Bedrock")]
struct Cli {
    /// JSON config file; environment variables are merged on top.
    #[arg(short, long, env = "PROXY_CONFIG", default_value = "config.json")]
    config: PathBuf,
}

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    App(#[from] AppError),
    #[error("invalid listen address {addr}: {source}")]
    Listen {
        addr: String,
        source: std::net::AddrParseError,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,bedrock_claude_proxy=debug")
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), StartupError> {
    let mut config = Config::load(&cli.config)?;
    config.merge_process_env();
    config.validate()?;
    tracing::debug!(config = %config.redacted_json(), "effective config");

    let addr: std::net::SocketAddr =
        config
            .listen
            .parse()
            .map_err(|source| StartupError::Listen {
                addr: config.listen.clone(),
                source,
            })?;
    let state = bedrock_claude_proxy::app::load_state(config)?;
    let app = bedrock_claude_proxy::app::build_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
