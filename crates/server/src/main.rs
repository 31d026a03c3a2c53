use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use fabula_config::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "fabula", about = "Turn-based LLM narrative engine server")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "fabula.toml")]
    config: String,
    /// Override the listen address from the config file.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let appender = tracing_appender::rolling::daily("logs", "fabula.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(file_writer.and(std::io::stdout))
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load_from(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }

    fabula_server::run_server(config).await
}
