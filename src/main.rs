use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wsproxy_rs::{config::Config, server::RelayServer, Result};

#[derive(Parser)]
#[command(name = "wsproxy-rs")]
#[command(about = "Transparent WebSocket relay that replaces outbound settings messages")]
struct Cli {
    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Upstream WebSocket URL every client is relayed to
    #[arg(short, long, env = "TARGET_URL")]
    target_url: Option<String>,

    #[arg(short, long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Human-readable logs instead of JSON lines
    #[arg(long, env = "PRETTY_LOGS")]
    pretty_logs: Option<bool>,

    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(target_url) = self.target_url {
            config.server.target_url = target_url;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(pretty) = self.pretty_logs {
            config.logging.pretty = pretty;
        }
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.pretty {
        builder.init();
    } else {
        builder.json().init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    init_logging(&config);
    info!("Starting wsproxy-rs");

    let server = RelayServer::new(config)?;
    server.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Logging may not be installed yet if configuration failed.
            error!("{}", e);
            eprintln!("wsproxy-rs: {}", e);
            ExitCode::FAILURE
        }
    }
}
