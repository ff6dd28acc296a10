use anyhow::{Context, Result};
use clap::Parser;
use reelfeed::config::Config;
use reelfeed::controller::{FeedController, FeedEvent};
use reelfeed::feed::HttpBackend;
use reelfeed::session::{HeadlessOpener, Session};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;

/// Default config path (~/.config/reelfeed/config.toml)
fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("reelfeed")
        .join("config.toml"))
}

#[derive(Parser, Debug)]
#[command(
    name = "reelfeed",
    about = "Headless driver for the listing video feed scheduler"
)]
struct Args {
    /// Config file (defaults to ~/.config/reelfeed/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the API base URL from the config file
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// Start with new videos muted
    #[arg(long)]
    muted: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(url) = args.api_url {
        config.api_base_url = url;
    }
    if args.muted {
        config.muted_by_default = true;
    }
    tracing::debug!(?config, "Effective configuration");

    let client = reqwest::Client::builder()
        .user_agent(concat!("reelfeed/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let backend = HttpBackend::new(
        client.clone(),
        &config.api_base_url,
        config.api_token(),
        config.request_timeout(),
    )
    .context("Invalid API configuration")?;
    let opener = HeadlessOpener::new(client, config.request_timeout());

    let (event_tx, event_rx) = mpsc::channel::<FeedEvent>(64);
    let controller = FeedController::new(
        config.feed_settings(),
        Arc::new(backend),
        Arc::new(opener),
        event_tx,
    );

    println!("Loading feed from {}", config.api_base_url);
    let mut session = Session::new(controller, event_rx, std::io::stdout());
    session
        .run(BufReader::new(tokio::io::stdin()), config.tick_interval())
        .await?;

    Ok(())
}
