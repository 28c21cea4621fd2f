use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use duit::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let cfg = ServerConfig::parse();

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "duit",
        "duit starting: RUST_LOG='{}', port={}, database='{}', policy={}",
        rust_log, cfg.port, cfg.database, cfg.policy
    );

    duit::server::run(cfg).await
}
