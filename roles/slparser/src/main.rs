use std::sync::Arc;

use tracing::{error, info};

mod api;
mod config;
mod parser;
mod server;

use config::Config;
use server::ParserServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_args()?;
    info!("Starting slparser");
    info!("HTTP server: {}", config.httpd_listen_address);
    info!("Data dir: {}", config.data_dir);

    std::fs::create_dir_all(&config.data_dir)?;

    let db = match &config.mysql_url {
        Some(url) => {
            let pool = pool_db::connect(url).await?;
            pool_db::check_server(&pool).await?;
            Some(pool)
        }
        None => {
            info!("no mysql_url configured, stats flush disabled");
            None
        }
    };

    let server = Arc::new(ParserServer::new(
        &config.data_dir,
        db,
        config.flush_db_interval_secs,
    ));
    server.init_parser(stats_core::unix_timestamp())?;

    let worker = server.clone();
    tokio::spawn(async move { worker.run_worker().await });

    let shutdown = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.stop();
        }
    });

    if let Err(e) = api::run_http_server(config.httpd_listen_address, server).await {
        error!("HTTP server error: {}", e);
        return Err(e);
    }
    Ok(())
}
