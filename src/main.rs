use std::net::SocketAddr;

use hero_card::{config::Config, observer::ObserverStrategy, routes::router, service::CardService};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;
    let strategy = match config.strategy {
        ObserverStrategy::Push => "push".to_string(),
        ObserverStrategy::Poll { interval, max_attempts } => {
            format!("poll every {}s, {} attempts", interval.as_secs(), max_attempts)
        }
    };
    tracing::info!(api_url = %config.api_url, job_handles = ?config.job_handles, "Card backend, observing via {}", strategy);

    let service = CardService::from_config(&config);
    let app = router(service.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    service.shutdown();
    Ok(())
}
