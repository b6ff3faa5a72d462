mod config;

use anyhow::Result;
use pyre::{agent::Agent, api, utils::tracing::init_tracing};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::load(None).await?;
    let agent = Agent::new(config.agent_config()).await?;

    let server_scope = CancellationToken::new();
    {
        let fleet = agent.fleet.clone();
        let drain_window = agent.drain_window;
        let server_scope = server_scope.clone();
        tokio::spawn(async move {
            if let Err(err) =
                pyre::agent::supervisor::run_signal_listener(fleet, drain_window, server_scope)
                    .await
            {
                error!("signal listener failed: {err:#}");
            }
        });
    }

    let addr = format!("{}:{}", config.api_config.host, config.api_config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, api::router(agent))
        .with_graceful_shutdown(async move { server_scope.cancelled().await })
        .await?;

    Ok(())
}
