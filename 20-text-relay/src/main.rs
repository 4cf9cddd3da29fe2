use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use text_relay::{
    cli::{Cli, Command, HubArgs},
    client,
    hub::Hub,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn run_hub(args: HubArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let mut hub = Hub::new(listener).with_config(args.hub_config());
    if let Some(ws_addr) = args.ws_listen {
        let ws_listener = TcpListener::bind(ws_addr)
            .await
            .with_context(|| format!("failed to bind {ws_addr}"))?;
        hub = hub.with_websocket(ws_listener);
    }

    let addr = hub.local_addr()?;
    info!("hub listening on {}", addr);
    if let Err(err) = hub.run_until_ctrl_c().await {
        warn!("hub exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Hub(args) => run_hub(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
