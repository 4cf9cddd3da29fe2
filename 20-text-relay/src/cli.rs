use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{hub::HubConfig, reconnect::ControllerConfig, transport::Endpoint};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay hub.
    Hub(HubArgs),
    /// Connect to a hub from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct HubArgs {
    /// Line-oriented TCP listener. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Also serve WebSocket sessions on `GET /ws` at this address.
    #[arg(long)]
    pub ws_listen: Option<SocketAddr>,

    /// Give up on a peer whose single write takes longer than this.
    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,
}

impl HubArgs {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// `host:port`, `tcp://host:port` or `ws://host:port/ws`.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub server: Endpoint,

    /// Nickname to claim on connect and after every reconnect.
    #[arg(long)]
    pub nickname: Option<String>,

    /// Seconds to wait between connection attempts.
    #[arg(long, default_value_t = 3)]
    pub retry_delay_secs: u64,

    /// How many hub lines may queue up before the oldest unread are dropped.
    #[arg(long, default_value_t = 256)]
    pub event_buffer: usize,

    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,
}

impl ClientArgs {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            event_capacity: self.event_buffer,
            identity: self.nickname.clone(),
            ..ControllerConfig::default()
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
