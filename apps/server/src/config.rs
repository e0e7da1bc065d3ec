use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use ws_pipe_common::constants::DEFAULT_KEEP_ALIVE_INTERVAL_SECS;

use crate::tunnel::SessionSettings;

/// CLI arguments for the tunnel server
#[derive(Parser, Debug)]
#[command(name = "wspipe")]
#[command(about = "WebSocket to TCP tunnel server", long_about = None)]
#[command(version)]
pub struct Args {
    /// Address to listen on
    #[arg(short, long, env = "WSPIPE_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Seconds between WebSocket keep-alive pings while relaying (0 disables)
    #[arg(
        long,
        env = "WSPIPE_KEEP_ALIVE",
        default_value_t = DEFAULT_KEEP_ALIVE_INTERVAL_SECS
    )]
    pub keep_alive_interval: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Configuration for the server
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address
    pub bind: SocketAddr,

    /// Keep-alive ping interval, `None` when disabled
    pub keep_alive_interval: Option<Duration>,
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        Self {
            bind: args.bind,
            keep_alive_interval: match args.keep_alive_interval {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            keep_alive_interval: self.keep_alive_interval,
        }
    }
}
