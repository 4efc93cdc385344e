use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, builder::TypedValueParser};

use crate::config::{DEFAULT_LISTEN, DEFAULT_OUTBOUND_BUFFER, RelayConfig, RoutingPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting WebSocket connections.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "RELAY_LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: SocketAddr,

    /// Routing policy for message frames.
    #[arg(long, env = "RELAY_POLICY", value_enum, default_value_t = RoutingPolicy::Directed)]
    pub policy: RoutingPolicy,

    /// Deliveries queued per connection before further ones are dropped.
    #[arg(
        long,
        env = "RELAY_OUTBOUND_BUFFER",
        default_value_t = DEFAULT_OUTBOUND_BUFFER,
        value_parser = clap::value_parser!(u32).range(1..).map(|n| n as usize)
    )]
    pub outbound_buffer: usize,

    /// Close connections that send nothing for this many seconds.
    #[arg(long, env = "RELAY_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,
}

impl From<ServeArgs> for RelayConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            listen: args.listen,
            policy: args.policy,
            outbound_buffer: args.outbound_buffer,
            idle_timeout: args.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Identity announced to the relay on connect.
    #[arg(long)]
    pub user_id: String,

    /// WebSocket URL of the relay.
    #[arg(long, default_value = "ws://127.0.0.1:8080/")]
    pub server: String,
}
