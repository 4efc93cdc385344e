use std::{net::SocketAddr, time::Duration};

use clap::ValueEnum;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// How MESSAGE frames pick their recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RoutingPolicy {
    /// Deliver to the named `to` identity; `"all"` or no `to` reaches everyone else.
    #[default]
    Directed,
    /// Deliver every message to everyone except the sender, ignoring `to`.
    FanOut,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub policy: RoutingPolicy,
    /// Frames queued per connection before deliveries to it start failing.
    pub outbound_buffer: usize,
    /// Close connections that stay silent this long. `None` disables it.
    pub idle_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            policy: RoutingPolicy::default(),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            idle_timeout: None,
        }
    }
}
