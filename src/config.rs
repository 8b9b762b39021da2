//! Command line and environment configuration

use std::num::NonZeroUsize;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};

use crate::health::DEFAULT_HEALTH_PORT;
use crate::signaling::{DEFAULT_SIGNALING_PORT, Keepalive};

/// Two-party WebRTC signaling server
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Interface to bind both listeners on
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    pub host: String,

    /// WebSocket signaling port
    #[arg(long, default_value_t = DEFAULT_SIGNALING_PORT, env = "PORT")]
    pub port: u16,

    /// HTTP liveness port
    #[arg(long, default_value_t = DEFAULT_HEALTH_PORT, env = "HEALTH_PORT")]
    pub health_port: u16,

    /// Seconds between WebSocket pings
    #[arg(
        long,
        default_value_t = 30,
        env = "PING_INTERVAL_SECS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before dropping the connection
    #[arg(
        long,
        default_value_t = 10,
        env = "PONG_TIMEOUT_SECS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub pong_timeout_secs: u64,

    /// Depth of the coordinator command queue
    #[arg(long, default_value = "1024", env = "COMMAND_BUFFER")]
    pub command_buffer: NonZeroUsize,
}

impl Config {
    /// Reject settings clap cannot check one flag at a time.
    ///
    /// The pong deadline must fall before the next ping tick, otherwise the
    /// tick drops the connection first and the timeout never applies.
    pub fn validate(self) -> Result<Self, clap::Error> {
        if self.pong_timeout_secs >= self.ping_interval_secs {
            return Err(Self::command().error(
                ErrorKind::ArgumentConflict,
                format!(
                    "--pong-timeout-secs ({}) must be less than --ping-interval-secs ({})",
                    self.pong_timeout_secs, self.ping_interval_secs
                ),
            ));
        }
        Ok(self)
    }

    pub fn signaling_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn health_addr(&self) -> String {
        format!("{}:{}", self.host, self.health_port)
    }

    pub fn keepalive(&self) -> Keepalive {
        Keepalive {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
        }
    }
}
