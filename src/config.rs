//! Server configuration
//!
//! All configuration comes from environment variables. `REDIS_URL` and
//! the bind address are the operational knobs; the keepalive and frame
//! size tunables exist for tests and unusual deployments and rarely
//! need touching.

use std::env;
use std::time::Duration;

use crate::error::AppError;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (`HOST`)
    pub host: String,
    /// Port to listen on (`PORT`)
    pub port: u16,
    /// Store connection URL (`REDIS_URL`)
    pub redis_url: String,
    /// Time allowed between inbound frames before the peer is
    /// considered dead (`PONG_WAIT_SECS`)
    pub pong_wait: Duration,
    /// Time allowed to write a single frame (`WRITE_WAIT_SECS`)
    pub write_wait: Duration,
    /// Maximum inbound frame size in bytes (`MAX_FRAME_BYTES`)
    pub max_frame_bytes: usize,
    /// Capacity of each connection's outbound queue
    pub outbound_queue: usize,
    /// Capacity of the hub's inbound event queue
    pub hub_queue: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_pong_wait() -> Duration {
    Duration::from_secs(60)
}

fn default_write_wait() -> Duration {
    Duration::from_secs(10)
}

fn default_max_frame_bytes() -> usize {
    4096
}

fn default_outbound_queue() -> usize {
    256
}

fn default_hub_queue() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            redis_url: default_redis_url(),
            pong_wait: default_pong_wait(),
            write_wait: default_write_wait(),
            max_frame_bytes: default_max_frame_bytes(),
            outbound_queue: default_outbound_queue(),
            hub_queue: default_hub_queue(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the environment, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| default_host()),
            port: parse_var("PORT")?.unwrap_or_else(default_port),
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| default_redis_url()),
            pong_wait: parse_var("PONG_WAIT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or_else(default_pong_wait),
            write_wait: parse_var("WRITE_WAIT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or_else(default_write_wait),
            max_frame_bytes: parse_var("MAX_FRAME_BYTES")?
                .unwrap_or_else(default_max_frame_bytes),
            outbound_queue: default_outbound_queue(),
            hub_queue: default_hub_queue(),
        })
    }

    /// Address to bind the listener to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Keepalive ping period: 90% of the pong wait, so a ping is always
    /// in flight before the peer's read deadline can expire.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait.mul_f64(0.9)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, AppError> {
    match env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| AppError::Config(format!("{name}='{raw}' is not valid"))),
    }
}
