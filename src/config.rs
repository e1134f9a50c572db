//! Configuration for brokers, clusters and peers.

use std::time::Duration;

/// Default deadline for an outbound request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(50);

/// Default deadline for a cluster existence query.
pub const DEFAULT_EXISTS_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pub/sub channel shared by all broker instances.
pub const DEFAULT_CLUSTER_CHANNEL: &str = "linkup";

/// Default keepalive interval. Some hosting proxies drop idle sockets after 55s.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(45);

/// Default broker port.
pub const DEFAULT_PORT: u16 = 5000;

/// Protocol core settings.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// How long a request waits for its response.
    pub request_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Cluster coordinator settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// How long an existence query waits for a positive answer.
    pub exists_timeout: Duration,
    /// Name of the pub/sub channel.
    pub channel: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            exists_timeout: DEFAULT_EXISTS_TIMEOUT,
            channel: DEFAULT_CLUSTER_CHANNEL.to_string(),
        }
    }
}

/// Broker settings.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Settings for each connection's protocol instance.
    pub rpc: RpcConfig,
    /// Settings for the cluster coordinator, when one is attached.
    pub cluster: ClusterConfig,
}

/// Client peer settings.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Settings for the broker connection's protocol instance.
    pub rpc: RpcConfig,
    /// Interval between keepalive pings while the broker socket is open.
    pub ping_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// Backoff policy for [`WsSocket`](crate::transport::WsSocket).
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied after every failed attempt.
    pub factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 1.5,
        }
    }
}

impl ReconnectConfig {
    /// Delay to wait after `attempt` consecutive failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}
