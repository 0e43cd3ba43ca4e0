//! Operator configuration read from the environment

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_BACKUP_MAX_RETRIES: u32 = 5;
pub const DEFAULT_READY_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MEMBER_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_ARANGO_CLIENT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";

#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Identity used for leader election
    pub pod_name: String,
    /// Namespace the operator runs in, holds the leader lease
    pub pod_namespace: String,
    /// Namespace to watch, `None` watches the whole cluster
    pub watch_namespace: Option<String>,
    /// Temporary failures a backup tolerates before it fails
    pub backup_max_retries: u32,
    /// How often a ready backup is checked against the database
    pub ready_poll_interval: Duration,
    /// How often a waiting plan or a running transfer is polled
    pub member_poll_interval: Duration,
    /// Timeout of a single call to the ArangoDB API
    pub arango_client_timeout: Duration,
    pub health_addr: SocketAddr,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            pod_name: "unknown".to_string(),
            pod_namespace: "default".to_string(),
            watch_namespace: None,
            backup_max_retries: DEFAULT_BACKUP_MAX_RETRIES,
            ready_poll_interval: Duration::from_secs(DEFAULT_READY_POLL_INTERVAL_SECS),
            member_poll_interval: Duration::from_secs(DEFAULT_MEMBER_POLL_INTERVAL_SECS),
            arango_client_timeout: Duration::from_secs(DEFAULT_ARANGO_CLIENT_TIMEOUT_SECS),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup; invalid values fall back to defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let pod_name = lookup("POD_NAME").unwrap_or_else(|| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or(defaults.pod_name.clone())
        });
        let pod_namespace = lookup("POD_NAMESPACE").unwrap_or_else(|| {
            warn!("POD_NAMESPACE not set, using 'default'");
            defaults.pod_namespace.clone()
        });

        Self {
            pod_name,
            pod_namespace,
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty()),
            backup_max_retries: parse_or(&lookup, "BACKUP_MAX_RETRIES", defaults.backup_max_retries),
            ready_poll_interval: Duration::from_secs(parse_or(
                &lookup,
                "READY_POLL_INTERVAL_SECS",
                DEFAULT_READY_POLL_INTERVAL_SECS,
            )),
            member_poll_interval: Duration::from_secs(parse_or(
                &lookup,
                "MEMBER_POLL_INTERVAL_SECS",
                DEFAULT_MEMBER_POLL_INTERVAL_SECS,
            )),
            arango_client_timeout: Duration::from_secs(parse_or(
                &lookup,
                "ARANGO_CLIENT_TIMEOUT_SECS",
                DEFAULT_ARANGO_CLIENT_TIMEOUT_SECS,
            )),
            health_addr: parse_or(&lookup, "HEALTH_ADDR", defaults.health_addr),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key = key, value = %raw, "Invalid value, using default {:?}", default);
            default
        }),
    }
}
