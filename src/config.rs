use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;

use crate::{hub::HubConfig, source::Selector, supervisor::BackoffConfig};

pub mod credentials;
pub use credentials::{ConfigError, Credentials};

/// Process configuration, from command-line flags or the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "kube-event-relay", version, about)]
pub struct Config {
    /// Address to serve the websocket endpoint on.
    #[arg(long, env = "RELAY_LISTEN", default_value = "0.0.0.0:7008")]
    pub listen: SocketAddr,

    /// Kubeconfig used when not running inside a cluster.
    /// Defaults to `$HOME/.kube/config`.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// API group of the watched collection; empty for the core group.
    #[arg(long, default_value = "")]
    pub group: String,

    #[arg(long = "api-version", default_value = "v1")]
    pub api_version: String,

    #[arg(long, default_value = "Event")]
    pub kind: String,

    /// Plural resource name, if it cannot be guessed from the kind.
    #[arg(long)]
    pub plural: Option<String>,

    /// Watch a single namespace instead of all of them.
    #[arg(long, short)]
    pub namespace: Option<String>,

    #[arg(long)]
    pub label_selector: Option<String>,

    #[arg(long)]
    pub field_selector: Option<String>,

    /// Server-side timeout of one watch request, in seconds.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=295))]
    pub watch_timeout: Option<u32>,

    /// Events buffered per subscriber before the oldest are dropped.
    #[arg(long, default_value_t = 256)]
    pub queue_capacity: usize,

    /// Consecutive overflows after which a subscriber is disconnected.
    #[arg(long, default_value_t = 64)]
    pub eviction_threshold: usize,

    #[arg(long, default_value_t = 500)]
    pub backoff_min_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub backoff_max_ms: u64,

    /// Grace period for subscriber sessions on shutdown.
    #[arg(long, default_value_t = 10)]
    pub shutdown_timeout_secs: u64,
}

impl Config {
    pub fn selector(&self) -> Selector {
        let mut selector = Selector::from_gvk(
            &self.group,
            &self.api_version,
            &self.kind,
            self.plural.as_deref(),
        );
        selector.namespace.clone_from(&self.namespace);
        selector.label_selector.clone_from(&self.label_selector);
        selector.field_selector.clone_from(&self.field_selector);
        selector.timeout = self.watch_timeout;
        selector
    }

    pub fn hub(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.queue_capacity.max(1),
            eviction_threshold: self.eviction_threshold.max(1),
        }
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            min: Duration::from_millis(self.backoff_min_ms),
            max: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
