//! Static controller settings
//!
//! Everything configurable at process start: flags with environment-variable
//! fallbacks. Per-group policy lives in the hot-reloadable
//! [`DynamicConfig`](culler_common::config::DynamicConfig) instead.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use culler_common::config::parse_duration;
use culler_common::Result;

/// Command-line and environment settings for the controller
#[derive(Debug, Parser)]
#[command(
    name = "culler",
    version,
    about = "Gracefully retires and replaces cluster nodes"
)]
pub struct Settings {
    /// Name of the node this controller instance runs on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Namespace the controller resides in
    #[arg(long, env = "NAMESPACE")]
    pub namespace: String,

    /// Run a reconciliation tick every period (5s, 3m, 1h, ...)
    #[arg(long, env = "POLL_PERIOD", default_value = "15s")]
    pub poll_period: String,

    /// Refresh the cloud provider cache every period
    #[arg(long, env = "PROVIDER_POLL_PERIOD", default_value = "30s")]
    pub provider_poll_period: String,

    /// Node label whose value is the name of the node's instance group
    #[arg(long, env = "INSTANCE_GROUP_LABEL")]
    pub instance_group_label: Option<String>,

    /// Delete a node when it carries this label
    #[arg(long, env = "REQUEST_DELETION_LABEL")]
    pub request_deletion_label: Option<String>,

    /// Label the controller applies to signal the per-node agent to drain
    /// and shut the host down
    #[arg(long, env = "FORCE_DELETION_LABEL")]
    pub force_deletion_label: String,

    /// Restrict the auto-scaling groups considered, as comma-separated
    /// tag=value pairs (e.g. cluster=prod,managed=true)
    #[arg(long, env = "ASG_FILTER")]
    pub asg_filter: Option<String>,

    /// Tag on an auto-scaling group whose value is its instance-group name
    #[arg(long, env = "ASG_NAME_TAG")]
    pub asg_name_tag: Option<String>,

    /// Name of the ConfigMap holding persisted state and the leader lease
    #[arg(long, env = "LOCK_CONFIGMAP_NAME", default_value = "culler-locks")]
    pub lock_configmap_name: String,

    /// Directory the dynamic per-group configuration is mounted at
    #[arg(long, env = "CONFIG_DIR", default_value = "/etc/culler")]
    pub config_dir: PathBuf,
}

impl Settings {
    /// Parsed reconciliation tick period
    pub fn poll_period(&self) -> Result<Duration> {
        parse_duration(&self.poll_period)
    }

    /// Parsed provider cache refresh period
    pub fn provider_poll_period(&self) -> Result<Duration> {
        parse_duration(&self.provider_poll_period)
    }

    /// The ASG tag filter as a map
    pub fn asg_filter_map(&self) -> HashMap<String, String> {
        parse_kv_list(self.asg_filter.as_deref().unwrap_or_default())
    }

    /// Check everything parseable at startup so bad flags fail fast
    pub fn validate(&self) -> Result<()> {
        self.poll_period()?;
        self.provider_poll_period()?;
        Ok(())
    }
}

/// Parse a comma-separated `k=v` list, skipping malformed items
pub fn parse_kv_list(s: &str) -> HashMap<String, String> {
    s.split(',')
        .filter_map(|item| {
            let (k, v) = item.split_once('=')?;
            if k.is_empty() {
                None
            } else {
                Some((k.to_string(), v.to_string()))
            }
        })
        .collect()
}

/// Settings fixture for unit tests
#[cfg(test)]
pub fn test_settings() -> Settings {
    Settings {
        node_name: "controller-node".to_string(),
        namespace: "kube-system".to_string(),
        poll_period: "15s".to_string(),
        provider_poll_period: "30s".to_string(),
        instance_group_label: Some("node.group".to_string()),
        request_deletion_label: Some("culler.dev/delete".to_string()),
        force_deletion_label: "culler.dev/drain".to_string(),
        asg_filter: None,
        asg_name_tag: None,
        lock_configmap_name: "culler-locks".to_string(),
        config_dir: PathBuf::from("/etc/culler"),
    }
}
