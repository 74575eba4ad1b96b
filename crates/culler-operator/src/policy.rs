//! Deletion policy
//!
//! Decides, per node and per tick, whether the controller wants a node gone
//! and why, whether the node should be invisible to the scheduler entirely,
//! and whether it is counted but untouchable.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use once_cell::sync::Lazy;
use tracing::{trace, warn};

use culler_common::config::DynamicConfig;
use culler_common::selector::Selector;
use culler_common::ROLE_LABEL;

use crate::provider::CloudProvider;
use crate::scheduler::state::{instance_group_key, MASTER_GROUP_KEY, NO_GROUP_KEY};
use crate::settings::Settings;

/// Why the controller wants a node deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    /// The node carries the configured request-deletion label
    HasDeletionLabel,
    /// The node is older than the group's deletion age (plus jitter)
    TooOld,
    /// The node's provisioning template differs from its group's
    ConfigurationChanged,
}

impl Reason {
    /// Metric label value for the reason
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::HasDeletionLabel => "has_deletion_label",
            Reason::TooOld => "too_old",
            Reason::ConfigurationChanged => "configuration_changed",
        }
    }
}

static EMPTY_LABELS: Lazy<BTreeMap<String, String>> = Lazy::new(BTreeMap::new);

/// The node's label map, empty if it has none
pub fn labels(node: &Node) -> &BTreeMap<String, String> {
    node.metadata.labels.as_ref().unwrap_or(&EMPTY_LABELS)
}

/// The node's instance-group name, empty if unlabelled
pub fn group_name(node: &Node, settings: &Settings) -> String {
    settings
        .instance_group_label
        .as_ref()
        .and_then(|label| labels(node).get(label))
        .cloned()
        .unwrap_or_default()
}

/// Bucket a node into its group key
///
/// Control-plane nodes map to the synthetic `master` group regardless of
/// instance-group label; unlabelled nodes map to `nogroup`.
pub fn group_key(node: &Node, settings: &Settings) -> String {
    if labels(node).get(ROLE_LABEL).map(String::as_str) == Some("master") {
        return MASTER_GROUP_KEY.to_string();
    }
    let name = group_name(node, settings);
    if name.is_empty() {
        NO_GROUP_KEY.to_string()
    } else {
        instance_group_key(&name)
    }
}

/// Whether the controller wants to delete the node, and why
pub async fn want_to_delete(
    node: &Node,
    settings: &Settings,
    config: &DynamicConfig,
    provider: &dyn CloudProvider,
) -> (bool, Option<Reason>) {
    let name = node.metadata.name.as_deref().unwrap_or_default();
    let group = group_name(node, settings);

    if let Some(request_label) = &settings.request_deletion_label {
        if labels(node).contains_key(request_label) {
            trace!(node = name, label = %request_label, "Node carries the request-deletion label");
            return (true, Some(Reason::HasDeletionLabel));
        }
    }

    if let Some(deletion_age) = config.get_duration(&group, "deletionAge") {
        // Spread bulk-aged cohorts over a window derived from the node name
        let jitter = config
            .get_duration(&group, "deletionAgeJitter")
            .map(|max| max * (fnv1a_32(name.as_bytes()) % 100) / 100)
            .unwrap_or(Duration::ZERO);

        let cutoff = chrono::Duration::from_std(deletion_age + jitter).ok();
        if let (Some(created), Some(cutoff)) = (node.metadata.creation_timestamp.as_ref(), cutoff)
        {
            if Utc::now() > created.0 + cutoff {
                trace!(node = name, age = ?deletion_age, "Node is past its deletion age");
                return (true, Some(Reason::TooOld));
            }
        }
    }

    if config.get_bool(&group, "deleteOldLaunchConfig") {
        match provider.outdated_template(node).await {
            Ok(true) => {
                trace!(node = name, "Node provisioning template differs from its group");
                return (true, Some(Reason::ConfigurationChanged));
            }
            Ok(false) => {}
            Err(e) => {
                warn!(node = name, error = %e, "Error checking for an outdated template");
            }
        }
    }

    (false, None)
}

/// Whether the node is invisible to the scheduler this tick
///
/// Nodes inside their startup grace period and nodes whose `Ready`
/// condition is not `True` are not considered at all.
pub fn totally_ignore(node: &Node, settings: &Settings, config: &DynamicConfig) -> bool {
    let name = node.metadata.name.as_deref().unwrap_or_default();
    let group = group_name(node, settings);

    if let Some(grace) = config.get_duration(&group, "startupGracePeriod") {
        if let (Some(created), Ok(grace)) = (
            node.metadata.creation_timestamp.as_ref(),
            chrono::Duration::from_std(grace),
        ) {
            if created.0 + grace > Utc::now() {
                trace!(node = name, "Ignoring node, still in its startup grace period");
                return true;
            }
        }
    }

    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    if !ready {
        trace!(node = name, "Ignoring node, not Ready");
        return true;
    }

    false
}

/// Whether the node counts toward its group's size but must never advance
/// past `DontWantDelete`
pub fn count_but_never_delete(node: &Node, settings: &Settings, config: &DynamicConfig) -> bool {
    let name = node.metadata.name.as_deref().unwrap_or_default();
    let group = group_name(node, settings);

    if config.get_bool(&group, "ignore") {
        trace!(node = name, group = %group, "Node ignored by group policy");
        return true;
    }

    let expr = config.get_string(&group, "ignoreSelector");
    if !expr.is_empty() {
        match Selector::parse(&expr) {
            Ok(selector) if selector.matches(labels(node)) => {
                trace!(node = name, selector = %expr, "Node matches the ignore selector");
                return true;
            }
            Ok(_) => {}
            Err(e) => warn!(selector = %expr, error = %e, "Invalid ignore selector"),
        }
    }

    false
}

// 32-bit FNV-1a. The jitter contract is pinned to this exact hash so that a
// node's retirement offset is stable across controller restarts.
fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockCloudProvider;
    use crate::settings::test_settings;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use std::collections::HashMap;

    fn node(name: &str, labels: &[(&str, &str)], age: chrono::Duration, ready: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                creation_timestamp: Some(Time(Utc::now() - age)),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn config_from(pairs: &[(&str, &str)]) -> DynamicConfig {
        let raw: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut cfg = DynamicConfig::default();
        cfg.load_from_map(&raw).unwrap();
        cfg
    }

    #[test]
    fn test_fnv1a_32_reference_values() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_group_key_buckets() {
        let settings = test_settings();

        let labelled = node("n1", &[("node.group", "workers")], chrono::Duration::hours(1), true);
        assert_eq!(group_key(&labelled, &settings), "ig:workers");

        let unlabelled = node("n2", &[], chrono::Duration::hours(1), true);
        assert_eq!(group_key(&unlabelled, &settings), "nogroup");

        let master = node(
            "n3",
            &[("kubernetes.io/role", "master"), ("node.group", "workers")],
            chrono::Duration::hours(1),
            true,
        );
        assert_eq!(group_key(&master, &settings), "master");
    }

    #[tokio::test]
    async fn test_request_deletion_label_wins() {
        let settings = test_settings();
        let provider = MockCloudProvider::new();
        let config = DynamicConfig::default();

        let marked = node(
            "n1",
            &[("node.group", "workers"), ("culler.dev/delete", "")],
            chrono::Duration::hours(1),
            true,
        );
        let (want, reason) = want_to_delete(&marked, &settings, &config, &provider).await;
        assert!(want);
        assert_eq!(reason, Some(Reason::HasDeletionLabel));
    }

    #[tokio::test]
    async fn test_deletion_age_with_jitter() {
        let settings = test_settings();
        let provider = MockCloudProvider::new();
        let config = config_from(&[
            ("global.deletionAge", "10d"),
            ("global.deletionAgeJitter", "1d"),
        ]);

        // Well past age plus any jitter
        let old = node("n-old", &[("node.group", "w")], chrono::Duration::days(12), true);
        let (want, reason) = want_to_delete(&old, &settings, &config, &provider).await;
        assert!(want);
        assert_eq!(reason, Some(Reason::TooOld));

        // Well under the age
        let young = node("n-young", &[("node.group", "w")], chrono::Duration::days(3), true);
        let (want, _) = want_to_delete(&young, &settings, &config, &provider).await;
        assert!(!want);
    }

    #[tokio::test]
    async fn test_outdated_template_consulted_only_when_enabled() {
        let settings = test_settings();
        let config = config_from(&[("global.deleteOldLaunchConfig", "true")]);

        let mut provider = MockCloudProvider::new();
        provider.expect_outdated_template().returning(|_| Ok(true));

        let n = node("n1", &[("node.group", "w")], chrono::Duration::hours(1), true);
        let (want, reason) = want_to_delete(&n, &settings, &config, &provider).await;
        assert!(want);
        assert_eq!(reason, Some(Reason::ConfigurationChanged));

        // Disabled: the provider is never asked
        let provider = MockCloudProvider::new();
        let config = DynamicConfig::default();
        let (want, _) = want_to_delete(&n, &settings, &config, &provider).await;
        assert!(!want);
    }

    #[tokio::test]
    async fn test_provider_errors_are_treated_as_not_outdated() {
        let settings = test_settings();
        let config = config_from(&[("global.deleteOldLaunchConfig", "true")]);

        let mut provider = MockCloudProvider::new();
        provider
            .expect_outdated_template()
            .returning(|_| Err(culler_common::Error::provider("asg cache cold")));

        let n = node("n1", &[("node.group", "w")], chrono::Duration::hours(1), true);
        let (want, reason) = want_to_delete(&n, &settings, &config, &provider).await;
        assert!(!want);
        assert_eq!(reason, None);
    }

    #[test]
    fn test_totally_ignore_young_and_unready_nodes() {
        let settings = test_settings();
        let config = config_from(&[("global.startupGracePeriod", "1h")]);

        let young = node("n1", &[], chrono::Duration::minutes(10), true);
        assert!(totally_ignore(&young, &settings, &config));

        let old_enough = node("n2", &[], chrono::Duration::hours(2), true);
        assert!(!totally_ignore(&old_enough, &settings, &config));

        let unready = node("n3", &[], chrono::Duration::hours(2), false);
        assert!(totally_ignore(&unready, &settings, &config));
    }

    #[test]
    fn test_count_but_never_delete() {
        let settings = test_settings();

        // Default selector protects control-plane nodes
        let config = DynamicConfig::default();
        let master = node(
            "m1",
            &[("kubernetes.io/role", "master")],
            chrono::Duration::hours(2),
            true,
        );
        assert!(count_but_never_delete(&master, &settings, &config));

        let worker = node("w1", &[("node.group", "w")], chrono::Duration::hours(2), true);
        assert!(!count_but_never_delete(&worker, &settings, &config));

        // Group-level blanket ignore
        let config = config_from(&[("group.w.ignore", "true")]);
        assert!(count_but_never_delete(&worker, &settings, &config));
    }
}
