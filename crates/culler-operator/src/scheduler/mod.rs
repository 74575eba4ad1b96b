//! The deletion scheduler
//!
//! One tick at a time: reload configuration, load the persisted snapshot,
//! absorb the node inventory, refresh group budgets from the provider,
//! advance the per-group state machines (or only our own group when the
//! controller is retiring the node it runs on), persist, publish metrics.

pub mod state;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use culler_common::config::{percent_or_count, DynamicConfig};
use culler_common::{Error, Result};

use crate::inventory::NodeInventory;
use crate::metrics::{GroupSnapshot, NodeObservation, Reporter};
use crate::policy;
use crate::provider::CloudProvider;
use crate::settings::Settings;
use crate::store::KeyValueStore;
use state::{Group, GroupStates, NodeState, SerializedState, State, TransitionEffector};

const STATE_KEY: &str = "state";

/// Conservative desired size assumed for the synthetic control-plane group
const MASTER_DESIRED_SIZE: i64 = 3;

/// The deletion scheduler: owns the per-group state machines and drives
/// them against the inventory, the provider, and the persisted snapshot
pub struct Culler {
    settings: Arc<Settings>,
    config: DynamicConfig,
    inventory: Arc<dyn NodeInventory>,
    provider: Arc<dyn CloudProvider>,
    store: Arc<dyn KeyValueStore>,
    reporter: Arc<Reporter>,
    states: GroupStates,
}

impl Culler {
    /// Create the scheduler
    pub fn new(
        settings: Arc<Settings>,
        inventory: Arc<dyn NodeInventory>,
        provider: Arc<dyn CloudProvider>,
        store: Arc<dyn KeyValueStore>,
        reporter: Arc<Reporter>,
    ) -> Self {
        Self {
            settings,
            config: DynamicConfig::default(),
            inventory,
            provider,
            store,
            reporter,
            states: GroupStates::default(),
        }
    }

    /// Drive ticks at the configured poll period until cancelled
    ///
    /// Ticks never overlap; one that overruns the period simply delays the
    /// next.
    pub async fn run(mut self, stop: CancellationToken) {
        let period = match self.settings.poll_period() {
            Ok(period) => period,
            Err(e) => {
                error!(error = %e, "Invalid poll period");
                return;
            }
        };
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("Deletion scheduler stopping");
                    return;
                }
                _ = interval.tick() => {}
            }
            let started = Instant::now();
            self.tick().await;
            debug!(took = ?started.elapsed(), "Poll cycle finished");
        }
    }

    /// Run one reconciliation tick
    pub async fn tick(&mut self) {
        // Reload configuration. Parse errors abort the tick; the previous
        // configuration stays in force.
        if let Err(e) = self.config.reload(&self.settings.config_dir) {
            error!(error = %e, "Error loading config");
            return;
        }

        // Node states persisted by a previous incarnation, adopted for any
        // node we are not tracking yet
        let persisted = match self.load_persisted().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "Error loading persisted node states");
                return;
            }
        };

        let all_nodes = match self.inventory.list().await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %e, "Could not list nodes");
                return;
            }
        };

        // Bucket nodes into groups, creating group and node records on first
        // sighting
        let mut present = BTreeSet::new();
        for node in &all_nodes {
            let node = node.as_ref();
            if policy::totally_ignore(node, &self.settings, &self.config) {
                continue;
            }
            let Some(name) = node.metadata.name.clone() else {
                continue;
            };
            present.insert(name.clone());

            let key = policy::group_key(node, &self.settings);
            let group = self.states.groups.entry(key.clone()).or_insert_with(|| {
                let group_name = policy::group_name(node, &self.settings);
                let is_real = key == state::instance_group_key(&group_name);
                let mut group = Group::new(key.clone(), group_name, is_real);
                if key == state::MASTER_GROUP_KEY {
                    group.num_desired = MASTER_DESIRED_SIZE;
                }
                group
            });
            group.nodes.entry(name.clone()).or_insert_with(|| {
                let initial = match persisted.node_states.get(&name) {
                    Some(p) => {
                        trace!(node = %name, state = %p.state, "Adopted persisted node state");
                        p.state
                    }
                    None => State::DontWantDelete,
                };
                NodeState::new(name.clone(), initial)
            });
        }

        // Refresh real groups from the provider and configuration, purge
        // vanished nodes, and rederive never-delete on the rest
        for group in self.states.groups.values_mut() {
            if group.is_real {
                match self.provider.desired_size(&group.name).await {
                    Ok(desired) => group.num_desired = desired,
                    Err(e) => {
                        warn!(group = %group.key, error = %e, "Error getting desired group size");
                    }
                }
                group.max_surge = percent_or_count(
                    &self.config.get_string(&group.name, "maxSurge"),
                    group.num_desired,
                    true,
                );
                group.max_unavailable = percent_or_count(
                    &self.config.get_string(&group.name, "maxUnavailable"),
                    group.num_desired,
                    false,
                );
                group.deletion_schedule =
                    self.config.get_schedule(&group.name, "deletionSchedule");
            }

            let tracked: Vec<String> = group.nodes.keys().cloned().collect();
            for name in tracked {
                if !present.contains(&name) {
                    if let Some(node) = group.nodes.remove(&name) {
                        info!(node = %name, last_state = %node.state, "Removing vanished node from memory");
                    }
                    continue;
                }
                match self.inventory.get(&name).await {
                    Ok(Some(real)) => {
                        let never = policy::count_but_never_delete(
                            real.as_ref(),
                            &self.settings,
                            &self.config,
                        );
                        if let Some(record) = group.nodes.get_mut(&name) {
                            record.never_delete = never;
                        }
                    }
                    Ok(None) => error!(node = %name, "Node listed but missing from lookup"),
                    Err(e) => error!(node = %name, error = %e, "Error fetching node"),
                }
            }
        }

        // When the node we run on needs to go, it goes first and alone: the
        // priority set restricts its group, and no other group acts at all.
        let cull_self = self.should_cull_self().await;

        let effector = Transitioner {
            settings: &self.settings,
            config: &self.config,
            inventory: Arc::clone(&self.inventory),
            provider: Arc::clone(&self.provider),
        };

        if cull_self {
            let own = match self.inventory.get(&self.settings.node_name).await {
                Ok(Some(node)) => node,
                _ => {
                    warn!(
                        node = %self.settings.node_name,
                        "Couldn't find my own node while trying to delete it"
                    );
                    return;
                }
            };
            let key = policy::group_key(own.as_ref(), &self.settings);
            if let Some(group) = self.states.groups.get_mut(&key) {
                group.advance(&effector).await;
            }
        } else {
            self.states.advance(&effector).await;
        }

        // Persist node states so a restarted controller adopts them
        match serde_json::to_string(&self.states.serialize_state()) {
            Ok(snapshot) => {
                if let Err(e) = self.store.store(STATE_KEY, Some(snapshot)).await {
                    error!(error = %e, "Error persisting deletion state");
                }
            }
            Err(e) => {
                error!(error = %e, "Error serializing deletion state");
                return;
            }
        }

        self.record_metrics().await;
    }

    async fn load_persisted(&self) -> Result<SerializedState> {
        match self.store.load(STATE_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::serialization(format!("unmarshalling node states: {}", e))),
            None => Ok(SerializedState::default()),
        }
    }

    // If for any reason the node this controller runs on should be deleted,
    // everything else waits and the controller retires its own host first.
    async fn should_cull_self(&mut self) -> bool {
        // If our own node is gone, it was probably reaped already
        let own = match self.inventory.get(&self.settings.node_name).await {
            Ok(Some(node)) => node,
            _ => return true,
        };
        let key = policy::group_key(own.as_ref(), &self.settings);

        // Freshly created nodes can lag into the inventory, so our own
        // records may not exist yet
        let tracked = self
            .states
            .groups
            .get(&key)
            .is_some_and(|g| g.nodes.contains_key(&self.settings.node_name));
        if !tracked {
            info!(node = %self.settings.node_name, "Own node not tracked yet, skipping self-preemption");
            return false;
        }

        // Already on the way out: keep going
        let own_state = self.states.groups[&key].nodes[&self.settings.node_name].state;
        if own_state != State::DontWantDelete {
            return true;
        }

        let (want, _) = policy::want_to_delete(
            own.as_ref(),
            &self.settings,
            &self.config,
            self.provider.as_ref(),
        )
        .await;
        if !want {
            return false;
        }

        info!(
            node = %self.settings.node_name,
            "Own node needs deletion, retiring it before anything else"
        );
        if let Some(group) = self.states.groups.get_mut(&key) {
            group.priority_nodes.insert(self.settings.node_name.clone());
        }
        true
    }

    async fn record_metrics(&self) {
        let mut snapshots = Vec::new();
        for group in self.states.groups.values() {
            let mut nodes = Vec::new();
            for record in group.nodes.values() {
                let real = match self.inventory.get(&record.name).await {
                    Ok(Some(node)) => node,
                    _ => continue,
                };
                let (_, reason) = policy::want_to_delete(
                    real.as_ref(),
                    &self.settings,
                    &self.config,
                    self.provider.as_ref(),
                )
                .await;
                nodes.push(NodeObservation {
                    state: record.state.as_str(),
                    reason: reason.map(|r| r.as_str()).unwrap_or(""),
                });
            }
            snapshots.push(GroupSnapshot {
                group: if group.name.is_empty() {
                    group.key.clone()
                } else {
                    group.name.clone()
                },
                desired: group.num_desired,
                nodes,
            });
        }
        self.reporter.publish(&snapshots);
    }
}

// Wires policy, provider, and inventory into the state machine's edges.
// Both decides authorization and performs the side effect; a rejected or
// failed edge leaves the node where it was.
struct Transitioner<'a> {
    settings: &'a Settings,
    config: &'a DynamicConfig,
    inventory: Arc<dyn NodeInventory>,
    provider: Arc<dyn CloudProvider>,
}

#[async_trait]
impl TransitionEffector for Transitioner<'_> {
    async fn attempt(&self, name: &str, from: State, to: State) -> Result<bool> {
        let node = self.inventory.get(name).await?.ok_or_else(|| {
            Error::internal_with_context("scheduler", format!("could not find node {}", name))
        })?;

        match (from, to) {
            (State::DontWantDelete, State::WantDelete) => {
                let (want, _) = policy::want_to_delete(
                    node.as_ref(),
                    self.settings,
                    self.config,
                    self.provider.as_ref(),
                )
                .await;
                Ok(want)
            }
            (State::WantDelete, State::Detached) => {
                self.provider.detach(node.as_ref()).await?;
                Ok(true)
            }
            (State::WantDelete, State::ReadyToDelete)
            | (State::Detached, State::ReadyToDelete) => Ok(true),
            (State::ReadyToDelete, State::Deleting) => {
                self.provider.pre_drain(node.as_ref()).await?;
                self.inventory
                    .apply_label(name, &self.settings.force_deletion_label, "culler")
                    .await?;
                Ok(true)
            }
            _ => Err(Error::internal_with_context(
                "scheduler",
                format!("no transition available for {} -> {}", from, to),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::MockNodeInventory;
    use crate::provider::MockCloudProvider;
    use crate::settings::test_settings;
    use crate::store::MockKeyValueStore;
    use chrono::Utc;
    use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use std::collections::HashMap;

    fn cluster_node(name: &str, group: &str, age_days: i64, ready: bool) -> Arc<Node> {
        Arc::new(Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    [("node.group".to_string(), group.to_string())]
                        .into_iter()
                        .collect(),
                ),
                creation_timestamp: Some(Time(Utc::now() - chrono::Duration::days(age_days))),
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
        })
    }

    fn inventory_of(nodes: Vec<Arc<Node>>) -> MockNodeInventory {
        let mut inventory = MockNodeInventory::new();
        let for_list = nodes.clone();
        inventory
            .expect_list()
            .returning(move || Ok(for_list.clone()));
        inventory.expect_get().returning(move |name| {
            Ok(nodes
                .iter()
                .find(|n| n.metadata.name.as_deref() == Some(name))
                .cloned())
        });
        inventory.expect_apply_label().returning(|_, _, _| Ok(()));
        inventory
    }

    fn store_with_snapshot(snapshot: Option<&str>) -> MockKeyValueStore {
        let mut store = MockKeyValueStore::new();
        let snap = snapshot.map(|s| s.to_string());
        store.expect_load().returning(move |_| Ok(snap.clone()));
        store.expect_store().returning(|_, _| Ok(()));
        store
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

    fn culler_with(
        inventory: MockNodeInventory,
        provider: MockCloudProvider,
        store: MockKeyValueStore,
        config: DynamicConfig,
    ) -> Culler {
        Culler {
            settings: Arc::new(test_settings()),
            config,
            inventory: Arc::new(inventory),
            provider: Arc::new(provider),
            store: Arc::new(store),
            reporter: Arc::new(Reporter::new()),
            states: GroupStates::default(),
        }
    }

    #[tokio::test]
    async fn test_persisted_state_is_adopted_on_restart() {
        let nodes = vec![
            cluster_node("node-x", "workers", 1, true),
            cluster_node("controller-node", "workers", 1, true),
        ];
        let mut provider = MockCloudProvider::new();
        provider.expect_desired_size().returning(|_| Ok(10));

        let mut store = MockKeyValueStore::new();
        store.expect_load().returning(|_| {
            Ok(Some(
                r#"{"nodeStates":{"node-x":{"state":"detached"}}}"#.to_string(),
            ))
        });
        store
            .expect_store()
            .withf(|key, value| {
                key == "state"
                    && value
                        .as_ref()
                        .is_some_and(|v| v.contains(r#""node-x":{"state":"detached"}"#))
            })
            .returning(|_, _| Ok(()));

        let mut culler = culler_with(
            inventory_of(nodes),
            provider,
            store,
            DynamicConfig::default(),
        );
        culler.tick().await;

        let group = &culler.states.groups["ig:workers"];
        assert_eq!(group.nodes["node-x"].state, State::Detached);
        assert_eq!(group.nodes["controller-node"].state, State::DontWantDelete);
        assert!(group.is_real);
        assert_eq!(group.num_desired, 10);
    }

    #[tokio::test]
    async fn test_self_preemption_isolates_own_group() {
        // The controller's node in group-a crosses the age threshold while
        // groups b and c have equally old nodes: only group-a may act.
        let nodes = vec![
            cluster_node("controller-node", "group-a", 30, true),
            cluster_node("a-2", "group-a", 30, true),
            cluster_node("b-1", "group-b", 30, true),
            cluster_node("c-1", "group-c", 30, true),
        ];
        let mut provider = MockCloudProvider::new();
        provider.expect_desired_size().returning(|_| Ok(2));
        provider
            .expect_detach()
            .withf(|node| node.metadata.name.as_deref() == Some("controller-node"))
            .returning(|_| Ok(()));

        let config = config_from(&[("global.deletionAge", "10d")]);
        let mut culler = culler_with(
            inventory_of(nodes),
            provider,
            store_with_snapshot(None),
            config,
        );
        culler.tick().await;

        let group_a = &culler.states.groups["ig:group-a"];
        assert!(group_a.priority_nodes.contains("controller-node"));
        assert_eq!(group_a.nodes["controller-node"].state, State::Detached);
        assert_eq!(group_a.nodes["a-2"].state, State::DontWantDelete);
        assert_eq!(
            culler.states.groups["ig:group-b"].nodes["b-1"].state,
            State::DontWantDelete
        );
        assert_eq!(
            culler.states.groups["ig:group-c"].nodes["c-1"].state,
            State::DontWantDelete
        );
    }

    #[tokio::test]
    async fn test_missing_own_node_aborts_the_tick() {
        // Own node absent from the inventory entirely: treated as already
        // reaped, and the tick stops before advancing or persisting.
        let nodes = vec![cluster_node("b-1", "group-b", 30, true)];
        let mut provider = MockCloudProvider::new();
        provider.expect_desired_size().returning(|_| Ok(1));

        let mut store = MockKeyValueStore::new();
        store.expect_load().returning(|_| Ok(None));
        store.expect_store().never();

        let config = config_from(&[("global.deletionAge", "10d")]);
        let mut culler = culler_with(inventory_of(nodes), provider, store, config);
        culler.tick().await;

        assert_eq!(
            culler.states.groups["ig:group-b"].nodes["b-1"].state,
            State::DontWantDelete
        );
    }

    #[tokio::test]
    async fn test_unready_own_node_does_not_block_other_groups() {
        // Own node exists but is filtered from absorption (not Ready yet):
        // the startup race is tolerated and other groups keep moving.
        let nodes = vec![
            cluster_node("controller-node", "group-a", 0, false),
            cluster_node("b-1", "group-b", 30, true),
        ];
        let mut provider = MockCloudProvider::new();
        provider.expect_desired_size().returning(|_| Ok(1));
        provider.expect_detach().returning(|_| Ok(()));

        let config = config_from(&[("global.deletionAge", "10d")]);
        let mut culler = culler_with(
            inventory_of(nodes),
            provider,
            store_with_snapshot(None),
            config,
        );
        culler.tick().await;

        // b-1 marked and detached; can_delete is zero (size 1, desired 1)
        assert_eq!(
            culler.states.groups["ig:group-b"].nodes["b-1"].state,
            State::Detached
        );
    }

    #[tokio::test]
    async fn test_vanished_nodes_are_purged() {
        let mut provider = MockCloudProvider::new();
        provider.expect_desired_size().returning(|_| Ok(5));

        let snapshot = r#"{"nodeStates":{"node-gone":{"state":"deleting"},"node-x":{"state":"want_delete"}}}"#;
        let nodes = vec![
            cluster_node("node-x", "workers", 1, true),
            cluster_node("controller-node", "workers", 1, true),
        ];
        // Zero surge keeps the resumed node parked in want_delete
        let config = config_from(&[("global.maxSurge", "0")]);
        let mut culler = culler_with(
            inventory_of(nodes),
            provider,
            store_with_snapshot(Some(snapshot)),
            config,
        );
        culler.tick().await;

        let group = &culler.states.groups["ig:workers"];
        // node-gone was never sighted, so it was never created; node-x
        // resumed in want_delete
        assert!(!group.nodes.contains_key("node-gone"));
        assert_eq!(group.nodes["node-x"].state, State::WantDelete);
    }

    #[tokio::test]
    async fn test_synthetic_groups_skip_the_provider() {
        // Unlabelled nodes land in the synthetic nogroup; the provider is
        // never queried for it and the sentinel keeps deletions impossible.
        let unlabelled = Arc::new(Node {
            metadata: ObjectMeta {
                name: Some("stray".to_string()),
                creation_timestamp: Some(Time(Utc::now() - chrono::Duration::days(30))),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        let nodes = vec![unlabelled, cluster_node("controller-node", "workers", 1, true)];

        let mut provider = MockCloudProvider::new();
        provider
            .expect_desired_size()
            .withf(|group| group == "workers")
            .returning(|_| Ok(3));
        // A stray node has no auto-scaling group, so a detach attempt fails
        // and the node stays where it is
        provider
            .expect_detach()
            .returning(|_| Err(culler_common::Error::provider("no auto-scaling group")));

        let config = config_from(&[("global.deletionAge", "10d")]);
        let mut culler = culler_with(
            inventory_of(nodes),
            provider,
            store_with_snapshot(None),
            config,
        );
        culler.tick().await;

        let nogroup = &culler.states.groups["nogroup"];
        assert!(!nogroup.is_real);
        // The stray node is wanted (too old) but the sentinel desired size
        // blocks every budgeted edge
        assert_eq!(nogroup.nodes["stray"].state, State::WantDelete);
    }
}
