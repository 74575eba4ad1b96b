//! Per-group deletion state machines
//!
//! Every observed node carries one of five deletion states; a [`Group`]
//! advances its nodes toward `Deleting` while respecting the surge and
//! unavailability budgets and the group's deletion window. Transitions are
//! attempted through a [`TransitionEffector`] that both decides
//! authorization and performs the side effect, so the whole budget argument
//! lives in one `advance` pass.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use culler_common::cron::Schedule;
use culler_common::{Result, UNKNOWN_DESIRED_SIZE};

/// Group key for control-plane nodes
pub const MASTER_GROUP_KEY: &str = "master";

/// Group key for nodes without an instance-group label
pub const NO_GROUP_KEY: &str = "nogroup";

/// Group key for nodes of the named instance group
pub fn instance_group_key(name: &str) -> String {
    format!("ig:{name}")
}

/// Stages of the deletion process for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// The controller does not want to delete the node
    DontWantDelete,
    /// The controller wants to delete the node but has not started yet
    WantDelete,
    /// The node is detached from its auto-scaling group, waiting for the
    /// replacement to come up
    Detached,
    /// The node may begin draining
    ReadyToDelete,
    /// The per-node agent has been signalled; the node will soon vanish
    Deleting,
}

impl State {
    /// Wire and log name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            State::DontWantDelete => "dont_want_delete",
            State::WantDelete => "want_delete",
            State::Detached => "detached",
            State::ReadyToDelete => "ready_to_delete",
            State::Deleting => "deleting",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether a transition is authorized and performs its side effect
///
/// `Ok(true)` commits the transition, `Ok(false)` declines it silently
/// (e.g. the policy does not want the node deleted), and `Err` declines it
/// loudly — the node stays in place and the operation retries next tick.
#[async_trait]
pub trait TransitionEffector: Send + Sync {
    /// Attempt to move `node` from `from` to `to`
    async fn attempt(&self, node: &str, from: State, to: State) -> Result<bool>;
}

/// Deletion state for a single node
#[derive(Debug, Clone)]
pub struct NodeState {
    /// Stable cluster-wide node name
    pub name: String,
    /// Current deletion state
    pub state: State,
    /// Counted toward group size but never advanced past `DontWantDelete`.
    /// Rederived from the ignore policy every tick, never persisted.
    pub never_delete: bool,
}

impl NodeState {
    /// Create a node record in the given state
    pub fn new(name: impl Into<String>, state: State) -> Self {
        Self {
            name: name.into(),
            state,
            never_delete: false,
        }
    }

    async fn change_state(&mut self, new_state: State, f: &dyn TransitionEffector) -> bool {
        match f.attempt(&self.name, self.state, new_state).await {
            Ok(true) => {
                info!(node = %self.name, from = %self.state, to = %new_state, "Changed node deletion state");
                self.state = new_state;
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!(
                    node = %self.name,
                    from = %self.state,
                    to = %new_state,
                    error = %e,
                    "Failed to change node deletion state"
                );
                false
            }
        }
    }
}

/// Persisted slice of one node's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedNode {
    /// The state enum; every other field is rederived after a restart
    pub state: State,
}

/// Snapshot of every node's deletion state, persisted across restarts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedState {
    /// Node name to persisted state
    #[serde(rename = "nodeStates", default)]
    pub node_states: BTreeMap<String, PersistedNode>,
}

/// Deletion state and budgets for a single instance group
#[derive(Debug)]
pub struct Group {
    /// Group key (`ig:<name>`, `master`, or `nogroup`)
    pub key: String,
    /// Group name as the provider knows it; empty for synthetic groups
    pub name: String,
    /// Whether the group is backed by a real provider group
    pub is_real: bool,
    /// Provider-reported desired capacity, or the unknown sentinel
    pub num_desired: i64,
    /// Nodes allowed above desired capacity during replacement
    pub max_surge: i64,
    /// Nodes tolerated below desired capacity
    pub max_unavailable: i64,
    /// Cron window during which deletions may start
    pub deletion_schedule: Option<Schedule>,
    /// Every observed node in the group
    pub nodes: BTreeMap<String, NodeState>,
    /// When non-empty, the group acts only on these nodes
    pub priority_nodes: BTreeSet<String>,
}

impl Group {
    /// Create a group with default budgets and unknown desired size
    pub fn new(key: impl Into<String>, name: impl Into<String>, is_real: bool) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            is_real,
            num_desired: UNKNOWN_DESIRED_SIZE,
            max_surge: 1,
            max_unavailable: 0,
            deletion_schedule: None,
            nodes: BTreeMap::new(),
            priority_nodes: BTreeSet::new(),
        }
    }

    /// Number of observed nodes in the group
    pub fn size(&self) -> i64 {
        self.nodes.len() as i64
    }

    /// Number of nodes in any of the given states
    pub fn state_count(&self, states: &[State]) -> i64 {
        self.nodes
            .values()
            .filter(|n| states.contains(&n.state))
            .count() as i64
    }

    // If there are priority nodes (the node the controller itself runs on),
    // act on them exclusively; entries that vanished or became never-delete
    // are dropped from the set. An emptied set falls back to all nodes.
    fn iterable_nodes(&mut self) -> Vec<String> {
        if !self.priority_nodes.is_empty() {
            let keep: Vec<String> = std::mem::take(&mut self.priority_nodes)
                .into_iter()
                .filter(|name| {
                    self.nodes
                        .get(name)
                        .map(|n| !n.never_delete)
                        .unwrap_or(false)
                })
                .collect();
            self.priority_nodes = keep.iter().cloned().collect();
            if !keep.is_empty() {
                return keep;
            }
        }
        self.nodes
            .values()
            .filter(|n| !n.never_delete)
            .map(|n| n.name.clone())
            .collect()
    }

    /// Try to move as many nodes in the group as possible toward deletion
    pub async fn advance(&mut self, f: &dyn TransitionEffector) {
        // DontWantDelete -> WantDelete wherever the policy asks for it
        for name in self.iterable_nodes() {
            if let Some(node) = self.nodes.get_mut(&name) {
                if node.state == State::DontWantDelete {
                    node.change_state(State::WantDelete, f).await;
                }
            }
        }

        // Slack available to move into the deletion-in-flight bucket this
        // tick: nodes beyond what the group must keep serving.
        let total = self.size();
        let being_deleted = self.state_count(&[State::ReadyToDelete, State::Deleting]);
        let mut can_delete = total - being_deleted - self.num_desired + self.max_unavailable;

        let schedule_allows = self
            .deletion_schedule
            .as_ref()
            .map(|s| s.matches(Utc::now()))
            .unwrap_or(true);
        if !schedule_allows && self.state_count(&[State::WantDelete]) > 0 {
            debug!(group = %self.key, "Deletion window closed by crontab");
        }

        // Detached -> ReadyToDelete. Detached nodes drain before
        // still-attached ones: they already consumed surge.
        for name in self.iterable_nodes() {
            if can_delete <= 0 {
                break;
            }
            if let Some(node) = self.nodes.get_mut(&name) {
                if node.state == State::Detached
                    && node.change_state(State::ReadyToDelete, f).await
                {
                    can_delete -= 1;
                }
            }
        }

        // WantDelete -> ReadyToDelete, for adopted nodes whose surge a prior
        // incarnation of the controller already paid for
        if schedule_allows {
            for name in self.iterable_nodes() {
                if can_delete <= 0 {
                    break;
                }
                if let Some(node) = self.nodes.get_mut(&name) {
                    if node.state == State::WantDelete
                        && node.change_state(State::ReadyToDelete, f).await
                    {
                        can_delete -= 1;
                    }
                }
            }
        }

        // ReadyToDelete -> Deleting
        for name in self.iterable_nodes() {
            if let Some(node) = self.nodes.get_mut(&name) {
                if node.state == State::ReadyToDelete {
                    node.change_state(State::Deleting, f).await;
                }
            }
        }

        // WantDelete -> Detached, bounded by the surge budget
        if schedule_allows {
            let mut can_detach = (self.max_surge
                - self.state_count(&[State::Detached, State::ReadyToDelete, State::Deleting]))
            .max(0);
            for name in self.iterable_nodes() {
                if can_detach == 0 {
                    break;
                }
                if let Some(node) = self.nodes.get_mut(&name) {
                    if node.state == State::WantDelete
                        && node.change_state(State::Detached, f).await
                    {
                        can_detach -= 1;
                    }
                }
            }
        }
    }
}

/// All per-group state machines, keyed by group key
#[derive(Debug, Default)]
pub struct GroupStates {
    /// Group key to group
    pub groups: BTreeMap<String, Group>,
}

impl GroupStates {
    /// Snapshot every node's state for persistence
    pub fn serialize_state(&self) -> SerializedState {
        let mut node_states = BTreeMap::new();
        for group in self.groups.values() {
            for node in group.nodes.values() {
                node_states.insert(node.name.clone(), PersistedNode { state: node.state });
            }
        }
        SerializedState { node_states }
    }

    /// Advance deletion for every group concurrently, joining before return
    pub async fn advance(&mut self, f: &dyn TransitionEffector) {
        join_all(self.groups.values_mut().map(|g| g.advance(f))).await;
    }
}
