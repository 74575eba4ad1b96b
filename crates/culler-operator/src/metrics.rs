//! Metrics for group deletion state
//!
//! Two gauges published through the global meter every tick: the
//! provider-desired size per instance group, and per-(state, reason) node
//! counts. Combinations that stop occurring are re-published as zero for
//! five minutes so scrapes see the series settle before it disappears.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Gauge, Meter};
use opentelemetry::{global, KeyValue};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("culler"));

/// Gauge tracking each instance group's provider-desired size
///
/// Labels:
/// - `group`: instance group name
static DESIRED_SIZE: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("culler_instance_group_desired_size")
        .with_description("Desired number of nodes in the instance group")
        .with_unit("{nodes}")
        .build()
});

/// Gauge tracking node counts per deletion state
///
/// Labels:
/// - `group`: instance group name
/// - `state`: deletion state of the counted nodes
/// - `reason`: why the controller wants them deleted (empty if it doesn't)
static GROUP_STATE: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("culler_instance_group_state")
        .with_description("Number of nodes in a particular state of deletion")
        .with_unit("{nodes}")
        .build()
});

const COMBO_RETENTION: Duration = Duration::from_secs(5 * 60);

type ComboKey = (String, &'static str, &'static str);

/// One node's observed deletion state and reason
#[derive(Debug, Clone, Copy)]
pub struct NodeObservation {
    /// Deletion state wire name
    pub state: &'static str,
    /// Deletion reason, empty when the controller does not want the node
    pub reason: &'static str,
}

/// One group's state for publication
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    /// Metric label for the group
    pub group: String,
    /// Provider-desired size (or the sentinel for synthetic groups)
    pub desired: i64,
    /// Every observed node
    pub nodes: Vec<NodeObservation>,
}

/// Publishes group-state gauges, remembering past combinations
#[derive(Debug, Default)]
pub struct Reporter {
    seen: Mutex<HashMap<ComboKey, Instant>>,
}

impl Reporter {
    /// Create a reporter with no history
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the gauges for the given snapshots
    pub fn publish(&self, snapshots: &[GroupSnapshot]) {
        let now = Instant::now();
        let counts = {
            let mut seen = self.seen.lock().unwrap();
            compute_counts(&mut seen, snapshots, now)
        };

        for snap in snapshots {
            DESIRED_SIZE.record(
                snap.desired,
                &[KeyValue::new("group", snap.group.clone())],
            );
        }
        for ((group, state, reason), count) in counts {
            GROUP_STATE.record(
                count,
                &[
                    KeyValue::new("group", group),
                    KeyValue::new("state", state),
                    KeyValue::new("reason", reason),
                ],
            );
        }
    }
}

// Count nodes per (group, state, reason); previously seen combinations with
// no nodes are carried as explicit zeros until they age out.
fn compute_counts(
    seen: &mut HashMap<ComboKey, Instant>,
    snapshots: &[GroupSnapshot],
    now: Instant,
) -> HashMap<ComboKey, i64> {
    let mut counts: HashMap<ComboKey, i64> = HashMap::new();
    for snap in snapshots {
        for node in &snap.nodes {
            let key = (snap.group.clone(), node.state, node.reason);
            *counts.entry(key.clone()).or_insert(0) += 1;
            seen.insert(key, now);
        }
    }

    seen.retain(|key, last| {
        if now.duration_since(*last) > COMBO_RETENTION {
            return false;
        }
        counts.entry(key.clone()).or_insert(0);
        true
    });

    counts
}
