//! culler — a node-lifecycle controller
//!
//! Gracefully retires and replaces cluster nodes backed by a cloud
//! auto-scaler. Nodes become eligible for deletion by declarative policy
//! (age with jitter, outdated provisioning template, an explicit request
//! label, cron-gated windows); replacements are provisioned ahead of time
//! within a surge budget; the drain itself is delegated to a per-node agent
//! signalled through a label.

pub mod inventory;
pub mod lease;
pub mod metrics;
pub mod policy;
pub mod provider;
pub mod scheduler;
pub mod settings;
pub mod store;
