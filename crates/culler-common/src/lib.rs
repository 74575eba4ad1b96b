//! Shared types and plumbing for the culler node-lifecycle controller

#![deny(missing_docs)]

pub mod config;
pub mod cron;
pub mod error;
pub mod selector;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Desired-size sentinel for groups whose real capacity is unknown.
///
/// High enough that the unavailability slack can never go positive, so the
/// scheduler never authorizes a deletion it cannot account for.
pub const UNKNOWN_DESIRED_SIZE: i64 = 1_000_000;

/// Node label whose value is the cluster role (`master` for control-plane)
pub const ROLE_LABEL: &str = "kubernetes.io/role";

/// Default selector for nodes that are counted but never deleted
pub const DEFAULT_IGNORE_SELECTOR: &str = "kubernetes.io/role=master";
