//! Cloud auto-scaler abstraction
//!
//! The scheduler only ever talks to the [`CloudProvider`] trait; the AWS
//! adapter lives behind it. Any error from these operations surfaces to the
//! state machine, which records it and leaves the node in its current state
//! until the next tick.

mod aws;

pub use aws::AwsProvider;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use tokio_util::sync::CancellationToken;

use culler_common::Result;

/// Adapter contract to the cloud auto-scaler
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Current desired capacity of the named group
    async fn desired_size(&self, group: &str) -> Result<i64>;

    /// Whether the node's provisioning artifact differs from its group's
    /// current canonical version
    async fn outdated_template(&self, node: &Node) -> Result<bool>;

    /// Flip provider-side flags so that a host shutdown results in
    /// termination rather than a stop
    async fn pre_drain(&self, node: &Node) -> Result<()>;

    /// Remove the node from its auto-scaling group without decrementing
    /// desired capacity, so the provider immediately provisions a
    /// replacement
    async fn detach(&self, node: &Node) -> Result<()>;

    /// Run the adapter's own cache refresh loop until cancelled
    async fn run(&self, stop: CancellationToken);
}
