//! Cluster node inventory
//!
//! A reflector-backed catalog of the cluster's nodes. The scheduler reads
//! exclusively from the in-memory store, which the watcher keeps in sync;
//! the only write is the merge patch that applies the force-deletion label.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use culler_common::{Error, Result};

/// Catalog of cluster nodes the scheduler consumes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeInventory: Send + Sync {
    /// Every node currently known to the cluster
    async fn list(&self) -> Result<Vec<Arc<Node>>>;

    /// The node with the given name, if it exists
    async fn get(&self, name: &str) -> Result<Option<Arc<Node>>>;

    /// Merge-patch a label onto the node record
    async fn apply_label(&self, name: &str, key: &str, value: &str) -> Result<()>;
}

/// Reflector-backed inventory watching every node in the cluster
pub struct ReflectorInventory {
    client: Client,
    reader: Store<Node>,
}

impl ReflectorInventory {
    /// Start watching nodes; resolves once the initial list has synced
    pub async fn start(client: Client, stop: CancellationToken) -> Result<Self> {
        let api: Api<Node> = Api::all(client.clone());
        let (reader, writer) = reflector::store();

        let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
            .default_backoff()
            .touched_objects();

        tokio::spawn(async move {
            let mut stream = stream.boxed();
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    item = stream.next() => match item {
                        Some(Ok(_)) => {}
                        Some(Err(e)) => warn!(error = %e, "Node watch error"),
                        None => return,
                    }
                }
            }
        });

        reader
            .wait_until_ready()
            .await
            .map_err(|e| Error::internal_with_context("inventory", e.to_string()))?;
        info!("Node inventory synced");
        Ok(Self { client, reader })
    }
}

#[async_trait]
impl NodeInventory for ReflectorInventory {
    async fn list(&self) -> Result<Vec<Arc<Node>>> {
        Ok(self.reader.state())
    }

    async fn get(&self, name: &str) -> Result<Option<Arc<Node>>> {
        Ok(self.reader.get(&ObjectRef::new(name)))
    }

    async fn apply_label(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut labels = serde_json::Map::new();
        labels.insert(
            key.to_string(),
            serde_json::Value::String(value.to_string()),
        );
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
