//! Durable small-object store
//!
//! The deletion snapshot and the leader lease persist as keys of one
//! ConfigMap. The snapshot is always written as a complete blob; the local
//! mutex serializes read-modify-write cycles within this process, and the
//! leader lease protects against concurrent controller instances.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tokio::sync::Mutex;
use tracing::info;

use culler_common::Result;

/// Adapter contract to a durable small-object store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// The value stored at the key, or `None` if absent
    async fn load(&self, key: &str) -> Result<Option<String>>;

    /// Store a value at the key; `None` deletes the key
    async fn store(&self, key: &str, value: Option<String>) -> Result<()>;
}

/// ConfigMap-backed store
pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    name: String,
    mu: Mutex<()>,
}

impl ConfigMapStore {
    /// Create the store, ensuring the backing ConfigMap exists
    pub async fn new(client: Client, namespace: &str, name: &str) -> Result<Self> {
        let store = Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            mu: Mutex::new(()),
        };
        store.get_or_create().await?;
        Ok(store)
    }

    async fn get_or_create(&self) -> Result<ConfigMap> {
        match self.api.get(&self.name).await {
            Ok(cm) => Ok(cm),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                info!(configmap = %self.name, "State ConfigMap missing, creating");
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                Ok(self.api.create(&PostParams::default(), &cm).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KeyValueStore for ConfigMapStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.mu.lock().await;
        let cm = self.get_or_create().await?;
        Ok(cm.data.and_then(|mut data| data.remove(key)))
    }

    async fn store(&self, key: &str, value: Option<String>) -> Result<()> {
        let _guard = self.mu.lock().await;
        let mut cm = self.get_or_create().await?;
        let data = cm.data.get_or_insert_with(Default::default);
        match value {
            Some(v) => {
                data.insert(key.to_string(), v);
            }
            None => {
                data.remove(key);
            }
        }
        self.api
            .replace(&self.name, &PostParams::default(), &cm)
            .await?;
        Ok(())
    }
}
