//! Cluster integration: the interface-provider contract, its kube-rs
//! implementation, and the cluster-backed source.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event as WatchEvent},
    Client,
};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use bosun_schema::{Gvk, Registry};

pub mod mock;
mod source;

pub use source::ClusterSource;

/// Raw upstream change as observed by a watch stream.
#[derive(Debug, Clone)]
pub enum RawEvent {
    Applied(serde_json::Value),
    Deleted(serde_json::Value),
    /// Watch re-established; carries the full current listing.
    Restarted(Vec<serde_json::Value>),
}

/// Live handle to the upstream cluster API. Production code wraps a
/// `kube::Client`; tests substitute [`mock::MockInterfaces`].
#[async_trait]
pub trait Interfaces: Send + Sync {
    /// Kinds the upstream API server actually serves.
    async fn served_kinds(&self) -> Result<Vec<Gvk>>;

    /// Current listing for one origin kind.
    async fn list(&self, origin: &Gvk) -> Result<Vec<serde_json::Value>>;

    /// Open a watch stream for one origin kind. Transient errors are
    /// retried inside the stream; it ends only when dropped.
    async fn watch(&self, origin: &Gvk) -> Result<BoxStream<'static, RawEvent>>;
}

/// Interface provider backed by a kubeconfig file (or the ambient
/// environment when the path is empty). The kubeconfig is validated at
/// construction; the client itself connects lazily on first use.
pub struct KubeInterfaces {
    kubeconfig_path: Option<PathBuf>,
    client: OnceCell<Client>,
}

impl KubeInterfaces {
    pub fn from_config_file(path: &str) -> Result<Self> {
        let kubeconfig_path = if path.is_empty() {
            None
        } else {
            // Surface unreadable or malformed files now, at the
            // construction seam, rather than from a watch loop later.
            kube::config::Kubeconfig::read_from(path)
                .with_context(|| format!("loading kubeconfig {path}"))?;
            Some(PathBuf::from(path))
        };
        Ok(Self { kubeconfig_path, client: OnceCell::new() })
    }

    async fn client(&self) -> Result<Client> {
        let client = self
            .client
            .get_or_try_init(|| async {
                let config = match &self.kubeconfig_path {
                    Some(path) => {
                        let kc = kube::config::Kubeconfig::read_from(path)?;
                        kube::Config::from_custom_kubeconfig(
                            kc,
                            &kube::config::KubeConfigOptions::default(),
                        )
                        .await?
                    }
                    None => kube::Config::infer().await?,
                };
                Ok::<_, anyhow::Error>(Client::try_from(config)?)
            })
            .await?;
        Ok(client.clone())
    }

    async fn dynamic_api(&self, origin: &Gvk) -> Result<Api<DynamicObject>> {
        let client = self.client().await?;
        let gvk = GroupVersionKind {
            group: origin.group.clone(),
            version: origin.version.clone(),
            kind: origin.kind.clone(),
        };
        let discovery = Discovery::new(client.clone()).run().await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let _namespaced = matches!(caps.scope, Scope::Namespaced);
                    return Ok(Api::all_with(client, &ar));
                }
            }
        }
        Err(anyhow!("kind not served upstream: {origin}"))
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_raw(obj: &DynamicObject) -> Result<serde_json::Value> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

#[async_trait]
impl Interfaces for KubeInterfaces {
    async fn served_kinds(&self) -> Result<Vec<Gvk>> {
        let client = self.client().await?;
        let discovery = Discovery::new(client).run().await?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, _caps) in group.recommended_resources() {
                out.push(Gvk {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                });
            }
        }
        Ok(out)
    }

    async fn list(&self, origin: &Gvk) -> Result<Vec<serde_json::Value>> {
        let api = self.dynamic_api(origin).await?;
        let items = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing {origin}"))?;
        items.items.iter().map(to_raw).collect()
    }

    async fn watch(&self, origin: &Gvk) -> Result<BoxStream<'static, RawEvent>> {
        let api = self.dynamic_api(origin).await?;
        let origin_label = origin.to_string();
        let stream = watcher::watcher(api, watcher::Config::default())
            .filter_map(move |item| {
                let origin_label = origin_label.clone();
                async move {
                    match item {
                        Ok(WatchEvent::Applied(o)) => match to_raw(&o) {
                            Ok(raw) => Some(RawEvent::Applied(raw)),
                            Err(e) => {
                                warn!(origin = %origin_label, error = %e, "skipping unserializable object");
                                None
                            }
                        },
                        Ok(WatchEvent::Deleted(o)) => match to_raw(&o) {
                            Ok(raw) => Some(RawEvent::Deleted(raw)),
                            Err(e) => {
                                warn!(origin = %origin_label, error = %e, "skipping unserializable object");
                                None
                            }
                        },
                        Ok(WatchEvent::Restarted(list)) => {
                            debug!(origin = %origin_label, count = list.len(), "watch restarted");
                            let raws = list.iter().filter_map(|o| to_raw(o).ok()).collect();
                            Some(RawEvent::Restarted(raws))
                        }
                        // The watcher retries with backoff internally;
                        // its errors are transient by definition.
                        Err(e) => {
                            warn!(origin = %origin_label, error = %e, "watch error; stream will recover");
                            None
                        }
                    }
                }
            })
            .boxed();
        Ok(stream)
    }
}

/// Check that every kind the registry watches is actually served
/// upstream. Run by default during server construction; patchable for
/// constrained environments.
pub async fn verify_resource_types_presence(
    interfaces: &dyn Interfaces,
    registry: &Registry,
) -> Result<()> {
    let served = interfaces.served_kinds().await.context("discovering served kinds")?;
    let missing: Vec<String> = registry
        .watched()
        .filter_map(|spec| spec.origin.as_ref())
        .filter(|origin| !served.contains(origin))
        .map(|origin| origin.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("required resource kinds not served upstream: {}", missing.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_schema::default_registry;

    #[test]
    fn kubeconfig_validation_fails_fast() {
        assert!(KubeInterfaces::from_config_file("/no/such/kubeconfig").is_err());
        // Empty path defers to the ambient environment.
        assert!(KubeInterfaces::from_config_file("").is_ok());
    }

    #[tokio::test]
    async fn verify_accepts_fully_served_upstream() {
        let mock = mock::MockInterfaces::serving_default_registry();
        verify_resource_types_presence(&mock, default_registry()).await.unwrap();
    }

    #[tokio::test]
    async fn verify_reports_missing_kinds() {
        let mock = mock::MockInterfaces::new(vec!["v1/Service".parse().unwrap()]);
        let err = verify_resource_types_presence(&mock, default_registry())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("networking.istio.io/v1alpha3/Gateway"));
    }

    #[test]
    fn strip_managed_fields_removes_only_that_key() {
        let mut v = serde_json::json!({
            "metadata": { "name": "x", "managedFields": [{}] },
            "spec": {},
        });
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
        assert_eq!(v["metadata"]["name"], "x");
    }
}
