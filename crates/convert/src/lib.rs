//! Raw upstream objects to canonical resources.
//!
//! Conversion is pure: `(kind spec, raw JSON, config) -> resources`.
//! A failure converting one object never affects its siblings; callers
//! report through [`report_failure`] and move on.

#![forbid(unsafe_code)]

use metrics::counter;
use serde_json::Value;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::warn;

use bosun_core::{FullName, Key, Resource, Version};
use bosun_schema::{Conversion, KindSpec};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("object has no metadata")]
    MissingMetadata,
    #[error("object missing required field: {0}")]
    MissingField(&'static str),
    #[error("field {field} has unexpected shape: {detail}")]
    BadField { field: &'static str, detail: String },
}

/// Conversion options, fixed for the life of a source.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// When true, native `v1/Service` objects synthesize the internal
    /// service model; when false that kind is absent from the stream.
    pub convert_k8s_service: bool,
}

impl Config {
    /// Whether a kind's channel is active under these settings.
    pub fn serves(&self, spec: &KindSpec) -> bool {
        match spec.conversion {
            Conversion::Noop => false,
            Conversion::KubeService => self.convert_k8s_service,
            Conversion::Identity => true,
        }
    }
}

/// Convert one raw upstream object into zero or more canonical
/// resources for `spec`'s kind.
pub fn convert(
    spec: &KindSpec,
    raw: &Value,
    cfg: &Config,
) -> Result<SmallVec<[Resource; 2]>, ConvertError> {
    let mut out = SmallVec::new();
    match spec.conversion {
        Conversion::Noop => {}
        Conversion::KubeService => {
            if cfg.convert_k8s_service {
                out.push(service_entry(spec, raw)?);
            }
        }
        Conversion::Identity => out.push(identity(spec, raw)?),
    }
    Ok(out)
}

/// Extract the canonical identity a raw object would convert to, without
/// converting the payload. Used for delete events, where the body is
/// gone or irrelevant.
pub fn key_of(spec: &KindSpec, raw: &Value) -> Result<Key, ConvertError> {
    let meta = Meta::of(raw)?;
    Ok(Key::new(&spec.kind, meta.full_name()))
}

/// Log and count one isolated conversion failure.
pub fn report_failure(kind: &str, name: Option<&str>, err: &ConvertError) {
    warn!(kind = %kind, name = ?name, error = %err, "dropping unconvertible resource");
    counter!("bosun_convert_failures_total", 1u64);
}

struct Meta<'a> {
    name: &'a str,
    namespace: Option<&'a str>,
    resource_version: &'a str,
    creation_ts: i64,
    meta: &'a serde_json::Map<String, Value>,
}

impl<'a> Meta<'a> {
    fn of(raw: &'a Value) -> Result<Self, ConvertError> {
        let meta = raw
            .get("metadata")
            .and_then(|m| m.as_object())
            .ok_or(ConvertError::MissingMetadata)?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|n| !n.is_empty())
            .ok_or(ConvertError::MissingField("metadata.name"))?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str());
        let resource_version = meta
            .get("resourceVersion")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let creation_ts = meta
            .get("creationTimestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        Ok(Self { name, namespace, resource_version, creation_ts, meta })
    }

    fn full_name(&self) -> FullName {
        FullName::new(self.namespace, self.name)
    }

    fn pairs(&self, field: &str) -> SmallVec<[(String, String); 8]> {
        let mut out = SmallVec::new();
        if let Some(map) = self.meta.get(field).and_then(|v| v.as_object()) {
            for (k, v) in map {
                if let Some(s) = v.as_str() {
                    out.push((k.clone(), s.to_string()));
                }
            }
        }
        out
    }

    fn resource(&self, kind: &str, body: Value) -> Resource {
        let mut res = Resource::new(
            Key::new(kind, self.full_name()),
            Version::from(self.resource_version),
            body,
        );
        res.created_at = self.creation_ts;
        res.labels = self.pairs("labels");
        res.annotations = self.pairs("annotations").into_iter().collect();
        res
    }
}

fn identity(spec: &KindSpec, raw: &Value) -> Result<Resource, ConvertError> {
    let meta = Meta::of(raw)?;
    let body = raw
        .get("spec")
        .cloned()
        .ok_or(ConvertError::MissingField("spec"))?;
    Ok(meta.resource(&spec.kind, body))
}

/// Synthesize the internal service model from a native `v1/Service`.
///
/// Hostname follows cluster DNS convention; ports and the cluster IP
/// carry over so subscribers can route without consulting the upstream
/// store themselves.
fn service_entry(spec: &KindSpec, raw: &Value) -> Result<Resource, ConvertError> {
    let meta = Meta::of(raw)?;
    let svc_spec = raw
        .get("spec")
        .and_then(|s| s.as_object())
        .ok_or(ConvertError::MissingField("spec"))?;

    let namespace = meta.namespace.unwrap_or("default");
    let host = format!("{}.{}.svc.cluster.local", meta.name, namespace);

    let mut ports = Vec::new();
    if let Some(list) = svc_spec.get("ports") {
        let list = list.as_array().ok_or(ConvertError::BadField {
            field: "spec.ports",
            detail: "not an array".to_string(),
        })?;
        for p in list {
            let number = p.get("port").and_then(|v| v.as_u64()).ok_or(ConvertError::BadField {
                field: "spec.ports",
                detail: "entry missing numeric port".to_string(),
            })?;
            let name = p
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("http")
                .to_string();
            let protocol = p
                .get("protocol")
                .and_then(|v| v.as_str())
                .unwrap_or("TCP")
                .to_ascii_lowercase();
            ports.push(serde_json::json!({
                "number": number,
                "name": name,
                "protocol": protocol,
            }));
        }
    }

    let cluster_ip = svc_spec.get("clusterIP").and_then(|v| v.as_str()).unwrap_or("");
    let (resolution, addresses) = if cluster_ip.is_empty() || cluster_ip == "None" {
        ("DNS", Vec::new())
    } else {
        ("STATIC", vec![Value::String(cluster_ip.to_string())])
    };

    let body = serde_json::json!({
        "hosts": [host],
        "addresses": addresses,
        "ports": ports,
        "location": "MESH_INTERNAL",
        "resolution": resolution,
    });
    Ok(meta.resource(&spec.kind, body))
}
