//! Static catalog of the resource kinds bosun aggregates and serves.
//!
//! The registry is assembled once at process start and never mutated;
//! everything downstream holds shared references into it.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("duplicate kind in registry: {0}")]
    DuplicateKind(String),
    #[error("duplicate collection in registry: {0}")]
    DuplicateCollection(String),
    #[error("unknown conversion rule: {0}")]
    UnknownRule(String),
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    BadGvk(String),
}

/// Upstream group/version/kind a schema kind is watched under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl FromStr for Gvk {
    type Err = SchemaError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] => Ok(Gvk {
                group: String::new(),
                version: (*version).to_string(),
                kind: (*kind).to_string(),
            }),
            [group, version, kind] => Ok(Gvk {
                group: (*group).to_string(),
                version: (*version).to_string(),
                kind: (*kind).to_string(),
            }),
            _ => Err(SchemaError::BadGvk(key.to_string())),
        }
    }
}

/// Named conversion rule applied to raw upstream objects of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Conversion {
    /// Pass the upstream spec through as the canonical body.
    Identity,
    /// Synthesize the internal service model from a native `v1/Service`.
    KubeService,
    /// Recognize the kind but emit nothing (withheld from distribution).
    Noop,
}

impl FromStr for Conversion {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(Conversion::Identity),
            "k8s-service" => Ok(Conversion::KubeService),
            "noop" => Ok(Conversion::Noop),
            other => Err(SchemaError::UnknownRule(other.to_string())),
        }
    }
}

/// One known kind: canonical name, wire collection, optional upstream
/// origin, and the conversion rule that normalizes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindSpec {
    pub kind: String,
    pub plural: String,
    /// Collection URL this kind is served under.
    pub collection: String,
    /// Upstream GVK watched for this kind; `None` for kinds fed outside
    /// the event stream (mesh configuration).
    pub origin: Option<Gvk>,
    pub conversion: Conversion,
}

/// Immutable, enumerable set of known kinds.
#[derive(Debug)]
pub struct Registry {
    specs: Vec<KindSpec>,
    by_kind: FxHashMap<String, usize>,
    by_collection: FxHashMap<String, usize>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder { specs: Vec::new() }
    }

    pub fn kinds(&self) -> &[KindSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn get(&self, kind: &str) -> Option<&KindSpec> {
        self.by_kind.get(kind).map(|&i| &self.specs[i])
    }

    pub fn by_collection(&self, collection: &str) -> Option<&KindSpec> {
        self.by_collection.get(collection).map(|&i| &self.specs[i])
    }

    /// Kinds with an upstream origin, i.e. the ones sources watch.
    pub fn watched(&self) -> impl Iterator<Item = &KindSpec> {
        self.specs.iter().filter(|s| s.origin.is_some())
    }
}

pub struct RegistryBuilder {
    specs: Vec<KindSpec>,
}

impl RegistryBuilder {
    pub fn add(
        mut self,
        kind: &str,
        plural: &str,
        collection: &str,
        origin: Option<&str>,
        rule: &str,
    ) -> Result<Self, SchemaError> {
        let origin = origin.map(Gvk::from_str).transpose()?;
        self.specs.push(KindSpec {
            kind: kind.to_string(),
            plural: plural.to_string(),
            collection: collection.to_string(),
            origin,
            conversion: rule.parse()?,
        });
        Ok(self)
    }

    pub fn build(self) -> Result<Registry, SchemaError> {
        let mut by_kind = FxHashMap::default();
        let mut by_collection = FxHashMap::default();
        for (i, spec) in self.specs.iter().enumerate() {
            if by_kind.insert(spec.kind.clone(), i).is_some() {
                return Err(SchemaError::DuplicateKind(spec.kind.clone()));
            }
            if by_collection.insert(spec.collection.clone(), i).is_some() {
                return Err(SchemaError::DuplicateCollection(spec.collection.clone()));
            }
        }
        Ok(Registry { specs: self.specs, by_kind, by_collection })
    }
}

/// Collection the mesh configuration value is served under. Present in
/// the default registry with no upstream origin; fed by the mesh config
/// cache rather than the event stream.
pub const MESH_CONFIG_COLLECTION: &str = "core/v1alpha1/meshconfig";

/// Kind synthesized from native `v1/Service` objects when service-model
/// conversion is enabled.
pub const SERVICE_ENTRY_KIND: &str = "ServiceEntry";

static DEFAULT: Lazy<Registry> = Lazy::new(|| {
    Registry::builder()
        .add("MeshConfig", "meshconfigs", MESH_CONFIG_COLLECTION, None, "identity")
        .and_then(|b| {
            b.add(
                "VirtualService",
                "virtualservices",
                "istio/networking/v1alpha3/virtualservices",
                Some("networking.istio.io/v1alpha3/VirtualService"),
                "identity",
            )
        })
        .and_then(|b| {
            b.add(
                "DestinationRule",
                "destinationrules",
                "istio/networking/v1alpha3/destinationrules",
                Some("networking.istio.io/v1alpha3/DestinationRule"),
                "identity",
            )
        })
        .and_then(|b| {
            b.add(
                "Gateway",
                "gateways",
                "istio/networking/v1alpha3/gateways",
                Some("networking.istio.io/v1alpha3/Gateway"),
                "identity",
            )
        })
        .and_then(|b| {
            b.add(
                "EnvoyFilter",
                "envoyfilters",
                "istio/networking/v1alpha3/envoyfilters",
                Some("networking.istio.io/v1alpha3/EnvoyFilter"),
                "identity",
            )
        })
        .and_then(|b| {
            b.add(
                "Policy",
                "policies",
                "istio/authentication/v1alpha1/policies",
                Some("authentication.istio.io/v1alpha1/Policy"),
                "identity",
            )
        })
        .and_then(|b| {
            b.add(
                "HTTPAPISpec",
                "httpapispecs",
                "istio/config/v1alpha2/httpapispecs",
                Some("config.istio.io/v1alpha2/HTTPAPISpec"),
                "identity",
            )
        })
        .and_then(|b| {
            b.add(
                SERVICE_ENTRY_KIND,
                "serviceentries",
                "istio/networking/v1alpha3/serviceentries",
                Some("v1/Service"),
                "k8s-service",
            )
        })
        .and_then(|b| b.build())
        .expect("default registry is well-formed")
});

/// The process-wide kind catalog.
pub fn default_registry() -> &'static Registry {
    &DEFAULT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_parses_both_forms() {
        let g: Gvk = "v1/Service".parse().unwrap();
        assert_eq!(g.group, "");
        assert_eq!(g.to_string(), "v1/Service");

        let g: Gvk = "networking.istio.io/v1alpha3/Gateway".parse().unwrap();
        assert_eq!(g.group, "networking.istio.io");
        assert_eq!(g.kind, "Gateway");

        assert!("Gateway".parse::<Gvk>().is_err());
    }

    #[test]
    fn builder_rejects_duplicates_and_unknown_rules() {
        let dup = Registry::builder()
            .add("A", "as", "x/a", None, "identity")
            .and_then(|b| b.add("A", "as2", "x/b", None, "identity"))
            .and_then(|b| b.build());
        assert!(matches!(dup, Err(SchemaError::DuplicateKind(_))));

        let rule = Registry::builder().add("A", "as", "x/a", None, "frobnicate");
        assert!(matches!(rule, Err(SchemaError::UnknownRule(_))));
    }

    #[test]
    fn default_registry_shape() {
        let reg = default_registry();
        assert_eq!(reg.len(), 8);

        let se = reg.get(SERVICE_ENTRY_KIND).unwrap();
        assert_eq!(se.conversion, Conversion::KubeService);
        assert_eq!(se.origin.as_ref().unwrap().to_string(), "v1/Service");

        let mesh = reg.by_collection(MESH_CONFIG_COLLECTION).unwrap();
        assert!(mesh.origin.is_none());

        // Every watched kind resolves back through both indexes.
        for spec in reg.watched() {
            assert_eq!(reg.get(&spec.kind).unwrap().collection, spec.collection);
        }
    }
}
