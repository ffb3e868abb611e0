//! Bosun core types shared by every crate: canonical resources and
//! the events sources emit about them.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Namespace-qualified resource name. Cluster-scoped resources carry no
/// namespace and render as a bare name; namespaced ones render as
/// `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FullName {
    pub namespace: Option<String>,
    pub name: String,
}

impl FullName {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(|ns| ns.to_string()),
            name: name.to_string(),
        }
    }

    pub fn cluster_scoped(name: &str) -> Self {
        Self { namespace: None, name: name.to_string() }
    }
}

impl fmt::Display for FullName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for FullName {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.split_once('/') {
            Some((ns, name)) => FullName::new(Some(ns), name),
            None => FullName::cluster_scoped(s),
        })
    }
}

/// Identity of a canonical resource: the schema kind plus the qualified
/// name. Unique within a kind at any instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub kind: String,
    pub name: FullName,
}

impl Key {
    pub fn new(kind: &str, name: FullName) -> Self {
        Self { kind: kind.to_string(), name }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Opaque per-identity version token. Backends guarantee tokens are
/// monotonically non-decreasing for one identity; nothing else is
/// assumed about their shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version(pub String);

impl Version {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Version(s.to_string())
    }
}

/// A canonical, schema-normalized configuration object, independent of
/// its upstream origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub key: Key,
    pub version: Version,
    /// Creation time as unix seconds; 0 when the backend supplied none.
    pub created_at: i64,
    pub labels: SmallVec<[(String, String); 8]>,
    pub annotations: SmallVec<[(String, String); 4]>,
    /// Canonical payload in schema form.
    pub body: serde_json::Value,
}

impl Resource {
    pub fn new(key: Key, version: Version, body: serde_json::Value) -> Self {
        Self {
            key,
            version,
            created_at: 0,
            labels: SmallVec::new(),
            annotations: SmallVec::new(),
            body,
        }
    }
}

/// Which backend produced an event. Used by the processor's precedence
/// policy when two sources disagree about one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceOrigin {
    Cluster,
    File,
    InMemory,
}

impl fmt::Display for SourceOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceOrigin::Cluster => "cluster",
            SourceOrigin::File => "file",
            SourceOrigin::InMemory => "inmemory",
        })
    }
}

/// The change carried by an [`Event`].
///
/// `FullSync` marks the end of a source's initial listing for a kind; it
/// carries no resource and lets downstream publish one consistent first
/// snapshot instead of one per seed object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Change {
    Added(Resource),
    Updated(Resource),
    Deleted(Key),
    FullSync { kind: String },
}

impl Change {
    /// Kind this change applies to.
    pub fn kind(&self) -> &str {
        match self {
            Change::Added(r) | Change::Updated(r) => &r.key.kind,
            Change::Deleted(k) => &k.kind,
            Change::FullSync { kind } => kind,
        }
    }
}

/// One ordered observation from a source. `seq` increases monotonically
/// per kind within the emitting source; there is no cross-kind ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub origin: SourceOrigin,
    pub change: Change,
}

impl Event {
    pub fn new(seq: u64, origin: SourceOrigin, change: Change) -> Self {
        Self { seq, origin, change }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fullname_display_and_parse() {
        let n: FullName = "istio-system/gw".parse().unwrap();
        assert_eq!(n.namespace.as_deref(), Some("istio-system"));
        assert_eq!(n.name, "gw");
        assert_eq!(n.to_string(), "istio-system/gw");

        let c: FullName = "node-role".parse().unwrap();
        assert!(c.namespace.is_none());
        assert_eq!(c.to_string(), "node-role");
    }

    #[test]
    fn fullname_empty_namespace_is_cluster_scoped() {
        let n = FullName::new(Some(""), "x");
        assert!(n.namespace.is_none());
    }

    #[test]
    fn change_kind_covers_all_variants() {
        let key = Key::new("Gateway", FullName::cluster_scoped("gw"));
        let res = Resource::new(key.clone(), Version::from("1"), serde_json::json!({}));
        assert_eq!(Change::Added(res.clone()).kind(), "Gateway");
        assert_eq!(Change::Updated(res).kind(), "Gateway");
        assert_eq!(Change::Deleted(key).kind(), "Gateway");
        assert_eq!(Change::FullSync { kind: "Gateway".into() }.kind(), "Gateway");
    }
}
