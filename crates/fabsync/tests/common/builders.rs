//! Builders for test documents and cluster objects.

#![allow(dead_code)]

use fabsync::gitops::{ClusterObject, ResourceIdentity, ResourceKind, SpecDocument};

/// A YAML document as it would be dropped into the raw directory.
#[derive(Debug, Clone)]
pub struct DocBuilder {
    kind: String,
    name: Option<String>,
    namespace: Option<String>,
    spec: Vec<(String, String)>,
}

impl DocBuilder {
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: Some(name.to_string()),
            namespace: None,
            spec: Vec::new(),
        }
    }

    /// A document with no `metadata.name`.
    pub fn unnamed(kind: &str) -> Self {
        Self {
            name: None,
            ..Self::new(kind, "")
        }
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Adds a spec entry; `value` is written as a YAML scalar.
    pub fn spec(mut self, key: &str, value: impl ToString) -> Self {
        self.spec.push((key.to_string(), value.to_string()));
        self
    }

    pub fn to_yaml(&self) -> String {
        let mut out = format!("kind: {}\nmetadata:\n", self.kind);
        match &self.name {
            Some(name) => out.push_str(&format!("  name: {}\n", name)),
            None => out.push_str("  labels: {}\n"),
        }
        if let Some(namespace) = &self.namespace {
            out.push_str(&format!("  namespace: {}\n", namespace));
        }
        if !self.spec.is_empty() {
            out.push_str("spec:\n");
            for (key, value) in &self.spec {
                out.push_str(&format!("  {}: {}\n", key, value));
            }
        }
        out
    }
}

/// Joins documents into one multi-document YAML stream.
pub fn multi_doc(docs: &[DocBuilder]) -> String {
    docs.iter()
        .map(DocBuilder::to_yaml)
        .collect::<Vec<_>>()
        .join("---\n")
}

pub fn vpc(name: &str, vlan: i64) -> DocBuilder {
    DocBuilder::new("VPC", name)
        .spec("vlan", vlan)
        .spec("subnet", "10.0.0.0/24")
}

pub fn identity(kind: ResourceKind, name: &str) -> ResourceIdentity {
    ResourceIdentity::new(kind, "default", name)
}

/// The spec `vpc(name, vlan)` declares.
pub fn vpc_spec(vlan: i64) -> SpecDocument {
    SpecDocument::new()
        .with("vlan", vlan)
        .with("subnet", "10.0.0.0/24")
}

/// A spec with `width` keys; changing one of them scores below 0.1.
pub fn wide_spec(width: usize, vlan: i64) -> SpecDocument {
    (1..width).fold(SpecDocument::new().with("vlan", vlan), |spec, i| {
        spec.with(&format!("opt{}", i), i as i64)
    })
}

pub fn cluster_object(kind: ResourceKind, name: &str, spec: SpecDocument) -> ClusterObject {
    ClusterObject::new(&identity(kind, name), spec)
}
