//! Manifest model and the flat manifest index
//!
//! A [`Manifest`] is one Kubernetes-shaped document classified by `kind`.
//! The [`ManifestIndex`] is a flat `(kind, name)` lookup plus per-kind lists;
//! when two manifests of the same kind share a name across namespaces, the
//! later one wins (documented gap).

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_yaml::{Mapping, Value};

use crate::extension::Warnings;
use crate::yaml;

/// Kinds that produce compose services.
pub const WORKLOAD_KINDS: &[&str] = &["DaemonSet", "Deployment", "Job", "StatefulSet"];

/// Kinds we warn about once per kind (no compose equivalent).
pub const UNSUPPORTED_KINDS: &[&str] = &[
    "CronJob",
    "HorizontalPodAutoscaler",
    "PodDisruptionBudget",
];

/// Kinds silently dropped (no compose equivalent, no useful warning).
pub const IGNORED_KINDS: &[&str] = &[
    "Certificate",
    "ClusterIssuer",
    "Issuer",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
    "Namespace",
    "NetworkPolicy",
    "ServiceAccount",
];

/// Kinds consumed by the built-in pipeline phases.
pub const BUILTIN_KINDS: &[&str] = &[
    "DaemonSet",
    "Deployment",
    "Job",
    "StatefulSet",
    "Service",
    "ConfigMap",
    "Secret",
    "Ingress",
    "PersistentVolumeClaim",
];

/// A single parsed Kubernetes-shaped document.
///
/// Immutable after indexing. The full document body is retained as an
/// order-preserving mapping so converters can read fields the typed header
/// does not model.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    /// The `kind` field
    pub kind: String,
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`, empty when unset
    pub namespace: String,
    /// `metadata.labels`
    pub labels: BTreeMap<String, String>,
    /// `metadata.annotations`
    pub annotations: BTreeMap<String, String>,
    body: Value,
}

impl Manifest {
    /// Classify a parsed document. Returns `None` when `kind` or
    /// `metadata.name` is missing; the caller is expected to warn.
    pub fn from_value(doc: Value) -> Option<Self> {
        let kind = yaml::str_field(&doc, "kind").to_string();
        let metadata = yaml::field(&doc, "metadata");
        let name = yaml::str_field(metadata, "name").to_string();
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            kind,
            name,
            namespace: yaml::str_field(metadata, "namespace").to_string(),
            labels: yaml::string_map(yaml::field(metadata, "labels")),
            annotations: yaml::string_map(yaml::field(metadata, "annotations")),
            body: doc,
        })
    }

    /// Build a minimal synthetic manifest with the given spec body.
    ///
    /// Used by converters that inject virtual objects back into the index.
    pub fn synthetic(kind: &str, name: &str, namespace: &str, spec: Value) -> Self {
        let mut metadata = Mapping::new();
        metadata.insert("name".into(), Value::String(name.to_string()));
        if !namespace.is_empty() {
            metadata.insert("namespace".into(), Value::String(namespace.to_string()));
        }
        let mut body = Mapping::new();
        body.insert("kind".into(), Value::String(kind.to_string()));
        body.insert("metadata".into(), Value::Mapping(metadata));
        body.insert("spec".into(), spec);
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            body: Value::Mapping(body),
        }
    }

    /// The full document.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Null-safe nested field read.
    pub fn get(&self, path: &[&str]) -> &Value {
        yaml::field_path(&self.body, path)
    }

    /// Null-safe nested string read.
    pub fn str_at(&self, path: &[&str]) -> &str {
        self.get(path).as_str().unwrap_or("")
    }

    /// Null-safe nested sequence read.
    pub fn seq_at(&self, path: &[&str]) -> &[Value] {
        self.get(path).as_sequence().map(Vec::as_slice).unwrap_or(&[])
    }

    /// The `spec` mapping.
    pub fn spec(&self) -> &Value {
        self.get(&["spec"])
    }

    /// The pod spec of a workload manifest (`spec.template.spec`).
    pub fn pod_spec(&self) -> &Value {
        self.get(&["spec", "template", "spec"])
    }

    /// `data` as a string map (ConfigMaps).
    pub fn data_map(&self) -> BTreeMap<String, String> {
        yaml::string_map(self.get(&["data"]))
    }

    /// Decoded value for a Secret key.
    ///
    /// `stringData` entries are plain text; `data` entries are
    /// base64-decoded, falling back to the raw string when decoding fails.
    pub fn secret_value(&self, key: &str) -> Option<String> {
        if let Some(v) = self.get(&["stringData", key]).as_str() {
            return Some(v.to_string());
        }
        let raw = self.get(&["data", key]).as_str()?;
        match BASE64.decode(raw) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(s) => Some(s),
                Err(_) => Some(raw.to_string()),
            },
            Err(_) => Some(raw.to_string()),
        }
    }

    /// All keys present in a Secret's `data` and `stringData` sections.
    pub fn secret_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = yaml::map_field(&self.body, "data")
            .filter_map(|(k, _)| k.as_str().map(String::from))
            .collect();
        keys.extend(
            yaml::map_field(&self.body, "stringData").filter_map(|(k, _)| k.as_str().map(String::from)),
        );
        keys
    }
}

/// Flat index of manifests: per-kind lists plus `(kind, name)` lookup.
#[derive(Debug, Default, Clone)]
pub struct ManifestIndex {
    kinds: BTreeMap<String, Vec<Manifest>>,
}

impl ManifestIndex {
    /// Build the index from parsed documents.
    ///
    /// Classification: documents without `kind`/`metadata.name` drop with a
    /// warning; ignored kinds drop silently; unsupported kinds drop with one
    /// warning per kind; unknown kinds drop with one warning per kind unless
    /// an extension claims them.
    pub fn build(docs: Vec<Value>, claimed_kinds: &BTreeSet<String>, warnings: &mut Warnings) -> Self {
        let mut index = Self::default();
        let mut unknown: BTreeMap<String, usize> = BTreeMap::new();
        let mut unsupported: BTreeSet<String> = BTreeSet::new();

        for doc in docs {
            let Some(manifest) = Manifest::from_value(doc) else {
                warnings.push("document missing kind or metadata.name — skipped");
                continue;
            };
            let kind = manifest.kind.as_str();
            if IGNORED_KINDS.contains(&kind) {
                continue;
            }
            if UNSUPPORTED_KINDS.contains(&kind) {
                unsupported.insert(kind.to_string());
                continue;
            }
            if !BUILTIN_KINDS.contains(&kind) && !claimed_kinds.contains(kind) {
                *unknown.entry(kind.to_string()).or_insert(0) += 1;
                continue;
            }
            index.insert(manifest);
        }

        for kind in unsupported {
            warnings.push(format!("{kind} is not supported and was skipped"));
        }
        for (kind, count) in unknown {
            warnings.push(format!("unknown kind '{kind}' ({count} manifest(s)) — skipped"));
        }
        index
    }

    /// Insert a manifest (input or synthetic).
    pub fn insert(&mut self, manifest: Manifest) {
        self.kinds.entry(manifest.kind.clone()).or_default().push(manifest);
    }

    /// All manifests of a kind, in input order.
    pub fn of_kind(&self, kind: &str) -> &[Manifest] {
        self.kinds.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Flat `(kind, name)` lookup; the later manifest wins on duplicates.
    pub fn get(&self, kind: &str, name: &str) -> Option<&Manifest> {
        self.of_kind(kind).iter().rev().find(|m| m.name == name)
    }

    /// All workload manifests, grouped by kind in `WORKLOAD_KINDS` order.
    pub fn workloads(&self) -> impl Iterator<Item = &Manifest> {
        WORKLOAD_KINDS.iter().flat_map(|kind| self.of_kind(kind).iter())
    }

    /// ConfigMap lookup by name.
    pub fn config_map(&self, name: &str) -> Option<&Manifest> {
        self.get("ConfigMap", name)
    }

    /// Secret lookup by name.
    pub fn secret(&self, name: &str) -> Option<&Manifest> {
        self.get("Secret", name)
    }

    /// Service lookup by name.
    pub fn service(&self, name: &str) -> Option<&Manifest> {
        self.get("Service", name)
    }

    /// Kind → manifest count, for the post-ingest summary.
    pub fn kind_counts(&self) -> BTreeMap<String, usize> {
        self.kinds.iter().map(|(k, v)| (k.clone(), v.len())).collect()
    }
}
