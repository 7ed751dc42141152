//! Compose-level data model
//!
//! [`ComposeService`] models the keys the pipeline generates; anything a
//! user override introduces beyond those lands in the flattened `extra`
//! mapping so it survives re-serialization untouched.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

/// Ordered map of compose service name → service spec.
pub type ServiceMap = IndexMap<String, ComposeService>;

/// One compose service entry.
///
/// Mutable through the pipeline; frozen before output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeService {
    /// Container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Explicit container name (set when sidecars join this service's
    /// network namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Explicit hostname (set when the service name exceeds the kernel's
    /// 63-character limit)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Restart policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    /// Entrypoint (from the container's `command`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Value>,
    /// Command (from the container's `args`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,
    /// Environment, insertion-ordered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Mapping>,
    /// Host-published ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<Value>>,
    /// Volume mounts (bind or named)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<String>>,
    /// Network attachment with aliases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<Value>,
    /// `container:<peer>` for sidecars sharing a network namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    /// Startup ordering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Value>,
    /// Any further compose keys (user overrides, custom services)
    #[serde(flatten)]
    pub extra: Mapping,
    /// Owning main service for init/sidecar services; drives cascade
    /// exclusion. Never serialized.
    #[serde(skip)]
    pub parent: Option<String>,
}

impl ComposeService {
    /// Push a volume mount string.
    pub fn add_volume(&mut self, volume: String) {
        self.volumes.get_or_insert_with(Vec::new).push(volume);
    }

    /// True when this service shares another container's network namespace.
    pub fn is_sidecar(&self) -> bool {
        self.network_mode.is_some()
    }
}

/// The emitted compose file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ComposeFile {
    /// Project name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Service entries
    pub services: ServiceMap,
    /// Top-level named volumes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Mapping>,
    /// Network overrides (external network attachment)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networks: Option<Value>,
}

/// Recursively merge `overrides` into `base`. A null leaf deletes the key;
/// mappings merge; everything else replaces.
pub fn deep_merge(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (Value::Mapping(base_map), Value::Mapping(over_map)) => {
            for (key, val) in over_map {
                if val.is_null() {
                    base_map.remove(key);
                } else if let Some(existing) = base_map.get_mut(key) {
                    if existing.is_mapping() && val.is_mapping() {
                        deep_merge(existing, val);
                    } else {
                        *existing = val.clone();
                    }
                } else {
                    base_map.insert(key.clone(), val.clone());
                }
            }
        }
        (base, _) => *base = overrides.clone(),
    }
}
