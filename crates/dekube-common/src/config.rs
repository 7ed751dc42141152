//! Project configuration
//!
//! The config file lives next to the generated compose file, is created on
//! the first run, and is meant to be edited by hand afterwards. Unknown keys
//! round-trip untouched. Legacy key names are migrated in memory at load
//! time and disappear from disk on the next save.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::Error;

/// File name of the persisted project config.
pub const CONFIG_FILE_NAME: &str = "dekube.yaml";

/// Config schema version stamped on save.
pub const CONFIG_VERSION: u32 = 3;

/// Default directory prefix for bare host-path volume names.
pub const DEFAULT_VOLUME_ROOT: &str = "./data";

fn default_volume_root() -> String {
    DEFAULT_VOLUME_ROOT.to_string()
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A user-defined literal string replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replacement {
    /// Text to search for (literal match)
    pub old: String,
    /// Replacement text
    pub new: String,
}

/// Per-volume configuration: a named volume driver or a host bind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume driver for a named volume (`local` when omitted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Host path to bind instead of a named volume. Bare names resolve
    /// under `volume_root`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
}

/// The persisted, user-editable project configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Schema version, stamped on save
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// Compose project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Directory prefix for bare host-path volume names
    #[serde(default = "default_volume_root")]
    pub volume_root: String,
    /// Attach services to an existing external network instead of the
    /// default project network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Write ingress routes to `Caddyfile-<name>` and emit no ingress
    /// service (manual-only switch)
    #[serde(default, skip_serializing_if = "is_false")]
    pub disable_ingress: bool,
    /// Ingress class → canonical rewriter name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ingress_types: BTreeMap<String, String>,
    /// PVC name → volume configuration
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeConfig>,
    /// Service name patterns to drop from the output
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Literal string replacements applied during post-processing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replacements: Vec<Replacement>,
    /// Deep-merged per-service overrides (a null leaf deletes the key)
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub overrides: Mapping,
    /// Custom services appended to the generated set
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub services: Mapping,
    /// Per-extension configuration sections
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub extensions: Mapping,
    /// Anything else the user added; preserved verbatim
    #[serde(flatten)]
    pub extra: Mapping,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            version: None,
            name: None,
            volume_root: default_volume_root(),
            network: None,
            disable_ingress: false,
            ingress_types: BTreeMap::new(),
            volumes: BTreeMap::new(),
            exclude: Vec::new(),
            replacements: Vec::new(),
            overrides: Mapping::new(),
            services: Mapping::new(),
            extensions: Mapping::new(),
            extra: Mapping::new(),
        }
    }
}

impl ProjectConfig {
    /// Caddy ACME account email, when configured under `extensions.caddy`.
    pub fn caddy_email(&self) -> Option<&str> {
        self.extensions
            .get("caddy")
            .and_then(|c| c.get("email"))
            .and_then(Value::as_str)
    }

    /// Whether Caddy should issue certificates from its internal CA.
    pub fn caddy_tls_internal(&self) -> bool {
        self.extensions
            .get("caddy")
            .and_then(|c| c.get("tls_internal"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Extension-specific config section by extension name.
    pub fn extension_config(&self, name: &str) -> Option<&Value> {
        self.extensions.get(name)
    }
}

/// Load the project config, or return the default when the file is absent.
///
/// Returns the config and whether legacy keys were migrated.
pub fn load_config(path: &Path) -> Result<(ProjectConfig, bool), Error> {
    if !path.exists() {
        return Ok((ProjectConfig::default(), false));
    }
    let text = fs::read_to_string(path)
        .map_err(|e| Error::config(path.display().to_string(), e.to_string()))?;
    let mut doc: Value = serde_yaml::from_str(&text)
        .map_err(|e| Error::config(path.display().to_string(), e.to_string()))?;
    if doc.is_null() {
        doc = Value::Mapping(Mapping::new());
    }
    let migrated = match doc.as_mapping_mut() {
        Some(mapping) => migrate(mapping),
        None => {
            return Err(Error::config(
                path.display().to_string(),
                "config root must be a mapping",
            ))
        }
    };
    let config: ProjectConfig = serde_yaml::from_value(doc)
        .map_err(|e| Error::config(path.display().to_string(), e.to_string()))?;
    Ok((config, migrated))
}

/// Write the project config with a version stamp and a comment header.
pub fn save_config(path: &Path, config: &ProjectConfig) -> Result<(), Error> {
    let mut stamped = config.clone();
    stamped.version = Some(CONFIG_VERSION);
    let body = serde_yaml::to_string(&stamped).map_err(|e| Error::serialization(e.to_string()))?;
    let text = format!("# dekube project configuration — edit and re-run\n\n{body}");
    fs::write(path, text)?;
    Ok(())
}

/// Rename legacy keys in place. Returns true when anything changed.
fn migrate(config: &mut Mapping) -> bool {
    let mut migrated = false;

    for (old, new) in [
        ("disableCaddy", "disable_ingress"),
        ("ingressTypes", "ingress_types"),
    ] {
        if let Some(value) = config.remove(old) {
            config.insert(Value::String(new.to_string()), value);
            migrated = true;
        }
    }

    // caddy_email / caddy_tls_internal moved under extensions.caddy
    let mut moved = Vec::new();
    for (old, new) in [("caddy_email", "email"), ("caddy_tls_internal", "tls_internal")] {
        if let Some(value) = config.remove(old) {
            moved.push((Value::String(new.to_string()), value));
        }
    }
    if !moved.is_empty() {
        migrated = true;
        if let Some(caddy) = mapping_entry(config, "extensions").and_then(|e| mapping_entry(e, "caddy"))
        {
            caddy.extend(moved);
        }
    }

    migrated
}

/// The nested mapping under `key`, created (or coerced) on demand.
fn mapping_entry<'a>(map: &'a mut Mapping, key: &str) -> Option<&'a mut Mapping> {
    let entry = map
        .entry(Value::String(key.to_string()))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !entry.is_mapping() {
        *entry = Value::Mapping(Mapping::new());
    }
    entry.as_mapping_mut()
}
