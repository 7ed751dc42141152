//! Manifest ingestion
//!
//! Reads rendered manifests from a directory (or invokes the upstream
//! renderer first), parses multi-document YAML, and fills in missing
//! `metadata.namespace` values. Rendered output is grouped per release
//! directory, and manifests inside one release routinely omit the
//! namespace that their siblings carry.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use serde_yaml::Value;
use tracing::{info, warn};

use dekube_common::extension::Warnings;
use dekube_common::yaml;

use crate::error::{Error, Result};

/// One parsed document plus the release directory it was rendered into.
#[derive(Debug, Clone)]
pub struct IngestedDoc {
    /// The parsed manifest document
    pub value: Value,
    /// First path component relative to the rendered directory
    pub release_dir: String,
}

/// Run `helmfile template` into `<output_dir>/.helmfile-rendered` and
/// return the rendered directory plus the release → namespace map from
/// `helmfile list`.
pub fn run_helmfile_template(
    helmfile_dir: &Path,
    output_dir: &Path,
    environment: Option<&str>,
) -> Result<(PathBuf, BTreeMap<String, String>)> {
    let rendered_dir = output_dir.join(".helmfile-rendered");
    if rendered_dir.exists() {
        fs::remove_dir_all(&rendered_dir)?;
    }
    fs::create_dir_all(&rendered_dir)?;

    // helmfile auto-detects the .gotmpl variant
    let mut helmfile_path = helmfile_dir.join("helmfile.yaml");
    if !helmfile_path.exists() {
        let gotmpl = helmfile_dir.join("helmfile.yaml.gotmpl");
        if gotmpl.exists() {
            helmfile_path = gotmpl;
        }
    }

    let mut cmd = Command::new("helmfile");
    cmd.arg("--file").arg(&helmfile_path);
    if let Some(env) = environment {
        cmd.args(["--environment", env]);
    }
    cmd.arg("template").arg("--output-dir").arg(&rendered_dir);
    info!("running: {cmd:?}");
    let status = cmd
        .status()
        .map_err(|e| Error::command_failed(format!("helmfile not runnable: {e}")))?;
    if !status.success() {
        return Err(Error::command_failed(format!("helmfile template exited with {status}")));
    }

    let release_ns = helmfile_list_namespaces(&helmfile_path, environment);
    Ok((rendered_dir, release_ns))
}

#[derive(Deserialize)]
struct HelmfileRelease {
    name: String,
    #[serde(default)]
    namespace: String,
}

/// `helmfile list` release → namespace mapping; failures degrade to an
/// empty map with a warning, namespace inference then relies on manifest
/// metadata alone.
fn helmfile_list_namespaces(helmfile_path: &Path, environment: Option<&str>) -> BTreeMap<String, String> {
    let mut cmd = Command::new("helmfile");
    cmd.arg("--file").arg(helmfile_path);
    if let Some(env) = environment {
        cmd.args(["--environment", env]);
    }
    cmd.args(["list", "--output", "json"]);

    let parsed = cmd
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| serde_json::from_slice::<Vec<HelmfileRelease>>(&out.stdout).ok());
    match parsed {
        Some(releases) => releases
            .into_iter()
            .filter(|r| !r.namespace.is_empty())
            .map(|r| (r.name, r.namespace))
            .collect(),
        None => {
            warn!("helmfile list failed, namespace inference will rely on manifest metadata only");
            BTreeMap::new()
        }
    }
}

/// Load all YAML documents under `dir`, attaching each one's release
/// directory. An unreadable directory is fatal; a malformed file warns and
/// is skipped; non-mapping documents are dropped silently.
pub fn read_manifest_dir(dir: &Path, warnings: &mut Warnings) -> Result<Vec<IngestedDoc>> {
    let mut files = Vec::new();
    collect_yaml_files(dir, dir, &mut files)?;
    files.sort();

    let mut docs = Vec::new();
    for file in files {
        let text = fs::read_to_string(&file)
            .map_err(|e| dekube_common::Error::input(file.display().to_string(), e.to_string()))?;
        let parsed = match yaml::parse_yaml_multi(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warnings.push(format!("skipping {}: {e}", file.display()));
                continue;
            }
        };
        let release_dir = file
            .strip_prefix(dir)
            .ok()
            .and_then(|rel| rel.components().next())
            .and_then(|c| c.as_os_str().to_str())
            .map(String::from)
            .unwrap_or_default();
        for value in parsed {
            if value.is_mapping() {
                docs.push(IngestedDoc { value, release_dir: release_dir.clone() });
            }
        }
    }
    Ok(docs)
}

fn collect_yaml_files(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .map_err(|e| dekube_common::Error::input(dir.display().to_string(), e.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|e| dekube_common::Error::input(dir.display().to_string(), e.to_string()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_yaml_files(root, &path, files)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            files.push(path);
        }
    }
    Ok(())
}

/// Fill missing `metadata.namespace` fields.
///
/// Strategy, each step covering the gaps the previous one left:
/// 1. sibling inference: another manifest in the same release dir carries
///    a namespace
/// 2. release-name matching: the release name is itself a known namespace
/// 3. the `helmfile list` release → namespace map
pub fn infer_namespaces(docs: &mut [IngestedDoc], release_ns: &BTreeMap<String, String>) {
    let mut dir_ns: BTreeMap<String, String> = BTreeMap::new();
    let mut all_dirs: BTreeSet<String> = BTreeSet::new();
    let mut known_ns: BTreeSet<String> = BTreeSet::new();

    for doc in docs.iter() {
        if !doc.release_dir.is_empty() {
            all_dirs.insert(doc.release_dir.clone());
        }
        let ns = yaml::str_field(yaml::field(&doc.value, "metadata"), "namespace");
        if !ns.is_empty() {
            known_ns.insert(ns.to_string());
            dir_ns.entry(doc.release_dir.clone()).or_insert_with(|| ns.to_string());
        }
        if yaml::str_field(&doc.value, "kind") == "Namespace" {
            let name = yaml::str_field(yaml::field(&doc.value, "metadata"), "name");
            if !name.is_empty() {
                known_ns.insert(name.to_string());
            }
        }
    }

    for dir in &all_dirs {
        if dir_ns.contains_key(dir) {
            continue;
        }
        let release = extract_release_name(dir);
        if known_ns.contains(&release) {
            dir_ns.insert(dir.clone(), release);
        } else if let Some(ns) = release_ns.get(&release) {
            dir_ns.insert(dir.clone(), ns.clone());
        }
    }

    for doc in docs.iter_mut() {
        let Some(ns) = dir_ns.get(&doc.release_dir) else {
            continue;
        };
        let Some(mapping) = doc.value.as_mapping_mut() else {
            continue;
        };
        let metadata = mapping
            .entry(Value::String("metadata".to_string()))
            .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
        if let Some(metadata) = metadata.as_mapping_mut() {
            let current = metadata.get("namespace").and_then(Value::as_str).unwrap_or("");
            if current.is_empty() {
                metadata.insert(Value::String("namespace".to_string()), Value::String(ns.clone()));
            }
        }
    }
}

/// Release name from a rendered output directory:
/// `helmfile.yaml-<hash>-<release>` or just `<name>`.
fn extract_release_name(release_dir: &str) -> String {
    let Some(rest) = release_dir.strip_prefix("helmfile.yaml-") else {
        return release_dir.to_string();
    };
    match rest.split_once('-') {
        Some((_, release)) => release.to_string(),
        None => rest.to_string(),
    }
}
