//! Output emission
//!
//! The only phase that writes: the compose file, the Caddyfile (or the
//! per-project variant when ingress is disabled), the planned
//! ConfigMap/Secret files, and the persisted project config.

use std::fs;
use std::path::Path;

use serde_yaml::Value;
use tracing::info;

use dekube_common::compose::ComposeFile;
use dekube_common::config::ProjectConfig;
use dekube_common::yaml;
use dekube_engine::caddy;
use dekube_engine::pipeline::Conversion;

use crate::error::Result;

/// Write the compose file.
pub fn write_compose(conversion: &Conversion, output_dir: &Path, compose_file: &str) -> Result<()> {
    let config = &conversion.config;
    let compose = ComposeFile {
        name: config.name.clone(),
        services: conversion.services.clone(),
        volumes: (!conversion.named_volumes.is_empty()).then(|| conversion.named_volumes.clone()),
        networks: config.network.as_ref().map(|name| {
            let mut default = serde_yaml::Mapping::new();
            default.insert("external".into(), Value::Bool(true));
            default.insert("name".into(), Value::String(name.clone()));
            Value::Mapping(yaml::mapping_from([("default", Value::Mapping(default))]))
        }),
    };

    let mut header = String::from("# Generated by dekube — do not edit manually\n");
    let has_sidecars = conversion.services.values().any(|s| s.container_name.is_some());
    if has_sidecars {
        header.push_str("# WARNING: sidecar containers use container_name for network sharing.\n");
        header.push_str("# Do not use 'docker compose -p' — rename via the project config instead.\n");
    }

    let body =
        serde_yaml::to_string(&compose).map_err(|e| dekube_common::Error::serialization(e.to_string()))?;
    let path = output_dir.join(compose_file);
    fs::write(&path, format!("{header}{body}"))?;
    info!("wrote {}", path.display());
    Ok(())
}

/// The Caddyfile name for this project: `Caddyfile`, or
/// `Caddyfile-<project>` when the ingress service is disabled.
pub fn caddyfile_name(config: &ProjectConfig) -> String {
    if config.disable_ingress {
        let project = config.name.as_deref().unwrap_or("project");
        format!("Caddyfile-{project}")
    } else {
        "Caddyfile".to_string()
    }
}

/// Render and write the Caddyfile.
pub fn write_caddyfile(conversion: &Conversion, output_dir: &Path) -> Result<()> {
    let text = caddy::render_caddyfile(&conversion.ingress, &conversion.config);
    let path = output_dir.join(caddyfile_name(&conversion.config));
    fs::write(&path, text)?;
    info!("wrote {}", path.display());
    Ok(())
}

/// Write the planned ConfigMap/Secret files.
pub fn write_files(conversion: &Conversion, output_dir: &Path) -> Result<()> {
    for (rel_path, contents) in &conversion.files {
        let path = output_dir.join(rel_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
    }
    if !conversion.files.is_empty() {
        info!("wrote {} materialised file(s)", conversion.files.len());
    }
    Ok(())
}
