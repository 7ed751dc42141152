//! Volume resolution
//!
//! Maps a container's `volumeMounts` against the pod spec's `volumes` (and
//! a StatefulSet's `volumeClaimTemplates`) into compose volume strings.
//! PVCs become named volumes unless the project config binds them to a host
//! path; ConfigMaps and Secrets are materialised as files under
//! `configmaps/<name>/` and `secrets/<name>/` in the in-memory file plan
//! and bind-mounted read-only; emptyDirs become anonymous volumes
//! (documented gap: not shared across compose services even when shared in
//! the pod); hostPath mounts bind directly.

use std::collections::BTreeMap;

use serde_yaml::Value;

use dekube_common::extension::ConvertContext;
use dekube_common::manifest::Manifest;
use dekube_common::yaml;

/// One entry of the pod spec's volume table.
#[derive(Debug, Clone, PartialEq)]
enum VolumeSource {
    Pvc { claim: String },
    ConfigMap { name: String, items: Option<Value> },
    Secret { name: String, items: Option<Value> },
    EmptyDir,
    HostPath { path: String },
    Unknown,
}

/// Resolve one container's volume mounts into compose volume strings.
pub fn convert_volume_mounts(
    container: &Value,
    pod_spec: &Value,
    claim_templates: &[Value],
    workload: &str,
    ctx: &mut ConvertContext,
) -> Vec<String> {
    let sources = build_volume_table(pod_spec, claim_templates);
    let mut result = Vec::new();

    for mount in yaml::seq_field(container, "volumeMounts") {
        let volume_name = yaml::str_field(mount, "name");
        let mount_path = yaml::str_field(mount, "mountPath");
        match sources.get(volume_name).unwrap_or(&VolumeSource::Unknown) {
            VolumeSource::Pvc { claim } => {
                result.push(convert_pvc_mount(claim, mount_path, ctx));
            }
            VolumeSource::EmptyDir => result.push(mount_path.to_string()),
            VolumeSource::HostPath { path } => result.push(format!("{path}:{mount_path}")),
            VolumeSource::ConfigMap { name, items } => {
                let Some(cm) = ctx.index.config_map(name).cloned() else {
                    ctx.warnings
                        .push(format!("ConfigMap '{name}' referenced by {workload} not found"));
                    continue;
                };
                let dir = materialise_config_map(&cm, items.as_ref(), ctx);
                result.push(data_mount(&dir, mount));
            }
            VolumeSource::Secret { name, items } => {
                let Some(secret) = ctx.index.secret(name).cloned() else {
                    ctx.warnings
                        .push(format!("Secret '{name}' referenced by {workload} not found"));
                    continue;
                };
                let dir = materialise_secret(&secret, items.as_ref(), ctx);
                result.push(data_mount(&dir, mount));
            }
            VolumeSource::Unknown => {}
        }
    }
    result
}

/// Resolve a host path: explicit paths stay as-is, bare names land under
/// the volume root.
pub fn resolve_host_path(host_path: &str, volume_root: &str) -> String {
    if host_path.starts_with('/')
        || host_path.starts_with("./")
        || host_path.starts_with("../")
        || host_path.starts_with('~')
    {
        return host_path.to_string();
    }
    format!("{volume_root}/{host_path}")
}

/// Volume name → source, from pod volumes and StatefulSet claim templates.
fn build_volume_table(pod_spec: &Value, claim_templates: &[Value]) -> BTreeMap<String, VolumeSource> {
    let mut table = BTreeMap::new();
    for vct in claim_templates {
        let name = yaml::str_field(yaml::field(vct, "metadata"), "name");
        if !name.is_empty() {
            table.insert(name.to_string(), VolumeSource::Pvc { claim: name.to_string() });
        }
    }
    for volume in yaml::seq_field(pod_spec, "volumes") {
        let name = yaml::str_field(volume, "name").to_string();
        if name.is_empty() {
            continue;
        }
        let source = if !yaml::field(volume, "persistentVolumeClaim").is_null() {
            VolumeSource::Pvc {
                claim: yaml::str_field(yaml::field(volume, "persistentVolumeClaim"), "claimName")
                    .to_string(),
            }
        } else if !yaml::field(volume, "configMap").is_null() {
            let cm = yaml::field(volume, "configMap");
            VolumeSource::ConfigMap {
                name: yaml::str_field(cm, "name").to_string(),
                items: non_null(yaml::field(cm, "items")),
            }
        } else if !yaml::field(volume, "secret").is_null() {
            let secret = yaml::field(volume, "secret");
            VolumeSource::Secret {
                name: yaml::str_field(secret, "secretName").to_string(),
                items: non_null(yaml::field(secret, "items")),
            }
        } else if !yaml::field(volume, "emptyDir").is_null() {
            VolumeSource::EmptyDir
        } else if !yaml::field(volume, "hostPath").is_null() {
            VolumeSource::HostPath {
                path: yaml::str_field(yaml::field(volume, "hostPath"), "path").to_string(),
            }
        } else {
            VolumeSource::Unknown
        };
        table.insert(name, source);
    }
    table
}

fn non_null(value: &Value) -> Option<Value> {
    if value.is_null() {
        None
    } else {
        Some(value.clone())
    }
}

/// PVC mount: host bind when the config maps the claim to a host path,
/// named volume otherwise.
fn convert_pvc_mount(claim: &str, mount_path: &str, ctx: &mut ConvertContext) -> String {
    ctx.pvc_names.insert(claim.to_string());
    if let Some(host_path) = ctx.config.volumes.get(claim).and_then(|v| v.host_path.as_deref()) {
        let resolved = resolve_host_path(host_path, &ctx.volume_root);
        return format!("{resolved}:{mount_path}");
    }
    format!("{claim}:{mount_path}")
}

/// Plan ConfigMap data entries as files. Returns the bind directory.
fn materialise_config_map(cm: &Manifest, items: Option<&Value>, ctx: &mut ConvertContext) -> String {
    let rel_dir = format!("configmaps/{}", cm.name);
    if ctx.materialised.insert(rel_dir.clone()) {
        let data = cm.data_map();
        for (key, out_name) in selected_keys(data.keys().cloned().collect(), items) {
            if let Some(value) = data.get(&key) {
                ctx.files.insert(format!("{rel_dir}/{out_name}"), value.clone());
            }
        }
    }
    format!("./{rel_dir}")
}

/// Plan Secret data entries as files. Returns the bind directory.
fn materialise_secret(secret: &Manifest, items: Option<&Value>, ctx: &mut ConvertContext) -> String {
    let rel_dir = format!("secrets/{}", secret.name);
    if ctx.materialised.insert(rel_dir.clone()) {
        for (key, out_name) in selected_keys(secret.secret_keys(), items) {
            match secret.secret_value(&key) {
                Some(value) => {
                    ctx.files.insert(format!("{rel_dir}/{out_name}"), value);
                }
                None => ctx.warnings.push(format!(
                    "Secret '{}' key '{key}' could not be decoded — skipped",
                    secret.name
                )),
            }
        }
    }
    format!("./{rel_dir}")
}

/// `(key, output filename)` pairs honouring an `items:` selection with
/// optional `path` aliases.
fn selected_keys(all_keys: Vec<String>, items: Option<&Value>) -> Vec<(String, String)> {
    let Some(items) = items.and_then(Value::as_sequence) else {
        return all_keys.into_iter().map(|k| (k.clone(), k)).collect();
    };
    items
        .iter()
        .filter_map(|item| {
            let key = yaml::str_field(item, "key");
            if key.is_empty() {
                return None;
            }
            let path = yaml::str_field(item, "path");
            let out = if path.is_empty() { key } else { path };
            Some((key.to_string(), out.to_string()))
        })
        .collect()
}

/// Bind-mount string for a materialised directory, honouring `subPath`.
fn data_mount(dir: &str, mount: &Value) -> String {
    let mount_path = yaml::str_field(mount, "mountPath");
    let sub_path = yaml::str_field(mount, "subPath");
    if sub_path.is_empty() {
        format!("{dir}:{mount_path}:ro")
    } else {
        format!("{dir}/{sub_path}:{mount_path}:ro")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dekube_common::config::{ProjectConfig, VolumeConfig};
    use dekube_common::manifest::ManifestIndex;
    use dekube_common::yaml::{parse_yaml, parse_yaml_multi};

    fn ctx_with(manifests: &str, config: ProjectConfig) -> ConvertContext {
        let mut index = ManifestIndex::default();
        for doc in parse_yaml_multi(manifests).unwrap() {
            index.insert(Manifest::from_value(doc).unwrap());
        }
        ConvertContext::new(index, config, false)
    }

    fn convert(container: &str, pod_spec: &str, ctx: &mut ConvertContext) -> Vec<String> {
        let container = parse_yaml(container).unwrap();
        let pod_spec = parse_yaml(pod_spec).unwrap();
        convert_volume_mounts(&container, &pod_spec, &[], "web", ctx)
    }

    #[test]
    fn pvc_without_mapping_is_a_named_volume() {
        let mut ctx = ctx_with("", ProjectConfig::default());
        let volumes = convert(
            "volumeMounts:\n- {name: data, mountPath: /var/lib/data}\n",
            "volumes:\n- name: data\n  persistentVolumeClaim: {claimName: web-data}\n",
            &mut ctx,
        );
        assert_eq!(volumes, vec!["web-data:/var/lib/data"]);
        assert!(ctx.pvc_names.contains("web-data"));
    }

    #[test]
    fn pvc_with_host_path_binds_under_volume_root() {
        let mut config = ProjectConfig::default();
        config.volumes.insert(
            "web-data".into(),
            VolumeConfig { host_path: Some("web-data".into()), ..Default::default() },
        );
        let mut ctx = ctx_with("", config);
        let volumes = convert(
            "volumeMounts:\n- {name: data, mountPath: /var/lib/data}\n",
            "volumes:\n- name: data\n  persistentVolumeClaim: {claimName: web-data}\n",
            &mut ctx,
        );
        assert_eq!(volumes, vec!["./data/web-data:/var/lib/data"]);
    }

    #[test]
    fn explicit_host_paths_are_kept() {
        assert_eq!(resolve_host_path("/srv/data", "./data"), "/srv/data");
        assert_eq!(resolve_host_path("./here", "./data"), "./here");
        assert_eq!(resolve_host_path("../up", "./data"), "../up");
        assert_eq!(resolve_host_path("~/home", "./data"), "~/home");
        assert_eq!(resolve_host_path("bare", "./data"), "./data/bare");
    }

    #[test]
    fn empty_dir_is_anonymous_volume() {
        let mut ctx = ctx_with("", ProjectConfig::default());
        let volumes = convert(
            "volumeMounts:\n- {name: scratch, mountPath: /tmp/scratch}\n",
            "volumes:\n- name: scratch\n  emptyDir: {}\n",
            &mut ctx,
        );
        assert_eq!(volumes, vec!["/tmp/scratch"]);
    }

    #[test]
    fn host_path_binds_directly() {
        let mut ctx = ctx_with("", ProjectConfig::default());
        let volumes = convert(
            "volumeMounts:\n- {name: logs, mountPath: /logs}\n",
            "volumes:\n- name: logs\n  hostPath: {path: /var/log/app}\n",
            &mut ctx,
        );
        assert_eq!(volumes, vec!["/var/log/app:/logs"]);
    }

    #[test]
    fn config_map_materialises_files_read_only() {
        let mut ctx = ctx_with(
            "kind: ConfigMap\nmetadata: {name: app-conf}\ndata: {app.ini: 'key = value'}\n",
            ProjectConfig::default(),
        );
        let volumes = convert(
            "volumeMounts:\n- {name: conf, mountPath: /etc/app}\n",
            "volumes:\n- name: conf\n  configMap: {name: app-conf}\n",
            &mut ctx,
        );
        assert_eq!(volumes, vec!["./configmaps/app-conf:/etc/app:ro"]);
        assert_eq!(ctx.files.get("configmaps/app-conf/app.ini").map(String::as_str), Some("key = value"));
    }

    #[test]
    fn config_map_items_select_and_alias_keys() {
        let mut ctx = ctx_with(
            "kind: ConfigMap\nmetadata: {name: app-conf}\ndata: {a: '1', b: '2'}\n",
            ProjectConfig::default(),
        );
        convert(
            "volumeMounts:\n- {name: conf, mountPath: /etc/app}\n",
            "volumes:\n- name: conf\n  configMap:\n    name: app-conf\n    items:\n    - {key: a, path: renamed.txt}\n",
            &mut ctx,
        );
        assert!(ctx.files.contains_key("configmaps/app-conf/renamed.txt"));
        assert!(!ctx.files.contains_key("configmaps/app-conf/b"));
    }

    #[test]
    fn sub_path_mounts_one_file() {
        let mut ctx = ctx_with(
            "kind: ConfigMap\nmetadata: {name: app-conf}\ndata: {app.ini: x}\n",
            ProjectConfig::default(),
        );
        let volumes = convert(
            "volumeMounts:\n- {name: conf, mountPath: /etc/app.ini, subPath: app.ini}\n",
            "volumes:\n- name: conf\n  configMap: {name: app-conf}\n",
            &mut ctx,
        );
        assert_eq!(volumes, vec!["./configmaps/app-conf/app.ini:/etc/app.ini:ro"]);
    }

    #[test]
    fn secret_materialises_decoded_values() {
        let mut ctx = ctx_with(
            "kind: Secret\nmetadata: {name: creds}\ndata: {pw: aHVudGVyMg==}\n",
            ProjectConfig::default(),
        );
        let volumes = convert(
            "volumeMounts:\n- {name: sec, mountPath: /run/secrets/app}\n",
            "volumes:\n- name: sec\n  secret: {secretName: creds}\n",
            &mut ctx,
        );
        assert_eq!(volumes, vec!["./secrets/creds:/run/secrets/app:ro"]);
        assert_eq!(ctx.files.get("secrets/creds/pw").map(String::as_str), Some("hunter2"));
    }

    #[test]
    fn missing_config_map_warns_and_skips_mount() {
        let mut ctx = ctx_with("", ProjectConfig::default());
        let volumes = convert(
            "volumeMounts:\n- {name: conf, mountPath: /etc/app}\n",
            "volumes:\n- name: conf\n  configMap: {name: nope}\n",
            &mut ctx,
        );
        assert!(volumes.is_empty());
        assert_eq!(ctx.warnings.items().len(), 1);
    }

    #[test]
    fn claim_templates_define_implicit_pvc_volumes() {
        let mut ctx = ctx_with("", ProjectConfig::default());
        let container = parse_yaml("volumeMounts:\n- {name: db, mountPath: /var/lib/db}\n").unwrap();
        let pod_spec = parse_yaml("{}").unwrap();
        let templates = parse_yaml("- metadata: {name: db}\n").unwrap();
        let volumes = convert_volume_mounts(
            &container,
            &pod_spec,
            templates.as_sequence().unwrap(),
            "db",
            &mut ctx,
        );
        assert_eq!(volumes, vec!["db:/var/lib/db"]);
    }
}
