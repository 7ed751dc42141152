//! Container environment resolution
//!
//! Resolves a container's `env` and `envFrom` into a flat, ordered mapping.
//! Literal values are kept verbatim, `configMapKeyRef`/`secretKeyRef` are
//! looked up in the manifest index (flat, namespace ignored), and
//! `fieldRef: status.podIP` resolves to the compose service name of the
//! containing workload. After resolution, kubelet `$(VAR)` references are
//! expanded against earlier entries of the same container, service-port
//! remapping and user replacements are applied, and remaining shell `$VAR`
//! occurrences are escaped so compose does not re-interpolate them.

use serde_yaml::{Mapping, Value};

use dekube_common::config::Replacement;
use dekube_common::extension::{ServicePortMap, Warnings};
use dekube_common::manifest::ManifestIndex;
use dekube_common::yaml;

use crate::rewrite;

/// Resolve one container's environment into an ordered mapping.
pub fn resolve_env(
    container: &Value,
    index: &ManifestIndex,
    workload: &str,
    service_ports: &ServicePortMap,
    replacements: &[Replacement],
    warnings: &mut Warnings,
) -> Mapping {
    let mut entries: Vec<(String, String)> = Vec::new();

    for entry in yaml::seq_field(container, "env") {
        if let Some(resolved) = resolve_entry(entry, index, workload, warnings) {
            entries.push(resolved);
        }
    }
    entries.extend(resolve_env_from(container, index));

    // Kubelet semantics: $(VAR) sees entries defined earlier in the list.
    for i in 0..entries.len() {
        let expanded = rewrite::expand_var_refs(&entries[i].1, |name| {
            entries[..i]
                .iter()
                .rev()
                .find(|(key, _)| key.as_str() == name)
                .map(|(_, value)| value.clone())
        });
        entries[i].1 = expanded;
    }

    let mut env = Mapping::new();
    for (key, mut value) in entries {
        value = rewrite::apply_port_remap(&value, service_ports);
        value = rewrite::apply_replacements(&value, replacements);
        value = rewrite::escape_shell_vars(&value);
        env.insert(Value::String(key), Value::String(value));
    }
    env
}

/// Resolve a single `env` entry. Returns `None` for entries that could not
/// be resolved (a warning is emitted where the reference was broken).
fn resolve_entry(
    entry: &Value,
    index: &ManifestIndex,
    workload: &str,
    warnings: &mut Warnings,
) -> Option<(String, String)> {
    let name = yaml::str_field(entry, "name").to_string();
    if name.is_empty() {
        return None;
    }
    if let Some(value) = yaml::scalar_to_string(yaml::field(entry, "value")) {
        return Some((name, value));
    }
    let value_from = yaml::field(entry, "valueFrom");
    if value_from.is_null() {
        return None;
    }

    let cm_ref = yaml::field(value_from, "configMapKeyRef");
    if !cm_ref.is_null() {
        let (cm_name, key) = (yaml::str_field(cm_ref, "name"), yaml::str_field(cm_ref, "key"));
        if let Some(value) = index.config_map(cm_name).and_then(|cm| cm.data_map().remove(key)) {
            return Some((name, value));
        }
        warnings.push(format!(
            "configMapKeyRef '{cm_name}/{key}' on {workload} could not be resolved"
        ));
        return None;
    }

    let secret_ref = yaml::field(value_from, "secretKeyRef");
    if !secret_ref.is_null() {
        let (sec_name, key) = (yaml::str_field(secret_ref, "name"), yaml::str_field(secret_ref, "key"));
        if let Some(value) = index.secret(sec_name).and_then(|s| s.secret_value(key)) {
            return Some((name, value));
        }
        warnings.push(format!(
            "secretKeyRef '{sec_name}/{key}' on {workload} could not be resolved"
        ));
        return None;
    }

    let field_ref = yaml::field(value_from, "fieldRef");
    if !field_ref.is_null() {
        let field_path = yaml::str_field(field_ref, "fieldPath");
        if field_path == "status.podIP" {
            // In compose, the service name is the container's DNS address.
            return Some((name, workload.to_string()));
        }
        warnings.push(format!(
            "env var '{name}' on {workload} uses unsupported fieldRef '{field_path}' — skipped"
        ));
        return None;
    }

    warnings.push(format!(
        "env var '{name}' on {workload} uses unsupported valueFrom — skipped"
    ));
    None
}

/// Expand `envFrom` ConfigMap/Secret references into individual entries.
fn resolve_env_from(container: &Value, index: &ManifestIndex) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    for source in yaml::seq_field(container, "envFrom") {
        let cm_ref = yaml::field(source, "configMapRef");
        if !cm_ref.is_null() {
            if let Some(cm) = index.config_map(yaml::str_field(cm_ref, "name")) {
                entries.extend(cm.data_map());
            }
            continue;
        }
        let secret_ref = yaml::field(source, "secretRef");
        if !secret_ref.is_null() {
            if let Some(secret) = index.secret(yaml::str_field(secret_ref, "name")) {
                for key in secret.secret_keys() {
                    if let Some(value) = secret.secret_value(&key) {
                        entries.push((key, value));
                    }
                }
            }
        }
    }
    entries
}

/// Convert K8s `command`/`args` to compose entrypoint/command values, with
/// `$(VAR)` expansion against the resolved environment and shell escaping.
pub fn convert_command(container: &Value, env: &Mapping) -> (Option<Value>, Option<Value>) {
    let convert = |key: &str| -> Option<Value> {
        let raw = yaml::field(container, key);
        if raw.is_null() {
            return None;
        }
        let mut value = raw.clone();
        rewrite::rewrite_strings(&mut value, &mut |s| {
            let expanded = rewrite::expand_var_refs(s, |name| {
                env.get(name).and_then(Value::as_str).map(String::from)
            });
            rewrite::escape_shell_vars(&expanded)
        });
        Some(value)
    };
    (convert("command"), convert("args"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dekube_common::manifest::Manifest;
    use dekube_common::yaml::parse_yaml;

    fn index_from(yaml: &str) -> ManifestIndex {
        let mut index = ManifestIndex::default();
        for doc in dekube_common::yaml::parse_yaml_multi(yaml).unwrap() {
            index.insert(Manifest::from_value(doc).unwrap());
        }
        index
    }

    fn resolve(container_yaml: &str, index: &ManifestIndex) -> (Mapping, Warnings) {
        let container = parse_yaml(container_yaml).unwrap();
        let mut warnings = Warnings::default();
        let env = resolve_env(
            &container,
            index,
            "web",
            &ServicePortMap::new(),
            &[],
            &mut warnings,
        );
        (env, warnings)
    }

    #[test]
    fn literal_values_resolve_in_order() {
        let (env, warnings) = resolve(
            "env:\n- {name: B, value: two}\n- {name: A, value: one}\n",
            &ManifestIndex::default(),
        );
        let keys: Vec<&str> = env.iter().filter_map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["B", "A"]);
        assert!(warnings.items().is_empty());
    }

    #[test]
    fn numeric_literals_become_strings() {
        let (env, _) = resolve("env:\n- {name: PORT, value: 8080}\n", &ManifestIndex::default());
        assert_eq!(env.get("PORT").and_then(Value::as_str), Some("8080"));
    }

    #[test]
    fn config_map_and_secret_refs_resolve() {
        let index = index_from(
            "kind: ConfigMap\nmetadata: {name: app}\ndata: {HOST: db}\n---\nkind: Secret\nmetadata: {name: creds}\ndata: {PW: aHVudGVyMg==}\n",
        );
        let (env, warnings) = resolve(
            "env:\n- name: HOST\n  valueFrom: {configMapKeyRef: {name: app, key: HOST}}\n- name: PW\n  valueFrom: {secretKeyRef: {name: creds, key: PW}}\n",
            &index,
        );
        assert_eq!(env.get("HOST").and_then(Value::as_str), Some("db"));
        assert_eq!(env.get("PW").and_then(Value::as_str), Some("hunter2"));
        assert!(warnings.items().is_empty());
    }

    #[test]
    fn missing_refs_warn_and_stay_absent() {
        let (env, warnings) = resolve(
            "env:\n- name: HOST\n  valueFrom: {configMapKeyRef: {name: nope, key: HOST}}\n",
            &ManifestIndex::default(),
        );
        assert!(env.get("HOST").is_none());
        assert_eq!(warnings.items().len(), 1);
    }

    #[test]
    fn pod_ip_field_ref_resolves_to_service_name() {
        let (env, _) = resolve(
            "env:\n- name: MY_IP\n  valueFrom: {fieldRef: {fieldPath: status.podIP}}\n",
            &ManifestIndex::default(),
        );
        assert_eq!(env.get("MY_IP").and_then(Value::as_str), Some("web"));
    }

    #[test]
    fn other_field_refs_warn_and_skip() {
        let (env, warnings) = resolve(
            "env:\n- name: NODE\n  valueFrom: {fieldRef: {fieldPath: spec.nodeName}}\n",
            &ManifestIndex::default(),
        );
        assert!(env.get("NODE").is_none());
        assert!(warnings.items()[0].contains("spec.nodeName"));
    }

    #[test]
    fn env_from_expands_before_var_expansion() {
        let index = index_from("kind: ConfigMap\nmetadata: {name: defaults}\ndata: {BASE: /srv}\n");
        let container = parse_yaml(
            "env:\n- {name: A, value: first}\nenvFrom:\n- configMapRef: {name: defaults}\n",
        )
        .unwrap();
        let mut warnings = Warnings::default();
        let env = resolve_env(&container, &index, "web", &ServicePortMap::new(), &[], &mut warnings);
        assert_eq!(env.get("BASE").and_then(Value::as_str), Some("/srv"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn var_refs_use_previously_resolved_entries() {
        let (env, _) = resolve(
            "env:\n- {name: HOST, value: db}\n- {name: URL, value: 'http://$(HOST):5432'}\n- {name: EARLY, value: '$(URL2)'}\n",
            &ManifestIndex::default(),
        );
        assert_eq!(env.get("URL").and_then(Value::as_str), Some("http://db:5432"));
        // Unresolved (later or unknown) references stay literal
        assert_eq!(env.get("EARLY").and_then(Value::as_str), Some("$(URL2)"));
    }

    #[test]
    fn shell_vars_escaped_after_resolution() {
        let (env, _) = resolve(
            "env:\n- {name: CMD, value: 'echo $HOME'}\n",
            &ManifestIndex::default(),
        );
        assert_eq!(env.get("CMD").and_then(Value::as_str), Some("echo $$HOME"));
    }

    #[test]
    fn command_becomes_entrypoint_with_expansion() {
        let container = parse_yaml(
            "command: [sh, -c, 'serve $(MODE)']\nargs: ['--listen', '$PORT']\n",
        )
        .unwrap();
        let mut env = Mapping::new();
        env.insert("MODE".into(), "fast".into());
        let (entrypoint, command) = convert_command(&container, &env);
        let entrypoint = entrypoint.unwrap();
        assert_eq!(entrypoint[2].as_str(), Some("serve fast"));
        let command = command.unwrap();
        assert_eq!(command[1].as_str(), Some("$$PORT"));
    }
}
