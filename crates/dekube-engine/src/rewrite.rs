//! The rewrite engine
//!
//! String-level rewrites applied across env values, command arrays,
//! Caddyfile upstreams, and materialised file contents: Service-port
//! remapping, hostname aliasing, kubelet `$(VAR)` expansion, shell `$VAR`
//! escaping for compose, user-defined replacements, and
//! `$secret:`/`$volume_root` placeholder resolution.
//!
//! Port remapping and replacements run both at build time and again in the
//! post-process sweep, so every rewrite here is idempotent: a remapped URL
//! no longer matches the remap pattern, and placeholder substitution is
//! literal.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_yaml::Value;

use dekube_common::config::Replacement;
use dekube_common::extension::{PortRef, ServicePortMap, Warnings};
use dekube_common::manifest::ManifestIndex;

/// K8s internal DNS name; capture 1 is the service name, the namespace and
/// `svc[.cluster.local]` suffix are discarded.
static K8S_DNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"([a-z0-9](?:[a-z0-9-]*[a-z0-9])?)\.(?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?)\.svc(?:\.cluster\.local)?",
    )
    .expect("hardcoded regex")
});

/// Kubelet `$(VAR)` interpolation in env values and command/args.
static K8S_VAR_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\(([A-Za-z_][A-Za-z0-9_]*)\)").expect("hardcoded regex"));

/// `$secret:<name>:<key>` placeholder.
static SECRET_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$secret:([^:]+):([^:}\s]+)").expect("hardcoded regex"));

/// A `$` that compose would interpolate (`$VAR` or `${VAR}`).
static SHELL_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_{])").expect("hardcoded regex"));

/// Characters that may follow a host:port before the URL continues.
const URL_BOUNDARY: &str = r#"([/\s"']|$)"#;

/// Strip a K8s DNS suffix: `minio.ns.svc.cluster.local` → `minio`.
pub fn strip_dns_suffix(host: &str) -> String {
    K8S_DNS.replace_all(host, "$1").into_owned()
}

/// Apply user-defined literal string replacements.
pub fn apply_replacements(text: &str, replacements: &[Replacement]) -> String {
    let mut out = text.to_string();
    for r in replacements {
        out = out.replace(&r.old, &r.new);
    }
    out
}

/// Rewrite URLs to use container ports instead of K8s Service ports.
///
/// K8s Services remap ports (Service port 80 → container port 8080);
/// compose has no service layer, so URLs must carry the container port.
/// Identity mappings and named ports are skipped. Once rewritten, a URL no
/// longer matches any remap pattern.
pub fn apply_port_remap(text: &str, ports: &ServicePortMap) -> String {
    let mut remaps: BTreeMap<&str, Vec<(u16, u16)>> = BTreeMap::new();
    for ((svc, port_ref), container) in ports {
        let PortRef::Number(svc_port) = port_ref else {
            continue;
        };
        if svc_port == container {
            continue;
        }
        remaps.entry(svc.as_str()).or_default().push((*svc_port, *container));
    }

    let mut out = text.to_string();
    for (svc, pairs) in remaps {
        let escaped = regex::escape(svc);
        for (svc_port, container) in pairs {
            // Explicit port: ://host:svc_port or @host:svc_port
            if let Ok(re) = Regex::new(&format!(r"([/@]){escaped}:{svc_port}{URL_BOUNDARY}")) {
                out = re
                    .replace_all(&out, |caps: &Captures| {
                        format!("{}{}:{}{}", &caps[1], svc, container, &caps[2])
                    })
                    .into_owned();
            }
            // Implicit port: http://host (80) or https://host (443)
            let scheme = match svc_port {
                80 => "http",
                443 => "https",
                _ => continue,
            };
            if let Ok(re) = Regex::new(&format!(r"({scheme}://){escaped}{URL_BOUNDARY}")) {
                out = re
                    .replace_all(&out, |caps: &Captures| {
                        format!("{}{}:{}{}", &caps[1], svc, container, &caps[2])
                    })
                    .into_owned();
            }
        }
    }
    out
}

/// Replace K8s Service names with compose service names in hostname
/// positions: preceded by `://` or `@`, followed by a path, port, quote,
/// whitespace, or end-of-string, so bucket names and other substrings are
/// left alone.
pub fn apply_alias_map(text: &str, aliases: &BTreeMap<String, String>) -> String {
    let mut out = text.to_string();
    for (alias, target) in aliases {
        let escaped = regex::escape(alias);
        if let Ok(re) = Regex::new(&format!(r#"([/@]){escaped}([/:\s"']|$)"#)) {
            out = re
                .replace_all(&out, |caps: &Captures| format!("{}{}{}", &caps[1], target, &caps[2]))
                .into_owned();
        }
    }
    out
}

/// Replace kubelet `$(VAR)` references using the given lookup; unresolved
/// references stay literal.
pub fn expand_var_refs(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    K8S_VAR_REF
        .replace_all(text, |caps: &Captures| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Escape `$VAR`/`${VAR}` to `$$VAR`/`$${VAR}` so compose does not
/// interpolate them from the host environment. Applied exactly once, at
/// build time.
pub fn escape_shell_vars(text: &str) -> String {
    SHELL_VAR
        .replace_all(text, |caps: &Captures| format!("$${}", &caps[1]))
        .into_owned()
}

/// Resolve `$secret:<name>:<key>` and `$volume_root` placeholders.
///
/// Unresolved placeholders warn and stay literal.
pub fn resolve_placeholders(
    text: &str,
    index: &ManifestIndex,
    volume_root: &str,
    warnings: &mut Warnings,
) -> String {
    let resolved = SECRET_REF.replace_all(text, |caps: &Captures| {
        let (name, key) = (&caps[1], &caps[2]);
        let Some(secret) = index.secret(name) else {
            warnings.push(format!("$secret ref: Secret '{name}' not found"));
            return caps[0].to_string();
        };
        match secret.secret_value(key) {
            Some(value) => value,
            None => {
                warnings.push(format!("$secret ref: key '{key}' not found in Secret '{name}'"));
                caps[0].to_string()
            }
        }
    });
    resolved.replace("$volume_root", volume_root)
}

/// Apply a string rewrite to every string in a value tree.
pub fn rewrite_strings(value: &mut Value, rewrite: &mut dyn FnMut(&str) -> String) {
    match value {
        Value::String(s) => *s = rewrite(s),
        Value::Sequence(seq) => {
            for item in seq {
                rewrite_strings(item, rewrite);
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                rewrite_strings(item, rewrite);
            }
        }
        _ => {}
    }
}
