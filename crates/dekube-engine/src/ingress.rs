//! Ingress building
//!
//! Dispatches each Ingress manifest to the registered rewriter for its
//! resolved class and collects route entries. Backend resolution follows
//! the Service index: ExternalName chains are walked to a terminal service
//! (bounded, with cycle detection), the alias map picks the compose service
//! name, and the service-port map remaps to the container port.

use dekube_common::extension::{ConvertContext, IngressRewriter, PortRef};
use dekube_common::ingress::IngressEntry;
use dekube_common::manifest::Manifest;
use dekube_common::yaml;

use crate::rewrite;

/// Bound on ExternalName chain walks; cycles warn and stop.
const ALIAS_WALK_LIMIT: usize = 8;

/// Well-known named ports, used when a named backend port survives the
/// service-port-map lookup.
const WELL_KNOWN_PORTS: &[(&str, u16)] = &[("http", 80), ("https", 443), ("grpc", 50051)];

/// Resolved upstream of one Ingress path entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBackend {
    /// The Service the backend referenced
    pub service: String,
    /// Compose service name after alias resolution
    pub compose_name: String,
    /// Container port after remapping
    pub port: u16,
    /// `host:port` for the proxy directive
    pub upstream: String,
}

/// Extract the ingress class from `spec.ingressClassName` or the legacy
/// `kubernetes.io/ingress.class` annotation, then resolve it through the
/// project's `ingress_types` mapping (exact match first, then substring).
pub fn ingress_class(manifest: &Manifest, ctx: &ConvertContext) -> String {
    let mut class = manifest.str_at(&["spec", "ingressClassName"]).to_lowercase();
    if class.is_empty() {
        class = manifest
            .annotations
            .get("kubernetes.io/ingress.class")
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
    }
    if let Some(canonical) = ctx.ingress_types.get(&class) {
        return canonical.to_lowercase();
    }
    for (pattern, canonical) in &ctx.ingress_types {
        if class.contains(pattern.as_str()) {
            return canonical.to_lowercase();
        }
    }
    class
}

/// Convert all Ingress manifests into route entries via rewriter dispatch.
///
/// Rewriters are matched by canonical name in registry order; a rewriter
/// whose `matches()` declines falls through to the next one with the same
/// name. Ingresses with no matching rewriter warn and are skipped.
pub fn build_entries(
    rewriters: &[&dyn IngressRewriter],
    ctx: &mut ConvertContext,
) -> Vec<IngressEntry> {
    let manifests: Vec<Manifest> = ctx.index.of_kind("Ingress").to_vec();
    let mut entries = Vec::new();

    for manifest in &manifests {
        let class = ingress_class(manifest, ctx);
        let rewriter = rewriters
            .iter()
            .find(|r| r.name() == class && r.matches(manifest));
        let Some(rewriter) = rewriter else {
            ctx.warnings.push(format!(
                "Ingress '{}': no matching rewriter for class '{class}', skipped",
                manifest.name
            ));
            continue;
        };
        match rewriter.rewrite(manifest, ctx) {
            Ok(routes) => entries.extend(routes),
            Err(e) => ctx.warnings.push(format!(
                "ingress rewriter '{}' failed on '{}': {e}",
                rewriter.name(),
                manifest.name
            )),
        }
    }
    entries
}

/// Resolve an Ingress path entry's backend to a compose upstream.
///
/// Handles both the v1 (`backend.service.name/port`) and v1beta1
/// (`serviceName`/`servicePort`) shapes.
pub fn resolve_backend(
    path_entry: &serde_yaml::Value,
    manifest: &Manifest,
    ctx: &mut ConvertContext,
) -> ResolvedBackend {
    let backend = yaml::field(path_entry, "backend");
    let (svc_name, port_ref) = if !yaml::field(backend, "service").is_null() {
        let service = yaml::field(backend, "service");
        let port = yaml::field(service, "port");
        let port_ref = yaml::port_field(port, "number")
            .map(PortRef::Number)
            .unwrap_or_else(|| {
                let name = yaml::str_field(port, "name");
                if name.is_empty() {
                    PortRef::Number(80)
                } else {
                    PortRef::Name(name.to_string())
                }
            });
        (yaml::str_field(service, "name").to_string(), port_ref)
    } else {
        let port_ref = match yaml::field(backend, "servicePort") {
            v if v.is_null() => PortRef::Number(80),
            v => match v.as_u64().and_then(|n| u16::try_from(n).ok()) {
                Some(n) => PortRef::Number(n),
                None => PortRef::Name(v.as_str().unwrap_or("").to_string()),
            },
        };
        (yaml::str_field(backend, "serviceName").to_string(), port_ref)
    };

    let terminal = follow_external_name(&svc_name, ctx, &manifest.name);
    let compose_name = ctx.alias_map.get(&terminal).cloned().unwrap_or_else(|| terminal.clone());

    let port = match ctx.service_ports.get(&(terminal.clone(), port_ref.clone())) {
        Some(container) => *container,
        None => match port_ref {
            PortRef::Number(n) => n,
            PortRef::Name(ref name) => match WELL_KNOWN_PORTS.iter().find(|(n, _)| n == name) {
                Some((_, p)) => *p,
                None => {
                    ctx.warnings.push(format!(
                        "Ingress backend {svc_name}: unresolved named port '{name}'"
                    ));
                    80
                }
            },
        },
    };

    ResolvedBackend {
        service: svc_name,
        upstream: format!("{compose_name}:{port}"),
        compose_name,
        port,
    }
}

/// Follow ExternalName aliases until a non-ExternalName target is reached
/// or the chain exits the known Service set. Cycles and over-long chains
/// warn and return the last resolved node.
fn follow_external_name(svc_name: &str, ctx: &mut ConvertContext, ingress_name: &str) -> String {
    let mut current = svc_name.to_string();
    let mut visited = vec![current.clone()];

    for _ in 0..ALIAS_WALK_LIMIT {
        let Some(service) = ctx.index.service(&current) else {
            return current;
        };
        if service.str_at(&["spec", "type"]) != "ExternalName" {
            return current;
        }
        let target = rewrite::strip_dns_suffix(service.str_at(&["spec", "externalName"]));
        if target.is_empty() || target == current {
            return current;
        }
        if visited.contains(&target) {
            ctx.warnings.push(format!(
                "Ingress '{ingress_name}': ExternalName cycle at '{target}'"
            ));
            return current;
        }
        visited.push(target.clone());
        current = target;
    }
    ctx.warnings.push(format!(
        "Ingress '{ingress_name}': ExternalName chain longer than {ALIAS_WALK_LIMIT}, stopped at '{current}'"
    ));
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use dekube_common::config::ProjectConfig;
    use dekube_common::extension::Warnings;
    use dekube_common::manifest::ManifestIndex;
    use dekube_common::yaml::{parse_yaml, parse_yaml_multi};

    use crate::services::ServiceIndex;

    fn ctx_from(manifests: &str) -> ConvertContext {
        let mut warnings = Warnings::default();
        let index =
            ManifestIndex::build(parse_yaml_multi(manifests).unwrap(), &BTreeSet::new(), &mut warnings);
        let svc_index = ServiceIndex::build(&index);
        let mut ctx = ConvertContext::new(index, ProjectConfig::default(), false);
        ctx.alias_map = svc_index.alias_map();
        ctx.service_ports = svc_index.service_port_map(&ctx.index);
        ctx
    }

    fn ingress(class_line: &str) -> Manifest {
        Manifest::from_value(
            parse_yaml(&format!("kind: Ingress\nmetadata: {{name: site}}\nspec:\n  {class_line}\n"))
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn class_from_spec_and_annotation() {
        let ctx = ctx_from("");
        assert_eq!(ingress_class(&ingress("ingressClassName: NGINX"), &ctx), "nginx");

        let manifest = Manifest::from_value(
            parse_yaml(
                "kind: Ingress\nmetadata:\n  name: site\n  annotations: {kubernetes.io/ingress.class: haproxy}\n",
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(ingress_class(&manifest, &ctx), "haproxy");
    }

    #[test]
    fn ingress_types_map_exact_and_substring() {
        let mut ctx = ctx_from("");
        ctx.ingress_types.insert("haproxy-internal".into(), "haproxy".into());
        assert_eq!(ingress_class(&ingress("ingressClassName: haproxy-internal"), &ctx), "haproxy");
        // Substring match: custom class containing a mapped pattern
        assert_eq!(
            ingress_class(&ingress("ingressClassName: haproxy-internal-v2"), &ctx),
            "haproxy"
        );
    }

    #[test]
    fn backend_v1_resolves_through_port_map() {
        let mut ctx = ctx_from(
            "kind: Deployment\nmetadata: {name: web, labels: {app: web}}\nspec:\n  template:\n    spec:\n      containers:\n      - {name: web, image: nginx, ports: [{containerPort: 8080}]}\n---\nkind: Service\nmetadata: {name: web-svc}\nspec:\n  selector: {app: web}\n  ports: [{port: 80, targetPort: 8080}]\n",
        );
        let path = parse_yaml("backend: {service: {name: web-svc, port: {number: 80}}}").unwrap();
        let manifest = ingress("rules: []");
        let backend = resolve_backend(&path, &manifest, &mut ctx);
        assert_eq!(backend.compose_name, "web");
        assert_eq!(backend.upstream, "web:8080");
    }

    #[test]
    fn backend_v1beta1_shape_resolves() {
        let mut ctx = ctx_from("");
        let path = parse_yaml("backend: {serviceName: legacy, servicePort: 9090}").unwrap();
        let manifest = ingress("rules: []");
        let backend = resolve_backend(&path, &manifest, &mut ctx);
        assert_eq!(backend.upstream, "legacy:9090");
    }

    #[test]
    fn external_name_chain_resolves_to_workload() {
        let mut ctx = ctx_from(
            "kind: Deployment\nmetadata: {name: minio, labels: {app: minio}}\nspec:\n  template:\n    spec:\n      containers:\n      - {name: minio, image: minio, ports: [{containerPort: 9000}]}\n---\nkind: Service\nmetadata: {name: minio}\nspec:\n  selector: {app: minio}\n  ports: [{port: 9000}]\n---\nkind: Service\nmetadata: {name: docs-media}\nspec:\n  type: ExternalName\n  externalName: minio.ns.svc.cluster.local\n",
        );
        let path = parse_yaml("backend: {service: {name: docs-media, port: {number: 9000}}}").unwrap();
        let manifest = ingress("rules: []");
        let backend = resolve_backend(&path, &manifest, &mut ctx);
        assert_eq!(backend.upstream, "minio:9000");
    }

    #[test]
    fn external_name_cycle_warns_and_stops() {
        let mut ctx = ctx_from(
            "kind: Service\nmetadata: {name: a}\nspec: {type: ExternalName, externalName: b}\n---\nkind: Service\nmetadata: {name: b}\nspec: {type: ExternalName, externalName: a}\n",
        );
        let path = parse_yaml("backend: {service: {name: a, port: {number: 80}}}").unwrap();
        let manifest = ingress("rules: []");
        resolve_backend(&path, &manifest, &mut ctx);
        assert!(ctx.warnings.items().iter().any(|w| w.contains("cycle")));
    }

    #[test]
    fn named_ports_fall_back_to_well_known() {
        let mut ctx = ctx_from("");
        let path = parse_yaml("backend: {service: {name: api, port: {name: grpc}}}").unwrap();
        let manifest = ingress("rules: []");
        let backend = resolve_backend(&path, &manifest, &mut ctx);
        assert_eq!(backend.port, 50051);

        let path = parse_yaml("backend: {service: {name: api, port: {name: metrics}}}").unwrap();
        let backend = resolve_backend(&path, &manifest, &mut ctx);
        assert_eq!(backend.port, 80);
        assert!(ctx.warnings.items().iter().any(|w| w.contains("metrics")));
    }

    #[test]
    fn unmatched_ingress_warns_and_skips() {
        let mut ctx = ctx_from("kind: Ingress\nmetadata: {name: site}\nspec: {ingressClassName: nginx}\n");
        let entries = build_entries(&[], &mut ctx);
        assert!(entries.is_empty());
        assert!(ctx.warnings.items()[0].contains("no matching rewriter"));
    }
}
