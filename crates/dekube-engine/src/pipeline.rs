//! The pipeline driver
//!
//! Phases run strictly in order, single-threaded; each phase observes the
//! prior phase's outputs:
//!
//! 1. ingest & index (done by the caller)
//! 2. converter fan-out, with synthetic manifests re-evaluated for up to
//!    three cycles
//! 3. alias map and service-port map construction
//! 4. workload build (skipping kinds claimed by extension converters)
//! 5. ingress build and the synthesised ingress service
//! 6. network alias injection
//! 7. transforms
//! 8. idempotent post-processing (port remap, replacements, placeholders)
//! 9. overrides, custom services, exclusions
//! 10. emission (done by the caller, from the returned [`Conversion`])

use std::collections::{BTreeMap, BTreeSet};

use serde_yaml::{Mapping, Value};

use dekube_common::compose::{deep_merge, ComposeService, ServiceMap};
use dekube_common::config::{ProjectConfig, VolumeConfig};
use dekube_common::extension::{ConvertContext, ServicePortMap, Warnings};
use dekube_common::ingress::IngressEntry;
use dekube_common::manifest::{Manifest, ManifestIndex};

use crate::caddy;
use crate::ingress as ingress_build;
use crate::registry::ExtensionRegistry;
use crate::rewrite;
use crate::services::ServiceIndex;
use crate::workload;

/// Cycle bound for the converter fan-out over synthetic manifests.
const FANOUT_CYCLE_LIMIT: usize = 3;

/// Everything a run produces; the caller writes it out.
#[derive(Debug)]
pub struct Conversion {
    /// Compose services, in build order
    pub services: ServiceMap,
    /// Ingress route entries for the Caddyfile
    pub ingress: Vec<IngressEntry>,
    /// Planned files (relative path → contents)
    pub files: BTreeMap<String, String>,
    /// Top-level named volumes for the compose file
    pub named_volumes: Mapping,
    /// The (possibly updated) project config to persist
    pub config: ProjectConfig,
    /// All warnings, in insertion order
    pub warnings: Vec<String>,
}

/// Run phases 2–9 over an indexed manifest set.
pub fn run(
    index: ManifestIndex,
    config: ProjectConfig,
    registry: &ExtensionRegistry,
    first_run: bool,
) -> Conversion {
    let mut ctx = ConvertContext::new(index, config, first_run);
    let mut services = ServiceMap::new();
    let mut ingress: Vec<IngressEntry> = Vec::new();
    let claimed = registry.claimed_kinds();

    // Phase 2: converter fan-out
    converter_fanout(registry, &claimed, &mut ctx, &mut services, &mut ingress);

    // Phase 3: alias & port map construction
    let svc_index = ServiceIndex::build(&ctx.index);
    ctx.alias_map = svc_index.alias_map();
    ctx.service_ports = svc_index.service_port_map(&ctx.index);

    // Phase 4: workload build
    let workloads: Vec<Manifest> = ctx
        .index
        .workloads()
        .filter(|m| !claimed.contains(&m.kind))
        .cloned()
        .collect();
    for manifest in &workloads {
        for (name, service) in workload::build_workload(manifest, &svc_index, &mut ctx) {
            services.insert(name, service);
        }
    }

    // Phase 5: ingress build
    if !claimed.contains("Ingress") {
        let rewriters = registry.rewriters();
        ingress.extend(ingress_build::build_entries(&rewriters, &mut ctx));
    }
    if !ingress.is_empty() && !ctx.config.disable_ingress {
        services.insert(caddy::CADDY_SERVICE.to_string(), caddy::caddy_service());
    }

    // Phase 6: network alias injection
    inject_network_aliases(&mut services, &svc_index, &mut ctx);

    // Phase 7: transforms
    for transform in registry.transforms() {
        transform.transform(&mut services, &mut ingress, &mut ctx);
    }

    // Phase 8: idempotent post-processing
    post_process(&mut services, &mut ingress, &mut ctx);

    // Volume bookkeeping: named volumes reflect this run's mounts; the
    // first run records host-path mappings for the next one.
    let named_volumes = collect_named_volumes(&services, &ctx);
    if ctx.first_run {
        for pvc in ctx.pvc_names.clone() {
            ctx.config
                .volumes
                .entry(pvc.clone())
                .or_insert_with(|| VolumeConfig { driver: None, host_path: Some(pvc) });
        }
    } else {
        let stale: Vec<String> = ctx
            .config
            .volumes
            .keys()
            .filter(|name| !ctx.pvc_names.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            ctx.warnings
                .push(format!("volume '{name}' in the project config is not referenced by any PVC — stale?"));
        }
    }

    // Phase 9: overrides, custom services, exclusions
    apply_overrides(&mut services, &mut ctx);
    append_custom_services(&mut services, &mut ctx);
    apply_exclusions(&mut services, &mut ingress, &mut ctx);
    workload::truncate_hostnames(&mut services);

    Conversion {
        services,
        ingress,
        files: std::mem::take(&mut ctx.files),
        named_volumes,
        warnings: std::mem::take(&mut ctx.warnings).into_vec(),
        config: ctx.config,
    }
}

/// Phase 2: dispatch claimed manifests to extension converters in priority
/// order, feeding synthetic manifests back into the index for up to
/// [`FANOUT_CYCLE_LIMIT`] cycles.
fn converter_fanout(
    registry: &ExtensionRegistry,
    claimed: &BTreeSet<String>,
    ctx: &mut ConvertContext,
    services: &mut ServiceMap,
    ingress: &mut Vec<IngressEntry>,
) {
    let mut converted: BTreeSet<(String, String)> = BTreeSet::new();
    let mut cycle = 0;

    loop {
        let pending: Vec<Manifest> = claimed
            .iter()
            .flat_map(|kind| ctx.index.of_kind(kind))
            .filter(|m| !converted.contains(&(m.kind.clone(), m.name.clone())))
            .cloned()
            .collect();
        if pending.is_empty() {
            return;
        }
        if cycle >= FANOUT_CYCLE_LIMIT {
            ctx.warnings.push(format!(
                "converter fan-out did not converge after {FANOUT_CYCLE_LIMIT} cycles — proceeding"
            ));
            return;
        }
        cycle += 1;

        let mut synthetic = Vec::new();
        for manifest in &pending {
            converted.insert((manifest.kind.clone(), manifest.name.clone()));
            for converter in registry.converters_for(&manifest.kind) {
                match converter.convert(manifest, ctx) {
                    Ok(output) => {
                        ctx.warnings.extend(output.warnings);
                        for (name, service) in output.services {
                            services.insert(name, service);
                        }
                        ingress.extend(output.ingress);
                        synthetic.extend(output.synthetic);
                    }
                    Err(e) => ctx.warnings.push(format!(
                        "extension '{}' failed on {} '{}': {e} — result discarded",
                        converter.name(),
                        manifest.kind,
                        manifest.name
                    )),
                }
            }
        }
        for manifest in synthetic {
            ctx.index.insert(manifest);
        }
    }
}

/// Phase 6: attach `networks.default.aliases` so cluster FQDNs resolve
/// through compose DNS. Sidecars share a namespace and get none.
fn inject_network_aliases(services: &mut ServiceMap, svc_index: &ServiceIndex, ctx: &mut ConvertContext) {
    let network_aliases = svc_index.network_aliases(&ctx.alias_map);
    for (name, aliases) in &network_aliases {
        if aliases.is_empty() {
            continue;
        }
        if let Some(service) = services.get_mut(name) {
            if !service.is_sidecar() {
                let alias_values: Vec<Value> =
                    aliases.iter().cloned().map(Value::String).collect();
                let mut default = Mapping::new();
                default.insert("aliases".into(), Value::Sequence(alias_values));
                let mut networks = Mapping::new();
                networks.insert("default".into(), Value::Mapping(default));
                service.networks = Some(Value::Mapping(networks));
            }
        }
    }

    for (name, service) in services.iter() {
        if service.is_sidecar() || svc_index.get(name).is_none() {
            continue;
        }
        let has_fqdn = network_aliases
            .get(name)
            .is_some_and(|aliases| aliases.iter().any(|a| a.contains(".svc.cluster.local")));
        if !has_fqdn {
            ctx.warnings.push(format!(
                "service '{name}' has no FQDN aliases (namespace unknown) — references by cluster FQDN will not resolve"
            ));
        }
    }
}

/// Phase 8: apply port remapping, user replacements, and placeholder
/// substitution across env values, command arrays, ingress upstreams, and
/// planned file contents. Safe to run on strings that were already
/// rewritten at build time.
fn post_process(services: &mut ServiceMap, ingress: &mut [IngressEntry], ctx: &mut ConvertContext) {
    let replacements = ctx.config.replacements.clone();

    for service in services.values_mut() {
        if let Some(env) = service.environment.as_mut() {
            for (_, value) in env.iter_mut() {
                if let Value::String(s) = value {
                    *s = post_process_text(s, &replacements, &ctx.service_ports, &ctx.index, &ctx.volume_root, &mut ctx.warnings);
                }
            }
        }
        for command in [&mut service.entrypoint, &mut service.command] {
            if let Some(value) = command {
                rewrite::rewrite_strings(value, &mut |s| {
                    post_process_text(s, &replacements, &ctx.service_ports, &ctx.index, &ctx.volume_root, &mut ctx.warnings)
                });
            }
        }
    }

    for entry in ingress.iter_mut() {
        entry.upstream = post_process_text(
            &entry.upstream,
            &replacements,
            &ctx.service_ports,
            &ctx.index,
            &ctx.volume_root,
            &mut ctx.warnings,
        );
    }

    let mut files = std::mem::take(&mut ctx.files);
    for content in files.values_mut() {
        *content = post_process_text(
            content,
            &replacements,
            &ctx.service_ports,
            &ctx.index,
            &ctx.volume_root,
            &mut ctx.warnings,
        );
    }
    ctx.files = files;
}

fn post_process_text(
    text: &str,
    replacements: &[dekube_common::config::Replacement],
    ports: &ServicePortMap,
    index: &ManifestIndex,
    volume_root: &str,
    warnings: &mut Warnings,
) -> String {
    let remapped = rewrite::apply_port_remap(text, ports);
    let replaced = rewrite::apply_replacements(&remapped, replacements);
    rewrite::resolve_placeholders(&replaced, index, volume_root, warnings)
}

/// Named volumes for the compose file: every configured volume without a
/// host path, every PVC the run resolved as a named volume, and Caddy's
/// data volume when the ingress service was emitted.
fn collect_named_volumes(services: &ServiceMap, ctx: &ConvertContext) -> Mapping {
    let mut named: BTreeMap<String, Value> = BTreeMap::new();
    for (name, volume) in &ctx.config.volumes {
        if volume.host_path.is_none() {
            let driver = volume.driver.clone().unwrap_or_else(|| "local".to_string());
            named.insert(
                name.clone(),
                Value::Mapping(dekube_common::yaml::mapping_from([("driver", Value::String(driver))])),
            );
        }
    }
    for pvc in &ctx.pvc_names {
        if !ctx.config.volumes.contains_key(pvc) {
            named.insert(
                pvc.clone(),
                Value::Mapping(dekube_common::yaml::mapping_from([(
                    "driver",
                    Value::String("local".to_string()),
                )])),
            );
        }
    }
    if services.contains_key(caddy::CADDY_SERVICE) {
        let (name, decl) = caddy::caddy_data_volume();
        named.insert(name, decl);
    }

    let mut mapping = Mapping::new();
    for (name, decl) in named {
        mapping.insert(Value::String(name), decl);
    }
    mapping
}

/// Phase 9a: deep-merge config overrides into generated services. A null
/// leaf deletes the key; `$secret:` and `$volume_root` placeholders in
/// override values resolve at merge time.
fn apply_overrides(services: &mut ServiceMap, ctx: &mut ConvertContext) {
    let overrides = ctx.config.overrides.clone();
    for (name_value, override_value) in &overrides {
        let Some(name) = name_value.as_str() else {
            continue;
        };
        let Some(existing) = services.get(name).cloned() else {
            ctx.warnings
                .push(format!("override for '{name}' but no such generated service — skipped"));
            continue;
        };

        let mut resolved = override_value.clone();
        rewrite::rewrite_strings(&mut resolved, &mut |s| {
            rewrite::resolve_placeholders(s, &ctx.index, &ctx.volume_root, &mut ctx.warnings)
        });

        let parent = existing.parent.clone();
        let mut merged_value = match serde_yaml::to_value(&existing) {
            Ok(v) => v,
            Err(e) => {
                ctx.warnings.push(format!("override for '{name}' skipped: {e}"));
                continue;
            }
        };
        deep_merge(&mut merged_value, &resolved);
        match serde_yaml::from_value::<ComposeService>(merged_value) {
            Ok(mut merged) => {
                merged.parent = parent;
                services.insert(name.to_string(), merged);
            }
            Err(e) => ctx.warnings.push(format!(
                "override for '{name}' produced an invalid service shape — skipped ({e})"
            )),
        }
    }
}

/// Phase 9b: append custom services from the config, with placeholder
/// resolution.
fn append_custom_services(services: &mut ServiceMap, ctx: &mut ConvertContext) {
    let custom = ctx.config.services.clone();
    for (name_value, definition) in &custom {
        let Some(name) = name_value.as_str() else {
            continue;
        };
        if services.contains_key(name) {
            ctx.warnings
                .push(format!("custom service '{name}' conflicts with a generated service — overwritten"));
        }
        let mut resolved = definition.clone();
        rewrite::rewrite_strings(&mut resolved, &mut |s| {
            rewrite::resolve_placeholders(s, &ctx.index, &ctx.volume_root, &mut ctx.warnings)
        });
        match serde_yaml::from_value::<ComposeService>(resolved) {
            Ok(service) => {
                services.insert(name.to_string(), service);
            }
            Err(e) => ctx
                .warnings
                .push(format!("custom service '{name}' is not a valid service — skipped ({e})")),
        }
    }
}

/// Phase 9c: drop services matching the exclude patterns, cascading to
/// their init and sidecar services, and drop ingress routes whose upstream
/// pointed at a dropped service.
fn apply_exclusions(services: &mut ServiceMap, ingress: &mut Vec<IngressEntry>, ctx: &mut ConvertContext) {
    let mut patterns = Vec::new();
    for raw in &ctx.config.exclude {
        match glob::Pattern::new(raw) {
            Ok(pattern) => patterns.push(pattern),
            Err(e) => ctx.warnings.push(format!("invalid exclude pattern '{raw}': {e}")),
        }
    }
    if patterns.is_empty() {
        return;
    }

    let matches = |name: &str| patterns.iter().any(|p| p.matches(name));
    let excluded: BTreeSet<String> = services
        .iter()
        .filter(|(name, service)| {
            matches(name) || service.parent.as_deref().is_some_and(&matches)
        })
        .map(|(name, _)| name.clone())
        .collect();
    if excluded.is_empty() {
        return;
    }

    services.retain(|name, _| !excluded.contains(name));
    ingress.retain(|entry| {
        if excluded.contains(entry.upstream_host()) {
            ctx.warnings.push(format!(
                "route {}{} → {} dropped: upstream service is excluded",
                entry.host, entry.path, entry.upstream
            ));
            false
        } else {
            true
        }
    });
}
