//! Workload building
//!
//! One workload manifest (DaemonSet, Deployment, StatefulSet, Job) expands
//! into up to three families of compose services: the main container keeps
//! the workload name, init containers become `{workload}-init-{container}`
//! one-shot services, and the remaining containers become
//! `{workload}-{container}` sidecars that join the main service's network
//! namespace via `network_mode: container:{workload}` (and therefore carry
//! no `ports` or `networks` of their own).

use serde_yaml::Value;

use dekube_common::compose::{ComposeService, ServiceMap};
use dekube_common::extension::ConvertContext;
use dekube_common::manifest::Manifest;
use dekube_common::yaml;

use crate::env;
use crate::services::ServiceIndex;
use crate::volumes;

/// Linux hostname length limit; longer service names get an explicit
/// truncated hostname to avoid sethostname failures at container start.
pub const HOSTNAME_MAX: usize = 63;

/// Build all compose services for one workload manifest.
pub fn build_workload(
    manifest: &Manifest,
    svc_index: &ServiceIndex,
    ctx: &mut ConvertContext,
) -> ServiceMap {
    let mut services = ServiceMap::new();
    let workload = manifest.name.clone();
    let pod_spec = manifest.pod_spec().clone();
    let claim_templates: Vec<Value> = manifest.seq_at(&["spec", "volumeClaimTemplates"]).to_vec();

    let containers = yaml::seq_field(&pod_spec, "containers").to_vec();
    if containers.is_empty() {
        ctx.warnings
            .push(format!("workload '{workload}' has no containers — skipped"));
        return services;
    }

    let one_shot = manifest.kind == "Job";
    let restart = if one_shot { "on-failure" } else { "unless-stopped" };

    let mut main = build_container(&containers[0], &pod_spec, &claim_templates, &workload, ctx);
    main.restart = Some(restart.to_string());
    main.ports = {
        let published = svc_index.published_ports(&workload, &ctx.service_ports);
        (!published.is_empty()).then(|| published.into_iter().map(Value::String).collect())
    };
    if containers.len() > 1 {
        // Sidecars join this container's namespace by name
        main.container_name = Some(workload.clone());
    }
    services.insert(workload.clone(), main);

    for init in yaml::seq_field(&pod_spec, "initContainers") {
        let container_name = yaml::str_field(init, "name");
        let mut service = build_container(init, &pod_spec, &claim_templates, &workload, ctx);
        service.restart = Some("on-failure".to_string());
        service.parent = Some(workload.clone());
        services.insert(format!("{workload}-init-{container_name}"), service);
    }

    for sidecar in &containers[1..] {
        let container_name = yaml::str_field(sidecar, "name");
        let mut service = build_container(sidecar, &pod_spec, &claim_templates, &workload, ctx);
        service.restart = Some(restart.to_string());
        service.network_mode = Some(format!("container:{workload}"));
        service.parent = Some(workload.clone());
        service.ports = None;
        services.insert(format!("{workload}-{container_name}"), service);
    }

    services
}

/// Build one container into a compose service (image, env, command,
/// volumes). Ports, restart policy and naming are the caller's concern.
fn build_container(
    container: &Value,
    pod_spec: &Value,
    claim_templates: &[Value],
    workload: &str,
    ctx: &mut ConvertContext,
) -> ComposeService {
    let environment = env::resolve_env(
        container,
        &ctx.index,
        workload,
        &ctx.service_ports,
        &ctx.config.replacements,
        &mut ctx.warnings,
    );
    let (entrypoint, command) = env::convert_command(container, &environment);
    let mounts = volumes::convert_volume_mounts(container, pod_spec, claim_templates, workload, ctx);

    let image = yaml::str_field(container, "image");
    ComposeService {
        image: (!image.is_empty()).then(|| image.to_string()),
        entrypoint,
        command,
        environment: (!environment.is_empty()).then_some(environment),
        volumes: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    }
}

/// Truncate a service name to a valid hostname: right-trim to 63
/// characters, then keep trimming while the cut ends on a non-alphanumeric.
pub fn truncate_hostname(name: &str) -> String {
    let mut cut: String = name.chars().take(HOSTNAME_MAX).collect();
    while cut
        .chars()
        .last()
        .is_some_and(|c| !c.is_ascii_alphanumeric())
    {
        cut.pop();
    }
    cut
}

/// Set an explicit hostname on every service whose name exceeds the limit.
pub fn truncate_hostnames(services: &mut ServiceMap) {
    for (name, service) in services.iter_mut() {
        if name.len() > HOSTNAME_MAX && service.hostname.is_none() {
            service.hostname = Some(truncate_hostname(name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use dekube_common::config::ProjectConfig;
    use dekube_common::extension::Warnings;
    use dekube_common::manifest::ManifestIndex;
    use dekube_common::yaml::parse_yaml_multi;

    fn run(manifests: &str) -> (ServiceMap, ConvertContext) {
        let mut warnings = Warnings::default();
        let index =
            ManifestIndex::build(parse_yaml_multi(manifests).unwrap(), &BTreeSet::new(), &mut warnings);
        let svc_index = ServiceIndex::build(&index);
        let mut ctx = ConvertContext::new(index, ProjectConfig::default(), false);
        ctx.service_ports = svc_index.service_port_map(&ctx.index);
        ctx.alias_map = svc_index.alias_map();

        let mut services = ServiceMap::new();
        let workloads: Vec<Manifest> = ctx.index.workloads().cloned().collect();
        for manifest in &workloads {
            services.extend(build_workload(manifest, &svc_index, &mut ctx));
        }
        (services, ctx)
    }

    #[test]
    fn minimal_deployment_builds_one_service() {
        let (services, _) = run(
            "kind: Deployment\nmetadata: {name: web, labels: {app: web}}\nspec:\n  template:\n    spec:\n      containers:\n      - {name: web, image: 'nginx:1.25', env: [{name: FOO, value: bar}]}\n---\nkind: Service\nmetadata: {name: web}\nspec:\n  selector: {app: web}\n  ports: [{port: 80}]\n",
        );
        let web = &services["web"];
        assert_eq!(web.image.as_deref(), Some("nginx:1.25"));
        assert_eq!(
            web.environment.as_ref().unwrap().get("FOO").and_then(Value::as_str),
            Some("bar")
        );
        // ClusterIP-only: no host-published ports
        assert!(web.ports.is_none());
        assert_eq!(web.restart.as_deref(), Some("unless-stopped"));
        assert!(web.container_name.is_none());
    }

    #[test]
    fn job_restarts_on_failure() {
        let (services, _) = run(
            "kind: Job\nmetadata: {name: db-migrate}\nspec:\n  template:\n    spec:\n      containers:\n      - {name: migrate, image: 'mig:1'}\n",
        );
        assert_eq!(services["db-migrate"].restart.as_deref(), Some("on-failure"));
    }

    #[test]
    fn init_and_sidecar_containers_expand() {
        let (services, _) = run(
            "kind: Deployment\nmetadata: {name: app}\nspec:\n  template:\n    spec:\n      initContainers:\n      - {name: setup, image: 'busybox'}\n      containers:\n      - {name: app, image: 'app:1'}\n      - {name: log, image: 'fluentd:1'}\n",
        );
        assert_eq!(services.len(), 3);

        let init = &services["app-init-setup"];
        assert_eq!(init.restart.as_deref(), Some("on-failure"));
        assert_eq!(init.parent.as_deref(), Some("app"));

        let sidecar = &services["app-log"];
        assert_eq!(sidecar.network_mode.as_deref(), Some("container:app"));
        assert!(sidecar.ports.is_none());
        assert!(sidecar.networks.is_none());

        // The main service pins its container name for the sidecar reference
        assert_eq!(services["app"].container_name.as_deref(), Some("app"));
    }

    #[test]
    fn node_port_services_publish_host_ports() {
        let (services, _) = run(
            "kind: Deployment\nmetadata: {name: web, labels: {app: web}}\nspec:\n  template:\n    spec:\n      containers:\n      - name: web\n        image: nginx\n        ports: [{containerPort: 8080}]\n---\nkind: Service\nmetadata: {name: web}\nspec:\n  type: NodePort\n  selector: {app: web}\n  ports: [{port: 80, targetPort: 8080}]\n",
        );
        let ports = services["web"].ports.as_ref().unwrap();
        assert_eq!(ports[0].as_str(), Some("80:8080"));
    }

    #[test]
    fn workload_without_containers_warns() {
        let (services, ctx) = run("kind: Deployment\nmetadata: {name: empty}\nspec: {}\n");
        assert!(services.is_empty());
        assert_eq!(ctx.warnings.items().len(), 1);
    }

    #[test]
    fn hostname_truncation_trims_trailing_separators() {
        let long = format!("{}-x", "a".repeat(62));
        assert_eq!(truncate_hostname(&long).len(), 62);
        assert_eq!(truncate_hostname(&long), "a".repeat(62));

        let plain = "b".repeat(80);
        assert_eq!(truncate_hostname(&plain), "b".repeat(63));
    }

    #[test]
    fn long_service_names_get_explicit_hostname() {
        let name = "x".repeat(70);
        let mut services = ServiceMap::new();
        services.insert(name.clone(), ComposeService::default());
        truncate_hostnames(&mut services);
        let hostname = services[&name].hostname.as_deref().unwrap();
        assert_eq!(hostname.len(), HOSTNAME_MAX);
    }
}
