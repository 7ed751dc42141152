//! Kubernetes Service indexing
//!
//! Walks `Service` manifests once, after the converter fan-out, and derives
//! the three structures the rest of the pipeline consumes: the alias map
//! (Service name → compose service name of the selected workload), the
//! service-port map (`(service, port-name-or-number)` → numeric container
//! port, with FQDN key variants), and per-service compose network aliases.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;

use dekube_common::extension::{PortRef, ServicePortMap};
use dekube_common::manifest::{Manifest, ManifestIndex};
use dekube_common::yaml;

use crate::rewrite;

/// One Kubernetes Service, reduced to what the pipeline needs.
#[derive(Debug, Clone, Default)]
pub struct ServiceInfo {
    /// Service namespace
    pub namespace: String,
    /// Label selector
    pub selector: BTreeMap<String, String>,
    /// Service type (`ClusterIP` when unset)
    pub service_type: String,
    /// `spec.externalName` for ExternalName services
    pub external_name: String,
    /// Declared ports
    pub ports: Vec<ServicePort>,
}

/// One Service port declaration.
#[derive(Debug, Clone)]
pub struct ServicePort {
    /// Port name, when given
    pub name: Option<String>,
    /// The Service port
    pub port: u16,
    /// `targetPort`, by number or by container-port name
    pub target: Option<PortRef>,
}

/// All Services by name (later manifest wins), plus the label table of
/// workloads they can select.
#[derive(Debug, Default)]
pub struct ServiceIndex {
    services: IndexMap<String, ServiceInfo>,
    workload_labels: Vec<(BTreeMap<String, String>, String)>,
}

impl ServiceIndex {
    /// Build the index from `Service` and workload manifests.
    pub fn build(index: &ManifestIndex) -> Self {
        let mut services = IndexMap::new();
        for manifest in index.of_kind("Service") {
            services.insert(manifest.name.clone(), service_info(manifest));
        }
        let workload_labels = index
            .workloads()
            .map(|m| (m.labels.clone(), m.name.clone()))
            .collect();
        Self { services, workload_labels }
    }

    /// Iterate services in input order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ServiceInfo)> {
        self.services.iter()
    }

    /// Lookup by Service name.
    pub fn get(&self, name: &str) -> Option<&ServiceInfo> {
        self.services.get(name)
    }

    /// The workload a selector matches, ties broken lexicographically.
    pub fn match_selector(&self, selector: &BTreeMap<String, String>) -> Option<&str> {
        if selector.is_empty() {
            return None;
        }
        self.workload_labels
            .iter()
            .filter(|(labels, _)| selector.iter().all(|(k, v)| labels.get(k) == Some(v)))
            .map(|(_, name)| name.as_str())
            .min()
    }

    /// Service name → compose service name, for Services whose name differs
    /// from the workload they select, plus ExternalName services whose
    /// target resolves into the known workload set.
    pub fn alias_map(&self) -> BTreeMap<String, String> {
        let mut aliases = BTreeMap::new();
        for (svc_name, info) in &self.services {
            if let Some(workload) = self.match_selector(&info.selector) {
                if workload != svc_name {
                    aliases.insert(svc_name.clone(), workload.to_string());
                }
            }
        }

        let known: BTreeSet<&str> =
            self.workload_labels.iter().map(|(_, name)| name.as_str()).collect();
        for (svc_name, info) in &self.services {
            if info.service_type != "ExternalName" {
                continue;
            }
            let target = rewrite::strip_dns_suffix(&info.external_name);
            let compose_name = aliases.get(&target).cloned().unwrap_or(target);
            if known.contains(compose_name.as_str()) {
                aliases.insert(svc_name.clone(), compose_name);
            }
        }
        aliases
    }

    /// `(service, port)` → container port, resolving `targetPort` through
    /// the selected workload's container ports, with FQDN key variants so
    /// port remapping matches `svc:80` and `svc.ns.svc.cluster.local:80`
    /// alike.
    pub fn service_port_map(&self, index: &ManifestIndex) -> ServicePortMap {
        let mut container_ports: BTreeMap<String, Vec<(String, u16)>> = BTreeMap::new();
        for manifest in index.workloads() {
            let mut ports = Vec::new();
            for container in manifest.seq_at(&["spec", "template", "spec", "containers"]) {
                for port in yaml::seq_field(container, "ports") {
                    if let Some(number) = yaml::port_field(port, "containerPort") {
                        ports.push((yaml::str_field(port, "name").to_string(), number));
                    }
                }
            }
            container_ports.insert(manifest.name.clone(), ports);
        }

        let mut map = ServicePortMap::new();
        for (svc_name, info) in &self.services {
            let workload = self.match_selector(&info.selector);
            let workload_ports = workload
                .and_then(|w| container_ports.get(w))
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            for port in &info.ports {
                let container = match &port.target {
                    None => port.port,
                    Some(PortRef::Number(n)) => *n,
                    Some(PortRef::Name(name)) => workload_ports
                        .iter()
                        .find(|(n, _)| n == name)
                        .map(|(_, p)| *p)
                        .unwrap_or(port.port),
                };
                map.insert((svc_name.clone(), PortRef::Number(port.port)), container);
                if let Some(name) = &port.name {
                    map.insert((svc_name.clone(), PortRef::Name(name.clone())), container);
                }
            }
        }

        self.expand_fqdn_keys(&mut map);
        map
    }

    fn expand_fqdn_keys(&self, map: &mut ServicePortMap) {
        let mut fqdn_entries = ServicePortMap::new();
        for ((svc_name, port_ref), container) in map.iter() {
            let Some(info) = self.services.get(svc_name) else {
                continue;
            };
            if info.namespace.is_empty() {
                continue;
            }
            for fqdn in fqdn_variants(svc_name, &info.namespace) {
                fqdn_entries.insert((fqdn, port_ref.clone()), *container);
            }
        }
        map.append(&mut fqdn_entries);
    }

    /// Compose network aliases per compose service: the Service name when it
    /// differs from the compose service name, plus FQDN variants when the
    /// namespace is known.
    pub fn network_aliases(&self, alias_map: &BTreeMap<String, String>) -> BTreeMap<String, Vec<String>> {
        let mut aliases: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (svc_name, info) in &self.services {
            let compose_name = alias_map.get(svc_name).cloned().unwrap_or_else(|| svc_name.clone());
            let entries = aliases.entry(compose_name.clone()).or_default();
            if *svc_name != compose_name && !entries.contains(svc_name) {
                entries.push(svc_name.clone());
            }
            if !info.namespace.is_empty() {
                for fqdn in fqdn_variants(svc_name, &info.namespace) {
                    if !entries.contains(&fqdn) {
                        entries.push(fqdn);
                    }
                }
            }
        }
        aliases
    }

    /// Host-published ports for a workload: only Services of type NodePort
    /// or LoadBalancer publish; ClusterIP-only ports never do.
    pub fn published_ports(&self, workload: &str, port_map: &ServicePortMap) -> Vec<String> {
        let mut published = Vec::new();
        for (svc_name, info) in &self.services {
            if info.service_type != "NodePort" && info.service_type != "LoadBalancer" {
                continue;
            }
            if self.match_selector(&info.selector) != Some(workload) {
                continue;
            }
            for port in &info.ports {
                let container = port_map
                    .get(&(svc_name.clone(), PortRef::Number(port.port)))
                    .copied()
                    .unwrap_or(port.port);
                published.push(format!("{}:{}", port.port, container));
            }
        }
        published
    }
}

/// FQDN alias variants for a Service in a namespace.
pub fn fqdn_variants(svc_name: &str, namespace: &str) -> [String; 3] {
    [
        format!("{svc_name}.{namespace}.svc.cluster.local"),
        format!("{svc_name}.{namespace}.svc"),
        format!("{svc_name}.{namespace}"),
    ]
}

fn service_info(manifest: &Manifest) -> ServiceInfo {
    let spec = manifest.spec();
    let mut ports = Vec::new();
    for port in yaml::seq_field(spec, "ports") {
        let Some(number) = yaml::port_field(port, "port") else {
            continue;
        };
        let target = match yaml::field(port, "targetPort") {
            v if v.is_null() => None,
            v => match v.as_u64().and_then(|n| u16::try_from(n).ok()) {
                Some(n) => Some(PortRef::Number(n)),
                None => v.as_str().map(|s| PortRef::Name(s.to_string())),
            },
        };
        let name = yaml::str_field(port, "name");
        ports.push(ServicePort {
            name: (!name.is_empty()).then(|| name.to_string()),
            port: number,
            target,
        });
    }

    let service_type = yaml::str_field(spec, "type");
    ServiceInfo {
        namespace: manifest.namespace.clone(),
        selector: yaml::string_map(yaml::field(spec, "selector")),
        service_type: if service_type.is_empty() { "ClusterIP".to_string() } else { service_type.to_string() },
        external_name: yaml::str_field(spec, "externalName").to_string(),
        ports,
    }
}
