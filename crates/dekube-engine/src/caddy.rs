//! Caddyfile assembly
//!
//! Groups route entries into one site block per host, most-specific path
//! prefixes first and the catch-all `/` last. HTTPS backends get
//! `transport http { tls }`. The synthesised `caddy` compose service binds
//! the rendered Caddyfile read-only and keeps certificate state in a named
//! volume.

use indexmap::IndexMap;
use serde_yaml::Value;

use dekube_common::compose::ComposeService;
use dekube_common::config::ProjectConfig;
use dekube_common::ingress::{IngressEntry, Scheme};
use dekube_common::yaml;

/// Name of the synthesised ingress compose service.
pub const CADDY_SERVICE: &str = "caddy";

/// Named volume holding Caddy's certificate state.
pub const CADDY_DATA_VOLUME: &str = "caddy-data";

/// Render the full Caddyfile for the collected entries.
pub fn render_caddyfile(entries: &[IngressEntry], config: &ProjectConfig) -> String {
    let mut out = String::new();

    let mut globals = Vec::new();
    if let Some(email) = config.caddy_email() {
        globals.push(format!("\temail {email}"));
    }
    if config.caddy_tls_internal() {
        globals.push("\tlocal_certs".to_string());
    }
    if !globals.is_empty() {
        out.push_str("{\n");
        for line in &globals {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("}\n\n");
    }

    let mut sites: IndexMap<&str, Vec<&IngressEntry>> = IndexMap::new();
    for entry in entries {
        sites.entry(entry.host.as_str()).or_default().push(entry);
    }

    for (host, mut routes) in sites {
        // Longest prefix first, catch-all last; stable for equal lengths
        routes.sort_by_key(|e| {
            if e.path == "/" {
                (usize::MAX, 0)
            } else {
                (0, usize::MAX - e.path.len())
            }
        });

        out.push_str(host);
        out.push_str(" {\n");
        for route in &routes {
            render_route(&mut out, route);
        }
        for route in &routes {
            for directive in &route.extra_directives {
                out.push('\t');
                out.push_str(directive);
                out.push('\n');
            }
        }
        out.push_str("}\n\n");
    }

    out.trim_end().to_string() + "\n"
}

fn render_route(out: &mut String, route: &IngressEntry) {
    let matcher = if route.path == "/" || route.path.is_empty() {
        String::new()
    } else {
        format!("{}* ", route.path.trim_end_matches('*'))
    };

    let tls_transport = route.scheme == Scheme::Https;
    match (&route.strip_prefix, tls_transport) {
        (Some(prefix), _) => {
            // handle_path strips the matcher prefix before proxying
            out.push_str(&format!("\thandle_path {}* {{\n", prefix.trim_end_matches('*')));
            if tls_transport {
                out.push_str(&format!(
                    "\t\treverse_proxy https://{} {{\n\t\t\ttransport http {{\n\t\t\t\ttls\n\t\t\t}}\n\t\t}}\n",
                    route.upstream
                ));
            } else {
                out.push_str(&format!("\t\treverse_proxy {}\n", route.upstream));
            }
            out.push_str("\t}\n");
        }
        (None, true) => {
            out.push_str(&format!(
                "\treverse_proxy {}https://{} {{\n\t\ttransport http {{\n\t\t\ttls\n\t\t}}\n\t}}\n",
                matcher, route.upstream
            ));
        }
        (None, false) => {
            out.push_str(&format!("\treverse_proxy {}{}\n", matcher, route.upstream));
        }
    }
}

/// The compose service running Caddy.
pub fn caddy_service() -> ComposeService {
    ComposeService {
        image: Some("caddy:2-alpine".to_string()),
        restart: Some("unless-stopped".to_string()),
        ports: Some(vec![Value::String("80:80".into()), Value::String("443:443".into())]),
        volumes: Some(vec![
            "./Caddyfile:/etc/caddy/Caddyfile:ro".to_string(),
            format!("{CADDY_DATA_VOLUME}:/data"),
        ]),
        ..Default::default()
    }
}

/// The named-volume declaration backing [`caddy_service`].
pub fn caddy_data_volume() -> (String, Value) {
    (
        CADDY_DATA_VOLUME.to_string(),
        Value::Mapping(yaml::mapping_from([("driver", Value::String("local".into()))])),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Mapping;

    fn entry(host: &str, path: &str, upstream: &str) -> IngressEntry {
        IngressEntry::new(host, path, upstream)
    }

    #[test]
    fn sites_group_by_host() {
        let entries = vec![
            entry("a.example.com", "/", "web:80"),
            entry("b.example.com", "/", "api:3000"),
        ];
        let out = render_caddyfile(&entries, &ProjectConfig::default());
        assert!(out.contains("a.example.com {\n\treverse_proxy web:80\n}"));
        assert!(out.contains("b.example.com {\n\treverse_proxy api:3000\n}"));
    }

    #[test]
    fn specific_paths_come_before_catch_all() {
        let entries = vec![
            entry("app.example.com", "/", "web:80"),
            entry("app.example.com", "/api", "api:3000"),
            entry("app.example.com", "/api/v2", "api2:3000"),
        ];
        let out = render_caddyfile(&entries, &ProjectConfig::default());
        let api_v2 = out.find("/api/v2*").unwrap();
        let api = out.find("reverse_proxy /api* ").unwrap();
        let root = out.find("reverse_proxy web:80").unwrap();
        assert!(api_v2 < api);
        assert!(api < root);
    }

    #[test]
    fn https_backend_carries_tls_transport() {
        let mut e = entry("secure.example.com", "/", "vault:8200");
        e.scheme = Scheme::Https;
        let out = render_caddyfile(&[e], &ProjectConfig::default());
        assert!(out.contains("reverse_proxy https://vault:8200 {"));
        assert!(out.contains("transport http {\n\t\t\ttls\n\t\t}"));
    }

    #[test]
    fn global_options_from_config() {
        let mut config = ProjectConfig::default();
        let mut caddy = Mapping::new();
        caddy.insert("email".into(), "ops@example.com".into());
        caddy.insert("tls_internal".into(), true.into());
        config.extensions.insert("caddy".into(), Value::Mapping(caddy));

        let out = render_caddyfile(&[entry("a.example.com", "/", "web:80")], &config);
        assert!(out.starts_with("{\n\temail ops@example.com\n\tlocal_certs\n}"));
    }

    #[test]
    fn strip_prefix_uses_handle_path() {
        let mut e = entry("app.example.com", "/media", "minio:9000");
        e.strip_prefix = Some("/media".to_string());
        let out = render_caddyfile(&[e], &ProjectConfig::default());
        assert!(out.contains("handle_path /media* {\n\t\treverse_proxy minio:9000\n\t}"));
    }

    #[test]
    fn caddy_service_shape() {
        let svc = caddy_service();
        assert_eq!(svc.image.as_deref(), Some("caddy:2-alpine"));
        assert!(svc.volumes.as_ref().unwrap().iter().any(|v| v.contains("Caddyfile")));
    }
}
