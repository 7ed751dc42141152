//! dekube CLI library
//!
//! Wires the phases together: load extensions, render or read manifests,
//! index, run the pipeline, and emit the outputs with the documented exit
//! codes (0 success, 1 fatal error, 2 empty output).

pub mod error;
pub mod ingest;
pub mod output;

pub use error::{Error, Result};

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use tracing::{info, warn};

use dekube_common::config::{load_config, save_config, ProjectConfig, CONFIG_FILE_NAME};
use dekube_common::extension::Warnings;
use dekube_common::manifest::ManifestIndex;
use dekube_engine::ExtensionRegistry;

/// Workload name fragments auto-excluded on the first run; these exist to
/// serve the cluster itself and have no compose counterpart.
const AUTO_EXCLUDE_PATTERNS: &[&str] = &["cert-manager", "ingress", "reflector"];

/// Exit code for a successful run.
pub const EXIT_OK: u8 = 0;

/// Exit code for a run that completed but produced no compose services.
pub const EXIT_EMPTY: u8 = 2;

/// Convert rendered Kubernetes manifests to a Compose project
#[derive(Parser, Debug)]
#[command(name = "dekube")]
#[command(version, about, long_about = None)]
#[command(group(ArgGroup::new("input").required(true)))]
pub struct Cli {
    /// Directory containing helmfile.yaml; rendered via `helmfile template`
    #[arg(long, group = "input")]
    pub helmfile_dir: Option<PathBuf>,

    /// Skip rendering and read pre-rendered manifests from this directory
    #[arg(long, group = "input")]
    pub from_dir: Option<PathBuf>,

    /// Environment passed to the renderer (e.g. local, production)
    #[arg(short, long)]
    pub environment: Option<String>,

    /// Target directory for the compose file, Caddyfile, and project config
    #[arg(long)]
    pub output_dir: PathBuf,

    /// Name of the generated compose file
    #[arg(long, default_value = "compose.yml")]
    pub compose_file: String,

    /// Load extension libraries from this directory
    #[arg(long)]
    pub extensions_dir: Option<PathBuf>,
}

impl Cli {
    /// Run the conversion. Returns the process exit code.
    pub fn run(self) -> Result<u8> {
        fs::create_dir_all(&self.output_dir)?;
        let mut warnings = Warnings::default();

        let mut registry = ExtensionRegistry::new();
        if let Some(dir) = &self.extensions_dir {
            if !dir.is_dir() {
                return Err(Error::validation(format!(
                    "extensions directory not found: {}",
                    dir.display()
                )));
            }
            registry.load_dir(dir, &mut warnings);
        }

        // Step 1: obtain rendered manifests
        let (rendered_dir, release_ns, source_dir) = match (&self.from_dir, &self.helmfile_dir) {
            (Some(dir), _) => (dir.clone(), BTreeMap::new(), dir.clone()),
            (None, Some(dir)) => {
                let (rendered, release_ns) =
                    ingest::run_helmfile_template(dir, &self.output_dir, self.environment.as_deref())?;
                (rendered, release_ns, dir.clone())
            }
            (None, None) => {
                return Err(Error::validation("one of --helmfile-dir or --from-dir is required"))
            }
        };

        // Step 2: parse and index
        let mut docs = ingest::read_manifest_dir(&rendered_dir, &mut warnings)?;
        ingest::infer_namespaces(&mut docs, &release_ns);
        let index = ManifestIndex::build(
            docs.into_iter().map(|d| d.value).collect(),
            &registry.claimed_kinds(),
            &mut warnings,
        );
        info!("parsed manifests: {:?}", index.kind_counts());

        // Step 3: load the project config
        let config_path = self.output_dir.join(CONFIG_FILE_NAME);
        let first_run = !config_path.exists();
        let (mut config, migrated) = load_config(&config_path)?;
        if migrated {
            info!("project config migrated to current key names in memory");
        }
        if first_run {
            init_first_run(&mut config, &index, &source_dir);
        }

        // Step 4: convert
        let conversion = dekube_engine::run(index, config, &registry, first_run);

        // Step 5: emit warnings
        for warning in warnings.items().iter().chain(conversion.warnings.iter()) {
            warn!("{warning}");
        }

        // Step 6: write outputs
        if conversion.services.is_empty() {
            warn!("no services generated, nothing to write");
            return Ok(EXIT_EMPTY);
        }
        output::write_compose(&conversion, &self.output_dir, &self.compose_file)?;
        if !conversion.ingress.is_empty() {
            output::write_caddyfile(&conversion, &self.output_dir)?;
        }
        output::write_files(&conversion, &self.output_dir)?;
        save_config(&config_path, &conversion.config)?;
        info!("wrote {}", config_path.display());

        if first_run {
            info!(
                "first run: {} was created and likely needs manual edits; review the exclude list and volume mappings, then re-run",
                CONFIG_FILE_NAME
            );
        }
        Ok(EXIT_OK)
    }
}

/// First run: name the project after the source directory and exclude
/// workloads that only make sense inside a cluster.
fn init_first_run(config: &mut ProjectConfig, index: &ManifestIndex, source_dir: &std::path::Path) {
    let name = source_dir
        .canonicalize()
        .unwrap_or_else(|_| source_dir.to_path_buf())
        .file_name()
        .and_then(|n| n.to_str())
        .map(String::from);
    config.name = name;

    for manifest in index.workloads() {
        if AUTO_EXCLUDE_PATTERNS.iter().any(|p| manifest.name.contains(p))
            && !config.exclude.contains(&manifest.name)
        {
            config.exclude.push(manifest.name.clone());
        }
    }
    if !config.exclude.is_empty() {
        info!("auto-excluded cluster-only workloads: {}", config.exclude.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use tempfile::TempDir;

    fn write_manifests(dir: &std::path::Path, text: &str) {
        fs::write(dir.join("manifests.yaml"), text).unwrap();
    }

    fn cli(from: &std::path::Path, out: &std::path::Path) -> Cli {
        Cli {
            helmfile_dir: None,
            from_dir: Some(from.to_path_buf()),
            environment: None,
            output_dir: out.to_path_buf(),
            compose_file: "compose.yml".to_string(),
            extensions_dir: None,
        }
    }

    #[test]
    fn end_to_end_from_dir() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_manifests(
            input.path(),
            "kind: Deployment\nmetadata: {name: web, namespace: default, labels: {app: web}}\nspec:\n  template:\n    spec:\n      containers:\n      - {name: web, image: 'nginx:1.25'}\n---\nkind: Service\nmetadata: {name: web, namespace: default}\nspec:\n  selector: {app: web}\n  ports: [{port: 80}]\n",
        );

        let code = cli(input.path(), out.path()).run().unwrap();
        assert_eq!(code, EXIT_OK);

        let compose = fs::read_to_string(out.path().join("compose.yml")).unwrap();
        assert!(compose.contains("web:"));
        assert!(compose.contains("image: nginx:1.25"));
        assert!(out.path().join(CONFIG_FILE_NAME).exists());
        // ClusterIP only: no Caddyfile without ingress manifests
        assert!(!out.path().join("Caddyfile").exists());
    }

    #[test]
    fn empty_output_exits_two() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_manifests(input.path(), "kind: ConfigMap\nmetadata: {name: only}\ndata: {}\n");
        let code = cli(input.path(), out.path()).run().unwrap();
        assert_eq!(code, EXIT_EMPTY);
    }

    #[test]
    fn unreadable_input_is_fatal() {
        let out = TempDir::new().unwrap();
        let result = cli(std::path::Path::new("/nonexistent/input"), out.path()).run();
        assert!(result.is_err());
    }

    #[test]
    fn missing_extensions_dir_is_fatal() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let mut cli = cli(input.path(), out.path());
        cli.extensions_dir = Some(PathBuf::from("/nonexistent/extensions"));
        assert!(cli.run().is_err());
    }

    #[test]
    fn first_run_auto_excludes_cluster_workloads() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_manifests(
            input.path(),
            "kind: Deployment\nmetadata: {name: cert-manager-webhook}\nspec:\n  template:\n    spec:\n      containers: [{name: c, image: x}]\n---\nkind: Deployment\nmetadata: {name: app}\nspec:\n  template:\n    spec:\n      containers: [{name: a, image: y}]\n",
        );
        cli(input.path(), out.path()).run().unwrap();

        let config_text = fs::read_to_string(out.path().join(CONFIG_FILE_NAME)).unwrap();
        assert!(config_text.contains("cert-manager-webhook"));
        let compose = fs::read_to_string(out.path().join("compose.yml")).unwrap();
        assert!(!compose.contains("cert-manager-webhook"));
        assert!(compose.contains("app:"));
    }

    #[test]
    fn config_survives_reruns() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_manifests(
            input.path(),
            "kind: Deployment\nmetadata: {name: app}\nspec:\n  template:\n    spec:\n      containers: [{name: a, image: y}]\n",
        );
        cli(input.path(), out.path()).run().unwrap();
        let first = fs::read_to_string(out.path().join(CONFIG_FILE_NAME)).unwrap();
        cli(input.path(), out.path()).run().unwrap();
        let second = fs::read_to_string(out.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(first, second);
    }
}
