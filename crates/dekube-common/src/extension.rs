//! Extension contracts
//!
//! Everything a converter, transform, or ingress rewriter needs to
//! interoperate with the pipeline lives here, so plugin crates depend on
//! this crate alone. Detection of provider output is structural: a converter
//! result that carries services *is* a provider result, regardless of which
//! build of the contract types produced it.

use std::collections::{BTreeMap, BTreeSet};

use serde_yaml::Value;

use crate::compose::ServiceMap;
use crate::config::ProjectConfig;
use crate::error::Error;
use crate::ingress::IngressEntry;
use crate::manifest::{Manifest, ManifestIndex};

/// Default priority for registry entries; lower runs first.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Append-only, insertion-ordered warning sink.
#[derive(Debug, Default, Clone)]
pub struct Warnings {
    items: Vec<String>,
}

impl Warnings {
    /// Append one warning.
    pub fn push(&mut self, warning: impl Into<String>) {
        self.items.push(warning.into());
    }

    /// Append many warnings.
    pub fn extend(&mut self, warnings: impl IntoIterator<Item = String>) {
        self.items.extend(warnings);
    }

    /// All warnings, in insertion order.
    pub fn items(&self) -> &[String] {
        &self.items
    }

    /// Consume the sink.
    pub fn into_vec(self) -> Vec<String> {
        self.items
    }
}

/// A Service port reference: by number or by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortRef {
    /// Numeric service port
    Number(u16),
    /// Named service port
    Name(String),
}

/// `(service name, port-name-or-number)` → numeric container port.
pub type ServicePortMap = BTreeMap<(String, PortRef), u16>;

/// Read-mostly state shared with every extension call.
///
/// Created once per run and grows monotonically: the alias map and
/// service-port map are populated after the converter fan-out, before any
/// transform or ingress rewriter runs.
#[derive(Debug)]
pub struct ConvertContext {
    /// The manifest index; mutated only by synthetic insertions during the
    /// converter fan-out, serialized by the driver
    pub index: ManifestIndex,
    /// The project configuration
    pub config: ProjectConfig,
    /// Kubernetes Service name → compose service name of the workload
    pub alias_map: BTreeMap<String, String>,
    /// `(service, port-name-or-number)` → numeric container port
    pub service_ports: ServicePortMap,
    /// Resolved volume root
    pub volume_root: String,
    /// Ingress class → canonical rewriter name
    pub ingress_types: BTreeMap<String, String>,
    /// Append-only warning sink
    pub warnings: Warnings,
    /// Planned output files (relative path → contents); written at emit time
    pub files: BTreeMap<String, String>,
    /// PVC claim names discovered while resolving volumes
    pub pvc_names: BTreeSet<String>,
    /// ConfigMap/Secret names already materialised into the file plan
    pub materialised: BTreeSet<String>,
    /// Whether this is the first run (no project config existed)
    pub first_run: bool,
}

impl ConvertContext {
    /// Build the context for a run.
    pub fn new(index: ManifestIndex, config: ProjectConfig, first_run: bool) -> Self {
        let volume_root = config.volume_root.clone();
        let ingress_types = config.ingress_types.clone();
        Self {
            index,
            config,
            alias_map: BTreeMap::new(),
            service_ports: ServicePortMap::new(),
            volume_root,
            ingress_types,
            warnings: Warnings::default(),
            files: BTreeMap::new(),
            pvc_names: BTreeSet::new(),
            materialised: BTreeSet::new(),
            first_run,
        }
    }
}

/// Output of one converter invocation.
///
/// A plain converter returns synthetic manifests and warnings; a provider
/// additionally returns compose services and ingress entries. The driver
/// does not distinguish the two nominally; it consumes whatever
/// capabilities are present.
#[derive(Debug, Default)]
pub struct ConverterOutput {
    /// Virtual manifests injected back into the index for re-evaluation
    pub synthetic: Vec<Manifest>,
    /// Compose services produced directly
    pub services: ServiceMap,
    /// Ingress entries injected directly
    pub ingress: Vec<IngressEntry>,
    /// Warnings raised by this call
    pub warnings: Vec<String>,
}

impl ConverterOutput {
    /// Whether this output carries the provider capability.
    pub fn is_provider(&self) -> bool {
        !self.services.is_empty()
    }
}

/// A converter claims manifest kinds and maps each manifest to output.
pub trait Converter {
    /// Extension name, used for warning tags and config sections.
    fn name(&self) -> &str;

    /// The manifest kinds this converter claims.
    fn kinds(&self) -> Vec<String>;

    /// Registry ordering; lower runs first.
    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    /// Convert one manifest. Errors discard this call's output and warn.
    fn convert(&self, manifest: &Manifest, ctx: &mut ConvertContext) -> Result<ConverterOutput, Error>;
}

/// A transform post-processes the full compose and ingress set.
pub trait Transform {
    /// Extension name, used for warning tags.
    fn name(&self) -> &str;

    /// Registry ordering; lower runs first.
    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    /// Mutate the accumulated services and ingress entries.
    fn transform(&self, services: &mut ServiceMap, ingress: &mut Vec<IngressEntry>, ctx: &mut ConvertContext);
}

/// An ingress rewriter translates one controller dialect into routes.
pub trait IngressRewriter {
    /// Canonical rewriter name matched against the resolved ingress class.
    fn name(&self) -> &str;

    /// Registry ordering; lower runs first.
    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    /// Whether this rewriter handles the manifest. On `false` the dispatch
    /// falls through to the next rewriter with the same canonical name.
    fn matches(&self, manifest: &Manifest) -> bool;

    /// Convert one Ingress manifest into route entries.
    fn rewrite(&self, manifest: &Manifest, ctx: &mut ConvertContext) -> Result<Vec<IngressEntry>, Error>;
}

/// The registrations one extension library contributes.
#[derive(Default)]
pub struct ExtensionSet {
    /// Converters to register
    pub converters: Vec<Box<dyn Converter>>,
    /// Transforms to register
    pub transforms: Vec<Box<dyn Transform>>,
    /// Ingress rewriters to register
    pub rewriters: Vec<Box<dyn IngressRewriter>>,
}

impl ExtensionSet {
    /// True when nothing was registered.
    pub fn is_empty(&self) -> bool {
        self.converters.is_empty() && self.transforms.is_empty() && self.rewriters.is_empty()
    }
}

/// Symbol every extension library must export.
pub const REGISTER_SYMBOL: &[u8] = b"dekube_extension_register";

/// Signature of the exported registration entry point.
///
/// Extension libraries must be built with the same toolchain as the host
/// binary; trait objects cross this boundary.
#[allow(improper_ctypes_definitions)]
pub type RegisterFn = unsafe extern "C" fn(&mut ExtensionSet);

/// Helper for rewriters and converters reading extension config: the raw
/// `extensions.<name>` section, or null.
pub fn extension_section<'a>(ctx: &'a ConvertContext, name: &str) -> &'a Value {
    static NULL: Value = Value::Null;
    ctx.config.extension_config(name).unwrap_or(&NULL)
}
