//! Extension registry
//!
//! Holds the converters, transforms, and ingress rewriters contributed by
//! extension libraries, each sorted by `(priority, registration order)`.
//! The registry starts empty; nothing in the engine registers itself, so
//! test suites inject fake extension sets and the CLI loads plugin
//! libraries from `--extensions-dir`.
//!
//! Extension libraries are dynamic libraries exporting
//! `dekube_extension_register(&mut ExtensionSet)`. The directory scan picks
//! up library files directly inside the directory and one level into
//! subdirectories. A library that fails to open or lacks the entry symbol
//! is dropped with a warning; the run continues.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use libloading::Library;
use tracing::info;

use dekube_common::extension::{
    Converter, ExtensionSet, IngressRewriter, RegisterFn, Transform, Warnings, REGISTER_SYMBOL,
};

struct Entry<T: ?Sized> {
    priority: i32,
    order: usize,
    inner: Box<T>,
}

/// Priority-ordered registries of loaded extensions.
#[derive(Default)]
pub struct ExtensionRegistry {
    converters: Vec<Entry<dyn Converter>>,
    transforms: Vec<Entry<dyn Transform>>,
    rewriters: Vec<Entry<dyn IngressRewriter>>,
    // Loaded plugin libraries stay alive as long as their trait objects do.
    libraries: Vec<Library>,
}

impl ExtensionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one converter.
    pub fn register_converter(&mut self, converter: Box<dyn Converter>) {
        let entry = Entry {
            priority: converter.priority(),
            order: self.converters.len(),
            inner: converter,
        };
        self.converters.push(entry);
        self.converters.sort_by_key(|e| (e.priority, e.order));
    }

    /// Register one transform.
    pub fn register_transform(&mut self, transform: Box<dyn Transform>) {
        let entry = Entry {
            priority: transform.priority(),
            order: self.transforms.len(),
            inner: transform,
        };
        self.transforms.push(entry);
        self.transforms.sort_by_key(|e| (e.priority, e.order));
    }

    /// Register one ingress rewriter.
    pub fn register_rewriter(&mut self, rewriter: Box<dyn IngressRewriter>) {
        let entry = Entry {
            priority: rewriter.priority(),
            order: self.rewriters.len(),
            inner: rewriter,
        };
        self.rewriters.push(entry);
        self.rewriters.sort_by_key(|e| (e.priority, e.order));
    }

    /// Move an extension set's registrations into the registry.
    pub fn extend(&mut self, set: ExtensionSet) {
        for converter in set.converters {
            self.register_converter(converter);
        }
        for transform in set.transforms {
            self.register_transform(transform);
        }
        for rewriter in set.rewriters {
            self.register_rewriter(rewriter);
        }
    }

    /// All kinds claimed by registered converters.
    pub fn claimed_kinds(&self) -> BTreeSet<String> {
        self.converters
            .iter()
            .flat_map(|e| e.inner.kinds())
            .collect()
    }

    /// Converters claiming a kind, in priority order.
    pub fn converters_for(&self, kind: &str) -> Vec<&dyn Converter> {
        self.converters
            .iter()
            .filter(|e| e.inner.kinds().iter().any(|k| k == kind))
            .map(|e| e.inner.as_ref())
            .collect()
    }

    /// All transforms, in priority order.
    pub fn transforms(&self) -> impl Iterator<Item = &dyn Transform> {
        self.transforms.iter().map(|e| e.inner.as_ref())
    }

    /// All ingress rewriters, in priority order.
    pub fn rewriters(&self) -> Vec<&dyn IngressRewriter> {
        self.rewriters.iter().map(|e| e.inner.as_ref()).collect()
    }

    /// Whether any rewriters are registered.
    pub fn has_rewriters(&self) -> bool {
        !self.rewriters.is_empty()
    }

    /// Load every extension library under `dir`. Failures warn and skip.
    pub fn load_dir(&mut self, dir: &Path, warnings: &mut Warnings) {
        for path in discover_libraries(dir, warnings) {
            match self.load_library(&path) {
                Ok(()) => {}
                Err(message) => {
                    warnings.push(format!("failed to load extension {}: {message}", path.display()))
                }
            }
        }
        self.log_loaded();
    }

    fn load_library(&mut self, path: &Path) -> Result<(), String> {
        // SAFETY: loading runs arbitrary library initialisation; extension
        // libraries must be built against the same contract crate and
        // toolchain as this binary.
        let library = unsafe { Library::new(path) }.map_err(|e| e.to_string())?;
        let mut set = ExtensionSet::default();
        unsafe {
            let register: libloading::Symbol<RegisterFn> =
                library.get(REGISTER_SYMBOL).map_err(|e| e.to_string())?;
            register(&mut set);
        }
        if set.is_empty() {
            return Err("library registered nothing".to_string());
        }
        self.extend(set);
        self.libraries.push(library);
        Ok(())
    }

    fn log_loaded(&self) {
        if !self.converters.is_empty() {
            let loaded: Vec<String> = self
                .converters
                .iter()
                .map(|e| format!("{} ({})", e.inner.name(), e.inner.kinds().join(", ")))
                .collect();
            info!("loaded converters: {}", loaded.join(", "));
        }
        if !self.transforms.is_empty() {
            let loaded: Vec<&str> = self.transforms.iter().map(|e| e.inner.name()).collect();
            info!("loaded transforms: {}", loaded.join(", "));
        }
        if !self.rewriters.is_empty() {
            let loaded: Vec<&str> = self.rewriters.iter().map(|e| e.inner.name()).collect();
            info!("loaded rewriters: {}", loaded.join(", "));
        }
    }
}

/// Dynamic-library extensions on this platform.
fn is_library(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("so") | Some("dylib") | Some("dll")
    )
}

fn hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') || n.starts_with('_'))
}

/// Library files directly in `dir`, plus one level into subdirectories,
/// in sorted order.
fn discover_libraries(dir: &Path, warnings: &mut Warnings) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        warnings.push(format!("extensions directory not readable: {}", dir.display()));
        return found;
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    paths.sort();

    for path in paths {
        if hidden(&path) {
            continue;
        }
        if path.is_file() && is_library(&path) {
            found.push(path);
        } else if path.is_dir() {
            let Ok(sub_entries) = fs::read_dir(&path) else {
                continue;
            };
            let mut subs: Vec<PathBuf> = sub_entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
            subs.sort();
            for sub in subs {
                if !hidden(&sub) && sub.is_file() && is_library(&sub) {
                    found.push(sub);
                }
            }
        }
    }
    found
}
