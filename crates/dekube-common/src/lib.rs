//! Shared contracts and data model for the dekube converter
//!
//! dekube turns a directory of rendered Kubernetes manifests into a Docker
//! Compose project. This crate holds everything the engine, the CLI, and
//! third-party extension libraries share: the manifest model and index, the
//! compose-level output model, the persisted project configuration, ingress
//! route entries, and the extension traits.

#![deny(missing_docs)]

pub mod compose;
pub mod config;
pub mod error;
pub mod extension;
pub mod ingress;
pub mod manifest;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
