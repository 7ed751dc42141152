//! Error types shared across the dekube crates
//!
//! Only two failure classes abort a run: unreadable input and a corrupt
//! project config. Everything else is reported through the warning sink and
//! the pipeline proceeds.

use thiserror::Error;

/// Main error type for dekube operations
#[derive(Debug, Error)]
pub enum Error {
    /// Input directory or file could not be read
    #[error("unreadable input [{path}]: {message}")]
    Input {
        /// Path that failed to read
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Project configuration could not be parsed
    #[error("malformed project config [{path}]: {message}")]
    Config {
        /// Path of the config file
        path: String,
        /// Description of what's invalid
        message: String,
    },

    /// YAML document could not be parsed
    #[error("yaml error: {message}")]
    Yaml {
        /// Description of what failed
        message: String,
        /// Source file, when known
        file: Option<String>,
    },

    /// Extension library failed to load or register
    #[error("extension error [{extension}]: {message}")]
    Extension {
        /// Extension name or library path
        extension: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization of an output artifact failed
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Underlying I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an unreadable-input error with path context
    pub fn input(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Input {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a malformed-config error with path context
    pub fn config(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a YAML parse error without file context
    pub fn yaml(message: impl Into<String>) -> Self {
        Self::Yaml {
            message: message.into(),
            file: None,
        }
    }

    /// Create an extension error tagged with the extension name
    pub fn extension(extension: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extension {
            extension: extension.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}
