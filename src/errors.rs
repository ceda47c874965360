// src/errors.rs
use thiserror::Error;

use crate::model::Lang;

/// Startup and configuration failures. Execution outcomes are reported as
/// typed issues by the executors, never through this type.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to serialize JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No {lang} interpreter found, searched: {}", searched.join(", "))]
    InterpreterNotFound { lang: Lang, searched: Vec<String> },

    #[error("Language '{0}' can't be executed")]
    UnsupportedLanguage(Lang),

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
