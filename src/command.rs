// src/command.rs
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::errors::{Result, SandboxError};
use crate::model::Lang;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("raw code shouldn't be blank")]
    BlankCode,
    #[error("script path shouldn't be blank")]
    BlankPath,
}

/// How the generated script reaches the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandMode {
    /// `[interpreter, "-c", script]`
    #[default]
    Inline,
    /// `[interpreter, path]`
    File,
}

/// Maps a script (inline text or file path) to an argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuilder {
    interpreter: PathBuf,
    mode: CommandMode,
}

impl CommandBuilder {
    pub fn new(interpreter: impl Into<PathBuf>, mode: CommandMode) -> Self {
        Self { interpreter: interpreter.into(), mode }
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    pub fn mode(&self) -> CommandMode {
        self.mode
    }

    pub fn build(&self, input: &str) -> std::result::Result<Vec<String>, CommandError> {
        let interpreter = self.interpreter.display().to_string();
        match self.mode {
            CommandMode::Inline => {
                if input.trim().is_empty() {
                    return Err(CommandError::BlankCode);
                }
                Ok(vec![interpreter, "-c".to_string(), input.to_string()])
            }
            CommandMode::File => {
                if input.trim().is_empty() {
                    return Err(CommandError::BlankPath);
                }
                Ok(vec![interpreter, input.to_string()])
            }
        }
    }
}

fn binary_name(lang: Lang) -> Result<&'static str> {
    match lang {
        Lang::Python => Ok(if cfg!(windows) { "python.exe" } else { "python3" }),
        Lang::JavaScript => Err(SandboxError::UnsupportedLanguage(lang)),
    }
}

fn system_fallback(lang: Lang) -> Option<PathBuf> {
    match lang {
        Lang::Python if cfg!(unix) => Some(PathBuf::from("/usr/bin/python3")),
        _ => None,
    }
}

/// `<os>-<arch>`, the directory name used under `bin/`.
pub fn platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Candidate interpreter locations in probe order.
pub fn candidate_paths(lang: Lang, base: &Path) -> Result<Vec<PathBuf>> {
    let binary = binary_name(lang)?;
    let platform = platform();
    let mut candidates = vec![
        base.join("bin").join(&platform).join(binary),
        base.join("..").join("bin").join(&platform).join(binary),
    ];
    candidates.extend(system_fallback(lang));
    Ok(candidates)
}

/// Resolves the interpreter binary: explicit override first, then the
/// project-local, parent and system-wide locations.
pub fn resolve_interpreter(lang: Lang, base: &Path, explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(SandboxError::InterpreterNotFound {
            lang,
            searched: vec![path.display().to_string()],
        });
    }

    let candidates = candidate_paths(lang, base)?;
    match candidates.iter().find(|path| path.is_file()) {
        Some(found) => {
            log::info!("Using {} interpreter at {}", lang, found.display());
            Ok(found.clone())
        }
        None => Err(SandboxError::InterpreterNotFound {
            lang,
            searched: candidates.iter().map(|p| p.display().to_string()).collect(),
        }),
    }
}
