// src/config.rs
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::command::CommandMode;
use crate::errors::{Result, SandboxError};
use crate::limits::ResourceLimits;
use crate::model::TestModel;

/// Runtime settings of a sandbox, loaded from `SANDBOX_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    /// Wall-clock budget of one execution, counted from process spawn.
    pub execution_budget: Duration,
    pub memory_limit_kb: u64,
    pub cpu_time_limit_secs: u64,
    /// Wrap every child in `ulimit` caps (unix only).
    pub resource_limits: bool,
    pub process_workers: usize,
    /// Upper bound on concurrently running child processes.
    pub max_processes: usize,
    pub notify_delay: Duration,
    pub mode: CommandMode,
    pub storage_dir: PathBuf,
    /// Skips interpreter probing when set.
    pub python_bin: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let execution_budget = Duration::from_secs(2);
        Self {
            execution_budget,
            memory_limit_kb: 256 * 1024,
            cpu_time_limit_secs: default_cpu_time(execution_budget),
            resource_limits: cfg!(unix),
            process_workers: 2,
            max_processes: 8,
            notify_delay: Duration::from_millis(5),
            mode: CommandMode::Inline,
            storage_dir: PathBuf::from("temp").join("files"),
            python_bin: None,
        }
    }
}

// One second above the wall-clock budget so the budget normally fires first.
fn default_cpu_time(budget: Duration) -> u64 {
    budget.as_millis().div_ceil(1000) as u64 + 1
}

impl SandboxConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = SandboxConfig::default();

        let execution_budget = match parse_var::<u64>(&lookup, "SANDBOX_EXECUTION_BUDGET_MS")? {
            Some(ms) if ms == 0 => {
                return Err(SandboxError::Config(
                    "SANDBOX_EXECUTION_BUDGET_MS must be positive".to_string(),
                ));
            }
            Some(ms) => Duration::from_millis(ms),
            None => defaults.execution_budget,
        };

        let mode = match lookup("SANDBOX_MODE").as_deref().map(str::trim) {
            None | Some("inline") => CommandMode::Inline,
            Some("file") => CommandMode::File,
            Some(other) => {
                return Err(SandboxError::Config(format!(
                    "SANDBOX_MODE must be 'inline' or 'file', got '{}'",
                    other
                )));
            }
        };

        let max_processes = parse_var(&lookup, "SANDBOX_MAX_PROCESSES")?.unwrap_or(defaults.max_processes);
        if max_processes == 0 {
            return Err(SandboxError::Config("SANDBOX_MAX_PROCESSES must be positive".to_string()));
        }

        Ok(SandboxConfig {
            execution_budget,
            memory_limit_kb: parse_var(&lookup, "SANDBOX_MEMORY_LIMIT_KB")?.unwrap_or(defaults.memory_limit_kb),
            cpu_time_limit_secs: parse_var(&lookup, "SANDBOX_CPU_TIME_LIMIT_SECS")?
                .unwrap_or_else(|| default_cpu_time(execution_budget)),
            resource_limits: parse_var(&lookup, "SANDBOX_RESOURCE_LIMITS")?.unwrap_or(defaults.resource_limits),
            process_workers: parse_var(&lookup, "SANDBOX_PROCESS_WORKERS")?
                .unwrap_or(defaults.process_workers)
                .max(1),
            max_processes,
            notify_delay: parse_var(&lookup, "SANDBOX_NOTIFY_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.notify_delay),
            mode,
            storage_dir: lookup("SANDBOX_STORAGE_DIR").map(PathBuf::from).unwrap_or(defaults.storage_dir),
            python_bin: lookup("PYTHON_BIN").filter(|s| !s.trim().is_empty()).map(PathBuf::from),
        })
    }

    pub fn limits(&self) -> Option<ResourceLimits> {
        (self.resource_limits && cfg!(unix)).then_some(ResourceLimits {
            memory_kb: self.memory_limit_kb,
            cpu_time_secs: self.cpu_time_limit_secs,
        })
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SandboxError::Config(format!("{} has an invalid value '{}'", key, raw))),
    }
}

/// Reads a test model from a TOML file and checks every question.
pub fn load_test_model(path: &Path) -> Result<TestModel> {
    let raw = std::fs::read_to_string(path)?;
    let model: TestModel = toml::from_str(&raw)?;
    for question in &model.questions {
        question.validate()?;
    }
    Ok(model)
}

static TEMPLATE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("template pattern is valid"));

/// Simple template renderer using regex.
/// Placeholders are in the format `{{key}}`; unknown keys are left as-is.
pub fn render_template(template: &str, data: &serde_json::Value) -> String {
    TEMPLATE_TOKEN.replace_all(template, |caps: &regex::Captures| {
        let key = &caps[1];
        data.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| caps[0].to_string())
    }).to_string()
}
