//! Configuration loading from goat.toml.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use goat_absint::AnalysisOptions;
use goat_diagnostics::Severity;
use goat_upfront::{FragmentPolicy, UpfrontOptions};

pub const CONFIG_FILE_NAME: &str = "goat.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unknown fragment policy {0:?} (expected singleton, same-func, total, gcatch or scc)")]
    UnknownPolicy(String),
    #[error("{0} must be at least 1")]
    ZeroBound(&'static str),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub goat: GoatConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GoatConfig {
    pub fragment_policy: String,
    /// Suffix selecting the entry functions. Empty means every `main` and,
    /// with `include_tests`, every `Test*` function.
    pub entry_function: String,
    pub call_context_depth: usize,
    /// Per entry and P-set; 0 disables the deadline.
    pub deadline_ms: u64,
    pub include_tests: bool,
    pub metrics: bool,
    pub visualize: bool,
    pub skip_goroot: bool,
    pub prune_large_callsites: bool,
    pub large_callsite_threshold: usize,
    pub goroutine_bound: usize,
    pub widening_threshold: usize,
}

impl Default for GoatConfig {
    fn default() -> Self {
        let options = AnalysisOptions::default();
        Self {
            fragment_policy: FragmentPolicy::default().to_string(),
            entry_function: String::new(),
            call_context_depth: options.call_context_depth,
            deadline_ms: 0,
            include_tests: false,
            metrics: false,
            visualize: false,
            skip_goroot: options.skip_goroot,
            prune_large_callsites: true,
            large_callsite_threshold: goat_upfront::DEFAULT_PRUNE_THRESHOLD,
            goroutine_bound: options.goroutine_bound,
            widening_threshold: options.widening_threshold,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    /// 0 = unlimited.
    pub max_findings: usize,
    /// Findings below this severity are neither shown nor counted for the
    /// exit code.
    pub severity_threshold: Severity,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Human,
            max_findings: 0,
            severity_threshold: Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
    Sarif,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            "sarif" => Ok(Self::Sarif),
            other => Err(format!("unknown output format {other:?}")),
        }
    }
}

/// Validated settings for one analysis run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub policy: FragmentPolicy,
    pub entry_function: Option<String>,
    pub include_tests: bool,
    pub metrics: bool,
    pub upfront: UpfrontOptions,
    pub analysis: AnalysisOptions,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            policy: FragmentPolicy::default(),
            entry_function: None,
            include_tests: false,
            metrics: false,
            upfront: UpfrontOptions::default(),
            analysis: AnalysisOptions::default(),
        }
    }
}

impl Config {
    /// Check the `[goat]` table and turn it into run settings.
    pub fn settings(&self) -> Result<RunSettings, ConfigError> {
        let goat = &self.goat;
        let policy = FragmentPolicy::from_str(&goat.fragment_policy)
            .map_err(|_| ConfigError::UnknownPolicy(goat.fragment_policy.clone()))?;
        if goat.goroutine_bound == 0 {
            return Err(ConfigError::ZeroBound("goroutine_bound"));
        }
        if goat.widening_threshold == 0 {
            return Err(ConfigError::ZeroBound("widening_threshold"));
        }
        if goat.prune_large_callsites && goat.large_callsite_threshold == 0 {
            return Err(ConfigError::ZeroBound("large_callsite_threshold"));
        }
        Ok(RunSettings {
            policy,
            entry_function: Some(goat.entry_function.clone()).filter(|s| !s.is_empty()),
            include_tests: goat.include_tests,
            metrics: goat.metrics,
            upfront: UpfrontOptions {
                prune_threshold: goat
                    .prune_large_callsites
                    .then_some(goat.large_callsite_threshold),
            },
            analysis: AnalysisOptions {
                call_context_depth: goat.call_context_depth,
                goroutine_bound: goat.goroutine_bound,
                widening_threshold: goat.widening_threshold,
                deadline: (goat.deadline_ms > 0).then(|| Duration::from_millis(goat.deadline_ms)),
                skip_goroot: goat.skip_goroot,
                visualize: goat.visualize,
                ..AnalysisOptions::default()
            },
        })
    }
}

/// Find and load goat.toml, walking up from `start_dir` and then trying
/// the user configuration directory. Returns the default config if no file
/// exists.
pub fn load_config(start_dir: &Path) -> Result<Config, ConfigError> {
    match find_config_file(start_dir).or_else(user_config_file) {
        Some(path) => load_config_file(&path),
        None => Ok(Config::default()),
    }
}

pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Walk up directories looking for goat.toml.
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// `~/.config/goat/goat.toml` or the platform equivalent, when it exists.
fn user_config_file() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join("goat").join(CONFIG_FILE_NAME))
        .filter(|p| p.is_file())
}

/// Default TOML content for `goat init`.
pub const DEFAULT_CONFIG_TOML: &str = r#"[goat]
fragment_policy = "gcatch"      # singleton | same-func | total | gcatch | scc
entry_function = ""             # suffix match; empty = every main (and Test* with include_tests)
call_context_depth = 1
deadline_ms = 0                 # 0 = no deadline
include_tests = false
metrics = false
visualize = false
skip_goroot = true
prune_large_callsites = true
large_callsite_threshold = 10
goroutine_bound = 3
widening_threshold = 3

[output]
format = "human"                # human | json | sarif
max_findings = 0                # 0 = unlimited
severity_threshold = "info"     # info | warning | error | critical
"#;
