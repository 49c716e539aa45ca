// Configuration for the grading engine
use crate::types::{Language, Limits, DEFAULT_FLOAT_EPSILON, DEFAULT_MEMORY_MB, DEFAULT_TIMEOUT_MS};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_LANGUAGES_PATH: &str = "config/languages.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageExecution {
    pub command: String,
    pub args: Vec<String>,
    pub file_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    pub image: String,
    pub execution: LanguageExecution,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

fn default_pids_limit() -> i64 {
    64
}

impl LanguageConfig {
    fn builtin_python() -> Self {
        Self {
            name: "python".to_string(),
            version: "3.12".to_string(),
            image: "python:3.12-slim".to_string(),
            execution: LanguageExecution {
                command: "python3".to_string(),
                args: vec!["-I".to_string(), "-B".to_string(), "-u".to_string()],
                file_extension: "py".to_string(),
            },
            memory_limit_mb: DEFAULT_MEMORY_MB as u32,
            cpu_limit: 0.5,
            pids_limit: default_pids_limit(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<String, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path).context("Failed to read languages.json")?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            if let Err(e) = lang.name.parse::<Language>() {
                bail!("Unknown language in languages.json: {}", e);
            }
            configs.insert(lang.name.to_lowercase(), lang);
        }

        if configs.is_empty() {
            bail!("No languages configured in languages.json");
        }

        Ok(Self { configs })
    }

    /// Built-in configuration used when no languages.json is present
    pub fn builtin() -> Self {
        let python = LanguageConfig::builtin_python();
        let mut configs = HashMap::new();
        configs.insert(python.name.clone(), python);
        Self { configs }
    }

    /// Load from the default path, falling back to the built-in set
    pub fn load_or_builtin(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            warn!(
                path = %config_path.display(),
                "Language config not found, using built-in languages"
            );
            Ok(Self::builtin())
        }
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig> {
        let lang_name = language.to_string();
        self.configs
            .get(&lang_name)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", lang_name))
    }

    /// List all configured languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Which sandbox implementation executes submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Process,
    Docker,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "process" | "local" => Ok(BackendKind::Process),
            "docker" => Ok(BackendKind::Docker),
            other => Err(format!("unknown sandbox backend '{}'", other)),
        }
    }
}

/// How many test cases share one interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IsolationPolicy {
    /// One fresh interpreter per submission, reloaded only after a crash or timeout
    #[default]
    PerSubmission,
    /// One fresh interpreter per test case
    PerCase,
}

impl FromStr for IsolationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "submission" | "per-submission" => Ok(IsolationPolicy::PerSubmission),
            "case" | "per-case" => Ok(IsolationPolicy::PerCase),
            other => Err(format!("unknown isolation policy '{}'", other)),
        }
    }
}

/// How far the process backend confines the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessConfinement {
    /// Private user, mount and network namespaces over a read-only root,
    /// plus resource limits and a syscall filter. Loads fail when the host
    /// cannot create the namespaces.
    #[default]
    Strict,
    /// Resource limits and the syscall filter only. The host filesystem stays
    /// readable, so this is for development with trusted code.
    Relaxed,
}

impl FromStr for ProcessConfinement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" | "namespaces" => Ok(ProcessConfinement::Strict),
            "relaxed" | "dev" => Ok(ProcessConfinement::Relaxed),
            other => Err(format!("unknown process confinement '{}'", other)),
        }
    }
}

/// Runtime settings for the grading coordinator
#[derive(Debug, Clone)]
pub struct GraderConfig {
    pub backend: BackendKind,
    pub isolation: IsolationPolicy,
    /// Sandboxes allowed to run at once
    pub max_concurrent: usize,
    /// Gradings allowed to wait for a slot before new ones are refused
    pub max_queued: usize,
    /// Bound on diagnosticText, in bytes
    pub diagnostic_limit: usize,
    /// Bound on one reply line from the sandbox, in bytes
    pub max_response_bytes: usize,
    pub float_epsilon: f64,
    pub scratch_dir: PathBuf,
    pub default_limits: Limits,
    pub max_timeout_ms: u64,
    pub max_memory_mb: u64,
    /// Added to timeoutMs to get the deadline of a whole grading
    pub grading_overhead_ms: u64,
    pub confinement: ProcessConfinement,
    /// Size of the writable scratch area and of any single file written, in MB
    pub scratch_limit_mb: u64,
    pub open_files_limit: u64,
    /// Extra host paths mounted read-only into a strict process sandbox
    pub read_only_paths: Vec<PathBuf>,
}

impl Default for GraderConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        Self {
            backend: BackendKind::Process,
            isolation: IsolationPolicy::PerSubmission,
            max_concurrent: parallelism,
            max_queued: 64,
            diagnostic_limit: 4096,
            max_response_bytes: 4 * 1024 * 1024,
            float_epsilon: DEFAULT_FLOAT_EPSILON,
            scratch_dir: std::env::temp_dir(),
            default_limits: Limits {
                timeout_ms: DEFAULT_TIMEOUT_MS,
                memory_mb: DEFAULT_MEMORY_MB,
            },
            max_timeout_ms: 30_000,
            max_memory_mb: 1024,
            grading_overhead_ms: 1000,
            confinement: ProcessConfinement::Strict,
            scratch_limit_mb: 16,
            open_files_limit: 64,
            read_only_paths: Vec::new(),
        }
    }
}

impl GraderConfig {
    /// Read VERDICT_* environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let backend = parse_or(&lookup, "VERDICT_BACKEND", defaults.backend);
        let isolation = parse_or(&lookup, "VERDICT_ISOLATION", defaults.isolation);
        let max_concurrent: usize = parse_or(&lookup, "VERDICT_MAX_CONCURRENT", defaults.max_concurrent);
        let max_queued = parse_or(&lookup, "VERDICT_MAX_QUEUED", defaults.max_queued);
        let diagnostic_limit = parse_or(&lookup, "VERDICT_DIAGNOSTIC_LIMIT", defaults.diagnostic_limit);
        let max_response_bytes =
            parse_or(&lookup, "VERDICT_MAX_RESPONSE_BYTES", defaults.max_response_bytes);
        let float_epsilon = parse_or(&lookup, "VERDICT_FLOAT_EPSILON", defaults.float_epsilon);
        let max_timeout_ms = parse_or(&lookup, "VERDICT_MAX_TIMEOUT_MS", defaults.max_timeout_ms);
        let max_memory_mb = parse_or(&lookup, "VERDICT_MAX_MEMORY_MB", defaults.max_memory_mb);
        let scratch_dir = lookup("VERDICT_SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.scratch_dir);
        let grading_overhead_ms =
            parse_or(&lookup, "VERDICT_GRADING_OVERHEAD_MS", defaults.grading_overhead_ms);
        let confinement = parse_or(&lookup, "VERDICT_PROCESS_CONFINEMENT", defaults.confinement);
        let scratch_limit_mb: u64 = parse_or(&lookup, "VERDICT_SCRATCH_LIMIT_MB", defaults.scratch_limit_mb);
        let open_files_limit: u64 = parse_or(&lookup, "VERDICT_OPEN_FILES_LIMIT", defaults.open_files_limit);
        let read_only_paths = lookup("VERDICT_READ_ONLY_PATHS")
            .map(|raw| std::env::split_paths(&raw).filter(|p| !p.as_os_str().is_empty()).collect())
            .unwrap_or(defaults.read_only_paths);

        Self {
            backend,
            isolation,
            max_concurrent: max_concurrent.max(1),
            max_queued,
            diagnostic_limit,
            max_response_bytes,
            float_epsilon,
            scratch_dir,
            default_limits: defaults.default_limits,
            max_timeout_ms,
            max_memory_mb,
            grading_overhead_ms,
            confinement,
            scratch_limit_mb: scratch_limit_mb.max(1),
            open_files_limit: open_files_limit.max(16),
            read_only_paths,
        }
    }

    pub fn grading_overhead(&self) -> Duration {
        Duration::from_millis(self.grading_overhead_ms)
    }

    pub fn scratch_limit_bytes(&self) -> u64 {
        self.scratch_limit_mb.saturating_mul(1024 * 1024)
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(e) => {
                warn!(variable = name, value = %raw, error = %e, "Invalid value, using default");
                default
            }
        },
        None => default,
    }
}
