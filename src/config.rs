use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the HTTP port (set by most serverless platforms)
pub const ENV_PORT: &str = "PORT";
/// Environment variable overriding the bind address
pub const ENV_BIND: &str = "PROCBRIDGE_BIND";
/// Environment variable holding an explicit worker executable
pub const ENV_WORKER_EXECUTABLE: &str = "PROCBRIDGE_WORKER_EXECUTABLE";
/// Environment variable overriding the worker timeout
pub const ENV_WORKER_TIMEOUT_SECS: &str = "PROCBRIDGE_WORKER_TIMEOUT_SECS";
/// Environment variable overriding the worker working directory
pub const ENV_WORKER_DIR: &str = "PROCBRIDGE_WORKER_DIR";

/// Global configuration for the bridge
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP front end settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker process settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Opaque credential passthrough
    pub credentials: Option<CredentialsConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Largest request body accepted before a worker is started (default: 1 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// How the worker is expected to consume the request
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerMode {
    /// Worker answers the request described by CGI-style environment variables (default)
    #[default]
    #[serde(alias = "subhandler")]
    SubHandler,
    /// Worker behaves as an independent program; no request fields are passed
    Standalone,
}

/// A path variable resolved relative to the worker working directory
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PathVarConfig {
    /// Variable name, e.g. PYTHONPATH
    pub name: String,
    /// Path relative to the working directory
    #[serde(default = "default_path_var_relative")]
    pub relative: String,
}

/// Configuration for the per-request worker process
///
/// # Security Warning
///
/// `executable`, `fallbacks` and `args` describe a command that is executed
/// for every inbound request. Configuration files must be protected with
/// appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Explicit executable, tried before the fallbacks
    pub executable: Option<String>,

    /// Standard executables tried in order after the explicit override
    #[serde(default = "default_fallbacks")]
    pub fallbacks: Vec<String>,

    /// Arguments passed to the worker (script or module identifier)
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,

    /// Working directory for the worker (default: current directory)
    pub working_dir: Option<String>,

    /// Whether request fields are passed to the worker
    #[serde(default)]
    pub mode: WorkerMode,

    /// Seconds before a running worker is terminated (default: 30)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL when reaping a terminated worker (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Flags set on every invocation, overriding the inherited environment
    #[serde(default = "default_fixed_flags")]
    pub fixed_flags: BTreeMap<String, String>,

    /// Extra environment entries for the worker
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working-directory-relative path variable
    pub path_var: Option<PathVarConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executable: None,
            fallbacks: default_fallbacks(),
            args: default_worker_args(),
            working_dir: None,
            mode: WorkerMode::default(),
            timeout_secs: default_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            fixed_flags: default_fixed_flags(),
            env: BTreeMap::new(),
            path_var: None,
        }
    }
}

impl WorkerConfig {
    /// Create a worker config running `executable` with `args` and no fallbacks
    pub fn command(executable: &str, args: &[&str]) -> Self {
        Self {
            executable: Some(executable.to_string()),
            fallbacks: Vec::new(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    pub fn with_mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Ordered executable candidates: explicit override first, then fallbacks
    pub fn candidates(&self) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::with_capacity(self.fallbacks.len() + 1);
        if let Some(ref exe) = self.executable {
            candidates.push(exe.clone());
        }
        for fallback in &self.fallbacks {
            if !candidates.contains(fallback) {
                candidates.push(fallback.clone());
            }
        }
        candidates
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Resolved working directory (relative paths are kept relative to the bridge's cwd)
    pub fn working_dir(&self) -> PathBuf {
        self.working_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();

        if self.candidates().is_empty() {
            errors.push("worker: at least one of 'executable' or 'fallbacks' is required".to_string());
        }
        if self.candidates().iter().any(|c| c.trim().is_empty()) {
            errors.push("worker: executable candidates must not be empty".to_string());
        }
        if self.args.iter().any(|a| a.is_empty()) {
            errors.push("worker: 'args' entries must not be empty".to_string());
        }
        if self.timeout_secs == 0 {
            errors.push("worker: 'timeout_secs' must be greater than 0".to_string());
        }
        for key in self.fixed_flags.keys().chain(self.env.keys()) {
            if !is_valid_env_key(key) {
                errors.push(format!("worker: invalid environment key '{}'", key));
            }
        }
        if let Some(ref path_var) = self.path_var {
            if !is_valid_env_key(&path_var.name) {
                errors.push(format!("worker: invalid path_var name '{}'", path_var.name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("\n  - "))
        }
    }
}

/// Opaque credential material handed to the worker through one variable
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct CredentialsConfig {
    /// Variable the worker reads (default: GOOGLE_APPLICATION_CREDENTIALS)
    #[serde(default = "default_credentials_env_var")]
    pub env_var: String,
    /// Value passed through untouched, typically a path to a key file
    pub path: String,
}

fn is_valid_env_key(key: &str) -> bool {
    !key.is_empty() && !key.contains('=') && !key.contains('\0')
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    crate::server::DEFAULT_MAX_BODY_BYTES
}

fn default_fallbacks() -> Vec<String> {
    vec![
        "python3".to_string(),
        "/usr/bin/python3".to_string(),
        "python".to_string(),
    ]
}

fn default_worker_args() -> Vec<String> {
    vec!["handler.py".to_string()]
}

fn default_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_fixed_flags() -> BTreeMap<String, String> {
    BTreeMap::from([("TESTING".to_string(), "false".to_string())])
}

fn default_path_var_relative() -> String {
    ".".to_string()
}

fn default_credentials_env_var() -> String {
    "GOOGLE_APPLICATION_CREDENTIALS".to_string()
}

impl Config {
    /// Load configuration from a TOML file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from defaults plus environment overrides only
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides read through `lookup` (normally `std::env::var`)
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", ENV_PORT, port, e))?;
        }
        if let Some(bind) = lookup(ENV_BIND) {
            self.server.bind = bind;
        }
        if let Some(exe) = lookup(ENV_WORKER_EXECUTABLE).filter(|s| !s.trim().is_empty()) {
            self.worker.executable = Some(exe);
        }
        if let Some(secs) = lookup(ENV_WORKER_TIMEOUT_SECS) {
            self.worker.timeout_secs = secs.trim().parse().map_err(|e| {
                anyhow::anyhow!("Invalid {} '{}': {}", ENV_WORKER_TIMEOUT_SECS, secs, e)
            })?;
        }
        if let Some(dir) = lookup(ENV_WORKER_DIR).filter(|s| !s.trim().is_empty()) {
            self.worker.working_dir = Some(dir);
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.worker.validate() {
            errors.push(e);
        }
        if self.server.max_body_bytes == 0 {
            errors.push("server: 'max_body_bytes' must be greater than 0".to_string());
        }
        if let Some(ref creds) = self.credentials {
            if !is_valid_env_key(&creds.env_var) {
                errors.push(format!("credentials: invalid env_var '{}'", creds.env_var));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
