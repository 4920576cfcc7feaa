//! Process-wide state, built once at startup and shared read-only by every
//! handling flow.

use crate::config::{Config, WorkerConfig, WorkerMode};
use crate::environment::BaseEnvironment;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Resolved worker settings, derived from [`WorkerConfig`] and the credentials section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Executables tried in order; the first that starts is used
    pub candidates: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub mode: WorkerMode,
    pub timeout: Duration,
    /// Time a terminated worker gets before SIGKILL
    pub shutdown_grace_period: Duration,
    /// Configured entries: `[worker.env]`, credentials and the path variable
    pub configured_env: BTreeMap<String, String>,
    pub fixed_flags: BTreeMap<String, String>,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        let worker: &WorkerConfig = &config.worker;
        let working_dir = worker.working_dir();

        let mut configured_env = worker.env.clone();
        if let Some(ref creds) = config.credentials {
            configured_env.insert(creds.env_var.clone(), creds.path.clone());
        }
        if let Some(ref path_var) = worker.path_var {
            let joined = working_dir.join(&path_var.relative);
            let resolved = std::fs::canonicalize(&joined).unwrap_or(joined);
            configured_env.insert(path_var.name.clone(), resolved.to_string_lossy().into_owned());
        }

        Self {
            candidates: worker.candidates(),
            args: worker.args.clone(),
            working_dir,
            mode: worker.mode,
            timeout: worker.timeout(),
            shutdown_grace_period: worker.shutdown_grace_period(),
            configured_env,
            fixed_flags: worker.fixed_flags.clone(),
        }
    }

    /// Settings running a single executable with the default timeouts and flags
    pub fn command(executable: &str, args: &[&str]) -> Self {
        let mut config = Config::default();
        config.worker = WorkerConfig::command(executable, args);
        Self::from_config(&config)
    }

    pub fn with_candidates(mut self, candidates: &[&str]) -> Self {
        self.candidates = candidates.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    pub fn with_mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.configured_env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_fixed_flag(mut self, key: &str, value: &str) -> Self {
        self.fixed_flags.insert(key.to_string(), value.to_string());
        self
    }
}

/// Read-only state shared by all handling flows.
///
/// The base environment is captured exactly once, before the first request,
/// and never mutated afterwards.
#[derive(Debug)]
pub struct BridgeContext {
    base_env: BaseEnvironment,
    worker: WorkerSettings,
}

impl BridgeContext {
    /// Capture the process environment and resolve the worker settings.
    pub fn init(config: &Config) -> Arc<Self> {
        let base_env = BaseEnvironment::capture();
        let worker = WorkerSettings::from_config(config);
        info!(
            base_env_vars = base_env.len(),
            candidates = ?worker.candidates,
            working_dir = %worker.working_dir.display(),
            "Bridge context initialized"
        );
        Self::new(base_env, worker)
    }

    pub fn new(base_env: BaseEnvironment, worker: WorkerSettings) -> Arc<Self> {
        Arc::new(Self { base_env, worker })
    }

    pub fn base_env(&self) -> &BaseEnvironment {
        &self.base_env
    }

    pub fn worker(&self) -> &WorkerSettings {
        &self.worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialsConfig, PathVarConfig};

    #[test]
    fn test_from_config_defaults() {
        let settings = WorkerSettings::from_config(&Config::default());

        assert_eq!(settings.candidates, vec!["python3", "/usr/bin/python3", "python"]);
        assert_eq!(settings.args, vec!["handler.py"]);
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.shutdown_grace_period, Duration::from_secs(5));
        assert_eq!(settings.mode, WorkerMode::SubHandler);
        assert!(settings.configured_env.is_empty());
        assert_eq!(settings.fixed_flags.get("TESTING").map(String::as_str), Some("false"));
    }

    #[test]
    fn test_credentials_and_path_var_become_configured_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();

        let mut config = Config::default();
        config.worker.working_dir = Some(dir.path().to_string_lossy().into_owned());
        config.worker.path_var = Some(PathVarConfig {
            name: "PYTHONPATH".to_string(),
            relative: "lib".to_string(),
        });
        config.worker.env.insert("EXTRA".to_string(), "1".to_string());
        config.credentials = Some(CredentialsConfig {
            env_var: "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
            path: "/secrets/sa.json".to_string(),
        });

        let settings = WorkerSettings::from_config(&config);
        let expected_lib = std::fs::canonicalize(dir.path().join("lib")).unwrap();

        assert_eq!(
            settings.configured_env.get("PYTHONPATH").map(String::as_str),
            Some(expected_lib.to_string_lossy().as_ref())
        );
        assert_eq!(
            settings
                .configured_env
                .get("GOOGLE_APPLICATION_CREDENTIALS")
                .map(String::as_str),
            Some("/secrets/sa.json")
        );
        assert_eq!(settings.configured_env.get("EXTRA").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_command_builder() {
        let settings = WorkerSettings::command("/bin/sh", &["-c", "true"])
            .with_timeout(Duration::from_millis(250))
            .with_candidates(&["/missing", "/bin/sh"])
            .with_fixed_flag("TESTING", "0");

        assert_eq!(settings.candidates, vec!["/missing", "/bin/sh"]);
        assert_eq!(settings.args, vec!["-c", "true"]);
        assert_eq!(settings.timeout, Duration::from_millis(250));
        assert_eq!(settings.fixed_flags.get("TESTING").map(String::as_str), Some("0"));
    }

    #[test]
    fn test_context_keeps_settings() {
        let base = BaseEnvironment::from_vars([("HOME", "/root")]);
        let ctx = BridgeContext::new(base, WorkerSettings::command("true", &[]));

        assert_eq!(ctx.base_env().get("HOME"), Some("/root"));
        assert_eq!(ctx.worker().candidates, vec!["true"]);
    }
}
