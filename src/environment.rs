//! Worker environment derivation
//!
//! The environment handed to a worker is built in four layers, each
//! overriding the previous one on key collision:
//!
//! 1. the base environment captured once at startup
//! 2. configured entries (`[worker.env]`, credentials, path variable)
//! 3. fixed flags (e.g. `TESTING=false`)
//! 4. request-derived fields, in sub-handler mode only

use crate::config::WorkerMode;
use crate::context::WorkerSettings;
use crate::handler::WorkerRequest;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub const REQUEST_METHOD: &str = "REQUEST_METHOD";
pub const PATH_INFO: &str = "PATH_INFO";
pub const QUERY_STRING: &str = "QUERY_STRING";
pub const CONTENT_LENGTH: &str = "CONTENT_LENGTH";
pub const REQUEST_ID: &str = "REQUEST_ID";

/// Snapshot of the process environment, shared read-only across requests
#[derive(Debug, Clone, Default)]
pub struct BaseEnvironment {
    vars: Arc<BTreeMap<String, String>>,
}

impl BaseEnvironment {
    /// Capture the current process environment.
    ///
    /// Entries that are not valid UTF-8 are skipped.
    pub fn capture() -> Self {
        let mut skipped = 0usize;
        let vars: BTreeMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| match (k.into_string(), v.into_string()) {
                (Ok(k), Ok(v)) => Some((k, v)),
                _ => {
                    skipped += 1;
                    None
                }
            })
            .collect();
        if skipped > 0 {
            debug!(skipped, "Skipped non UTF-8 environment entries");
        }
        Self {
            vars: Arc::new(vars),
        }
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: Arc::new(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }
}

/// Build the complete environment for one worker invocation
pub fn derive_environment(
    base: &BaseEnvironment,
    settings: &WorkerSettings,
    request: &WorkerRequest,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> =
        base.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

    env.extend(settings.configured_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(settings.fixed_flags.iter().map(|(k, v)| (k.clone(), v.clone())));

    if settings.mode == WorkerMode::SubHandler {
        env.extend(request_fields(request));
    }

    env
}

/// CGI-style variables describing the request
pub fn request_fields(request: &WorkerRequest) -> [(String, String); 5] {
    [
        (REQUEST_METHOD.to_string(), request.method.clone()),
        (PATH_INFO.to_string(), request.path.clone()),
        (QUERY_STRING.to_string(), request.query.clone()),
        (CONTENT_LENGTH.to_string(), request.body.len().to_string()),
        (REQUEST_ID.to_string(), request.request_id.clone()),
    ]
}
