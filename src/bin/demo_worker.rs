//! Sample sub-handler worker.
//!
//! Reads the request from CGI-style environment variables, writes exactly one
//! JSON document to stdout and all diagnostics to stderr.

use procbridge::environment::{CONTENT_LENGTH, PATH_INFO, QUERY_STRING, REQUEST_ID, REQUEST_METHOD};
use serde_json::{json, Value};
use std::io::Write;
use std::process::ExitCode;
use tracing::{error, info};

const API_VERSION: &str = "1.0.0";

fn main() -> ExitCode {
    // stdout is reserved for the response document
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("demo_worker=info".parse().expect("valid log directive")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let method = env_or(REQUEST_METHOD, "GET");
    let path = env_or(PATH_INFO, "/");
    info!(method = %method, path = %path, "Processing request");

    match route(&method, &path) {
        Ok(response) => {
            let body = response.to_string();
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = writeln!(stdout, "{}", body).and_then(|_| stdout.flush()) {
                error!(error = %e, "Failed to write response");
                return ExitCode::FAILURE;
            }
            info!(response = %body, "Response sent");
            ExitCode::SUCCESS
        }
        Err(message) => {
            error!(path = %path, "{}", message);
            ExitCode::FAILURE
        }
    }
}

fn route(method: &str, path: &str) -> Result<Value, String> {
    match path {
        "" | "/" => Ok(json!({
            "message": "Welcome to Bangla Motorcycle Review API",
            "version": API_VERSION,
            "status": "operational",
        })),
        "/health" => Ok(json!({ "status": "healthy" })),
        "/echo" => Ok(json!({
            "method": method,
            "path": path,
            "query": env_or(QUERY_STRING, ""),
            "content_length": env_or(CONTENT_LENGTH, "0"),
            "request_id": env_or(REQUEST_ID, ""),
            "testing": env_or("TESTING", ""),
        })),
        "/fail" => Err("Simulated handler failure".to_string()),
        other => Ok(json!({
            "error": "Not Found",
            "message": format!("Endpoint {} not found", other),
        })),
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
