//! The process-backed request handler
//!
//! Every request gets its own [`WorkerInvocation`]. The handler starts it,
//! waits for one of exit, timeout or client disconnect, and turns the result
//! into a [`BridgeResponse`]. Disconnects yield no response at all.

use crate::context::BridgeContext;
use crate::decode::decode_output;
use crate::error::{BridgeErrorCode, ErrorResponse, X_BRIDGE_ERROR, UNKNOWN_WORKER_ERROR};
use crate::worker::{CapturedOutput, StartError, WorkerInvocation, WorkerOutcome};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{Response, StatusCode};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";

/// An inbound request, immutable while it is being handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    pub method: String,
    pub path: String,
    /// Raw query string without the leading '?'
    pub query: String,
    pub body: Bytes,
    pub request_id: String,
}

impl WorkerRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            query: String::new(),
            body: Bytes::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = query.to_string();
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = request_id.to_string();
        self
    }
}

/// Status and JSON body produced for one request
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeResponse {
    pub status: StatusCode,
    pub body: serde_json::Value,
    /// Set for every failure response
    pub error: Option<BridgeErrorCode>,
}

impl BridgeResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            error: None,
        }
    }

    pub fn error(error: ErrorResponse) -> Self {
        Self {
            status: error.code.status_code(),
            body: error.to_value(),
            error: Some(error.code),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Build the HTTP response, echoing the request id
    pub fn into_http(self, request_id: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        let mut builder = Response::builder()
            .status(self.status)
            .header(hyper::header::CONTENT_TYPE, "application/json");
        if let Ok(value) = HeaderValue::from_str(request_id) {
            builder = builder.header(X_REQUEST_ID, value);
        }
        if let Some(code) = self.error {
            builder = builder.header(X_BRIDGE_ERROR, code.as_header_value());
        }
        builder
            .body(
                Full::new(Bytes::from(self.body.to_string()))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .expect("valid response builder")
    }
}

/// Handles requests by running one worker per request
#[derive(Clone)]
pub struct RequestHandler {
    context: Arc<BridgeContext>,
}

impl RequestHandler {
    pub fn new(context: Arc<BridgeContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<BridgeContext> {
        &self.context
    }

    /// Handle one request.
    ///
    /// `disconnected` resolves when the client goes away; in that case the
    /// worker is terminated and `None` is returned. Every other path returns
    /// a response.
    pub async fn handle<C>(&self, request: WorkerRequest, disconnected: C) -> Option<BridgeResponse>
    where
        C: Future<Output = ()>,
    {
        info!(
            request_id = %request.request_id,
            method = %request.method,
            path = %request.path,
            query = %request.query,
            "Handling request"
        );

        let mut invocation = WorkerInvocation::new(&self.context, &request);

        if let Err(e) = invocation.start() {
            error!(request_id = %request.request_id, error = %e, "Failed to start worker process");
            return Some(start_failure(&e));
        }

        let response = match invocation.wait(disconnected).await {
            Ok(WorkerOutcome::Completed { status, output }) => {
                map_completion(status.success(), status.code(), &output)
            }
            Ok(WorkerOutcome::TimedOut { after }) => timeout_response(after),
            Ok(WorkerOutcome::Canceled) => {
                info!(request_id = %request.request_id, "Request canceled by client, no response sent");
                return None;
            }
            Err(e) => {
                error!(request_id = %request.request_id, error = %e, "Worker invocation failed");
                BridgeResponse::error(
                    ErrorResponse::new(BridgeErrorCode::InternalError, "Worker invocation failed")
                        .with_detail(e.to_string()),
                )
            }
        };

        debug!(
            request_id = %request.request_id,
            status = response.status.as_u16(),
            "Response ready"
        );
        Some(response)
    }
}

fn start_failure(error: &StartError) -> BridgeResponse {
    BridgeResponse::error(
        ErrorResponse::new(BridgeErrorCode::StartFailure, "Failed to start worker process")
            .with_detail(error.to_string()),
    )
}

fn timeout_response(after: std::time::Duration) -> BridgeResponse {
    BridgeResponse::error(ErrorResponse::new(
        BridgeErrorCode::Timeout,
        format!("Worker timed out after {} ms", after.as_millis()),
    ))
}

/// Map a worker that exited by itself to a response.
///
/// Non-zero exit reports stderr; zero exit must produce exactly one JSON
/// document on stdout.
pub fn map_completion(success: bool, exit_code: Option<i32>, output: &CapturedOutput) -> BridgeResponse {
    if !success {
        let stderr = output.stderr_text();
        let detail = if stderr.trim().is_empty() {
            UNKNOWN_WORKER_ERROR.to_string()
        } else {
            stderr.into_owned()
        };
        let message = match exit_code {
            Some(code) => format!("Worker process exited with status {}", code),
            None => "Worker process was terminated by a signal".to_string(),
        };
        warn!(exit_code = ?exit_code, "Worker process failed");
        return BridgeResponse::error(
            ErrorResponse::new(BridgeErrorCode::WorkerFailure, message).with_detail(detail),
        );
    }

    match decode_output(&output.stdout) {
        Ok(body) => BridgeResponse::ok(body),
        Err(e) => {
            warn!(error = %e, "Worker output is not valid JSON");
            BridgeResponse::error(
                ErrorResponse::new(BridgeErrorCode::DecodeFailure, "Failed to decode worker output")
                    .with_detail(e.to_string())
                    .with_output(output.stdout_text().into_owned()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output(stdout: &str, stderr: &str) -> CapturedOutput {
        CapturedOutput {
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_success_with_json() {
        let response = map_completion(true, Some(0), &output(r#"{"message":"Hello from Firebase!"}"#, ""));

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, json!({"message": "Hello from Firebase!"}));
        assert!(response.is_success());
    }

    #[test]
    fn test_success_ignores_stderr_diagnostics() {
        let response = map_completion(
            true,
            Some(0),
            &output("{\"status\":\"healthy\"}\n", "INFO - Processing GET request to /health\n"),
        );
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body["status"], "healthy");
    }

    #[test]
    fn test_non_zero_exit_reports_stderr() {
        let response = map_completion(false, Some(1), &output("", "Traceback: ValueError\n"));

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.error, Some(BridgeErrorCode::WorkerFailure));
        assert_eq!(response.body["code"], "WORKER_FAILURE");
        assert_eq!(response.body["detail"], "Traceback: ValueError\n");
        assert_eq!(response.body["message"], "Worker process exited with status 1");
    }

    #[test]
    fn test_non_zero_exit_with_empty_stderr() {
        let response = map_completion(false, Some(2), &output("{\"ok\":true}", ""));

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.body["detail"], UNKNOWN_WORKER_ERROR);
    }

    #[test]
    fn test_signal_exit_is_worker_failure() {
        let response = map_completion(false, None, &output("", "killed"));

        assert_eq!(response.error, Some(BridgeErrorCode::WorkerFailure));
        assert_eq!(response.body["message"], "Worker process was terminated by a signal");
    }

    #[test]
    fn test_undecodable_output() {
        let response = map_completion(true, Some(0), &output("Hello world!", ""));

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.error, Some(BridgeErrorCode::DecodeFailure));
        assert_eq!(response.body["output"], "Hello world!");
        assert!(response.body["detail"].as_str().unwrap().contains("invalid JSON"));
    }

    #[test]
    fn test_empty_output_is_decode_failure() {
        let response = map_completion(true, Some(0), &output("", ""));

        assert_eq!(response.error, Some(BridgeErrorCode::DecodeFailure));
        assert_eq!(response.body["detail"], "worker produced no output");
    }

    #[test]
    fn test_timeout_response() {
        let response = timeout_response(std::time::Duration::from_secs(30));

        assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.body["code"], "TIMEOUT");
        assert_eq!(response.body["message"], "Worker timed out after 30000 ms");
    }

    #[test]
    fn test_into_http_sets_headers() {
        let response = timeout_response(std::time::Duration::from_secs(1)).into_http("abc-123");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers().get(X_REQUEST_ID).unwrap(), "abc-123");
        assert_eq!(response.headers().get(X_BRIDGE_ERROR).unwrap(), "TIMEOUT");
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let ok = BridgeResponse::ok(json!({"a": 1})).into_http("abc-123");
        assert!(ok.headers().get(X_BRIDGE_ERROR).is_none());
    }

    #[test]
    fn test_request_builder() {
        let request = WorkerRequest::new("GET", "/health")
            .with_query("verbose=1")
            .with_request_id("req-9");

        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/health");
        assert_eq!(request.query, "verbose=1");
        assert!(request.body.is_empty());
        assert_eq!(request.request_id, "req-9");

        // Generated ids are unique
        assert_ne!(
            WorkerRequest::new("GET", "/").request_id,
            WorkerRequest::new("GET", "/").request_id
        );
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::context::WorkerSettings;
        use crate::environment::BaseEnvironment;
        use std::future::pending;
        use std::time::{Duration, Instant};

        fn handler(settings: WorkerSettings) -> RequestHandler {
            RequestHandler::new(BridgeContext::new(BaseEnvironment::capture(), settings))
        }

        fn sh(script: &str) -> WorkerSettings {
            WorkerSettings::command("/bin/sh", &["-c", script])
        }

        #[tokio::test]
        async fn test_hello_world_worker() {
            let handler = handler(sh(r#"printf '{"message":"Hello from Firebase!"}'"#));
            let response = handler
                .handle(WorkerRequest::new("GET", "/"), pending())
                .await
                .unwrap();

            assert_eq!(response.status, StatusCode::OK);
            assert_eq!(response.body, json!({"message": "Hello from Firebase!"}));
        }

        #[tokio::test]
        async fn test_failing_worker() {
            let handler = handler(sh("echo 'database unavailable' >&2; exit 1"));
            let response = handler
                .handle(WorkerRequest::new("GET", "/"), pending())
                .await
                .unwrap();

            assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(response.body["detail"], "database unavailable\n");
        }

        #[tokio::test]
        async fn test_no_launchable_candidate() {
            for candidates in [
                vec!["/nonexistent/python3"],
                vec!["/nonexistent/a", "/nonexistent/b", "/nonexistent/c"],
            ] {
                let handler = handler(sh("exit 0").with_candidates(&candidates));
                let response = handler
                    .handle(WorkerRequest::new("GET", "/"), pending())
                    .await
                    .unwrap();

                assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(response.error, Some(BridgeErrorCode::StartFailure));
                assert_eq!(response.body["message"], "Failed to start worker process");
                assert!(response.body["detail"]
                    .as_str()
                    .unwrap()
                    .contains(candidates[candidates.len() - 1]));
            }
        }

        #[tokio::test]
        async fn test_timeout_yields_504() {
            let handler = handler(
                sh("printf partial; sleep 10").with_timeout(Duration::from_millis(300)),
            );
            let started = Instant::now();
            let response = handler
                .handle(WorkerRequest::new("GET", "/slow"), pending())
                .await
                .unwrap();

            assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
            assert!(response.body.get("output").is_none());
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn test_disconnect_yields_no_response() {
            let handler = handler(sh("sleep 10"));
            let response = handler
                .handle(WorkerRequest::new("GET", "/"), async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                })
                .await;

            assert!(response.is_none());
        }

        #[tokio::test]
        async fn test_concurrent_requests_are_isolated() {
            let handler = handler(sh(
                r#"sleep 0.1; printf '{"path":"%s","query":"%s"}' "$PATH_INFO" "$QUERY_STRING""#,
            ));

            let mut tasks = Vec::new();
            for i in 0..16 {
                let handler = handler.clone();
                tasks.push(tokio::spawn(async move {
                    let request = WorkerRequest::new("GET", &format!("/item/{}", i))
                        .with_query(&format!("n={}", i));
                    (i, handler.handle(request, pending()).await.unwrap())
                }));
            }

            for task in tasks {
                let (i, response) = task.await.unwrap();
                assert_eq!(response.status, StatusCode::OK);
                assert_eq!(response.body["path"], format!("/item/{}", i));
                assert_eq!(response.body["query"], format!("n={}", i));
            }
        }
    }
}
