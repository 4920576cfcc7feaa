use crate::error::{BridgeErrorCode, ErrorResponse};
use crate::handler::{BridgeResponse, RequestHandler, WorkerRequest, X_REQUEST_ID};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default request body limit (1 MiB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// HTTP front end that hands every request to a [`RequestHandler`]
pub struct BridgeServer {
    bind_addr: SocketAddr,
    handler: RequestHandler,
    shutdown_rx: watch::Receiver<bool>,
    max_body_bytes: usize,
}

impl BridgeServer {
    pub fn new(
        bind_addr: SocketAddr,
        handler: RequestHandler,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            handler,
            shutdown_rx,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Bridge server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = self.handler.clone();
                            let max_body_bytes = self.max_body_bytes;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, handler, max_body_bytes).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Bridge server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    handler: RequestHandler,
    max_body_bytes: usize,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        async move { handle_request(req, handler, addr, max_body_bytes).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    handler: RequestHandler,
    client_addr: SocketAddr,
    max_body_bytes: usize,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (parts, body) = req.into_parts();
    let method = parts.method.to_string();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().unwrap_or("").to_string();

    debug!(
        request_id = %request_id,
        client = %client_addr,
        method = %method,
        path = %path,
        "Request received"
    );

    let body = match Limited::new(body, max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let response = if e.downcast_ref::<LengthLimitError>().is_some() {
                warn!(request_id = %request_id, limit = max_body_bytes, "Request body too large");
                ErrorResponse::new(
                    BridgeErrorCode::RequestTooLarge,
                    format!("Request body exceeds {} bytes", max_body_bytes),
                )
            } else {
                warn!(request_id = %request_id, error = %e, "Failed to read request body");
                ErrorResponse::new(BridgeErrorCode::InvalidRequest, "Failed to read request body")
                    .with_detail(e.to_string())
            };
            return Ok(BridgeResponse::error(response).into_http(&request_id));
        }
    };

    let request = WorkerRequest::new(&method, &path)
        .with_query(&query)
        .with_body(body)
        .with_request_id(&request_id);

    // Holding `_connection` keeps `disconnected` pending. hyper drops this
    // future when the client goes away, which closes the channel and lets the
    // handling task terminate the worker.
    let (_connection, closed) = oneshot::channel::<()>();
    let disconnected = async move {
        let _ = closed.await;
    };
    let task = tokio::spawn(async move { handler.handle(request, disconnected).await });

    let response = match task.await {
        Ok(Some(response)) => response,
        Ok(None) => {
            // `_connection` is still alive here, so the handler cannot have
            // observed a disconnect while this future is being polled.
            debug!(request_id = %request_id, "Handler returned no response");
            return Ok(empty_response());
        }
        Err(e) => {
            error!(request_id = %request_id, error = %e, "Request handling task failed");
            BridgeResponse::error(ErrorResponse::new(
                BridgeErrorCode::InternalError,
                "Request handling failed",
            ))
        }
    };

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status.as_u16(),
        "Request completed"
    );

    Ok(response.into_http(&request_id))
}

fn empty_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Empty::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}
