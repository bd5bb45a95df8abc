//! Readiness, liveness, and metrics HTTP endpoints.
//!
//! A [`Checker`] aggregates the registered plugins; the [`ProbeServer`] maps
//! the configured paths onto it. Responses are `200 OK` when every plugin
//! passes, or `500` with the first failing error string.

use std::convert::Infallible;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tracing::{debug, error};

use crate::error::ProviderError;
use crate::plugin::{V1Plugin, V2Plugin};

/// Evaluates health and liveness across every registered plugin, v1 first,
/// stopping at the first failure.
pub struct Checker {
    v1: Vec<V1Plugin>,
    v2: Vec<V2Plugin>,
}

impl Checker {
    /// Creates a checker over the given plugins.
    pub fn new(v1: Vec<V1Plugin>, v2: Vec<V2Plugin>) -> Self {
        Self { v1, v2 }
    }

    /// Readiness: any KMS unavailability fails, including operator-induced.
    pub async fn health(&self) -> Result<(), ProviderError> {
        for plugin in &self.v1 {
            plugin.health().await?;
        }
        for plugin in &self.v2 {
            plugin.health().await?;
        }
        Ok(())
    }

    /// Liveness: operator-induced failures are filtered out.
    pub async fn live(&self) -> Result<(), ProviderError> {
        for plugin in &self.v1 {
            plugin.live().await?;
        }
        for plugin in &self.v2 {
            plugin.live().await?;
        }
        Ok(())
    }
}

/// HTTP/1 server exposing the probe and metrics endpoints.
pub struct ProbeServer {
    checker: Arc<Checker>,
    healthz_path: String,
    livez_path: String,
    metrics_path: String,
}

impl ProbeServer {
    /// Creates a server routing the given paths onto `checker`.
    pub fn new(
        checker: Arc<Checker>,
        healthz_path: impl Into<String>,
        livez_path: impl Into<String>,
        metrics_path: impl Into<String>,
    ) -> Self {
        Self {
            checker,
            healthz_path: healthz_path.into(),
            livez_path: livez_path.into(),
            metrics_path: metrics_path.into(),
        }
    }

    /// Accepts connections on `listener` until the task is cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request| {
                    let server = server.clone();
                    async move { server.route(request).await }
                });
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(error = %err, "probe connection error");
                }
            });
        }
    }

    async fn route(&self, request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let path = request.uri().path();
        let response = if path == self.healthz_path {
            check_response("health", self.checker.health().await)
        } else if path == self.livez_path {
            check_response("live", self.checker.live().await)
        } else if path == self.metrics_path {
            metrics_response()
        } else {
            text_response(StatusCode::NOT_FOUND, "not found")
        };
        Ok(response)
    }
}

fn check_response(probe: &str, result: Result<(), ProviderError>) -> Response<Full<Bytes>> {
    match result {
        Ok(()) => {
            debug!(probe, "check success");
            text_response(StatusCode::OK, "OK")
        }
        Err(err) => {
            error!(probe, error = %err, "check failed");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&prometheus::gather()) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            if let Ok(content_type) = encoder.format_type().parse() {
                response.headers_mut().insert(CONTENT_TYPE, content_type);
            }
            response
        }
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_owned())));
    *response.status_mut() = status;
    response
}
