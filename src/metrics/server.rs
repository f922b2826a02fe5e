//! HTTP server for Prometheus metrics and health endpoints

use super::Metrics;
use crate::binding::BindingRegistry;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// HTTP server that exposes Prometheus metrics plus liveness and readiness
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    bindings: Arc<BindingRegistry>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, bindings: Arc<BindingRegistry>, addr: SocketAddr) -> Self {
        Self {
            metrics,
            bindings,
            addr,
        }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics server listening on http://{}/metrics", self.addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();
            let bindings = self.bindings.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = metrics.clone();
                    let bindings = bindings.clone();
                    async move { Ok::<_, Infallible>(handle_request(&req, &metrics, &bindings)) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

pub(crate) fn handle_request<B>(
    req: &Request<B>,
    metrics: &Metrics,
    bindings: &BindingRegistry,
) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(buffer) => {
                let mut response = text(StatusCode::OK, buffer);
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to encode metrics",
                )
            }
        },
        "/health" | "/healthz" => text(StatusCode::OK, "OK"),
        "/ready" | "/readyz" => {
            if bindings.all_routing() {
                text(StatusCode::OK, "OK")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "Not Ready")
            }
        }
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    }
}
