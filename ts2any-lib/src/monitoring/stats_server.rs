//! HTTP statistics service
//!
//! Serves Prometheus metrics on `/metrics` and a liveness probe on
//! `/health`.

use super::metrics::gather_metrics;
use crate::error::{Result, StreamerError};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Configuration for the stats HTTP service
#[derive(Debug, Clone)]
pub struct StatsServiceConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for StatsServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8081,
        }
    }
}

/// Stats HTTP service with graceful shutdown
pub struct StatsService {
    config: StatsServiceConfig,
    shutdown: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl StatsService {
    pub fn new(config: StatsServiceConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            server: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            info!("Stats service disabled");
            return Ok(());
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| StreamerError::config(format!("failed to bind stats service: {}", err)))?;
        info!("Stats service listening on http://{}", addr);

        let shutdown = self.shutdown.clone();
        let server = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        error!("Stats service accept failed: {}", err);
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                tokio::spawn(async move {
                    if let Err(err) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service_fn(stats_handler))
                        .await
                    {
                        error!("Stats connection error: {}", err);
                    }
                });
            }
        });
        *self.server.lock().unwrap() = Some(server);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.shutdown.cancel();
        let server = self.server.lock().unwrap().take();
        if let Some(server) = server {
            let _ = server.await;
        }
        Ok(())
    }
}

async fn stats_handler(
    request: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match request.uri().path() {
        "/metrics" => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(gather_metrics()))),
        "/health" => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("OK"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found"))),
    };
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}
