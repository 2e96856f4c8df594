//! HTTP listener and graceful shutdown.
//!
//! # Graceful shutdown
//!
//! On **SIGTERM** or **SIGINT** the server:
//! 1. Flips the service's [`Shutdown`](crate::Shutdown) flag, so every
//!    response from then on carries `connection: close`.
//! 2. Stops calling `listener.accept()`.
//! 3. Lets every in-flight connection task run to completion.
//! 4. Returns from [`Server::serve`].
//!
//! In-flight requests are never cancelled.

use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::BodyExt;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::app::{App, Service};
use crate::envelope::{BodyStream, BoxError};
use crate::error::Error;

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    pub fn bind(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Accepts connections and answers them with `service` until a shutdown
    /// signal arrives and every in-flight connection has finished.
    pub async fn serve(self, service: Service) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "fulcrum listening");

        let mut tasks = tokio::task::JoinSet::new();

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    service.shutdown().begin();
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let service = service.clone();
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        let svc = service_fn(move |req| {
                            let service = service.clone();
                            async move { dispatch(service, req, remote_addr).await }
                        });

                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("fulcrum stopped");
        Ok(())
    }
}

/// Builds `app`, installs logging and serves on the configured address.
pub async fn run(app: App) -> Result<(), Error> {
    crate::logging::init(app.settings());
    let addr = app.settings().addr()?;
    let service = app.build().await?;
    Server::bind(addr).serve(service).await
}

// ── Request dispatch ──────────────────────────────────────────────────────────

async fn dispatch(
    service: Service,
    req: hyper::Request<hyper::body::Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<BodyStream>, Infallible> {
    let req = req.map(|body| body.map_err(BoxError::from).boxed_unsync());
    Ok(service.respond(req, Some(remote_addr)).await)
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or Ctrl-C. A handler that cannot be
/// installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("could not install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("could not install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
