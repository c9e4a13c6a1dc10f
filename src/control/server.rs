//! Control socket - HTTP/1.1 and HTTP/2 over a Unix domain socket

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::UnixListener;
use tower::Service;
use tracing::{debug, error, info};

/// Socket permissions: owner and group only
const SOCKET_MODE: u32 = 0o660;

/// Bind the control socket, replacing a stale one left by a previous run
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
    info!("Control socket listening on {}", path.display());
    Ok(listener)
}

/// Serve `app` until `shutdown` resolves, then drain open connections
pub async fn serve<F>(listener: UnixListener, app: Router, shutdown: F)
where
    F: Future<Output = ()>,
{
    let builder = AutoBuilder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let socket = match result {
                    Ok((socket, _)) => socket,
                    Err(e) => {
                        error!("Failed to accept control connection: {}", e);
                        continue;
                    }
                };

                let app = app.clone();
                let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                    let mut app = app.clone();
                    let req = req.map(axum::body::Body::new);
                    async move { app.call(req).await }
                });

                let conn = builder.serve_connection_with_upgrades(TokioIo::new(socket), service);
                let conn = graceful.watch(conn.into_owned());

                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!("Control connection closed: {}", e);
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Control socket no longer accepting connections");
                break;
            }
        }
    }

    graceful.shutdown().await;
    debug!("Control connections drained");
}

/// Delete the socket file on the way out
pub fn remove(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed control socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!("Failed to remove control socket {}: {}", path.display(), e),
    }
}
