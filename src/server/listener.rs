use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::http::connection::Connection;
use crate::relay::Relay;

/// Pause after a failed accept, e.g. while the process is out of file
/// descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Binds the configured address and serves relay traffic.
pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&cfg.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.listen_addr))?;
    info!("Listening on {}", cfg.server.listen_addr);

    let relay = Arc::new(Relay::from_config(cfg)?);
    serve(listener, relay).await
}

/// Accepts connections on an already bound listener, one task each.
///
/// Never returns; accept failures are logged and retried.
pub async fn serve(listener: TcpListener, relay: Arc<Relay>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = accept_next(|| listener.accept()).await;
        info!("Accepted connection from {}", peer);

        let relay = Arc::clone(&relay);
        tokio::spawn(async move {
            let mut conn = Connection::new(socket, relay);
            if let Err(e) = conn.run().await {
                tracing::error!("Connection error from {}: {}", peer, e);
            }
        });
    }
}

/// Calls `accept` until it succeeds, backing off after each failure.
async fn accept_next<T, A, F>(mut accept: A) -> T
where
    A: FnMut() -> F,
    F: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
