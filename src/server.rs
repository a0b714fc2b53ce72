use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, field, info, instrument, warn};
use tracing_subscriber::EnvFilter;

use crate::commands::executable::Executable;
use crate::commands::Command;
use crate::config::Config;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

/// How long the accept loop waits after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Binds the configured address and serves clients until `shutdown` completes.
pub async fn run(config: Config, shutdown: impl Future) -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;

    serve(listener, config, shutdown).await
}

/// Accepts connections on `listener`, one task per client, until `shutdown` completes.
///
/// On shutdown the listener is closed first. Every connection then finishes the request it is
/// working on, if any, and closes. Returns once all of them are gone.
pub async fn serve(
    listener: TcpListener,
    config: Config,
    shutdown: impl Future,
) -> Result<(), Error> {
    let store = Store::new();
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();

    info!("Server listening on {}", listener.local_addr()?);

    tokio::pin!(shutdown);

    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = &mut shutdown => break,
        };
        let (socket, client_address) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                // Errors such as running out of file descriptors persist for a while.
                tokio::select! {
                    _ = time::sleep(ACCEPT_ERROR_BACKOFF) => continue,
                    _ = &mut shutdown => break,
                }
            }
        };

        info!("Accepted connection from {:?}", client_address);

        let store = store.clone();
        let token = token.clone();
        let max_frame_size = config.max_frame_size;

        tracker.spawn(async move {
            if let Err(e) =
                handle_connection(socket, client_address, store, max_frame_size, token).await
            {
                warn!("Connection dropped: {}", e);
            }
        });
    }

    info!("Shutting down, waiting for {} connection(s)", tracker.len());
    drop(listener);
    token.cancel();
    tracker.close();
    tracker.wait().await;
    info!("Server shutdown complete");

    Ok(())
}

#[instrument(name = "connection", skip_all, fields(connection_id, client_address))]
async fn handle_connection(
    stream: TcpStream,
    client_address: SocketAddr,
    store: Store,
    max_frame_size: usize,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let mut conn = Connection::with_max_frame_size(stream, max_frame_size);

    tracing::Span::current()
        .record("connection_id", field::display(conn.id))
        .record("client_address", field::display(client_address));

    loop {
        // Shutdown is only observed while waiting for a request. A reply that is being built or
        // written always goes out.
        let frame = tokio::select! {
            res = conn.read_frame() => res?,
            _ = shutdown.cancelled() => {
                info!("Closing connection, server is shutting down");
                break;
            }
        };
        let Some(frame) = frame else {
            break;
        };

        debug!("Received frame from client: {}", frame);
        let res = match Command::try_from(frame) {
            Ok(cmd) => {
                debug!("Executing {}", cmd);
                cmd.exec(store.clone())?
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => Frame::Error(e.to_string()),
        };
        debug!("Sending response to client: {}", res);

        conn.write_frame(res).await?;
    }

    info!("Connection closed");
    Ok(())
}

/// Completes on SIGINT, or on SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
