//! Unix-socket gRPC serving.

use std::future::Future;
use std::io;
use std::path::Path;

use thiserror::Error;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::info;

use crate::plugin::{V1Plugin, V2Plugin};
use crate::proto::v1beta1::key_management_service_server::KeyManagementServiceServer as V1Server;
use crate::proto::v2::key_management_service_server::KeyManagementServiceServer as V2Server;

/// Errors raised while serving an RPC endpoint.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The socket path could not be prepared or bound.
    #[error("failed to bind unix socket: {0}")]
    Bind(#[from] io::Error),

    /// The gRPC server terminated with an error.
    #[error("grpc server error: {0}")]
    Serve(#[from] tonic::transport::Error),
}

/// Binds `path`, removing a stale socket file left behind by an unclean
/// shutdown (SIGKILL does not run cleanup).
fn bind(path: &Path) -> Result<UnixListener, ServerError> {
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "removed existing socket"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(ServerError::Bind(err)),
    }
    Ok(UnixListener::bind(path)?)
}

/// Serves the v1beta1 plugin on `path` until `shutdown` resolves.
pub async fn serve_v1<F>(path: &Path, plugin: V1Plugin, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    let listener = bind(path)?;
    info!(path = %path.display(), "v1 server listening");
    Server::builder()
        .add_service(V1Server::new(plugin))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await?;
    Ok(())
}

/// Serves the v2 plugin on `path` until `shutdown` resolves.
pub async fn serve_v2<F>(path: &Path, plugin: V2Plugin, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    let listener = bind(path)?;
    info!(path = %path.display(), "v2 server listening");
    Server::builder()
        .add_service(V2Server::new(plugin))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await?;
    Ok(())
}
