//! Listener and TLS setup.
//!
//! Listen addresses take the forms
//! - `tcp://127.0.0.1:9001` or bare `127.0.0.1:9001`
//! - `unix:///run/bifrost.sock` (Unix only)

use std::fmt;
use std::fs;
use std::future::Future;
use std::path::PathBuf;

use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Router;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tracing::debug;

use super::config::TlsConfig;
use crate::{BifrostError, Result};

/// Where the gRPC server accepts connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(String),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl ListenAddr {
    pub fn parse(listen: &str) -> Result<Self> {
        if let Some(addr) = listen.strip_prefix("tcp://") {
            return Self::tcp(addr);
        }
        if let Some(path) = listen.strip_prefix("unix://") {
            #[cfg(unix)]
            {
                if path.is_empty() {
                    return Err(BifrostError::Configuration(
                        "unix listen address needs a socket path".to_string(),
                    ));
                }
                return Ok(ListenAddr::Unix(PathBuf::from(path)));
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(BifrostError::Configuration(
                    "unix sockets are not supported on this platform".to_string(),
                ));
            }
        }
        if listen.contains("://") {
            return Err(BifrostError::Configuration(format!(
                "unsupported listen scheme: {listen}"
            )));
        }
        Self::tcp(listen)
    }

    fn tcp(addr: &str) -> Result<Self> {
        if !addr.contains(':') {
            return Err(BifrostError::Configuration(format!(
                "tcp listen address needs host:port, got {addr:?}"
            )));
        }
        Ok(ListenAddr::Tcp(addr.to_string()))
    }

    /// Bind the socket. Synchronous so it can run inside the bridge's
    /// startup critical section; needs a tokio runtime context.
    pub(crate) fn bind(&self) -> Result<BoundListener> {
        let bind_error = |source| BifrostError::Bind {
            addr: self.to_string(),
            source,
        };

        match self {
            ListenAddr::Tcp(addr) => {
                let listener = std::net::TcpListener::bind(addr).map_err(bind_error)?;
                listener.set_nonblocking(true).map_err(bind_error)?;
                let listener = tokio::net::TcpListener::from_std(listener).map_err(bind_error)?;
                Ok(BoundListener::Tcp(listener))
            }
            #[cfg(unix)]
            ListenAddr::Unix(path) => {
                if path.exists() {
                    debug!(path = %path.display(), "removing stale socket");
                    fs::remove_file(path).map_err(bind_error)?;
                }
                let listener = std::os::unix::net::UnixListener::bind(path).map_err(bind_error)?;
                listener.set_nonblocking(true).map_err(bind_error)?;
                let listener = tokio::net::UnixListener::from_std(listener).map_err(bind_error)?;
                Ok(BoundListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "tcp://{addr}"),
            #[cfg(unix)]
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A bound socket not yet accepting.
#[derive(Debug)]
pub(crate) enum BoundListener {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

impl BoundListener {
    /// Resolved address, with the real port for `:0` binds.
    pub(crate) fn local_addr(&self) -> String {
        match self {
            BoundListener::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => addr.to_string(),
                Err(_) => "tcp://<unknown>".to_string(),
            },
            #[cfg(unix)]
            BoundListener::Unix { path, .. } => format!("unix://{}", path.display()),
        }
    }

    /// Run the accept loop until `signal` resolves and in-flight calls drain.
    pub(crate) async fn serve<F>(self, router: Router, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        match self {
            BoundListener::Tcp(listener) => {
                router
                    .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
                    .await?;
            }
            #[cfg(unix)]
            BoundListener::Unix { listener, path } => {
                let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);
                let result = router.serve_with_incoming_shutdown(incoming, signal).await;
                if let Err(e) = fs::remove_file(&path) {
                    debug!(path = %path.display(), error = %e, "failed to remove socket");
                }
                result?;
            }
        }
        Ok(())
    }
}

/// Read TLS credentials from PEM files.
pub fn load_tls(config: &TlsConfig) -> Result<ServerTlsConfig> {
    let read = |path: &PathBuf, what: &str| {
        fs::read(path).map_err(|e| {
            BifrostError::Tls(format!("failed to read {what} {}: {e}", path.display()))
        })
    };

    let cert = read(&config.cert, "certificate")?;
    let key = read(&config.key, "private key")?;
    let mut tls = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));

    if let Some(ca) = &config.client_ca {
        let ca = read(ca, "client CA")?;
        tls = tls.client_ca_root(Certificate::from_pem(ca));
    }

    Ok(tls)
}
