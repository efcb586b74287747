//! Production TLS connector: builds a `ConnectFn` that dials a TCP socket
//! and performs a TLS handshake using the platform's native trust store.

use std::sync::Arc;

use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::client::boxed_connect;
use crate::error::MessagingError;
use crate::reconnect::ConnectFn;

/// Builds a native-root-store `rustls::ClientConfig` shared by both
/// connections.
pub fn native_tls_config() -> Result<Arc<rustls::ClientConfig>, MessagingError> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in native.errors {
        tracing::warn!(%err, "error loading a native root certificate");
    }
    for cert in native.certs {
        let _ = roots.add(cert);
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Builds a `ConnectFn<TlsStream<TcpStream>>` that connects to `host:port`
/// and validates the peer certificate against `server_name`.
pub fn tcp_tls_connect_fn(
    host: String,
    port: u16,
    server_name: String,
    tls_config: Arc<rustls::ClientConfig>,
) -> ConnectFn<TlsStream<TcpStream>> {
    boxed_connect(move || {
        let host = host.clone();
        let server_name = server_name.clone();
        let tls_config = Arc::clone(&tls_config);
        async move {
            let tcp = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(MessagingError::Transport)?;
            tcp.set_nodelay(true).ok();
            let connector = TlsConnector::from(tls_config);
            let name = ServerName::try_from(server_name)
                .map_err(|_| {
                    MessagingError::Transport(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "invalid TLS server name",
                    ))
                })?
                .to_owned();
            connector
                .connect(name, tcp)
                .await
                .map_err(MessagingError::Transport)
        }
    })
}
