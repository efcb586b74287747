//! Error domain for the messaging client.

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("target peer not found: {0}")]
    PeerNotFound(String),

    #[error("operation aborted: {reason}")]
    Aborted { reason: &'static str },

    #[error("transport error: {0}")]
    Transport(std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
}

impl MessagingError {
    /// Socket-level errors the default completion callback (spec.md §4.3)
    /// swallows rather than logs at warning level — cancellation and the
    /// ordinary connection-reset/broken-pipe family.
    pub fn is_expected(&self) -> bool {
        match self {
            MessagingError::Aborted { .. } => true,
            MessagingError::Transport(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// A stable code identifying the error's *kind*, used to suppress
    /// repeated identical log lines during reconnect (spec.md §4.3).
    pub fn code(&self) -> &'static str {
        match self {
            MessagingError::NotConnected => "not_connected",
            MessagingError::PeerNotFound(_) => "peer_not_found",
            MessagingError::Aborted { .. } => "aborted",
            MessagingError::Transport(io_err) => match io_err.kind() {
                std::io::ErrorKind::ConnectionReset => "conn_reset",
                std::io::ErrorKind::ConnectionAborted => "conn_aborted",
                std::io::ErrorKind::BrokenPipe => "broken_pipe",
                std::io::ErrorKind::TimedOut => "timed_out",
                _ => "transport_other",
            },
            MessagingError::Tls(_) => "tls_error",
        }
    }
}
