//! Per-side reconnect state machine (spec.md §4.3 "Reconnect state machine
//! (per side)").
//!
//! Generic over the underlying stream type so the reconnect logic can be
//! exercised in tests against an in-memory duplex stream instead of a real
//! TLS socket.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::MessagingError;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A factory for new connection attempts, invoked once per reconnect cycle.
pub type ConnectFn<S> = Arc<dyn Fn() -> BoxFuture<Result<S, MessagingError>> + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Side {
    Sender,
    Receiver,
}

impl Side {
    fn label(&self) -> &'static str {
        match self {
            Side::Sender => "sender",
            Side::Receiver => "receiver",
        }
    }
}

/// One half of the dual connection: tracks whichever of {no connector, a
/// connector in flight, an established connection} currently applies.
pub struct SideSlot<S: Send + 'static> {
    side: Side,
    connector: Option<JoinHandle<Result<S, MessagingError>>>,
    connection: Option<Arc<AsyncMutex<S>>>,
    last_logged_code: Option<&'static str>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> SideSlot<S> {
    pub fn new(side: Side) -> Self {
        SideSlot {
            side,
            connector: None,
            connection: None,
            last_logged_code: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection(&self) -> Option<Arc<AsyncMutex<S>>> {
        self.connection.clone()
    }

    pub fn clear_connection(&mut self) {
        self.connection = None;
    }

    /// Runs one reconcile tick. Returns `true` if `is_connected()` flipped
    /// as a result (used by the owning client to decide whether to
    /// regenerate the channel id).
    pub async fn tick(&mut self, connect: &ConnectFn<S>) -> bool {
        let was_connected = self.is_connected();

        if self.connection.is_some() {
            // Connected; a live read/write error elsewhere calls
            // `clear_connection` and the next tick will reconnect.
        } else if let Some(handle) = self.connector.as_ref() {
            if handle.is_finished() {
                let handle = self.connector.take().unwrap();
                match handle.await {
                    Ok(Ok(stream)) => {
                        info!(side = self.side.label(), "connected to broker");
                        self.connection = Some(Arc::new(AsyncMutex::new(stream)));
                        self.last_logged_code = None;
                    }
                    Ok(Err(err)) => {
                        self.log_failure(&err);
                        self.connector = Some(tokio::spawn((connect.as_ref())()));
                    }
                    Err(join_err) => {
                        warn!(side = self.side.label(), error = %join_err, "connector task panicked");
                        self.connector = Some(tokio::spawn((connect.as_ref())()));
                    }
                }
            }
            // else: still connecting, do nothing this tick.
        } else {
            self.connector = Some(tokio::spawn((connect.as_ref())()));
        }

        was_connected != self.is_connected()
    }

    fn log_failure(&mut self, err: &MessagingError) {
        let code = err.code();
        if err.is_expected() {
            if self.last_logged_code != Some(code) {
                debug!(side = self.side.label(), code, "expected connect failure");
                self.last_logged_code = Some(code);
            }
        } else {
            warn!(side = self.side.label(), %err, "unexpected connect failure");
        }
    }
}
