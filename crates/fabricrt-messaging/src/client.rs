//! Messaging Client (MC): a persistent dual-connection broker client.
//!
//! See spec.md §4.3. The client is generic over its stream type so the
//! reconnect/dispatch machinery can be driven in tests against an in-memory
//! duplex stream (see `tests/` in this crate) instead of a real TLS socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::block::Block;
use crate::error::MessagingError;
use crate::reconnect::{BoxFuture, ConnectFn, Side, SideSlot};

pub type CompletionCallback = Box<dyn FnOnce(Result<(), MessagingError>) + Send>;
pub type InboundHandler = Arc<dyn Fn(Block) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub source_peer_id: String,
    pub reconnect_interval: Duration,
    pub no_copy: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            source_peer_id: Uuid::new_v4().to_string(),
            reconnect_interval: Duration::from_secs(5),
            no_copy: true,
        }
    }
}

enum Command {
    Push {
        block: Block,
        cb: CompletionCallback,
    },
    Shutdown,
}

/// Shared, cheaply-cloneable handle to a running messaging client.
pub struct MessagingClient {
    config: ClientConfig,
    cmd_tx: mpsc::UnboundedSender<Command>,
    channel_id: Arc<RwLock<Uuid>>,
    connected_sender: Arc<AtomicBool>,
    connected_receiver: Arc<AtomicBool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl MessagingClient {
    /// Spawns the reconnect reconciler and returns a handle. `connect_sender`
    /// / `connect_receiver` build a fresh connection attempt each time one is
    /// needed; `inbound` receives every block the receiver side decodes.
    pub fn spawn<S>(
        config: ClientConfig,
        connect_sender: ConnectFn<S>,
        connect_receiver: ConnectFn<S>,
        inbound: InboundHandler,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let channel_id = Arc::new(RwLock::new(Uuid::new_v4()));
        let connected_sender = Arc::new(AtomicBool::new(false));
        let connected_receiver = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_reconciler(
            config.clone(),
            cmd_rx,
            connect_sender,
            connect_receiver,
            inbound,
            Arc::clone(&channel_id),
            Arc::clone(&connected_sender),
            Arc::clone(&connected_receiver),
        ));

        Arc::new(MessagingClient {
            config,
            cmd_tx,
            channel_id,
            connected_sender,
            connected_receiver,
            task: std::sync::Mutex::new(Some(task)),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected_sender.load(Ordering::SeqCst) && self.connected_receiver.load(Ordering::SeqCst)
    }

    pub fn channel_id(&self) -> Uuid {
        *self.channel_id.read()
    }

    /// `pushBlock`: fails immediately with `NotConnected` if the sender side
    /// has never connected; otherwise queues the block for the reconciler
    /// to write, invoking either the caller's callback or the client-wide
    /// default.
    pub fn push_block(&self, block: Block, cb: Option<CompletionCallback>) {
        let cb = cb.unwrap_or_else(|| Box::new(default_completion_callback));
        if !self.connected_sender.load(Ordering::SeqCst) {
            cb(Err(MessagingError::NotConnected));
            return;
        }
        if self.cmd_tx.send(Command::Push { block, cb }).is_err() {
            // Reconciler already shut down; the dropped command's callback
            // would otherwise never fire.
            warn!("pushBlock after messaging client shutdown");
        }
    }

    /// Idempotent shutdown: cancels and awaits the reconciler in order.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(Command::Shutdown);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

/// Swallows "expected" socket-level errors (spec.md §4.3 "Default completion
/// callback"); logs the rest.
fn default_completion_callback(result: Result<(), MessagingError>) {
    if let Err(err) = result {
        if err.is_expected() {
            tracing::debug!(code = err.code(), "expected push failure");
        } else {
            tracing::warn!(code = err.code(), %err, "push failed");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_reconciler<S>(
    config: ClientConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    connect_sender: ConnectFn<S>,
    connect_receiver: ConnectFn<S>,
    inbound: InboundHandler,
    channel_id: Arc<RwLock<Uuid>>,
    connected_sender: Arc<AtomicBool>,
    connected_receiver: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut sender = SideSlot::<S>::new(Side::Sender);
    let mut receiver = SideSlot::<S>::new(Side::Receiver);
    let (lost_tx, mut lost_rx) = mpsc::unbounded_channel::<Side>();

    let mut interval = tokio::time::interval(config.reconnect_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let sender_flip = sender.tick(&connect_sender).await;
                let receiver_flip = receiver.tick(&connect_receiver).await;

                if receiver_flip && receiver.is_connected() {
                    if let Some(conn) = receiver.connection() {
                        spawn_read_loop(conn, inbound.clone(), lost_tx.clone());
                    }
                }

                if sender_flip || receiver_flip {
                    regenerate_channel_id(&channel_id, &config);
                }
                connected_sender.store(sender.is_connected(), Ordering::SeqCst);
                connected_receiver.store(receiver.is_connected(), Ordering::SeqCst);
            }
            lost = lost_rx.recv() => {
                let flip = match lost {
                    Some(Side::Sender) => {
                        let flip = sender.is_connected();
                        sender.clear_connection();
                        flip
                    }
                    Some(Side::Receiver) => {
                        let flip = receiver.is_connected();
                        receiver.clear_connection();
                        flip
                    }
                    None => false,
                };
                if flip {
                    regenerate_channel_id(&channel_id, &config);
                }
                connected_sender.store(sender.is_connected(), Ordering::SeqCst);
                connected_receiver.store(receiver.is_connected(), Ordering::SeqCst);
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Push { block, cb }) => {
                        handle_push(&sender, block, cb, &lost_tx).await;
                    }
                    Some(Command::Shutdown) | None => break,
                }
            }
        }
    }

    info!("messaging client reconciler shutting down");
}

async fn handle_push<S>(
    sender: &SideSlot<S>,
    block: Block,
    cb: CompletionCallback,
    lost_tx: &mpsc::UnboundedSender<Side>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some(conn) = sender.connection() else {
        cb(Err(MessagingError::NotConnected));
        return;
    };
    let frame = block.encode_frame();
    let mut guard = conn.lock().await;
    match guard.write_all(&frame).await {
        Ok(()) => {
            drop(guard);
            cb(Ok(()));
        }
        Err(io_err) => {
            drop(guard);
            let _ = lost_tx.send(Side::Sender);
            cb(Err(MessagingError::Transport(io_err)));
        }
    }
}

fn spawn_read_loop<S>(
    conn: Arc<tokio::sync::Mutex<S>>,
    inbound: InboundHandler,
    lost_tx: mpsc::UnboundedSender<Side>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let block = {
                let mut guard = conn.lock().await;
                read_one_frame(&mut *guard).await
            };
            match block {
                Ok(block) => inbound(block),
                Err(err) => {
                    if !err.is_expected() {
                        warn!(%err, "receiver read loop ending");
                    }
                    let _ = lost_tx.send(Side::Receiver);
                    break;
                }
            }
        }
    });
}

async fn read_one_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Block, MessagingError> {
    let mut header = [0u8; 8];
    stream
        .read_exact(&mut header)
        .await
        .map_err(MessagingError::Transport)?;
    let offset1 = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
    let total_len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
    let mut body = bytes::BytesMut::zeroed(total_len);
    stream
        .read_exact(&mut body)
        .await
        .map_err(MessagingError::Transport)?;
    Block::decode_frame({
        let mut framed = bytes::BytesMut::with_capacity(8 + total_len);
        framed.extend_from_slice(&header);
        framed.extend_from_slice(&body);
        framed
    })
    .ok_or(MessagingError::Transport(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "malformed block frame",
    )))
}

fn regenerate_channel_id(channel_id: &Arc<RwLock<Uuid>>, config: &ClientConfig) {
    let new_id = Uuid::new_v4();
    *channel_id.write() = new_id;
    info!(source_peer_id = %config.source_peer_id, channel_id = %new_id, "channel id rotated");
}

/// Helper for constructing a `ConnectFn` from a plain async closure; kept
/// here (rather than inlined at call sites) because boxing/pinning a
/// closure's future is easy to get subtly wrong.
pub fn boxed_connect<S, F, Fut>(f: F) -> ConnectFn<S>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<S, MessagingError>> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<Result<S, MessagingError>> { Box::pin(f()) })
}
