//! The narrow messaging-backend capability the bridge depends on: "Put"
//! (push a block to a target peer). Kept as a trait so tests can substitute
//! a fake backend without a real broker connection.

use fabricrt_messaging::{Block, CompletionCallback, MessagingClient};

pub trait MessagingBackend: Send + Sync {
    fn push_block(&self, block: Block, cb: CompletionCallback);
    fn is_connected(&self) -> bool;
}

impl MessagingBackend for MessagingClient {
    fn push_block(&self, block: Block, cb: CompletionCallback) {
        MessagingClient::push_block(self, block, Some(cb))
    }

    fn is_connected(&self) -> bool {
        MessagingClient::is_connected(self)
    }
}
