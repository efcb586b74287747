//! The HMB Request Registry (spec.md §3, §4.4 "Request registry
//! operations"): correlates conversation ids between the send path and the
//! inbound-reply path, whichever arrives second completing the wait.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fabricrt_messaging::Block;
use uuid::Uuid;

use crate::error::BridgeError;

pub type CompletionCb = Box<dyn FnOnce(Result<Block, BridgeError>) + Send>;

struct RegistryEntry {
    callback: Option<CompletionCb>,
    response: Option<Block>,
    registered_at: Instant,
}

/// Backed by a `DashMap`, the same concurrent-registry idiom used elsewhere
/// in this codebase for correlating ids to in-flight state.
pub struct RequestRegistry {
    entries: DashMap<Uuid, RegistryEntry>,
    cancel_list: Mutex<Vec<Uuid>>,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRegistry {
    pub fn new() -> Self {
        RequestRegistry {
            entries: DashMap::new(),
            cancel_list: Mutex::new(Vec::new()),
        }
    }

    /// `registerRequest`: returns `false` if a response had already arrived
    /// (in which case `cb` is invoked synchronously, before returning) so
    /// the caller's wait completes without ever suspending.
    pub fn register_request(&self, id: Uuid, cb: CompletionCb) -> bool {
        if let Some(mut existing) = self.entries.get_mut(&id) {
            if let Some(block) = existing.response.take() {
                drop(existing);
                self.entries.remove(&id);
                cb(Ok(block));
                return false;
            }
            existing.callback = Some(cb);
            return true;
        }
        self.entries.insert(
            id,
            RegistryEntry {
                callback: Some(cb),
                response: None,
                registered_at: Instant::now(),
            },
        );
        true
    }

    /// `completeRequest`: insert-or-update; invokes a present callback
    /// outside the map's internal lock.
    pub fn complete_request(&self, id: Uuid, block: Block) {
        let taken_cb = {
            if let Some(mut entry) = self.entries.get_mut(&id) {
                if let Some(cb) = entry.callback.take() {
                    Some(cb)
                } else {
                    entry.response = Some(block.clone());
                    None
                }
            } else {
                self.entries.insert(
                    id,
                    RegistryEntry {
                        callback: None,
                        response: Some(block.clone()),
                        registered_at: Instant::now(),
                    },
                );
                None
            }
        };
        if let Some(cb) = taken_cb {
            self.entries.remove(&id);
            cb(Ok(block));
        }
    }

    /// `closeRequest`: erase with cancel semantics, returning any response
    /// that had accumulated.
    pub fn close_request(&self, id: Uuid) -> Option<Block> {
        self.entries.remove(&id).and_then(|(_, entry)| entry.response)
    }

    /// `scheduleForCancel`: enqueue for the 200 ms cancel-drain timer.
    pub fn schedule_for_cancel(&self, id: Uuid) {
        self.cancel_list.lock().unwrap().push(id);
    }

    fn abort_request(&self, id: Uuid, reason: &'static str) {
        if let Some((_, entry)) = self.entries.remove(&id) {
            if let Some(cb) = entry.callback {
                cb(Err(BridgeError::Aborted { reason }));
            }
        }
    }

    /// Drains the cancel list, completing each pending request with
    /// `OperationAborted`. Intended to run on the 200 ms timer.
    pub fn drain_cancel_list(&self) {
        let ids = std::mem::take(&mut *self.cancel_list.lock().unwrap());
        for id in ids {
            self.abort_request(id, "cancelled");
        }
    }

    /// Detaches every entry older than `timeout`, completing each with
    /// `OperationAborted`. Intended to run on the 5 s prune timer.
    pub fn prune_expired(&self, timeout: Duration) {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|entry| now.duration_since(entry.registered_at) > timeout)
            .map(|entry| *entry.key())
            .collect();
        for id in expired {
            self.abort_request(id, "request timeout");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::sync::mpsc;

    fn fake_block() -> Block {
        Block::new(BytesMut::from(&b"hello"[..]), 5)
    }

    #[test]
    fn response_before_register_completes_synchronously() {
        let registry = RequestRegistry::new();
        let id = Uuid::new_v4();
        registry.complete_request(id, fake_block());

        let (tx, rx) = mpsc::channel();
        let still_waiting = registry.register_request(
            id,
            Box::new(move |result| {
                tx.send(result.is_ok()).unwrap();
            }),
        );
        assert!(!still_waiting);
        assert!(rx.recv().unwrap());
        assert!(registry.is_empty());
    }

    #[test]
    fn register_then_response_completes_the_waiter() {
        let registry = RequestRegistry::new();
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel();
        let still_waiting = registry.register_request(
            id,
            Box::new(move |result| {
                tx.send(result.is_ok()).unwrap();
            }),
        );
        assert!(still_waiting);
        registry.complete_request(id, fake_block());
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn close_after_register_returns_none_and_removes_entry() {
        let registry = RequestRegistry::new();
        let id = Uuid::new_v4();
        registry.register_request(id, Box::new(|_| {}));
        assert!(registry.close_request(id).is_none());
        assert!(registry.is_empty());
    }
}
