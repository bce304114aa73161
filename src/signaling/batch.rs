//! Batched membership operations.
//!
//! `join_groups`, `leave_groups`, and `register_presence` accumulate
//! identifiers synchronously and flush once on the next scheduler tick, so
//! N synchronous calls cost one RPC. Every caller inside one batch window
//! receives a handle to the same shared completion.

use super::SignalingChannel;
use super::request::RpcError;
use crate::http::Method;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use log::debug;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

type BatchResult = Result<(), Arc<RpcError>>;
type SharedCompletion = Shared<BoxFuture<'static, BatchResult>>;

/// Handle to one batch window's shared completion.
///
/// Clones compare equal on `window_id`; every caller in the same window
/// holds the same completion.
#[derive(Clone)]
pub struct BatchHandle {
    window_id: u64,
    completion: Completion,
}

#[derive(Clone)]
enum Completion {
    Pending(SharedCompletion),
    Resolved,
}

impl BatchHandle {
    /// Identity of the batch window this handle belongs to.
    pub fn window_id(&self) -> u64 {
        self.window_id
    }

    /// Wait for the batch flush to resolve or reject.
    pub async fn wait(self) -> Result<(), Arc<RpcError>> {
        match self.completion {
            Completion::Pending(shared) => shared.await,
            Completion::Resolved => Ok(()),
        }
    }
}

struct OpenWindow {
    id: u64,
    items: Arc<Mutex<Vec<String>>>,
    handle: BatchHandle,
}

/// Accumulates identifiers for one kind of membership RPC.
pub(crate) struct Batcher {
    name: &'static str,
    window_counter: AtomicU64,
    window: Arc<Mutex<Option<OpenWindow>>>,
}

impl Batcher {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            window_counter: AtomicU64::new(1),
            window: Arc::new(Mutex::new(None)),
        }
    }

    /// An already-resolved handle, for calls that had nothing left to send.
    pub(crate) fn resolved(&self) -> BatchHandle {
        BatchHandle {
            window_id: 0,
            completion: Completion::Resolved,
        }
    }

    /// Add identifiers to the open window, or open one and schedule its
    /// flush for the next scheduler tick. Order of addition is preserved;
    /// duplicates within a window collapse.
    pub(crate) fn add<F, Fut>(&self, items: &[String], flush: F) -> BatchHandle
    where
        F: FnOnce(Vec<String>) -> Fut + Send + 'static,
        Fut: Future<Output = BatchResult> + Send + 'static,
    {
        let mut slot = self.window.lock().unwrap();

        if let Some(window) = slot.as_ref() {
            let mut pending = window.items.lock().unwrap();
            for item in items {
                if !pending.contains(item) {
                    pending.push(item.clone());
                }
            }
            return window.handle.clone();
        }

        let id = self.window_counter.fetch_add(1, Ordering::Relaxed);
        let mut initial = Vec::new();
        for item in items {
            if !initial.contains(item) {
                initial.push(item.clone());
            }
        }
        let pending = Arc::new(Mutex::new(initial));
        let (tx, rx) = oneshot::channel::<BatchResult>();
        // Fold the dropped-sender case into the result so the completion
        // output stays cloneable across every holder of the handle.
        let completion = async move {
            rx.await
                .unwrap_or_else(|_| Err(Arc::new(RpcError::Disconnected)))
        }
        .boxed()
        .shared();
        let handle = BatchHandle {
            window_id: id,
            completion: Completion::Pending(completion),
        };

        *slot = Some(OpenWindow {
            id,
            items: pending.clone(),
            handle: handle.clone(),
        });

        let name = self.name;
        let window_slot = Arc::clone(&self.window);
        tokio::spawn(async move {
            // Everything queued synchronously before this tick joins the
            // batch; the window closes the moment the flush fires.
            tokio::task::yield_now().await;
            let batch = {
                let mut slot = window_slot.lock().unwrap();
                match slot.take() {
                    Some(window) if window.id == id => {
                        window.items.lock().unwrap().drain(..).collect::<Vec<_>>()
                    }
                    other => {
                        // A different window took over; put it back.
                        *slot = other;
                        return;
                    }
                }
            };
            debug!(target: "Signaling/Batch", "Flushing {} {name} id(s)", batch.len());
            let result = flush(batch).await;
            let _ = tx.send(result);
        });

        handle
    }
}

impl SignalingChannel {
    /// Join one or more groups. Synchronous callers within a tick share a
    /// single `POST /v1/groups/` RPC.
    pub fn join_groups(self: &Arc<Self>, group_ids: &[String]) -> BatchHandle {
        let channel = Arc::clone(self);
        self.join_batch.add(group_ids, move |groups| async move {
            channel
                .request(
                    Method::Post,
                    "/v1/groups/",
                    Some(serde_json::json!({ "groups": groups })),
                )
                .await
                .map(|_| ())
                .map_err(Arc::new)
        })
    }

    /// Leave one or more groups, batched like [`join_groups`].
    ///
    /// [`join_groups`]: SignalingChannel::join_groups
    pub fn leave_groups(self: &Arc<Self>, group_ids: &[String]) -> BatchHandle {
        let channel = Arc::clone(self);
        self.leave_batch.add(group_ids, move |groups| async move {
            channel
                .request(
                    Method::Delete,
                    "/v1/groups/",
                    Some(serde_json::json!({ "groups": groups })),
                )
                .await
                .map(|_| ())
                .map_err(Arc::new)
        })
    }

    /// Subscribe to presence for the given endpoints. Batched; endpoints
    /// already registered in an earlier successful flush are suppressed.
    pub fn register_presence(self: &Arc<Self>, endpoint_ids: &[String]) -> BatchHandle {
        let fresh: Vec<String> = {
            let registered = self.registered_presence.lock().unwrap();
            endpoint_ids
                .iter()
                .filter(|id| !registered.contains(*id))
                .cloned()
                .collect()
        };
        if fresh.is_empty() {
            return self.presence_batch.resolved();
        }

        let channel = Arc::clone(self);
        self.presence_batch.add(&fresh, move |endpoints| async move {
            let result = channel
                .request(
                    Method::Post,
                    "/v1/presenceobservers",
                    Some(serde_json::json!({ "endpointList": endpoints.clone() })),
                )
                .await
                .map(|_| ())
                .map_err(Arc::new);
            if result.is_ok() {
                let mut registered = channel.registered_presence.lock().unwrap();
                for endpoint in endpoints {
                    registered.insert(endpoint);
                }
            }
            result
        })
    }
}
