//! Request queue: serialized admission of outbound requests.
//!
//! One request is "current" at a time; the rest wait in FIFO order. The promoted
//! request is handed to a processor channel (the assembler's inbox) and the
//! submitter's oneshot resolves when the request completes or fails.

use crate::delivery::{ChannelContext, OutboundDelivery};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("request failed: {0}")]
    Failed(String),
    #[error("queue dropped before the request resolved")]
    Dropped,
}

/// One admitted request: id, context, and the delivery adapter it arrived with.
#[derive(Clone)]
pub struct QueuedRequest {
    pub id: String,
    pub context: ChannelContext,
    pub delivery: Arc<dyn OutboundDelivery>,
}

struct Entry {
    request: QueuedRequest,
    done: oneshot::Sender<Result<String, QueueError>>,
}

struct QueueState {
    pending: VecDeque<Entry>,
    current: Option<Entry>,
}

/// Serializes request admission; exposes the current request and its
/// completion/failure hooks.
pub struct RequestQueue {
    state: Mutex<QueueState>,
    processor: Mutex<Option<mpsc::Sender<QueuedRequest>>>,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                current: None,
            }),
            processor: Mutex::new(None),
        }
    }

    /// Register the processor inbox that promoted requests are handed to.
    pub async fn set_processor(&self, tx: mpsc::Sender<QueuedRequest>) {
        *self.processor.lock().await = Some(tx);
        self.promote().await;
    }

    /// Admit a request. Resolves with the finalized response text, or a
    /// `QueueError` when the request fails.
    pub async fn submit(
        &self,
        context: ChannelContext,
        delivery: Arc<dyn OutboundDelivery>,
    ) -> oneshot::Receiver<Result<String, QueueError>> {
        let (done_tx, done_rx) = oneshot::channel();
        let request = QueuedRequest {
            id: format!("req-{}", uuid::Uuid::new_v4()),
            context,
            delivery,
        };
        {
            let mut state = self.state.lock().await;
            state.pending.push_back(Entry {
                request,
                done: done_tx,
            });
        }
        self.promote().await;
        done_rx
    }

    /// The request currently being processed, if any.
    pub async fn current(&self) -> Option<QueuedRequest> {
        self.state.lock().await.current.as_ref().map(|e| e.request.clone())
    }

    /// Resolve the current request with the finalized text and promote the next.
    pub async fn complete_current(&self, text: &str) {
        let entry = self.state.lock().await.current.take();
        match entry {
            Some(entry) => {
                let _ = entry.done.send(Ok(text.to_string()));
            }
            None => log::debug!("complete_current with no current request"),
        }
        self.promote().await;
    }

    /// Fail the current request with a reason and promote the next.
    pub async fn fail_current(&self, reason: &str) {
        let entry = self.state.lock().await.current.take();
        match entry {
            Some(entry) => {
                let _ = entry.done.send(Err(QueueError::Failed(reason.to_string())));
            }
            None => log::debug!("fail_current with no current request"),
        }
        self.promote().await;
    }

    /// Promote the next pending request when none is current; dispatch happens
    /// outside the state lock. Requests stay pending until a processor exists.
    async fn promote(&self) {
        let tx = self.processor.lock().await.clone();
        let Some(tx) = tx else { return };
        let dispatch = {
            let mut state = self.state.lock().await;
            if state.current.is_some() {
                None
            } else if let Some(entry) = state.pending.pop_front() {
                let request = entry.request.clone();
                state.current = Some(entry);
                Some(request)
            } else {
                None
            }
        };
        let Some(request) = dispatch else { return };
        if tx.send(request).await.is_err() {
            log::warn!("request processor channel closed");
            if let Some(entry) = self.state.lock().await.current.take() {
                let _ = entry.done.send(Err(QueueError::Dropped));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::LogDelivery;

    #[tokio::test]
    async fn requests_are_processed_one_at_a_time() {
        let queue = RequestQueue::new();
        let (tx, mut rx) = mpsc::channel(8);
        queue.set_processor(tx).await;

        let first = queue
            .submit(ChannelContext::new("one"), Arc::new(LogDelivery))
            .await;
        let second = queue
            .submit(ChannelContext::new("two"), Arc::new(LogDelivery))
            .await;

        let processed = rx.recv().await.expect("first promoted");
        assert_eq!(processed.context.content, "one");
        // Second stays pending until the first resolves.
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.current().await.expect("current").id, processed.id);

        queue.complete_current("done").await;
        assert_eq!(first.await.expect("first hook").expect("first ok"), "done");

        let processed = rx.recv().await.expect("second promoted");
        assert_eq!(processed.context.content, "two");
        queue.fail_current("boom").await;
        let err = second.await.expect("second hook").expect_err("second fails");
        assert!(matches!(err, QueueError::Failed(ref r) if r == "boom"));
        assert!(queue.current().await.is_none());
    }

    #[tokio::test]
    async fn submit_before_processor_is_promoted_on_registration() {
        let queue = RequestQueue::new();
        let pending = queue
            .submit(ChannelContext::new("early"), Arc::new(LogDelivery))
            .await;
        let (tx, mut rx) = mpsc::channel(8);
        queue.set_processor(tx).await;
        let processed = rx.recv().await.expect("promoted after registration");
        assert_eq!(processed.context.content, "early");
        queue.complete_current("ok").await;
        assert_eq!(pending.await.expect("hook").expect("ok"), "ok");
    }
}
