//! Queue of view updates waiting to be applied asynchronously.
//!
//! Uses `crossbeam-queue::ArrayQueue` as a bounded FIFO. A writer makes
//! room before committing, and applies its updates inline when even an
//! empty queue cannot hold them, so nothing is ever dropped. An update whose application fails stays at the head
//! and is retried before anything behind it, so updates derived from one
//! base partition reach the view in the order the base accepted them.

use basalt_types::ViewId;
use basalt_view::{PartitionKey, ViewMutation};
use crossbeam_queue::ArrayQueue;
use tracing::{error, warn};

use crate::error::{BasaltError, Result};

/// View mutations derived from one base statement, for one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub view_id: ViewId,
    pub partition_key: PartitionKey,
    pub mutations: Vec<ViewMutation>,
}

/// Result of attempting to enqueue an update.
#[derive(Debug)]
pub enum PushResult<T> {
    /// Item was enqueued.
    Ok,
    /// Queue is full. Returns the item for the caller to handle.
    Backpressure(T),
}

#[derive(Debug)]
struct Stalled {
    update: PendingUpdate,
    attempts: u32,
}

/// Bounded FIFO of pending view updates.
#[derive(Debug)]
pub struct PropagationQueue {
    inner: ArrayQueue<PendingUpdate>,
    stalled: Option<Stalled>,
    max_attempts: u32,
}

impl PropagationQueue {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize, max_attempts: u32) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: ArrayQueue::new(capacity),
            stalled: None,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn try_push(&self, update: PendingUpdate) -> PushResult<PendingUpdate> {
        match self.inner.push(update) {
            Ok(()) => PushResult::Ok,
            Err(update) => PushResult::Backpressure(update),
        }
    }

    /// Pending updates, including a stalled head.
    pub fn len(&self) -> usize {
        self.inner.len() + usize::from(self.stalled.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free slots left before pushes hit backpressure.
    pub fn remaining(&self) -> usize {
        self.inner.capacity() - self.inner.len()
    }

    /// Applies queued updates in order until the queue is empty or one
    /// fails. Returns how many were applied.
    ///
    /// A failed update is kept at the head; the error reports how many
    /// attempts it has had so far.
    pub fn drain<F>(&mut self, mut apply: F) -> Result<usize>
    where
        F: FnMut(&PendingUpdate) -> Result<()>,
    {
        let mut applied = 0;
        loop {
            let mut head = match self.stalled.take() {
                Some(stalled) => stalled,
                None => match self.inner.pop() {
                    Some(update) => Stalled {
                        update,
                        attempts: 0,
                    },
                    None => return Ok(applied),
                },
            };

            if let Err(e) = apply(&head.update) {
                head.attempts += 1;
                let view_id = head.update.view_id;
                let attempts = head.attempts;
                if attempts >= self.max_attempts {
                    error!(%view_id, attempts, error = %e, "view update keeps failing");
                } else {
                    warn!(%view_id, attempts, error = %e, "view update failed, will retry");
                }
                self.stalled = Some(head);
                return Err(BasaltError::PropagationStalled {
                    view_id,
                    attempts,
                    reason: e.to_string(),
                });
            }
            applied += 1;
        }
    }

    /// Discards every pending update of a dropped view.
    pub fn discard_view(&mut self, view_id: ViewId) -> usize {
        let mut discarded = 0;
        if self
            .stalled
            .as_ref()
            .is_some_and(|s| s.update.view_id == view_id)
        {
            self.stalled = None;
            discarded += 1;
        }
        let kept: Vec<PendingUpdate> = std::iter::from_fn(|| self.inner.pop()).collect();
        for update in kept {
            if update.view_id == view_id {
                discarded += 1;
            } else if let Err(update) = self.inner.push(update) {
                // Only as many items as were just popped go back in.
                unreachable!("queue refilled beyond its own length: {update:?}");
            }
        }
        discarded
    }
}
