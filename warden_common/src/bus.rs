//! Thread-safe message queue plus a callback registry keyed by message id.
//!
//! The supervisor and the agent each own one or more buses: producers on
//! any thread [`enqueue`](MessageBus::enqueue), the I/O loop drains, and
//! received messages are fanned out with [`dispatch`](MessageBus::dispatch).
//! Callbacks run on the dispatching thread, outside every internal lock,
//! so a callback may enqueue or register without deadlocking.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::message::Message;

/// Shared callback type. Receives the message payload.
pub type Callback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// FIFO queue with blocking consumers and per-id callbacks.
pub struct MessageBus {
    queue: Mutex<VecDeque<Message>>,
    ready: Condvar,
    callbacks: RwLock<HashMap<i32, Vec<Callback>>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("queued", &self.len())
            .field("callback_ids", &self.callbacks.read().len())
            .finish()
    }
}

impl MessageBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    /// Append a message and wake one waiting consumer.
    pub fn enqueue(&self, msg: Message) {
        self.queue.lock().push_back(msg);
        self.ready.notify_one();
    }

    /// Remove the oldest message, blocking until one arrives.
    pub fn dequeue(&self) -> Message {
        let mut queue = self.queue.lock();
        loop {
            if let Some(msg) = queue.pop_front() {
                return msg;
            }
            self.ready.wait(&mut queue);
        }
    }

    /// Like [`dequeue`](Self::dequeue) but gives up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        loop {
            if let Some(msg) = queue.pop_front() {
                return Some(msg);
            }
            if self.ready.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop_front();
            }
        }
    }

    /// Remove the oldest message if there is one.
    pub fn try_dequeue(&self) -> Option<Message> {
        self.queue.lock().pop_front()
    }

    /// Remove up to `max` messages in FIFO order without blocking.
    pub fn drain(&self, max: usize) -> Vec<Message> {
        let mut queue = self.queue.lock();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Put messages back at the head, preserving their order.
    pub fn requeue_front(&self, msgs: Vec<Message>) {
        if msgs.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        for msg in msgs.into_iter().rev() {
            queue.push_front(msg);
        }
        drop(queue);
        self.ready.notify_one();
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Register a callback for `msg_type`. Callbacks for one id run in
    /// registration order.
    pub fn register<F>(&self, msg_type: i32, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .entry(msg_type)
            .or_default()
            .push(Arc::new(callback));
    }

    /// True when at least one callback is registered for `msg_type`.
    pub fn has_callbacks(&self, msg_type: i32) -> bool {
        self.callbacks
            .read()
            .get(&msg_type)
            .is_some_and(|list| !list.is_empty())
    }

    /// Invoke every callback registered for the message's id.
    ///
    /// Returns the number of callbacks run. Ids with no registration are
    /// ignored.
    pub fn dispatch(&self, msg: &Message) -> usize {
        let list: Vec<Callback> = match self.callbacks.read().get(&msg.msg_type) {
            Some(list) => list.clone(),
            None => {
                debug!(msg_type = msg.msg_type, "no callback registered");
                return 0;
            }
        };
        for callback in &list {
            callback(&msg.payload);
        }
        list.len()
    }
}
