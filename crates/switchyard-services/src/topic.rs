//! Per-spot inbox holding delivered topic messages until `recv`.
//!
//! QUEUE messages share one bounded FIFO; a full FIFO pushes back on the
//! sender. RINGBUFFER messages go to a fixed-depth ring per topic that
//! overwrites its oldest entry. Every entry carries an arrival sequence so
//! `pop` hands out messages in arrival order across the FIFO and the rings.
//!
//! A FIFO slot can be reserved ahead of the message with `try_reserve`, so a
//! publisher can hold room in every destination before committing to any.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::Instant;

use switchyard_core::{Message, TopicMode, Wait};

use crate::error::{Error, Result};

#[derive(Debug)]
struct Entry {
    seq: u64,
    topic: String,
    parts: Message,
}

#[derive(Debug)]
struct State {
    queue: VecDeque<Entry>,
    /// FIFO slots held by outstanding `Slot`s.
    reserved: usize,
    rings: HashMap<String, VecDeque<Entry>>,
    next_seq: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct Inbox {
    state: Mutex<State>,
    queue_capacity: usize,
    ring_capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl Inbox {
    pub fn new(queue_capacity: usize, ring_capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                reserved: 0,
                rings: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            queue_capacity: queue_capacity.max(1),
            ring_capacity: ring_capacity.max(1),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        let state = self.lock();
        state.queue.len() + state.rings.values().map(VecDeque::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store one message. Ring topics never wait; the queue waits for room
    /// as `wait` allows.
    pub async fn push(&self, topic: &str, mode: TopicMode, parts: Message, wait: Wait) -> Result<()> {
        let deadline = deadline(wait);
        let mut parts = Some(parts);
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(p) = parts.take() {
                match self.try_push(topic, mode, p) {
                    Ok(()) => return Ok(()),
                    Err(p) => parts = Some(p),
                }
            }
            if self.lock().closed {
                return Err(Error::Closed);
            }
            park(notified, wait, deadline).await?;
        }
    }

    /// Returns the message back if the queue is full. Ring pushes always
    /// succeed while open.
    fn try_push(&self, topic: &str, mode: TopicMode, parts: Message) -> std::result::Result<(), Message> {
        let mut state = self.lock();
        if state.closed {
            return Err(parts);
        }
        let seq = state.next_seq;
        let entry = Entry {
            seq,
            topic: topic.to_string(),
            parts,
        };
        match mode {
            TopicMode::Queue => {
                if state.queue.len() + state.reserved >= self.queue_capacity {
                    return Err(entry.parts);
                }
                state.queue.push_back(entry);
            }
            TopicMode::RingBuffer => {
                let ring = state.rings.entry(topic.to_string()).or_default();
                if ring.len() >= self.ring_capacity {
                    ring.pop_front();
                    tracing::trace!(topic, "ring full, oldest message overwritten");
                }
                ring.push_back(entry);
            }
        }
        state.next_seq += 1;
        drop(state);
        self.readable.notify_one();
        Ok(())
    }

    /// Hold one FIFO slot if there is room now.
    pub fn try_reserve(&self) -> Result<Slot<'_>> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.queue.len() + state.reserved >= self.queue_capacity {
            return Err(Error::WouldBlock);
        }
        state.reserved += 1;
        Ok(Slot { inbox: self, armed: true })
    }

    /// Wait until the FIFO has room or the inbox closes, as `wait` allows
    /// until `deadline`. Reserves nothing.
    pub async fn wait_room(&self, wait: Wait, deadline: Option<Instant>) -> Result<()> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock();
                if state.closed || state.queue.len() + state.reserved < self.queue_capacity {
                    return Ok(());
                }
            }
            park(notified, wait, deadline).await?;
        }
    }

    /// Oldest message across the queue and all rings.
    pub async fn pop(&self, wait: Wait) -> Result<(String, Message)> {
        let deadline = deadline(wait);
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_pop() {
                return Ok((entry.topic, entry.parts));
            }
            if self.lock().closed {
                return Err(Error::Closed);
            }
            park(notified, wait, deadline).await?;
        }
    }

    fn try_pop(&self) -> Option<Entry> {
        let mut state = self.lock();
        let queue_head = state.queue.front().map(|e| e.seq);
        let ring_head = state
            .rings
            .iter()
            .filter_map(|(topic, ring)| ring.front().map(|e| (e.seq, topic.clone())))
            .min();

        let entry = match (queue_head, ring_head) {
            (None, None) => return None,
            (Some(q), Some((r, _))) if q < r => state.queue.pop_front(),
            (Some(_), None) => state.queue.pop_front(),
            (_, Some((_, topic))) => state.rings.get_mut(&topic).and_then(VecDeque::pop_front),
        };
        let from_queue = entry.as_ref().is_some_and(|e| Some(e.seq) == queue_head);
        drop(state);
        if from_queue {
            self.writable.notify_one();
        }
        entry
    }

    /// Drop all buffered ring entries of `topic`.
    pub fn discard_ring(&self, topic: &str) {
        self.lock().rings.remove(topic);
    }

    /// Wake every waiter; further pushes and pops fail with `Closed` once
    /// drained.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A reserved FIFO slot. Dropping it unfilled gives the room back.
#[derive(Debug)]
pub struct Slot<'a> {
    inbox: &'a Inbox,
    armed: bool,
}

impl Slot<'_> {
    /// Store a QUEUE message in the reserved slot. Discarded if the inbox
    /// closed meanwhile.
    pub fn fill(mut self, topic: &str, parts: Message) {
        self.armed = false;
        let mut state = self.inbox.lock();
        state.reserved -= 1;
        if state.closed {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push_back(Entry {
            seq,
            topic: topic.to_string(),
            parts,
        });
        drop(state);
        self.inbox.readable.notify_one();
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inbox.lock().reserved -= 1;
            self.inbox.writable.notify_one();
        }
    }
}

pub(crate) fn deadline(wait: Wait) -> Option<Instant> {
    match wait {
        Wait::Timeout(d) => Some(Instant::now() + d),
        _ => None,
    }
}

async fn park(
    notified: std::pin::Pin<&mut tokio::sync::futures::Notified<'_>>,
    wait: Wait,
    deadline: Option<Instant>,
) -> Result<()> {
    match (wait, deadline) {
        (Wait::DontWait, _) => Err(Error::WouldBlock),
        (_, Some(at)) => tokio::time::timeout_at(at, notified)
            .await
            .map_err(|_| Error::Timeout),
        _ => {
            notified.await;
            Ok(())
        }
    }
}
