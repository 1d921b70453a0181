//! Publisher socket: fans messages out to subscribers by prefix.
//!
//! Each subscriber connection has its own bounded outbox and prefix set. The
//! first frame of a message is its topic; a subscriber receives a message if
//! any of its prefixes is a prefix of the topic.
//!
//! `send` is lossy: a full outbox makes room by dropping its oldest lossy
//! message, so a slow subscriber keeps the newest ones. `send_reliable`
//! messages are never dropped once queued.
//!
//! Subscribers send control messages of one frame: `0x01 ++ prefix` to
//! subscribe, `0x00 ++ prefix` to unsubscribe.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{broadcast, Notify};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use switchyard_core::{Frame, Message, Wait};

use crate::codec::{self, Outbound, SocketKind};
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::options::{SocketOption, SocketOptions};
use crate::queue::{lock, read, write};
use crate::stream::{self, Listener};

pub(crate) const CTL_UNSUBSCRIBE: u8 = 0x00;
pub(crate) const CTL_SUBSCRIBE: u8 = 0x01;

// ── Outbox ────────────────────────────────────────────────────────────────────

struct Queued {
    msg: Message,
    lossy: bool,
}

#[derive(Default)]
struct OutboxState {
    queue: VecDeque<Queued>,
    /// Slots promised to in-flight reliable sends.
    reserved: usize,
    closed: bool,
}

/// One subscriber's outbound queue.
struct Outbox {
    state: Mutex<OutboxState>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

enum Reserve {
    Reserved(Permit),
    Full,
    Closed,
}

/// A reserved outbox slot. Dropping it unused gives the slot back.
struct Permit {
    outbox: Option<Arc<Outbox>>,
}

impl Permit {
    fn send(mut self, msg: Message) {
        if let Some(outbox) = self.outbox.take() {
            let mut state = lock(&outbox.state);
            state.reserved -= 1;
            if !state.closed {
                state.queue.push_back(Queued { msg, lossy: false });
            }
            drop(state);
            outbox.readable.notify_one();
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(outbox) = self.outbox.take() {
            lock(&outbox.state).reserved -= 1;
            outbox.writable.notify_waiters();
        }
    }
}

impl Outbox {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(OutboxState::default()),
            capacity: capacity.max(1),
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    /// Queue a lossy message, evicting the oldest lossy one if full. Returns
    /// false if nothing could make room.
    fn push_lossy(&self, msg: Message) -> bool {
        let mut state = lock(&self.state);
        if state.closed {
            return false;
        }
        if state.queue.len() + state.reserved >= self.capacity {
            match state.queue.iter().position(|q| q.lossy) {
                Some(i) => {
                    state.queue.remove(i);
                }
                None => return false,
            }
        }
        state.queue.push_back(Queued { msg, lossy: true });
        drop(state);
        self.readable.notify_one();
        true
    }

    fn try_reserve(self: &Arc<Self>) -> Reserve {
        let mut state = lock(&self.state);
        if state.closed {
            return Reserve::Closed;
        }
        if state.queue.len() + state.reserved >= self.capacity {
            return Reserve::Full;
        }
        state.reserved += 1;
        Reserve::Reserved(Permit {
            outbox: Some(self.clone()),
        })
    }

    /// Wait until a slot is free or the outbox closes. Reserves nothing.
    async fn writable(&self) {
        let notified = self.writable.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let state = lock(&self.state);
            if state.closed || state.queue.len() + state.reserved < self.capacity {
                return;
            }
        }
        notified.await;
    }

    async fn pop(&self) -> Option<Message> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = lock(&self.state);
                if let Some(q) = state.queue.pop_front() {
                    drop(state);
                    self.writable.notify_waiters();
                    return Some(q.msg);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.queue.clear();
        drop(state);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

impl Outbound for Arc<Outbox> {
    fn next(&mut self) -> BoxFuture<'_, Option<Message>> {
        Box::pin(self.pop())
    }
}

/// Outbox slots held by `PubSocket::reserve`.
pub struct Reservation {
    permits: Vec<Permit>,
}

impl Reservation {
    /// Subscribers holding a slot.
    pub fn len(&self) -> usize {
        self.permits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permits.is_empty()
    }

    /// Queue `msg` in every reserved slot. Returns how many it went to.
    pub fn send(self, msg: Message) -> usize {
        let n = self.permits.len();
        for permit in self.permits {
            permit.send(msg.clone());
        }
        n
    }
}

// ── Socket ────────────────────────────────────────────────────────────────────

struct Subscriber {
    outbox: Arc<Outbox>,
    prefixes: Arc<RwLock<HashSet<Bytes>>>,
}

impl Subscriber {
    fn wants(&self, topic: &[u8]) -> bool {
        read(&self.prefixes).iter().any(|p| topic.starts_with(p))
    }
}

struct Inner {
    subscribers: DashMap<u64, Subscriber>,
    joins: broadcast::Sender<Bytes>,
    options: Mutex<SocketOptions>,
    tls_server: RwLock<Option<TlsAcceptor>>,
    bound: Mutex<Vec<Endpoint>>,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

pub struct PubSocket {
    inner: Arc<Inner>,
}

impl Default for PubSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSocket {
    pub fn new() -> Self {
        Self::with_options(SocketOptions::default())
    }

    pub fn with_options(options: SocketOptions) -> Self {
        let (joins, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                subscribers: DashMap::new(),
                joins,
                options: Mutex::new(options),
                tls_server: RwLock::new(None),
                bound: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub async fn bind(&self, endpoint: &str) -> Result<Endpoint, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let ep: Endpoint = endpoint.parse()?;
        let acceptor = read(&self.inner.tls_server).clone();
        let (listener, bound) = stream::listen(&ep, acceptor).await?;
        lock(&self.inner.bound).push(bound.clone());
        tracing::info!(endpoint = %bound, "publisher bound");
        tokio::spawn(accept_loop(self.inner.clone(), listener, bound.clone()));
        Ok(bound)
    }

    pub fn bound_endpoints(&self) -> Vec<Endpoint> {
        lock(&self.inner.bound).clone()
    }

    /// Send without waiting. A subscriber whose outbox is full drops its
    /// oldest lossy message to take this one. Returns how many subscribers
    /// it was queued for.
    pub fn send(&self, msg: Message) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let topic = msg.first().cloned().unwrap_or_default();
        let mut queued = 0;
        for sub in self.inner.subscribers.iter() {
            if !sub.wants(&topic) {
                continue;
            }
            if sub.outbox.push_lossy(msg.clone()) {
                queued += 1;
            } else {
                tracing::trace!(subscriber = *sub.key(), "subscriber outbox full of reliable messages, message dropped");
            }
        }
        Ok(queued)
    }

    /// Send to every matching subscriber or to none.
    ///
    /// A slot is reserved in every matching outbox before anything is
    /// queued. With `Wait::DontWait` a single full outbox fails the whole
    /// send with `WouldBlock`.
    pub async fn send_reliable(&self, msg: Message, wait: Wait) -> Result<usize, TransportError> {
        let topic = msg.first().cloned().unwrap_or_default();
        let reservation = self.reserve(topic.as_bytes(), wait).await?;
        Ok(reservation.send(msg))
    }

    /// First half of `send_reliable`: hold one slot in every outbox whose
    /// subscriber wants `topic`. Nothing is queued until `Reservation::send`;
    /// dropping the reservation releases the slots.
    pub async fn reserve(&self, topic: &[u8], wait: Wait) -> Result<Reservation, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let targets: Vec<Arc<Outbox>> = self
            .inner
            .subscribers
            .iter()
            .filter(|s| s.wants(topic))
            .map(|s| s.outbox.clone())
            .collect();

        // A full outbox releases every permit taken so far before waiting,
        // so concurrent reservations cannot hold each other up.
        let reserve_all = async {
            loop {
                let mut permits = Vec::with_capacity(targets.len());
                let mut full = None;
                for outbox in &targets {
                    match outbox.try_reserve() {
                        Reserve::Reserved(p) => permits.push(p),
                        Reserve::Closed => {}
                        Reserve::Full => {
                            full = Some(outbox);
                            break;
                        }
                    }
                }
                let Some(outbox) = full else {
                    return Ok(permits);
                };
                drop(permits);
                if wait == Wait::DontWait {
                    return Err(TransportError::WouldBlock);
                }
                outbox.writable().await;
            }
        };

        let permits = match wait {
            Wait::Timeout(d) => tokio::time::timeout(d, reserve_all)
                .await
                .map_err(|_| TransportError::Timeout)??,
            _ => reserve_all.await?,
        };
        Ok(Reservation { permits })
    }

    /// Stream of prefixes as subscribers register them.
    pub fn subscriber_joined(&self) -> broadcast::Receiver<Bytes> {
        self.inner.joins.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    pub fn set_option(&self, option: SocketOption) {
        lock(&self.inner.options).apply(option);
    }

    pub fn set_tls_server(&self, acceptor: TlsAcceptor) {
        *write(&self.inner.tls_server) = Some(acceptor);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        for sub in self.inner.subscribers.iter() {
            sub.outbox.close();
        }
        self.inner.subscribers.clear();
        for ep in lock(&self.inner.bound).drain(..) {
            stream::release_inproc(&ep);
        }
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(inner: Arc<Inner>, mut listener: Listener, endpoint: Endpoint) {
    loop {
        let incoming = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            r = listener.accept() => r,
        };
        match incoming {
            Ok(incoming) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    let peer = incoming.peer.clone();
                    match incoming.establish().await {
                        Ok(s) => {
                            if let Err(e) = serve(&inner, codec::framed(s)).await {
                                tracing::debug!(peer = %peer, error = %e, "subscriber connection ended");
                            }
                        }
                        Err(e) => tracing::warn!(peer = %peer, error = %e, "subscriber handshake failed"),
                    }
                });
            }
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

async fn serve(inner: &Arc<Inner>, mut conn: codec::Connection) -> Result<(), TransportError> {
    codec::handshake(&mut conn, SocketKind::Pub, &Bytes::new()).await?;

    let send_hwm = lock(&inner.options).send_hwm;
    let mut outbox = Outbox::new(send_hwm);
    let prefixes = Arc::new(RwLock::new(HashSet::new()));
    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
    inner.subscribers.insert(
        id,
        Subscriber {
            outbox: outbox.clone(),
            prefixes: prefixes.clone(),
        },
    );

    let joins = inner.joins.clone();
    let cancel = inner.cancel.child_token();
    let result = codec::pump(conn, &mut outbox, &cancel, |msg| {
        apply_control(&prefixes, &joins, msg);
        async { true }
    })
    .await;

    inner.subscribers.remove(&id);
    outbox.close();
    result
}

fn apply_control(prefixes: &RwLock<HashSet<Bytes>>, joins: &broadcast::Sender<Bytes>, msg: Message) {
    let Some(frame) = msg.into_iter().next() else {
        return;
    };
    let bytes = frame.into_bytes();
    match bytes.first() {
        Some(&CTL_SUBSCRIBE) => {
            let prefix = bytes.slice(1..);
            write(prefixes).insert(prefix.clone());
            let _ = joins.send(prefix);
        }
        Some(&CTL_UNSUBSCRIBE) => {
            write(prefixes).remove(&bytes.slice(1..));
        }
        _ => tracing::warn!("unknown subscriber control message"),
    }
}

/// Build a control message for a prefix.
pub(crate) fn control(op: u8, prefix: &[u8]) -> Message {
    let mut b = Vec::with_capacity(prefix.len() + 1);
    b.push(op);
    b.extend_from_slice(prefix);
    vec![Frame::from(b)]
}
