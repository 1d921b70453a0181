//! Router socket: addresses each connected peer by routing identity.
//!
//! A router may bind, connect, or both. Incoming messages are tagged with the
//! sender's identity; outgoing messages name their destination and fail with
//! `HostUnreachable` if no such peer is connected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use switchyard_core::{Message, Wait};

use crate::codec::{self, Connection, SocketKind};
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::options::{SocketOption, SocketOptions};
use crate::queue::{self, lock, read, write};
use crate::stream::{self, Listener};
use crate::tls::TlsClient;

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Greeting completed; the peer can be addressed.
    Ready { routing_id: Bytes, endpoint: String },
    /// The connection for this identity is gone.
    Disconnected { routing_id: Bytes, endpoint: String },
}

struct Peer {
    tx: mpsc::Sender<Message>,
    conn_id: u64,
}

struct Inner {
    routing_id: Bytes,
    options: Mutex<SocketOptions>,
    peers: DashMap<Bytes, Peer>,
    inbound_tx: mpsc::Sender<(Bytes, Message)>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<(Bytes, Message)>>,
    events: broadcast::Sender<PeerEvent>,
    tls_server: RwLock<Option<TlsAcceptor>>,
    tls_client: RwLock<Option<TlsClient>>,
    connects: DashMap<String, CancellationToken>,
    bound: Mutex<Vec<Endpoint>>,
    cancel: CancellationToken,
    next_conn: AtomicU64,
}

pub struct RouterSocket {
    inner: Arc<Inner>,
}

impl RouterSocket {
    pub fn new(routing_id: impl Into<Bytes>) -> Self {
        Self::with_options(routing_id, SocketOptions::default())
    }

    pub fn with_options(routing_id: impl Into<Bytes>, options: SocketOptions) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(options.recv_hwm);
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                routing_id: routing_id.into(),
                options: Mutex::new(options),
                peers: DashMap::new(),
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                events,
                tls_server: RwLock::new(None),
                tls_client: RwLock::new(None),
                connects: DashMap::new(),
                bound: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
                next_conn: AtomicU64::new(0),
            }),
        }
    }

    pub fn routing_id(&self) -> &Bytes {
        &self.inner.routing_id
    }

    /// Bind and start accepting. Returns the endpoint with any ephemeral
    /// port resolved.
    pub async fn bind(&self, endpoint: &str) -> Result<Endpoint, TransportError> {
        self.ensure_open()?;
        let ep: Endpoint = endpoint.parse()?;
        let acceptor = read(&self.inner.tls_server).clone();
        let (listener, bound) = stream::listen(&ep, acceptor).await?;
        lock(&self.inner.bound).push(bound.clone());
        tracing::info!(
            endpoint = %bound,
            routing_id = %hex::encode(&self.inner.routing_id),
            "router bound"
        );
        tokio::spawn(accept_loop(self.inner.clone(), listener, bound.clone()));
        Ok(bound)
    }

    /// Connect with automatic reconnection. `peer_id` overrides the identity
    /// the peer announces; messages to it are addressed with that id.
    pub fn connect(&self, endpoint: &str, peer_id: Option<Bytes>) -> Result<(), TransportError> {
        self.ensure_open()?;
        let ep: Endpoint = endpoint.parse()?;
        let token = self.inner.cancel.child_token();
        if let Some(old) = self.inner.connects.insert(ep.to_string(), token.clone()) {
            old.cancel();
        }
        tokio::spawn(connect_loop(self.inner.clone(), ep, peer_id, token));
        Ok(())
    }

    /// Drop the outgoing connection to `endpoint`. Returns false if there
    /// was none.
    pub fn disconnect(&self, endpoint: &str) -> bool {
        let key = endpoint
            .parse::<Endpoint>()
            .map(|e| e.to_string())
            .unwrap_or_else(|_| endpoint.to_string());
        match self.inner.connects.remove(&key) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn send_to(&self, routing_id: &[u8], msg: Message, wait: Wait) -> Result<(), TransportError> {
        self.ensure_open()?;
        let tx = self
            .inner
            .peers
            .get(routing_id)
            .map(|p| p.tx.clone())
            .ok_or_else(|| TransportError::HostUnreachable(hex::encode(routing_id)))?;
        queue::send_with(&tx, msg, wait).await
    }

    pub async fn recv(&self, wait: Wait) -> Result<(Bytes, Message), TransportError> {
        queue::recv_with(&self.inner.inbound_rx, wait, &self.inner.cancel).await
    }

    pub fn events(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self, routing_id: &[u8]) -> bool {
        self.inner.peers.contains_key(routing_id)
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn bound_endpoints(&self) -> Vec<Endpoint> {
        lock(&self.inner.bound).clone()
    }

    pub fn set_option(&self, option: SocketOption) {
        lock(&self.inner.options).apply(option);
    }

    /// Certificate for tls:// endpoints bound afterwards.
    pub fn set_tls_server(&self, acceptor: TlsAcceptor) {
        *write(&self.inner.tls_server) = Some(acceptor);
    }

    /// Trust settings for tls:// connections opened afterwards.
    pub fn set_tls_client(&self, client: TlsClient) {
        *write(&self.inner.tls_client) = Some(client);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop all tasks and drop every connection. Idempotent.
    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.connects.clear();
        self.inner.peers.clear();
        for ep in lock(&self.inner.bound).drain(..) {
            stream::release_inproc(&ep);
        }
        tracing::debug!(routing_id = %hex::encode(&self.inner.routing_id), "router closed");
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

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
                    let stream = match incoming.establish().await {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "router handshake failed");
                            return;
                        }
                    };
                    let cancel = inner.cancel.child_token();
                    if let Err(e) = serve(&inner, codec::framed(stream), peer.clone(), None, cancel).await {
                        tracing::debug!(peer = %peer, error = %e, "router connection ended");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
    tracing::trace!(endpoint = %endpoint, "router listener stopped");
}

async fn connect_loop(inner: Arc<Inner>, ep: Endpoint, alias: Option<Bytes>, token: CancellationToken) {
    loop {
        let tls = read(&inner.tls_client).clone();
        let attempt = tokio::select! {
            _ = token.cancelled() => return,
            r = stream::connect(&ep, tls.as_ref()) => r,
        };
        match attempt {
            Ok(s) => {
                let r = serve(&inner, codec::framed(s), ep.to_string(), alias.clone(), token.clone()).await;
                if let Err(e) = r {
                    tracing::debug!(endpoint = %ep, error = %e, "router connection ended");
                }
            }
            Err(e) => tracing::trace!(endpoint = %ep, error = %e, "router connect failed"),
        }
        let delay = lock(&inner.options).reconnect_interval;
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn serve(
    inner: &Arc<Inner>,
    mut conn: Connection,
    endpoint: String,
    alias: Option<Bytes>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let greeting = codec::handshake(&mut conn, SocketKind::Router, &inner.routing_id).await?;
    let routing_id = alias
        .filter(|a| !a.is_empty())
        .or_else(|| Some(greeting.routing_id).filter(|r| !r.is_empty()))
        .unwrap_or_else(queue::random_routing_id);

    let (send_hwm, handover) = {
        let opts = lock(&inner.options);
        (opts.send_hwm, opts.handover)
    };
    let (tx, mut rx) = mpsc::channel(send_hwm);
    let conn_id = inner.next_conn.fetch_add(1, Ordering::Relaxed);

    match inner.peers.entry(routing_id.clone()) {
        Entry::Occupied(mut e) => {
            if !handover {
                tracing::warn!(
                    routing_id = %hex::encode(&routing_id),
                    endpoint = %endpoint,
                    "duplicate routing id refused"
                );
                return Ok(());
            }
            // Dropping the old sender ends the old connection's writer.
            e.insert(Peer { tx, conn_id });
            tracing::debug!(routing_id = %hex::encode(&routing_id), "routing id handed over");
        }
        Entry::Vacant(v) => {
            v.insert(Peer { tx, conn_id });
        }
    }

    tracing::debug!(routing_id = %hex::encode(&routing_id), endpoint = %endpoint, "router peer ready");
    let _ = inner.events.send(PeerEvent::Ready {
        routing_id: routing_id.clone(),
        endpoint: endpoint.clone(),
    });

    let inbound = inner.inbound_tx.clone();
    let rid = routing_id.clone();
    let result = codec::pump(conn, &mut rx, &cancel, |msg| {
        let inbound = inbound.clone();
        let rid = rid.clone();
        async move { inbound.send((rid, msg)).await.is_ok() }
    })
    .await;

    if inner
        .peers
        .remove_if(&routing_id, |_, p| p.conn_id == conn_id)
        .is_some()
    {
        tracing::debug!(routing_id = %hex::encode(&routing_id), endpoint = %endpoint, "router peer gone");
        let _ = inner.events.send(PeerEvent::Disconnected {
            routing_id,
            endpoint,
        });
    }
    result
}
