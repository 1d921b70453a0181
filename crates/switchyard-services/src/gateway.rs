//! Gateway: client-side load balancing over discovered receivers.
//!
//! One router socket connects to every receiver of every service in use,
//! addressing each by the routing id it registered with. A reconciliation
//! task compares the Discovery view with live connections, opens and closes
//! connections, and reports pool changes over a channel. The send path
//! drains that channel before picking a receiver, so selection never waits
//! on the task.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use switchyard_core::config::GatewayConfig;
use switchyard_core::{LbStrategy, Message, Wait};
use switchyard_transport::{
    PeerEvent, RouterSocket, SocketOption, SocketOptions, TlsClient, TransportError,
};

use crate::balancer::Pool;
use crate::discovery::Discovery;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewaySocket {
    /// Router connected to the receivers.
    Router,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PoolDelta {
    Add {
        service: String,
        routing_id: Bytes,
        weight: u32,
    },
    Remove {
        service: String,
        routing_id: Bytes,
    },
    Weight {
        service: String,
        routing_id: Bytes,
        weight: u32,
    },
}

/// Selection state. Only touched by callers of the public API.
struct Selector {
    pools: HashMap<String, Pool>,
    strategies: HashMap<String, LbStrategy>,
    default_strategy: LbStrategy,
    /// Service a routing id was last pooled under, for tagging replies.
    owners: HashMap<Bytes, String>,
    deltas: mpsc::UnboundedReceiver<PoolDelta>,
}

impl Selector {
    fn drain(&mut self) {
        while let Ok(delta) = self.deltas.try_recv() {
            self.apply(delta);
        }
    }

    fn apply(&mut self, delta: PoolDelta) {
        match delta {
            PoolDelta::Add {
                service,
                routing_id,
                weight,
            } => {
                self.owners.insert(routing_id.clone(), service.clone());
                self.pools.entry(service).or_default().add(routing_id, weight);
            }
            PoolDelta::Remove {
                service,
                routing_id,
            } => {
                if let Some(pool) = self.pools.get_mut(&service) {
                    pool.remove(&routing_id);
                }
            }
            PoolDelta::Weight {
                service,
                routing_id,
                weight,
            } => {
                if let Some(pool) = self.pools.get_mut(&service) {
                    pool.set_weight(&routing_id, weight);
                }
            }
        }
    }

    fn pick(&mut self, service: &str) -> Option<Bytes> {
        let strategy = self
            .strategies
            .get(service)
            .copied()
            .unwrap_or(self.default_strategy);
        self.pools.get_mut(service)?.select(strategy)
    }

    fn len(&self, service: &str) -> usize {
        self.pools.get(service).map_or(0, Pool::len)
    }
}

struct Inner {
    discovery: Arc<Discovery>,
    router: RouterSocket,
    selector: Mutex<Selector>,
    tracked: watch::Sender<BTreeSet<String>>,
    cancel: CancellationToken,
}

impl Inner {
    fn selector(&self) -> MutexGuard<'_, Selector> {
        self.selector.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// A gateway over `discovery`. Must be created inside a tokio runtime.
    pub fn new(discovery: Arc<Discovery>) -> Self {
        Self::with_options(discovery, SocketOptions::default(), &GatewayConfig::default())
    }

    pub fn with_options(
        discovery: Arc<Discovery>,
        options: SocketOptions,
        config: &GatewayConfig,
    ) -> Self {
        let routing_id = format!("gw-{}", hex::encode(rand::random::<u32>().to_be_bytes()));
        let router = RouterSocket::with_options(routing_id, options);
        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let (tracked, _) = watch::channel(BTreeSet::new());
        let inner = Arc::new(Inner {
            discovery,
            router,
            selector: Mutex::new(Selector {
                pools: HashMap::new(),
                strategies: HashMap::new(),
                default_strategy: config.default_strategy,
                owners: HashMap::new(),
                deltas: delta_rx,
            }),
            tracked,
            cancel: CancellationToken::new(),
        });

        let task = Reconciler {
            inner: inner.clone(),
            events: inner.router.events(),
            updates: inner.discovery.updates(),
            tracked: inner.tracked.subscribe(),
            links: HashMap::new(),
            members: HashMap::new(),
            down: HashMap::new(),
            backoff: Duration::from_millis(config.down_backoff_ms),
            refresh: Duration::from_millis(config.refresh_interval_ms.max(1)),
            deltas: delta_tx,
        };
        tokio::spawn(task.run());
        Self { inner }
    }

    pub fn routing_id(&self) -> &Bytes {
        self.inner.router.routing_id()
    }

    pub fn set_lb_strategy(&self, service: &str, strategy: LbStrategy) -> Result<()> {
        self.ensure_open()?;
        validate_service(service)?;
        self.inner
            .selector()
            .strategies
            .insert(service.to_string(), strategy);
        Ok(())
    }

    /// Send one request to a receiver of `service` picked by its strategy.
    pub async fn send(&self, service: &str, parts: Message, wait: Wait) -> Result<()> {
        self.ensure_open()?;
        self.track(service)?;
        loop {
            let routing_id = {
                let mut selector = self.inner.selector();
                selector.drain();
                selector
                    .pick(service)
                    .ok_or_else(|| Error::NoReceiversAvailable(service.to_string()))?
            };
            match self.deliver(service, &routing_id, parts.clone(), wait).await {
                Err(Error::Transport(TransportError::HostUnreachable(_))) => continue,
                other => return other,
            }
        }
    }

    /// Send to one specific receiver of `service`.
    pub async fn send_to(
        &self,
        service: &str,
        routing_id: &[u8],
        parts: Message,
        wait: Wait,
    ) -> Result<()> {
        self.ensure_open()?;
        self.track(service)?;
        let pooled = {
            let mut selector = self.inner.selector();
            selector.drain();
            selector
                .pools
                .get(service)
                .is_some_and(|p| p.contains(routing_id))
        };
        if !pooled {
            return Err(Error::NoReceiversAvailable(service.to_string()));
        }
        match self
            .deliver(service, &Bytes::copy_from_slice(routing_id), parts, wait)
            .await
        {
            Err(Error::Transport(TransportError::HostUnreachable(_))) => {
                Err(Error::NoReceiversAvailable(service.to_string()))
            }
            other => other,
        }
    }

    async fn deliver(&self, service: &str, routing_id: &Bytes, parts: Message, wait: Wait) -> Result<()> {
        match self.inner.router.send_to(routing_id, parts, wait).await {
            Ok(()) => {
                tracing::trace!(service, routing_id = %hex::encode(routing_id), "request sent");
                Ok(())
            }
            Err(e @ TransportError::HostUnreachable(_)) => {
                // Gone between selection and send; the disconnect event will
                // tell the reconciler.
                let mut selector = self.inner.selector();
                if let Some(pool) = selector.pools.get_mut(service) {
                    pool.remove(routing_id);
                }
                Err(Error::Transport(e))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Next reply, tagged with the service of the receiver that sent it.
    pub async fn recv(&self, wait: Wait) -> Result<(String, Message)> {
        self.ensure_open()?;
        let (routing_id, msg) = self.inner.router.recv(wait).await?;
        let mut selector = self.inner.selector();
        selector.drain();
        let service = selector.owners.get(&routing_id).cloned().unwrap_or_default();
        Ok((service, msg))
    }

    /// Receivers of `service` ready to take requests. Starts tracking the
    /// service if it was not tracked yet.
    pub fn connection_count(&self, service: &str) -> Result<usize> {
        self.ensure_open()?;
        self.track(service)?;
        let mut selector = self.inner.selector();
        selector.drain();
        Ok(selector.len(service))
    }

    /// Trust settings for `tls://` receivers connected afterwards.
    pub fn set_tls_client(
        &self,
        ca_cert: Option<&Path>,
        hostname: Option<&str>,
        trust_system: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        let client = TlsClient::new(ca_cert, hostname, trust_system)?;
        self.inner.router.set_tls_client(client);
        Ok(())
    }

    pub fn set_socket_option(&self, socket: GatewaySocket, option: SocketOption) -> Result<()> {
        self.ensure_open()?;
        match socket {
            GatewaySocket::Router => self.inner.router.set_option(option),
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Idempotent. The Discovery is left open.
    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.router.close();
        tracing::debug!(routing_id = %hex::encode(self.inner.router.routing_id()), "gateway closed");
    }

    fn track(&self, service: &str) -> Result<()> {
        validate_service(service)?;
        let mut added = false;
        self.inner.tracked.send_if_modified(|set| {
            added = set.insert(service.to_string());
            added
        });
        if added {
            self.inner.discovery.subscribe(service)?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.close();
    }
}

fn validate_service(service: &str) -> Result<()> {
    if service.is_empty() || service.len() > switchyard_core::wire::MAX_SERVICE_LEN {
        return Err(Error::invalid("invalid service name"));
    }
    Ok(())
}

// ── Reconciliation ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Link {
    endpoint: String,
    ready: bool,
}

struct Reconciler {
    inner: Arc<Inner>,
    events: broadcast::Receiver<PeerEvent>,
    updates: watch::Receiver<u64>,
    tracked: watch::Receiver<BTreeSet<String>>,
    /// Connections opened by routing id.
    links: HashMap<Bytes, Link>,
    /// Pool memberships reported so far, with their weight.
    members: HashMap<(String, Bytes), u32>,
    /// Receivers held back after a disconnect.
    down: HashMap<Bytes, Instant>,
    backoff: Duration,
    refresh: Duration,
    deltas: mpsc::UnboundedSender<PoolDelta>,
}

impl Reconciler {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.refresh);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let cancel = self.inner.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.updates.changed() => {
                    if r.is_err() {
                        break;
                    }
                }
                r = self.tracked.changed() => {
                    if r.is_err() {
                        break;
                    }
                }
                ev = self.events.recv() => match ev {
                    Ok(ev) => self.on_event(ev),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "gateway lagged on peer events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tick.tick() => {}
            }
            self.reconcile();
        }
        tracing::trace!("gateway reconciliation stopped");
    }

    fn on_event(&mut self, ev: PeerEvent) {
        match ev {
            PeerEvent::Ready { routing_id, endpoint } => {
                if let Some(link) = self.links.get_mut(&routing_id) {
                    link.ready = true;
                    tracing::debug!(routing_id = %hex::encode(&routing_id), endpoint = %endpoint, "receiver connected");
                }
            }
            PeerEvent::Disconnected { routing_id, endpoint } => {
                if let Some(link) = self.links.remove(&routing_id) {
                    self.inner.router.disconnect(&link.endpoint);
                    self.down.insert(routing_id.clone(), Instant::now() + self.backoff);
                    tracing::debug!(
                        routing_id = %hex::encode(&routing_id),
                        endpoint = %endpoint,
                        backoff_ms = self.backoff.as_millis() as u64,
                        "receiver down"
                    );
                }
            }
        }
    }

    /// Bring connections and pool memberships in line with the Discovery
    /// view of every tracked service.
    fn reconcile(&mut self) {
        let now = Instant::now();
        self.down.retain(|_, until| *until > now);

        // routing id → (endpoint, [(service, weight)])
        let mut desired: HashMap<Bytes, (String, Vec<(String, u32)>)> = HashMap::new();
        for service in self.tracked.borrow().iter() {
            for rec in self.inner.discovery.get_receivers(service) {
                desired
                    .entry(rec.routing_id.clone())
                    .or_insert_with(|| (rec.endpoint.clone(), Vec::new()))
                    .1
                    .push((service.clone(), rec.weight));
            }
        }

        let stale: Vec<Bytes> = self
            .links
            .iter()
            .filter(|(rid, link)| desired.get(*rid).map_or(true, |(ep, _)| *ep != link.endpoint))
            .map(|(rid, _)| rid.clone())
            .collect();
        for rid in stale {
            if let Some(link) = self.links.remove(&rid) {
                self.inner.router.disconnect(&link.endpoint);
                tracing::debug!(routing_id = %hex::encode(&rid), endpoint = %link.endpoint, "receiver dropped");
            }
        }

        for (rid, (endpoint, _)) in &desired {
            if self.links.contains_key(rid) || self.down.contains_key(rid) {
                continue;
            }
            match self.inner.router.connect(endpoint, Some(rid.clone())) {
                Ok(()) => {
                    self.links.insert(
                        rid.clone(),
                        Link {
                            endpoint: endpoint.clone(),
                            ready: false,
                        },
                    );
                }
                Err(e) => tracing::warn!(endpoint = %endpoint, error = %e, "cannot connect to receiver"),
            }
        }

        let mut wanted: HashMap<(String, Bytes), u32> = HashMap::new();
        for (rid, (_, services)) in &desired {
            if !self.links.get(rid).is_some_and(|l| l.ready) {
                continue;
            }
            for (service, weight) in services {
                wanted.insert((service.clone(), rid.clone()), *weight);
            }
        }

        let mut deltas = Vec::new();
        self.members.retain(|(service, rid), _| {
            let keep = wanted.contains_key(&(service.clone(), rid.clone()));
            if !keep {
                deltas.push(PoolDelta::Remove {
                    service: service.clone(),
                    routing_id: rid.clone(),
                });
            }
            keep
        });
        for ((service, rid), weight) in wanted {
            match self.members.get(&(service.clone(), rid.clone())) {
                None => deltas.push(PoolDelta::Add {
                    service: service.clone(),
                    routing_id: rid.clone(),
                    weight,
                }),
                Some(&old) if old != weight => deltas.push(PoolDelta::Weight {
                    service: service.clone(),
                    routing_id: rid.clone(),
                    weight,
                }),
                Some(_) => {}
            }
            self.members.insert((service, rid), weight);
        }

        for delta in deltas {
            tracing::debug!(?delta, "pool delta");
            if self.deltas.send(delta).is_err() {
                return;
            }
        }
    }
}
