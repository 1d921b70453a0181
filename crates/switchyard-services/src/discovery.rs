//! Discovery: a client-side cache of one registry's broadcast feed.
//!
//! Every accepted snapshot rebuilds the cache for the subscribed service
//! names; nothing is patched incrementally. Consumers that need to react to
//! changes watch the generation counter from `updates()`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use switchyard_core::wire::{self, ServiceList, ServiceRecord};
use switchyard_core::{Message, ServiceType, Wait};
use switchyard_transport::{SocketOption, SocketOptions, SubSocket, TlsClient, TransportError};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySocket {
    /// Subscriber connected to the registry broadcast socket.
    Subscribe,
}

#[derive(Default)]
struct Cache {
    feed: Option<String>,
    subscribed: BTreeSet<String>,
    services: HashMap<String, Vec<ServiceRecord>>,
    last: Option<ServiceList>,
    seen: HashMap<u32, u64>,
}

impl Cache {
    /// Accept a snapshot unless it is not newer than the last one seen from
    /// the same registry. Returns whether the cached view changed.
    fn ingest(&mut self, list: ServiceList, service_type: ServiceType) -> bool {
        if let Some(&seq) = self.seen.get(&list.registry_id) {
            if list.seq <= seq {
                return false;
            }
        }
        self.seen.insert(list.registry_id, list.seq);
        let services = project(&list, service_type, &self.subscribed);
        self.last = Some(list);
        if services == self.services {
            return false;
        }
        self.services = services;
        true
    }

    fn reset(&mut self) {
        self.services.clear();
        self.last = None;
        self.seen.clear();
    }
}

/// The subscribed part of a snapshot, for one service type.
fn project(
    list: &ServiceList,
    service_type: ServiceType,
    subscribed: &BTreeSet<String>,
) -> HashMap<String, Vec<ServiceRecord>> {
    list.services
        .iter()
        .filter(|e| e.service_type == service_type && subscribed.contains(&e.service))
        .filter(|e| !e.records.is_empty())
        .map(|e| (e.service.clone(), e.records.clone()))
        .collect()
}

struct Inner {
    service_type: ServiceType,
    sub: SubSocket,
    cache: RwLock<Cache>,
    generation: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Cache> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Cache> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

pub struct Discovery {
    inner: Arc<Inner>,
}

impl Discovery {
    /// A discovery for one service type. Must be created inside a tokio
    /// runtime; the ingest task starts immediately.
    pub fn new(service_type: ServiceType) -> Self {
        Self::with_options(service_type, SocketOptions::default())
    }

    pub fn with_options(service_type: ServiceType, options: SocketOptions) -> Self {
        let sub = SubSocket::with_options(options);
        sub.subscribe(wire::MSG_SERVICE_LIST.to_le_bytes());
        let (generation, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            service_type,
            sub,
            cache: RwLock::new(Cache::default()),
            generation,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(ingest(inner.clone()));
        Self { inner }
    }

    pub fn service_type(&self) -> ServiceType {
        self.inner.service_type
    }

    /// Follow `broadcast`, replacing any previous feed and clearing the cache.
    pub fn connect_registry(&self, broadcast: &str) -> Result<()> {
        self.ensure_open()?;
        // Validate before tearing down the current feed.
        broadcast
            .parse::<switchyard_transport::Endpoint>()
            .map_err(Error::from)?;
        let previous = {
            let mut cache = self.inner.write();
            cache.reset();
            cache.feed.replace(broadcast.to_string())
        };
        if let Some(prev) = previous {
            self.inner.sub.disconnect(&prev);
        }
        self.inner.sub.connect(broadcast)?;
        self.inner.bump();
        tracing::info!(feed = broadcast, service_type = ?self.inner.service_type, "discovery connected");
        Ok(())
    }

    /// Track `service`. Filled at once from the last snapshot received.
    pub fn subscribe(&self, service: &str) -> Result<()> {
        self.ensure_open()?;
        if service.is_empty() {
            return Err(Error::invalid("service name must not be empty"));
        }
        let mut cache = self.inner.write();
        if !cache.subscribed.insert(service.to_string()) {
            return Ok(());
        }
        let records = cache
            .last
            .as_ref()
            .map(|l| l.records(self.inner.service_type, service).to_vec())
            .unwrap_or_default();
        if !records.is_empty() {
            cache.services.insert(service.to_string(), records);
            drop(cache);
            self.inner.bump();
        }
        Ok(())
    }

    /// Stop tracking `service`. Its entry goes away with the next snapshot.
    /// Names that were never subscribed are ignored.
    pub fn unsubscribe(&self, service: &str) -> Result<()> {
        self.ensure_open()?;
        if service.is_empty() {
            return Err(Error::invalid("service name must not be empty"));
        }
        self.inner.write().subscribed.remove(service);
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.read().subscribed.iter().cloned().collect()
    }

    pub fn receiver_count(&self, service: &str) -> usize {
        self.inner.read().services.get(service).map_or(0, Vec::len)
    }

    pub fn service_available(&self, service: &str) -> bool {
        self.receiver_count(service) > 0
    }

    /// Records for `service` in registry order.
    pub fn get_receivers(&self, service: &str) -> Vec<ServiceRecord> {
        self.inner
            .read()
            .services
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    /// Generation counter, bumped whenever the cached view changes.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.inner.generation.subscribe()
    }

    pub fn set_socket_option(&self, socket: DiscoverySocket, option: SocketOption) -> Result<()> {
        self.ensure_open()?;
        match socket {
            DiscoverySocket::Subscribe => self.inner.sub.set_option(option),
        }
        Ok(())
    }

    /// Trust settings for `tls://` feeds connected afterwards.
    pub fn set_tls_client(&self, client: TlsClient) -> Result<()> {
        self.ensure_open()?;
        self.inner.sub.set_tls_client(client);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Idempotent.
    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.sub.close();
        self.inner.write().reset();
        self.inner.bump();
        tracing::debug!("discovery closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.close();
    }
}

async fn ingest(inner: Arc<Inner>) {
    loop {
        let msg = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            r = inner.sub.recv(Wait::Block) => r,
        };
        match msg {
            Ok(msg) => handle(&inner, &msg),
            Err(TransportError::Closed) => break,
            Err(e) => tracing::warn!(error = %e, "discovery feed error"),
        }
    }
}

fn handle(inner: &Inner, msg: &Message) {
    let list = match ServiceList::decode(msg) {
        Ok(list) => list,
        Err(e) => {
            tracing::warn!(error = %e, "malformed directory snapshot");
            return;
        }
    };
    let (registry, seq) = (list.registry_id, list.seq);
    let changed = inner.write().ingest(list, inner.service_type);
    tracing::trace!(registry, seq, changed, "directory snapshot");
    if changed {
        inner.bump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use switchyard_core::wire::ServiceEntry;

    fn record(ty: ServiceType, service: &str, endpoint: &str) -> ServiceRecord {
        ServiceRecord {
            service_type: ty,
            service: service.into(),
            endpoint: endpoint.into(),
            routing_id: Bytes::from(endpoint.to_string()),
            weight: 1,
            registered_at: 0,
            origin: 1,
        }
    }

    fn list(registry_id: u32, seq: u64, records: Vec<ServiceRecord>) -> ServiceList {
        let mut services: Vec<ServiceEntry> = Vec::new();
        for r in records {
            match services
                .iter_mut()
                .find(|e| e.service == r.service && e.service_type == r.service_type)
            {
                Some(e) => e.records.push(r),
                None => services.push(ServiceEntry {
                    service_type: r.service_type,
                    service: r.service.clone(),
                    records: vec![r],
                }),
            }
        }
        ServiceList {
            registry_id,
            seq,
            services,
        }
    }

    #[test]
    fn ingest_filters_by_subscription_and_type() {
        let mut cache = Cache::default();
        cache.subscribed.insert("echo".into());
        let snapshot = list(
            1,
            1,
            vec![
                record(ServiceType::Gateway, "echo", "tcp://h:1"),
                record(ServiceType::Spot, "echo", "tcp://h:2"),
                record(ServiceType::Gateway, "other", "tcp://h:3"),
            ],
        );
        assert!(cache.ingest(snapshot, ServiceType::Gateway));
        assert_eq!(cache.services.len(), 1);
        assert_eq!(cache.services["echo"].len(), 1);
        assert_eq!(cache.services["echo"][0].endpoint, "tcp://h:1");
    }

    #[test]
    fn stale_snapshots_are_ignored() {
        let mut cache = Cache::default();
        cache.subscribed.insert("echo".into());
        let fresh = list(1, 5, vec![record(ServiceType::Gateway, "echo", "tcp://h:1")]);
        assert!(cache.ingest(fresh, ServiceType::Gateway));
        assert!(!cache.ingest(list(1, 5, vec![]), ServiceType::Gateway));
        assert!(!cache.ingest(list(1, 4, vec![]), ServiceType::Gateway));
        assert_eq!(cache.services["echo"].len(), 1);

        // Another registry has its own sequence.
        assert!(cache.ingest(list(2, 1, vec![]), ServiceType::Gateway));
        assert!(cache.services.is_empty());
    }

    #[tokio::test]
    async fn subscribe_fills_from_last_snapshot() {
        let discovery = Discovery::new(ServiceType::Gateway);
        discovery.inner.write().ingest(
            list(1, 1, vec![record(ServiceType::Gateway, "echo", "tcp://h:1")]),
            ServiceType::Gateway,
        );
        assert_eq!(discovery.receiver_count("echo"), 0);
        discovery.subscribe("echo").unwrap();
        assert_eq!(discovery.receiver_count("echo"), 1);
        assert!(discovery.service_available("echo"));
        assert!(discovery.get_receivers("nope").is_empty());

        discovery.unsubscribe("echo").unwrap();
        // Dropped on the next ingestion, not before.
        assert_eq!(discovery.receiver_count("echo"), 1);
        discovery.inner.write().ingest(list(1, 2, vec![]), ServiceType::Gateway);
        assert_eq!(discovery.receiver_count("echo"), 0);
        discovery.unsubscribe("echo").unwrap();
        discovery.unsubscribe("never").unwrap();
        assert!(matches!(discovery.unsubscribe(""), Err(Error::InvalidArgument(_))));
        assert!(discovery.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let discovery = Discovery::new(ServiceType::Gateway);
        discovery.close();
        discovery.close();
        assert!(matches!(discovery.subscribe("x"), Err(Error::Closed)));
        assert!(matches!(discovery.connect_registry("inproc://x"), Err(Error::Closed)));
    }
}
