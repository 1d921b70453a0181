//! SpotNode / Spot: topic pub/sub between peer nodes.
//!
//! A node owns one publisher (bound, what peers subscribe to), one
//! subscriber (connected to peer publishers) and one registry dealer. Spots
//! are lightweight handles on a node: each declares the topics it publishes,
//! holds its own subscriptions and receives into its own inbox.
//!
//! On the wire a publication is `[topic][mode][parts...]`, mode being the
//! `TopicMode` byte of the publishing spot's topic. Subscriptions are
//! forwarded to peers as prefixes and matched exactly on arrival.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use switchyard_core::config::SpotConfig;
use switchyard_core::{Frame, Message, ServiceType, TopicMode, Wait};
use switchyard_transport::tls::server_acceptor;
use switchyard_transport::{
    DealerSocket, Endpoint, PubSocket, SocketOption, SocketOptions, SubSocket, TlsClient,
    TransportError,
};

use crate::discovery::Discovery;
use crate::error::{Error, Result};
use crate::receiver::advertise_endpoint;
use crate::registration::{RegisterResult, Registrar, RegistrationHandle};
use crate::topic::{deadline, Inbox};

/// Service name used when `register` is given an empty one.
pub const DEFAULT_SPOT_SERVICE: &str = "spot-node";

const MAX_SPOT_SERVICE_LEN: usize = 64;
const MAX_TOPIC_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotSocket {
    /// Publisher peers subscribe to.
    Pub,
    /// Subscriber connected to peer publishers.
    Sub,
    /// Dealer connected to the registry.
    Dealer,
}

// ── Publication framing ───────────────────────────────────────────────────────

fn encode_publication(topic: &str, mode: TopicMode, parts: Message) -> Message {
    let mut msg = Vec::with_capacity(parts.len() + 2);
    msg.push(Frame::from(topic.to_string()));
    msg.push(Frame::new(Bytes::copy_from_slice(&[mode.into()])));
    msg.extend(parts);
    msg
}

fn decode_publication(mut msg: Message) -> Option<(String, TopicMode, Message)> {
    if msg.len() < 2 {
        return None;
    }
    let parts = msg.split_off(2);
    let topic = msg[0].as_str()?.to_string();
    let mode = match msg[1].as_bytes().as_ref() {
        [b] => TopicMode::try_from(*b).ok()?,
        _ => return None,
    };
    Some((topic, mode, parts))
}

/// What is left of `wait` at `deadline`.
fn remaining(wait: Wait, deadline: Option<Instant>) -> Wait {
    match (wait, deadline) {
        (Wait::Timeout(_), Some(at)) => Wait::Timeout(at.saturating_duration_since(Instant::now())),
        _ => wait,
    }
}

// ── Subscriptions ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Interest {
    exact: HashSet<String>,
    /// Pattern prefixes, i.e. patterns without their trailing `*`.
    prefixes: BTreeSet<String>,
}

impl Interest {
    fn matches(&self, topic: &str) -> bool {
        self.exact.contains(topic) || self.prefixes.iter().any(|p| topic.starts_with(p.as_str()))
    }

    /// Everything subscribed upstream on behalf of this interest.
    fn upstream(&self) -> Vec<String> {
        self.exact.iter().chain(self.prefixes.iter()).cloned().collect()
    }
}

/// The prefix a pattern stands for: exactly one `*`, in last position.
fn pattern_prefix(pattern: &str) -> Option<&str> {
    let prefix = pattern.strip_suffix('*')?;
    (!prefix.contains('*')).then_some(prefix)
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
        return Err(Error::invalid(format!("invalid topic {topic:?}")));
    }
    Ok(())
}

fn validate_spot_service(service: &str) -> Result<()> {
    let ok = (1..=MAX_SPOT_SERVICE_LEN).contains(&service.len())
        && service
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "spot service {service:?} must be 1..={MAX_SPOT_SERVICE_LEN} of [a-z0-9.-]"
        )))
    }
}

// ── Node ──────────────────────────────────────────────────────────────────────

struct SpotShared {
    id: u64,
    topics: Mutex<HashMap<String, TopicMode>>,
    interest: Mutex<Interest>,
    inbox: Inbox,
    closed: AtomicBool,
}

impl SpotShared {
    fn interest(&self) -> MutexGuard<'_, Interest> {
        self.interest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicMode>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct Peers {
    /// Connected with `connect_peer_pub`.
    manual: BTreeSet<String>,
    /// Connected because Discovery advertised them.
    discovered: BTreeSet<String>,
}

struct NodeInner {
    publisher: PubSocket,
    sub: SubSocket,
    registrar: Arc<Registrar>,
    bound: Mutex<Option<Endpoint>>,
    spots: Mutex<HashMap<u64, Arc<SpotShared>>>,
    next_spot: AtomicU64,
    peers: Mutex<Peers>,
    peering: Mutex<Option<CancellationToken>>,
    config: SpotConfig,
    cancel: CancellationToken,
}

impl NodeInner {
    fn spots(&self) -> MutexGuard<'_, HashMap<u64, Arc<SpotShared>>> {
        self.spots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peers(&self) -> MutexGuard<'_, Peers> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn matching(&self, topic: &str) -> Vec<Arc<SpotShared>> {
        self.spots()
            .values()
            .filter(|s| s.interest().matches(topic))
            .cloned()
            .collect()
    }

    /// Hand a publication to every local spot subscribed to `topic`.
    async fn deliver(&self, topic: &str, mode: TopicMode, parts: &Message, wait: Wait) -> Result<()> {
        for spot in self.matching(topic) {
            match spot.inbox.push(topic, mode, parts.clone(), wait).await {
                Ok(()) | Err(Error::Closed) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct SpotNode {
    inner: Arc<NodeInner>,
}

impl Default for SpotNode {
    fn default() -> Self {
        Self::new()
    }
}

impl SpotNode {
    /// Must be created inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_options(SocketOptions::default(), &SpotConfig::default())
    }

    pub fn with_options(options: SocketOptions, config: &SpotConfig) -> Self {
        let routing_id = Bytes::from(format!(
            "spot-{}",
            hex::encode(rand::random::<u64>().to_be_bytes())
        ));
        let registrar = Arc::new(Registrar::new(
            ServiceType::Spot,
            DealerSocket::with_options(routing_id, options.clone()),
            Duration::from_millis(config.heartbeat_interval_ms),
        ));
        let inner = Arc::new(NodeInner {
            publisher: PubSocket::with_options(options.clone()),
            sub: SubSocket::with_options(options),
            registrar,
            bound: Mutex::new(None),
            spots: Mutex::new(HashMap::new()),
            next_spot: AtomicU64::new(1),
            peers: Mutex::new(Peers::default()),
            peering: Mutex::new(None),
            config: config.clone(),
            cancel: CancellationToken::new(),
        });
        {
            let registrar = inner.registrar.clone();
            let cancel = inner.cancel.clone();
            tokio::spawn(async move { registrar.run(cancel).await });
        }
        tokio::spawn(dispatch(inner.clone()));
        Self { inner }
    }

    pub fn routing_id(&self) -> &Bytes {
        self.inner.registrar.dealer().routing_id()
    }

    /// Bind the publisher. Returns the bound endpoint with any ephemeral
    /// port resolved.
    pub async fn bind(&self, endpoint: &str) -> Result<String> {
        self.ensure_open()?;
        let bound = self.inner.publisher.bind(endpoint).await?;
        let resolved = bound.to_string();
        self.inner
            .bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(bound);
        tracing::info!(endpoint = %resolved, "spot node bound");
        Ok(resolved)
    }

    pub fn connect_registry(&self, request: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner.registrar.dealer().connect(request)?;
        tracing::info!(registry = request, "spot node connected to registry");
        Ok(())
    }

    /// Subscribe to a peer node's publisher.
    pub fn connect_peer_pub(&self, endpoint: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner.sub.connect(endpoint)?;
        self.inner.peers().manual.insert(endpoint.to_string());
        tracing::debug!(peer = endpoint, "spot peer connected");
        Ok(())
    }

    pub fn disconnect_peer_pub(&self, endpoint: &str) -> Result<()> {
        self.ensure_open()?;
        let mut peers = self.inner.peers();
        if !peers.manual.remove(endpoint) {
            return Err(Error::invalid(format!("{endpoint:?} is not a connected peer")));
        }
        if !peers.discovered.contains(endpoint) {
            self.inner.sub.disconnect(endpoint);
        }
        tracing::debug!(peer = endpoint, "spot peer disconnected");
        Ok(())
    }

    /// Publisher endpoints currently subscribed to.
    pub fn peers(&self) -> Vec<String> {
        self.inner.sub.connected_endpoints()
    }

    /// Peer with every spot node Discovery reports for `service`, other
    /// than this one. Replaces any earlier discovery binding.
    pub fn set_discovery(&self, discovery: Arc<Discovery>, service: &str) -> Result<()> {
        self.ensure_open()?;
        if discovery.service_type() != ServiceType::Spot {
            return Err(Error::invalid("discovery must track spot services"));
        }
        let service = if service.is_empty() { DEFAULT_SPOT_SERVICE } else { service };
        validate_spot_service(service)?;
        discovery.subscribe(service)?;

        let token = self.inner.cancel.child_token();
        let previous = self
            .inner
            .peering
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(prev) = previous {
            prev.cancel();
        }
        tokio::spawn(peering(self.inner.clone(), discovery, service.to_string(), token));
        Ok(())
    }

    /// Advertise this node's publisher as a spot service. An empty
    /// `service` registers under `spot-node`; an empty `advertise` uses the
    /// bound endpoint.
    pub async fn register(&self, service: &str, advertise: &str) -> Result<RegistrationHandle> {
        self.ensure_open()?;
        let service = if service.is_empty() { DEFAULT_SPOT_SERVICE } else { service };
        validate_spot_service(service)?;
        if self.inner.registrar.dealer().endpoint().is_none() {
            return Err(Error::EndpointsUnset);
        }
        let endpoint = advertise_endpoint(advertise, &self.inner.bound)?;
        self.inner
            .registrar
            .register(service, endpoint, switchyard_core::wire::DEFAULT_WEIGHT)
            .await
    }

    pub fn register_result(&self, service: &str) -> Option<RegisterResult> {
        let service = if service.is_empty() { DEFAULT_SPOT_SERVICE } else { service };
        self.inner.registrar.result(service)
    }

    pub async fn unregister(&self, service: &str) -> Result<()> {
        self.ensure_open()?;
        let service = if service.is_empty() { DEFAULT_SPOT_SERVICE } else { service };
        self.inner.registrar.unregister(service).await
    }

    pub fn set_heartbeat_interval(&self, interval_ms: u64) -> Result<()> {
        self.ensure_open()?;
        self.inner.registrar.set_heartbeat_interval(interval_ms)
    }

    /// Certificate for `tls://` endpoints bound afterwards.
    pub fn set_tls_server(&self, cert: &Path, key: &Path) -> Result<()> {
        self.ensure_open()?;
        self.inner.publisher.set_tls_server(server_acceptor(cert, key)?);
        Ok(())
    }

    /// Trust settings for `tls://` peers and registries connected afterwards.
    pub fn set_tls_client(&self, client: TlsClient) -> Result<()> {
        self.ensure_open()?;
        self.inner.sub.set_tls_client(client.clone());
        self.inner.registrar.dealer().set_tls_client(client);
        Ok(())
    }

    pub fn set_socket_option(&self, socket: SpotSocket, option: SocketOption) -> Result<()> {
        self.ensure_open()?;
        match socket {
            SpotSocket::Pub => self.inner.publisher.set_option(option),
            SpotSocket::Sub => self.inner.sub.set_option(option),
            SpotSocket::Dealer => self.inner.registrar.dealer().set_option(option),
        }
        Ok(())
    }

    /// A new spot on this node.
    pub fn spot(&self) -> Result<Spot> {
        self.ensure_open()?;
        let id = self.inner.next_spot.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SpotShared {
            id,
            topics: Mutex::new(HashMap::new()),
            interest: Mutex::new(Interest::default()),
            inbox: Inbox::new(self.inner.config.queue_capacity, self.inner.config.ring_capacity),
            closed: AtomicBool::new(false),
        });
        self.inner.spots().insert(id, shared.clone());
        Ok(Spot {
            node: self.inner.clone(),
            shared,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Idempotent. Spots created from this node stop working.
    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.publisher.close();
        self.inner.sub.close();
        self.inner.registrar.close();
        for (_, spot) in self.inner.spots().drain() {
            spot.closed.store(true, Ordering::Release);
            spot.inbox.close();
        }
        tracing::info!(routing_id = %hex::encode(self.routing_id()), "spot node closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for SpotNode {
    fn drop(&mut self) {
        self.close();
    }
}

/// Route peer publications into local inboxes. A full QUEUE inbox stalls
/// this task, which pushes back on the publishing peer.
async fn dispatch(inner: Arc<NodeInner>) {
    loop {
        let msg = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            r = inner.sub.recv(Wait::Block) => r,
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(TransportError::Closed) => break,
            Err(e) => {
                tracing::warn!(error = %e, "spot subscriber error");
                continue;
            }
        };
        let Some((topic, mode, parts)) = decode_publication(msg) else {
            tracing::warn!("malformed spot publication");
            continue;
        };
        tracing::trace!(topic = %topic, mode = ?mode, parts = parts.len(), "publication received");
        let delivered = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            r = inner.deliver(&topic, mode, &parts, Wait::Block) => r,
        };
        if let Err(e) = delivered {
            tracing::debug!(topic = %topic, error = %e, "publication not delivered");
        }
    }
    tracing::trace!("spot dispatch stopped");
}

/// Keep peer connections in line with what Discovery advertises.
async fn peering(inner: Arc<NodeInner>, discovery: Arc<Discovery>, service: String, token: CancellationToken) {
    let mut updates = discovery.updates();
    let mut tick = tokio::time::interval(Duration::from_millis(inner.config.peer_refresh_ms.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            r = updates.changed() => {
                if r.is_err() {
                    break;
                }
            }
            _ = tick.tick() => {}
        }
        reconcile_peers(&inner, &discovery, &service);
    }

    // Unbound from discovery: drop what it brought in.
    let mut peers = inner.peers();
    for endpoint in std::mem::take(&mut peers.discovered) {
        if !peers.manual.contains(&endpoint) {
            inner.sub.disconnect(&endpoint);
        }
    }
}

fn reconcile_peers(inner: &NodeInner, discovery: &Discovery, service: &str) {
    let own_id = inner.registrar.dealer().routing_id().clone();
    let own_endpoints = inner.registrar.endpoints();
    let wanted: BTreeSet<String> = discovery
        .get_receivers(service)
        .into_iter()
        .filter(|r| r.routing_id != own_id && !own_endpoints.contains(&r.endpoint))
        .map(|r| r.endpoint)
        .collect();

    let mut peers = inner.peers();
    let gone: Vec<String> = peers.discovered.difference(&wanted).cloned().collect();
    for endpoint in gone {
        peers.discovered.remove(&endpoint);
        if !peers.manual.contains(&endpoint) {
            inner.sub.disconnect(&endpoint);
            tracing::debug!(peer = %endpoint, "spot peer withdrawn");
        }
    }
    for endpoint in wanted {
        if peers.discovered.contains(&endpoint) {
            continue;
        }
        if peers.manual.contains(&endpoint) {
            peers.discovered.insert(endpoint);
            continue;
        }
        match inner.sub.connect(&endpoint) {
            Ok(()) => {
                tracing::debug!(peer = %endpoint, "spot peer discovered");
                peers.discovered.insert(endpoint);
            }
            Err(e) => tracing::warn!(peer = %endpoint, error = %e, "cannot connect to spot peer"),
        }
    }
}

// ── Spot ──────────────────────────────────────────────────────────────────────

/// A publishing and subscribing handle on a `SpotNode`.
pub struct Spot {
    node: Arc<NodeInner>,
    shared: Arc<SpotShared>,
}

impl Spot {
    /// Declare `topic` for publishing from this spot.
    pub fn topic_create(&self, topic: &str, mode: TopicMode) -> Result<()> {
        self.ensure_open()?;
        validate_topic(topic)?;
        let mut topics = self.shared.topics();
        if topics.contains_key(topic) {
            return Err(Error::TopicExists(topic.to_string()));
        }
        topics.insert(topic.to_string(), mode);
        tracing::debug!(spot = self.shared.id, topic, mode = ?mode, "topic created");
        Ok(())
    }

    pub fn topic_destroy(&self, topic: &str) -> Result<()> {
        self.ensure_open()?;
        if self.shared.topics().remove(topic).is_none() {
            return Err(Error::UnknownTopic(topic.to_string()));
        }
        tracing::debug!(spot = self.shared.id, topic, "topic destroyed");
        Ok(())
    }

    /// Publish to local subscribers, then to connected peers. QUEUE topics
    /// wait for room as `wait` allows and never drop; RINGBUFFER topics
    /// never wait.
    pub async fn publish(&self, topic: &str, parts: Message, wait: Wait) -> Result<()> {
        self.ensure_open()?;
        let mode = self
            .shared
            .topics()
            .get(topic)
            .copied()
            .ok_or_else(|| Error::UnknownTopic(topic.to_string()))?;

        match mode {
            TopicMode::Queue => {
                // Hold room in every local inbox and peer outbox before
                // filling any. A full inbox releases what was taken and the
                // round starts over, so nothing is held while waiting.
                let deadline = deadline(wait);
                let targets = self.node.matching(topic);
                let slots = loop {
                    let mut slots = Vec::with_capacity(targets.len());
                    let mut full = None;
                    for spot in &targets {
                        match spot.inbox.try_reserve() {
                            Ok(slot) => slots.push(slot),
                            Err(Error::Closed) => {}
                            Err(_) => {
                                full = Some(spot);
                                break;
                            }
                        }
                    }
                    let Some(spot) = full else {
                        break slots;
                    };
                    drop(slots);
                    spot.inbox.wait_room(wait, deadline).await?;
                };
                let remote = self
                    .node
                    .publisher
                    .reserve(topic.as_bytes(), remaining(wait, deadline))
                    .await?;
                for slot in slots {
                    slot.fill(topic, parts.clone());
                }
                let n = remote.send(encode_publication(topic, mode, parts));
                tracing::trace!(topic, peers = n, "queue publication sent");
            }
            TopicMode::RingBuffer => {
                self.node.deliver(topic, mode, &parts, Wait::DontWait).await?;
                let n = self
                    .node
                    .publisher
                    .send(encode_publication(topic, mode, parts))?;
                tracing::trace!(topic, peers = n, "ring publication sent");
            }
        }
        Ok(())
    }

    /// Receive publications on exactly `topic`.
    pub fn subscribe(&self, topic: &str) -> Result<()> {
        self.ensure_open()?;
        validate_topic(topic)?;
        if self.shared.interest().exact.insert(topic.to_string()) {
            self.node.sub.subscribe(topic);
        }
        Ok(())
    }

    /// Receive publications on every topic starting with the text before
    /// the trailing `*`.
    pub fn subscribe_pattern(&self, pattern: &str) -> Result<()> {
        self.ensure_open()?;
        let prefix = pattern_prefix(pattern).ok_or_else(|| {
            Error::invalid(format!("pattern {pattern:?} must end with its only '*'"))
        })?;
        if self.shared.interest().prefixes.insert(prefix.to_string()) {
            self.node.sub.subscribe(prefix);
        }
        Ok(())
    }

    /// Drop a topic or pattern subscription.
    pub fn unsubscribe(&self, topic_or_pattern: &str) -> Result<()> {
        self.ensure_open()?;
        let mut interest = self.shared.interest();
        let upstream = if interest.exact.remove(topic_or_pattern) {
            topic_or_pattern
        } else {
            match pattern_prefix(topic_or_pattern) {
                Some(prefix) if interest.prefixes.remove(prefix) => prefix,
                _ => {
                    return Err(Error::invalid(format!(
                        "not subscribed to {topic_or_pattern:?}"
                    )))
                }
            }
        };
        self.node.sub.unsubscribe(upstream);
        Ok(())
    }

    /// Next publication as `(topic, parts)`.
    pub async fn recv(&self, wait: Wait) -> Result<(String, Message)> {
        self.ensure_open()?;
        self.shared.inbox.pop(wait).await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.node.is_closed()
    }

    /// Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.node.spots().remove(&self.shared.id);
        let upstream = {
            let mut interest = self.shared.interest();
            let upstream = interest.upstream();
            *interest = Interest::default();
            upstream
        };
        for prefix in upstream {
            self.node.sub.unsubscribe(prefix);
        }
        self.shared.inbox.close();
        tracing::debug!(spot = self.shared.id, "spot closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Spot {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_rules() {
        assert_eq!(pattern_prefix("prices.*"), Some("prices."));
        assert_eq!(pattern_prefix("*"), Some(""));
        assert_eq!(pattern_prefix("prices"), None);
        assert_eq!(pattern_prefix("pri*ces.*"), None);
        assert_eq!(pattern_prefix("*.x"), None);
    }

    #[test]
    fn interest_matches_exact_and_prefix() {
        let mut interest = Interest::default();
        interest.exact.insert("t".into());
        interest.prefixes.insert("prices.".into());
        assert!(interest.matches("t"));
        assert!(!interest.matches("tx"));
        assert!(interest.matches("prices.eur"));
        assert!(!interest.matches("price"));
    }

    #[test]
    fn topic_length_limits() {
        assert!(validate_topic(&"t".repeat(MAX_TOPIC_LEN)).is_ok());
        assert!(validate_topic(&"t".repeat(MAX_TOPIC_LEN + 1)).is_err());
        assert!(validate_topic("").is_err());
    }

    #[test]
    fn spot_service_names() {
        assert!(validate_spot_service("spot-node").is_ok());
        assert!(validate_spot_service("md.v2-eu").is_ok());
        assert!(validate_spot_service("").is_err());
        assert!(validate_spot_service("Upper").is_err());
        assert!(validate_spot_service(&"a".repeat(65)).is_err());
    }

    #[test]
    fn publication_framing() {
        let msg = encode_publication("t", TopicMode::RingBuffer, vec![Frame::from("a"), Frame::from("b")]);
        let (topic, mode, parts) = decode_publication(msg).unwrap();
        assert_eq!(topic, "t");
        assert_eq!(mode, TopicMode::RingBuffer);
        assert_eq!(parts, vec![Frame::from("a"), Frame::from("b")]);
        assert!(decode_publication(vec![Frame::from("t")]).is_none());
        assert!(decode_publication(vec![Frame::from("t"), Frame::from("xy")]).is_none());
    }

    #[tokio::test]
    async fn local_round_trip() {
        let node = SpotNode::new();
        let publisher = node.spot().unwrap();
        let subscriber = node.spot().unwrap();
        publisher.topic_create("t", TopicMode::Queue).unwrap();
        assert!(matches!(
            publisher.topic_create("t", TopicMode::Queue),
            Err(Error::TopicExists(_))
        ));
        subscriber.subscribe("t").unwrap();

        publisher
            .publish("t", vec![Frame::from("a"), Frame::from("b")], Wait::Block)
            .await
            .unwrap();
        let (topic, parts) = subscriber.recv(Wait::millis(1000)).await.unwrap();
        assert_eq!(topic, "t");
        assert_eq!(parts, vec![Frame::from("a"), Frame::from("b")]);

        assert!(matches!(
            publisher.publish("nope", vec![], Wait::DontWait).await,
            Err(Error::UnknownTopic(_))
        ));
        publisher.topic_destroy("t").unwrap();
        assert!(matches!(publisher.topic_destroy("t"), Err(Error::UnknownTopic(_))));
    }

    #[tokio::test]
    async fn unsubscribe_and_patterns() {
        let node = SpotNode::new();
        let spot = node.spot().unwrap();
        assert!(matches!(spot.subscribe_pattern("a*b"), Err(Error::InvalidArgument(_))));
        spot.subscribe_pattern("prices.*").unwrap();
        spot.topic_create("prices.eur", TopicMode::RingBuffer).unwrap();
        spot.publish("prices.eur", vec![Frame::from("1")], Wait::DontWait)
            .await
            .unwrap();
        let (topic, _) = spot.recv(Wait::DontWait).await.unwrap();
        assert_eq!(topic, "prices.eur");

        spot.unsubscribe("prices.*").unwrap();
        assert!(matches!(spot.unsubscribe("prices.*"), Err(Error::InvalidArgument(_))));
        spot.publish("prices.eur", vec![Frame::from("2")], Wait::DontWait)
            .await
            .unwrap();
        assert!(matches!(spot.recv(Wait::DontWait).await, Err(Error::WouldBlock)));
    }

    #[tokio::test]
    async fn close_is_idempotent_everywhere() {
        let node = SpotNode::new();
        let spot = node.spot().unwrap();
        spot.close();
        spot.close();
        assert!(matches!(spot.subscribe("t"), Err(Error::Closed)));

        let other = node.spot().unwrap();
        node.close();
        node.close();
        assert!(other.is_closed());
        assert!(matches!(other.recv(Wait::DontWait).await, Err(Error::Closed)));
        assert!(matches!(node.spot(), Err(Error::Closed)));
        assert!(matches!(
            node.register("", "").await,
            Err(Error::Closed)
        ));
    }
}
