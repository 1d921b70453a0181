//! Registry, the authoritative service directory.
//!
//! Providers send requests to the request socket (router role). The merged
//! directory is published on the broadcast socket as a full snapshot on a
//! fixed cadence, whenever it changes, and whenever a new subscriber joins.
//! Registries federate by subscribing to each other's broadcast sockets.
//!
//! Lifecycle: Unconfigured → Bound (`set_endpoints`) → Running (`start`) →
//! Closed. One task owns the `Directory` and serializes every mutation.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use switchyard_core::config::SwitchyardConfig;
use switchyard_core::wire::{self, AckStatus, RegisterAck, Request, ServiceList};
use switchyard_core::{Message, Wait};
use switchyard_transport::tls::server_acceptor;
use switchyard_transport::{
    PubSocket, RouterSocket, SocketOption, SocketOptions, SubSocket, TlsClient, TransportError,
};

use crate::directory::Directory;
use crate::error::{Error, Result};

/// Peers silent for this many broadcast intervals are forgotten.
const PEER_SILENCE_FACTOR: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrySocket {
    /// Publisher carrying the directory snapshots.
    Broadcast,
    /// Router receiving provider requests.
    Request,
    /// Subscriber connected to peer registries.
    PeerSubscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unconfigured,
    Bound,
    Running,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Timing {
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    broadcast_override: Option<Duration>,
}

impl Timing {
    fn broadcast_interval(&self) -> Duration {
        self.broadcast_override.unwrap_or(self.heartbeat_interval)
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(
                switchyard_core::config::DEFAULT_HEARTBEAT_INTERVAL_MS,
            ),
            heartbeat_timeout: Duration::from_millis(
                switchyard_core::config::DEFAULT_HEARTBEAT_TIMEOUT_MS,
            ),
            broadcast_override: None,
        }
    }
}

struct Control {
    state: State,
    id: Option<u32>,
    broadcast_ep: Option<String>,
    request_ep: Option<String>,
    peers: Vec<String>,
}

struct Inner {
    router: RouterSocket,
    publisher: PubSocket,
    peer_sub: SubSocket,
    control: Mutex<Control>,
    timing: watch::Sender<Timing>,
    cancel: CancellationToken,
}

pub struct Registry {
    inner: Arc<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_options(SocketOptions::default())
    }

    pub fn with_options(options: SocketOptions) -> Self {
        let peer_sub = SubSocket::with_options(options.clone());
        peer_sub.subscribe("");
        let (timing, _) = watch::channel(Timing::default());
        Self {
            inner: Arc::new(Inner {
                router: RouterSocket::with_options(Bytes::from_static(b"registry"), options.clone()),
                publisher: PubSocket::with_options(options),
                peer_sub,
                control: Mutex::new(Control {
                    state: State::Unconfigured,
                    id: None,
                    broadcast_ep: None,
                    request_ep: None,
                    peers: Vec::new(),
                }),
                timing,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Build, bind and configure a registry from the `[registry]`,
    /// `[transport]` and `[tls]` config sections. Not started.
    pub async fn from_config(config: &SwitchyardConfig) -> Result<Self> {
        let registry = Self::with_options(SocketOptions::from_config(&config.transport));
        let tls = &config.tls;
        if !tls.cert_path.is_empty() && !tls.key_path.is_empty() {
            registry.set_tls_server(Path::new(&tls.cert_path), Path::new(&tls.key_path))?;
        }
        if !tls.ca_path.is_empty() || tls.trust_system {
            let ca = (!tls.ca_path.is_empty()).then(|| Path::new(&tls.ca_path));
            let host = (!tls.hostname.is_empty()).then_some(tls.hostname.as_str());
            registry
                .inner
                .peer_sub
                .set_tls_client(TlsClient::new(ca, host, tls.trust_system)?);
        }

        let cfg = &config.registry;
        registry
            .set_endpoints(&cfg.broadcast_endpoint, &cfg.request_endpoint)
            .await?;
        if cfg.id != 0 {
            registry.set_id(cfg.id)?;
        }
        registry.set_heartbeat(cfg.heartbeat_interval_ms, cfg.heartbeat_timeout_ms)?;
        if cfg.broadcast_interval_ms != 0 {
            registry.set_broadcast_interval(cfg.broadcast_interval_ms)?;
        }
        for peer in &cfg.peers {
            registry.add_peer(peer)?;
        }
        Ok(registry)
    }

    // ── Configuration ─────────────────────────────────────────────────────────

    /// Bind the broadcast and request sockets. Ephemeral ports are resolved
    /// and readable afterwards.
    pub async fn set_endpoints(&self, broadcast: &str, request: &str) -> Result<()> {
        match self.control().state {
            State::Unconfigured => {}
            State::Closed => return Err(Error::Closed),
            _ => return Err(Error::invalid("registry endpoints are already bound")),
        }
        let pub_ep = self.inner.publisher.bind(broadcast).await?;
        let req_ep = self.inner.router.bind(request).await?;

        let mut control = self.control();
        control.broadcast_ep = Some(pub_ep.to_string());
        control.request_ep = Some(req_ep.to_string());
        control.state = State::Bound;
        Ok(())
    }

    pub fn broadcast_endpoint(&self) -> Option<String> {
        self.control().broadcast_ep.clone()
    }

    pub fn request_endpoint(&self) -> Option<String> {
        self.control().request_ep.clone()
    }

    /// Federation identity. Must be set before `start`.
    pub fn set_id(&self, id: u32) -> Result<()> {
        if id == 0 {
            return Err(Error::invalid("registry id must be non-zero"));
        }
        let mut control = self.control();
        match control.state {
            State::Running => Err(Error::invalid("registry id cannot change while running")),
            State::Closed => Err(Error::Closed),
            _ => {
                control.id = Some(id);
                Ok(())
            }
        }
    }

    /// The id in use, once set or chosen at start.
    pub fn id(&self) -> Option<u32> {
        self.control().id
    }

    /// Follow another registry's broadcast socket.
    pub fn add_peer(&self, broadcast: &str) -> Result<()> {
        let mut control = self.control();
        if control.state == State::Closed {
            return Err(Error::Closed);
        }
        self.inner.peer_sub.connect(broadcast)?;
        if !control.peers.iter().any(|p| p == broadcast) {
            control.peers.push(broadcast.to_string());
        }
        tracing::info!(peer = broadcast, "registry peer added");
        Ok(())
    }

    pub fn peers(&self) -> Vec<String> {
        self.control().peers.clone()
    }

    /// Heartbeat interval drives the broadcast cadence unless overridden;
    /// the timeout drives record expiry.
    pub fn set_heartbeat(&self, interval_ms: u64, timeout_ms: u64) -> Result<()> {
        if interval_ms == 0 || timeout_ms == 0 {
            return Err(Error::invalid("heartbeat interval and timeout must be non-zero"));
        }
        if timeout_ms <= interval_ms {
            return Err(Error::invalid(format!(
                "heartbeat timeout {timeout_ms}ms must exceed interval {interval_ms}ms"
            )));
        }
        self.ensure_open()?;
        self.inner.timing.send_modify(|t| {
            t.heartbeat_interval = Duration::from_millis(interval_ms);
            t.heartbeat_timeout = Duration::from_millis(timeout_ms);
        });
        Ok(())
    }

    pub fn set_broadcast_interval(&self, interval_ms: u64) -> Result<()> {
        if interval_ms == 0 {
            return Err(Error::invalid("broadcast interval must be non-zero"));
        }
        self.ensure_open()?;
        self.inner
            .timing
            .send_modify(|t| t.broadcast_override = Some(Duration::from_millis(interval_ms)));
        Ok(())
    }

    pub fn set_socket_option(&self, socket: RegistrySocket, option: SocketOption) -> Result<()> {
        self.ensure_open()?;
        match socket {
            RegistrySocket::Broadcast => self.inner.publisher.set_option(option),
            RegistrySocket::Request => self.inner.router.set_option(option),
            RegistrySocket::PeerSubscribe => self.inner.peer_sub.set_option(option),
        }
        Ok(())
    }

    /// Certificate for `tls://` endpoints bound afterwards.
    pub fn set_tls_server(&self, cert: &Path, key: &Path) -> Result<()> {
        self.ensure_open()?;
        let acceptor = server_acceptor(cert, key)?;
        self.inner.router.set_tls_server(acceptor.clone());
        self.inner.publisher.set_tls_server(acceptor);
        Ok(())
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Start the registry task. A no-op while already running.
    pub fn start(&self) -> Result<()> {
        let mut control = self.control();
        match control.state {
            State::Unconfigured => return Err(Error::EndpointsUnset),
            State::Closed => return Err(Error::Closed),
            State::Running => return Ok(()),
            State::Bound => {}
        }
        let id = *control.id.get_or_insert_with(random_id);
        control.state = State::Running;
        tracing::info!(
            registry_id = id,
            broadcast = control.broadcast_ep.as_deref().unwrap_or_default(),
            request = control.request_ep.as_deref().unwrap_or_default(),
            "registry started"
        );
        drop(control);

        let task = RegistryTask {
            inner: self.inner.clone(),
            directory: Directory::new(id),
            timing: self.inner.timing.subscribe(),
        };
        tokio::spawn(task.run());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.control().state == State::Running
    }

    /// Stop the task and release every socket. Idempotent.
    pub fn close(&self) {
        let mut control = self.control();
        if control.state == State::Closed {
            return;
        }
        control.state = State::Closed;
        drop(control);
        self.inner.cancel.cancel();
        self.inner.router.close();
        self.inner.publisher.close();
        self.inner.peer_sub.close();
        tracing::info!("registry closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.control().state == State::Closed {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn control(&self) -> std::sync::MutexGuard<'_, Control> {
        self.inner
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.close();
    }
}

fn random_id() -> u32 {
    loop {
        let id = rand::random::<u32>();
        if id != 0 {
            return id;
        }
    }
}

// ── Task ──────────────────────────────────────────────────────────────────────

struct RegistryTask {
    inner: Arc<Inner>,
    directory: Directory,
    timing: watch::Receiver<Timing>,
}

impl RegistryTask {
    async fn run(mut self) {
        let inner = self.inner.clone();
        let mut joins = inner.publisher.subscriber_joined();
        let mut timing = *self.timing.borrow_and_update();
        let mut next_broadcast = Instant::now() + timing.broadcast_interval();
        let mut last_sent: Option<u64> = None;

        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,

                r = inner.router.recv(Wait::Block) => match r {
                    Ok((routing_id, msg)) => self.handle_request(routing_id, msg).await,
                    Err(TransportError::Closed) => break,
                    Err(e) => tracing::warn!(error = %e, "registry request socket error"),
                },

                r = inner.peer_sub.recv(Wait::Block) => match r {
                    Ok(msg) => self.handle_peer(&msg),
                    Err(TransportError::Closed) => break,
                    Err(e) => tracing::warn!(error = %e, "registry peer socket error"),
                },

                r = joins.recv() => {
                    if r.is_ok() || matches!(r, Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) {
                        tracing::trace!("broadcast subscriber joined");
                        last_sent = None;
                    }
                }

                _ = tokio::time::sleep_until(next_broadcast) => {
                    last_sent = None;
                    next_broadcast = Instant::now() + timing.broadcast_interval();
                }

                r = self.timing.changed() => {
                    if r.is_err() {
                        break;
                    }
                    timing = *self.timing.borrow_and_update();
                    next_broadcast = Instant::now() + timing.broadcast_interval();
                    tracing::debug!(
                        interval_ms = timing.broadcast_interval().as_millis() as u64,
                        timeout_ms = timing.heartbeat_timeout.as_millis() as u64,
                        "registry timing changed"
                    );
                }
            }

            // Whatever triggered this broadcast, stale records stay out of it.
            self.expire(timing);
            if last_sent != Some(self.directory.seq()) {
                self.publish();
                last_sent = Some(self.directory.seq());
            }
        }
        tracing::debug!(registry_id = self.directory.id(), "registry task stopped");
    }

    async fn handle_request(&mut self, routing_id: Bytes, msg: Message) {
        let req = match Request::decode(&msg) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(
                    routing_id = %hex::encode(&routing_id),
                    error = %e,
                    "malformed registry request"
                );
                let ack = RegisterAck::error(AckStatus::Malformed, "", "", e.to_string());
                self.ack(&routing_id, ack).await;
                return;
            }
        };

        let now = std::time::Instant::now();
        match self
            .directory
            .apply(&routing_id, &req, now, crate::now_millis())
        {
            Ok(changed) => {
                if changed {
                    tracing::debug!(
                        routing_id = %hex::encode(&routing_id),
                        service = req.service(),
                        endpoint = req.endpoint(),
                        request = ?RequestKind::of(&req),
                        seq = self.directory.seq(),
                        "directory changed"
                    );
                }
                if matches!(req, Request::Register { .. } | Request::UpdateWeight { .. }) {
                    self.ack(&routing_id, RegisterAck::ok(req.service(), req.endpoint()))
                        .await;
                }
            }
            Err(rejection) => {
                tracing::debug!(
                    routing_id = %hex::encode(&routing_id),
                    service = req.service(),
                    reason = %rejection.reason,
                    "registry request refused"
                );
                let ack = RegisterAck::error(
                    rejection.status,
                    req.service(),
                    req.endpoint(),
                    rejection.reason,
                );
                self.ack(&routing_id, ack).await;
            }
        }
    }

    async fn ack(&self, routing_id: &Bytes, ack: RegisterAck) {
        // Never blocks: a full or vanished requester loses its ack and
        // retries on its next heartbeat.
        if let Err(e) = self
            .inner
            .router
            .send_to(routing_id, ack.encode(), Wait::DontWait)
            .await
        {
            tracing::trace!(routing_id = %hex::encode(routing_id), error = %e, "ack not delivered");
        }
    }

    fn handle_peer(&mut self, msg: &Message) {
        if wire::message_id(msg).ok() != Some(wire::MSG_SERVICE_LIST) {
            tracing::warn!("unexpected message on peer feed");
            return;
        }
        match ServiceList::decode(msg) {
            Ok(list) => {
                if self.directory.merge_peer(&list, std::time::Instant::now()) {
                    tracing::debug!(
                        peer = list.registry_id,
                        peer_seq = list.seq,
                        seq = self.directory.seq(),
                        "merged peer directory"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "malformed peer directory"),
        }
    }

    fn expire(&mut self, timing: Timing) {
        let now = std::time::Instant::now();
        for rec in self.directory.expire(now, timing.heartbeat_timeout) {
            tracing::debug!(
                service = %rec.service,
                endpoint = %rec.endpoint,
                routing_id = %hex::encode(&rec.routing_id),
                "record expired"
            );
        }
        let silence = timing.broadcast_interval() * PEER_SILENCE_FACTOR;
        for peer in self.directory.expire_peers(now, silence) {
            tracing::info!(peer, "peer registry went silent");
        }
    }

    fn publish(&self) {
        let list = self.directory.snapshot();
        match self.inner.publisher.send(list.encode()) {
            Ok(n) => tracing::trace!(seq = list.seq, subscribers = n, "directory broadcast"),
            Err(e) => tracing::debug!(error = %e, "directory broadcast failed"),
        }
    }
}

#[derive(Debug)]
enum RequestKind {
    Register,
    Unregister,
    Heartbeat,
    UpdateWeight,
}

impl RequestKind {
    fn of(req: &Request) -> Self {
        match req {
            Request::Register { .. } => RequestKind::Register,
            Request::Unregister { .. } => RequestKind::Unregister,
            Request::Heartbeat { .. } => RequestKind::Heartbeat,
            Request::UpdateWeight { .. } => RequestKind::UpdateWeight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_state_machine() {
        let registry = Registry::new();
        assert!(matches!(registry.start(), Err(Error::EndpointsUnset)));

        registry
            .set_endpoints("inproc://registry-test-pub", "inproc://registry-test-req")
            .await
            .unwrap();
        assert_eq!(registry.broadcast_endpoint().as_deref(), Some("inproc://registry-test-pub"));
        registry.start().unwrap();
        registry.start().unwrap();
        assert!(registry.is_running());
        assert!(registry.id().is_some_and(|id| id != 0));
        assert!(registry.set_id(9).is_err());

        registry.close();
        registry.close();
        assert!(matches!(registry.start(), Err(Error::Closed)));
        assert!(matches!(
            registry.set_heartbeat(100, 300),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn heartbeat_settings_are_validated() {
        let registry = Registry::new();
        assert!(matches!(registry.set_heartbeat(0, 100), Err(Error::InvalidArgument(_))));
        assert!(matches!(registry.set_heartbeat(100, 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(registry.set_heartbeat(100, 100), Err(Error::InvalidArgument(_))));
        assert!(registry.set_heartbeat(100, 101).is_ok());
        assert!(matches!(registry.set_broadcast_interval(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(registry.set_id(0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn broadcast_follows_heartbeat_unless_overridden() {
        let mut t = Timing::default();
        assert_eq!(t.broadcast_interval(), Duration::from_millis(5000));
        t.broadcast_override = Some(Duration::from_millis(50));
        assert_eq!(t.broadcast_interval(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn replies_malformed_to_garbage() {
        let registry = Registry::new();
        registry
            .set_endpoints("inproc://registry-test-garbage-pub", "inproc://registry-test-garbage-req")
            .await
            .unwrap();
        registry.start().unwrap();

        let dealer = switchyard_transport::DealerSocket::new("garbage");
        dealer.connect("inproc://registry-test-garbage-req").unwrap();
        dealer
            .send(vec![switchyard_core::Frame::from("??")], Wait::Block)
            .await
            .unwrap();
        let reply = dealer.recv(Wait::millis(5000)).await.unwrap();
        let ack = RegisterAck::decode(&reply).unwrap();
        assert_eq!(ack.status, AckStatus::Malformed);
    }
}
