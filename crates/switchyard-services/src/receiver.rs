//! Receiver: a provider that serves gateway requests.
//!
//! The receiver binds a router socket for gateway traffic and keeps a dealer
//! connection to a registry. Both sockets share one routing id, which is what
//! the registry records and what gateways address the receiver by.
//!
//! Registration is asynchronous: `register` sends the request and returns a
//! handle that resolves when the registry acknowledges it.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use switchyard_core::config::ReceiverConfig;
use switchyard_core::{wire, ServiceType};
use switchyard_transport::tls::server_acceptor;
use switchyard_transport::{
    DealerSocket, Endpoint, RouterSocket, SocketOption, SocketOptions, TlsClient,
};

use crate::error::{Error, Result};
use crate::registration::{RegisterResult, Registrar, RegistrationHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverSocket {
    /// Router serving gateway requests.
    Router,
    /// Dealer connected to the registry.
    Registry,
}

struct Inner {
    router: RouterSocket,
    registrar: Arc<Registrar>,
    bound: Mutex<Option<Endpoint>>,
    cancel: CancellationToken,
}

pub struct Receiver {
    inner: Inner,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    /// Must be created inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_options(SocketOptions::default(), &ReceiverConfig::default())
    }

    pub fn with_options(options: SocketOptions, config: &ReceiverConfig) -> Self {
        let routing_id = Bytes::from(format!(
            "rx-{}",
            hex::encode(rand::random::<u64>().to_be_bytes())
        ));
        let mut router_opts = options.clone();
        router_opts.handover = true;
        let registrar = Arc::new(Registrar::new(
            ServiceType::Gateway,
            DealerSocket::with_options(routing_id.clone(), options),
            Duration::from_millis(config.heartbeat_interval_ms),
        ));
        let cancel = CancellationToken::new();
        {
            let registrar = registrar.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { registrar.run(cancel).await });
        }
        Self {
            inner: Inner {
                router: RouterSocket::with_options(routing_id, router_opts),
                registrar,
                bound: Mutex::new(None),
                cancel,
            },
        }
    }

    pub fn routing_id(&self) -> &Bytes {
        self.inner.router.routing_id()
    }

    /// Bind the request socket. Returns the bound endpoint with any
    /// ephemeral port resolved.
    pub async fn bind(&self, endpoint: &str) -> Result<String> {
        self.ensure_open()?;
        let bound = self.inner.router.bind(endpoint).await?;
        let resolved = bound.to_string();
        self.inner
            .bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(bound);
        Ok(resolved)
    }

    /// The router carrying gateway traffic. Use it to receive requests and
    /// send replies; the receiver keeps ownership and closes it.
    pub fn router_socket(&self) -> &RouterSocket {
        &self.inner.router
    }

    pub fn connect_registry(&self, request: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner.registrar.dealer().connect(request)?;
        tracing::info!(
            registry = request,
            routing_id = %hex::encode(self.routing_id()),
            "receiver connected to registry"
        );
        Ok(())
    }

    /// Advertise `service` at `advertise`, or at the bound endpoint when
    /// `advertise` is empty. Registering a service again replaces the
    /// previous registration.
    pub async fn register(
        &self,
        service: &str,
        advertise: &str,
        weight: u32,
    ) -> Result<RegistrationHandle> {
        self.ensure_open()?;
        if service.is_empty() || service.len() > wire::MAX_SERVICE_LEN {
            return Err(Error::invalid("invalid service name"));
        }
        if self.inner.registrar.dealer().endpoint().is_none() {
            return Err(Error::EndpointsUnset);
        }
        let endpoint = advertise_endpoint(advertise, &self.inner.bound)?;
        self.inner.registrar.register(service, endpoint, weight).await
    }

    pub fn register_result(&self, service: &str) -> Option<RegisterResult> {
        self.inner.registrar.result(service)
    }

    /// Change the advertised weight in place.
    pub async fn update_weight(&self, service: &str, weight: u32) -> Result<()> {
        self.ensure_open()?;
        self.inner.registrar.update_weight(service, weight).await
    }

    pub async fn unregister(&self, service: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner.registrar.unregister(service).await
    }

    /// Certificate for `tls://` endpoints bound afterwards.
    pub fn set_tls_server(&self, cert: &Path, key: &Path) -> Result<()> {
        self.ensure_open()?;
        self.inner.router.set_tls_server(server_acceptor(cert, key)?);
        Ok(())
    }

    /// Trust settings for a `tls://` registry connection opened afterwards.
    pub fn set_tls_client(&self, client: TlsClient) -> Result<()> {
        self.ensure_open()?;
        self.inner.registrar.dealer().set_tls_client(client);
        Ok(())
    }

    pub fn set_heartbeat_interval(&self, interval_ms: u64) -> Result<()> {
        self.ensure_open()?;
        self.inner.registrar.set_heartbeat_interval(interval_ms)
    }

    pub fn set_socket_option(&self, socket: ReceiverSocket, option: SocketOption) -> Result<()> {
        self.ensure_open()?;
        match socket {
            ReceiverSocket::Router => self.inner.router.set_option(option),
            ReceiverSocket::Registry => self.inner.registrar.dealer().set_option(option),
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Idempotent. Outstanding registration handles resolve to `Closed`.
    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.router.close();
        self.inner.registrar.close();
        tracing::info!(routing_id = %hex::encode(self.routing_id()), "receiver closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.close();
    }
}

/// An explicit advertise endpoint is validated as is; an empty one becomes
/// the bound endpoint with wildcard hosts replaced by loopback.
pub(crate) fn advertise_endpoint(advertise: &str, bound: &Mutex<Option<Endpoint>>) -> Result<String> {
    if !advertise.is_empty() {
        let ep: Endpoint = advertise.parse()?;
        if advertise.len() > wire::MAX_ENDPOINT_LEN {
            return Err(Error::InvalidEndpoint(advertise.to_string()));
        }
        return Ok(ep.to_string());
    }
    bound
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(|ep| ep.advertised().to_string())
        .ok_or_else(|| Error::invalid("nothing bound to advertise"))
}
