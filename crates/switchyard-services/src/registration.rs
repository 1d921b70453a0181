//! Registry client shared by receivers and spot nodes.
//!
//! A `Registrar` owns the dealer connected to a registry request socket and
//! the registrations made through it. Its task heartbeats accepted
//! registrations, re-sends pending ones on every tick, and re-registers
//! whatever the registry reports as unknown.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use switchyard_core::wire::{self, AckStatus, RegisterAck, Request};
use switchyard_core::{Message, ServiceType, Wait};
use switchyard_transport::{DealerSocket, TransportError};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterStatus {
    /// Sent, no acknowledgment yet.
    Pending,
    Accepted,
    /// Refused by the registry with this ack status code.
    Rejected { code: u8 },
}

/// Latest known outcome of one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResult {
    pub status: RegisterStatus,
    /// Endpoint as advertised to the registry.
    pub endpoint: String,
    /// Registry error text. Empty unless rejected.
    pub error: String,
}

/// Resolves once the registry answers a registration.
#[derive(Debug, Clone)]
pub struct RegistrationHandle {
    service: String,
    state: watch::Receiver<RegisterResult>,
}

impl RegistrationHandle {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn current(&self) -> RegisterResult {
        self.state.borrow().clone()
    }

    /// Wait for the first non-pending outcome. A rejection is returned as
    /// `Error::Rejected`.
    pub async fn wait(&self, timeout: Duration) -> Result<RegisterResult> {
        let mut state = self.state.clone();
        let outcome = tokio::time::timeout(
            timeout,
            state.wait_for(|r| r.status != RegisterStatus::Pending),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|_| Error::Closed)?
        .clone();
        match outcome.status {
            RegisterStatus::Rejected { code } => Err(Error::Rejected {
                code,
                message: outcome.error,
            }),
            _ => Ok(outcome),
        }
    }
}

struct Registration {
    endpoint: String,
    weight: u32,
    state: watch::Sender<RegisterResult>,
}

impl Registration {
    fn status(&self) -> RegisterStatus {
        self.state.borrow().status
    }
}

pub(crate) struct Registrar {
    service_type: ServiceType,
    dealer: DealerSocket,
    entries: Mutex<HashMap<String, Registration>>,
    heartbeat: watch::Sender<Duration>,
}

impl Registrar {
    pub(crate) fn new(service_type: ServiceType, dealer: DealerSocket, heartbeat: Duration) -> Self {
        let (heartbeat, _) = watch::channel(heartbeat.max(Duration::from_millis(1)));
        Self {
            service_type,
            dealer,
            entries: Mutex::new(HashMap::new()),
            heartbeat,
        }
    }

    pub(crate) fn dealer(&self) -> &DealerSocket {
        &self.dealer
    }

    /// Register `service` at `endpoint`, replacing any earlier registration
    /// of the same name.
    pub(crate) async fn register(
        &self,
        service: &str,
        endpoint: String,
        weight: u32,
    ) -> Result<RegistrationHandle> {
        if self.dealer.endpoint().is_none() {
            return Err(Error::EndpointsUnset);
        }
        let (state, rx) = watch::channel(RegisterResult {
            status: RegisterStatus::Pending,
            endpoint: endpoint.clone(),
            error: String::new(),
        });
        let req = self.register_request(service, &endpoint, weight);
        self.entries().insert(
            service.to_string(),
            Registration {
                endpoint,
                weight,
                state,
            },
        );
        tracing::debug!(
            service,
            endpoint = req.endpoint(),
            weight,
            service_type = ?self.service_type,
            "registering"
        );
        self.send(req).await;
        Ok(RegistrationHandle {
            service: service.to_string(),
            state: rx,
        })
    }

    pub(crate) fn result(&self, service: &str) -> Option<RegisterResult> {
        self.entries().get(service).map(|r| r.state.borrow().clone())
    }

    pub(crate) async fn update_weight(&self, service: &str, weight: u32) -> Result<()> {
        let req = {
            let mut entries = self.entries();
            let reg = entries
                .get_mut(service)
                .ok_or_else(|| Error::NotRegistered(service.to_string()))?;
            reg.weight = weight;
            match reg.status() {
                RegisterStatus::Accepted => Request::UpdateWeight {
                    service_type: self.service_type,
                    service: service.to_string(),
                    endpoint: reg.endpoint.clone(),
                    weight,
                },
                _ => self.register_request(service, &reg.endpoint, weight),
            }
        };
        self.send(req).await;
        Ok(())
    }

    /// Best effort: the record also expires on its own.
    pub(crate) async fn unregister(&self, service: &str) -> Result<()> {
        let reg = self
            .entries()
            .remove(service)
            .ok_or_else(|| Error::NotRegistered(service.to_string()))?;
        self.send(Request::Unregister {
            service_type: self.service_type,
            service: service.to_string(),
            endpoint: reg.endpoint,
        })
        .await;
        tracing::debug!(service, "unregistered");
        Ok(())
    }

    pub(crate) fn set_heartbeat_interval(&self, interval_ms: u64) -> Result<()> {
        if interval_ms == 0 {
            return Err(Error::invalid("heartbeat interval must be non-zero"));
        }
        self.heartbeat
            .send_replace(Duration::from_millis(interval_ms));
        Ok(())
    }

    /// Advertised endpoints of every registration.
    pub(crate) fn endpoints(&self) -> Vec<String> {
        self.entries().values().map(|r| r.endpoint.clone()).collect()
    }

    /// Drop every registration; outstanding handles resolve to `Closed`.
    pub(crate) fn close(&self) {
        self.dealer.close();
        self.entries().clear();
    }

    pub(crate) async fn run(&self, cancel: CancellationToken) {
        let mut heartbeat = self.heartbeat.subscribe();
        let mut interval = *heartbeat.borrow_and_update();
        let mut next = Instant::now() + interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.dealer.recv(Wait::Block) => match r {
                    Ok(msg) => self.on_ack(&msg).await,
                    Err(TransportError::Closed) => break,
                    Err(e) => tracing::warn!(error = %e, "registry connection error"),
                },
                _ = tokio::time::sleep_until(next) => {
                    self.beat().await;
                    next = Instant::now() + interval;
                }
                r = heartbeat.changed() => {
                    if r.is_err() {
                        break;
                    }
                    interval = *heartbeat.borrow_and_update();
                    next = Instant::now() + interval;
                }
            }
        }
        tracing::trace!(service_type = ?self.service_type, "registrar stopped");
    }

    /// Heartbeat accepted registrations, re-send pending ones.
    async fn beat(&self) {
        let requests: Vec<Request> = self
            .entries()
            .iter()
            .filter_map(|(service, reg)| match reg.status() {
                RegisterStatus::Accepted => Some(Request::Heartbeat {
                    service_type: self.service_type,
                    service: service.clone(),
                    endpoint: reg.endpoint.clone(),
                }),
                RegisterStatus::Pending => {
                    Some(self.register_request(service, &reg.endpoint, reg.weight))
                }
                RegisterStatus::Rejected { .. } => None,
            })
            .collect();
        for req in requests {
            self.send(req).await;
        }
    }

    async fn on_ack(&self, msg: &Message) {
        let ack = match RegisterAck::decode(msg) {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!(error = %e, "malformed registry reply");
                return;
            }
        };
        let retry = {
            let entries = self.entries();
            let Some(reg) = entries.get(&ack.service) else {
                tracing::trace!(service = %ack.service, status = ?ack.status, "ack for unknown service");
                return;
            };
            match ack.status {
                AckStatus::Ok => {
                    reg.state.send_if_modified(|r| {
                        let changed = r.status != RegisterStatus::Accepted;
                        r.status = RegisterStatus::Accepted;
                        r.error.clear();
                        changed
                    });
                    tracing::debug!(service = %ack.service, endpoint = %ack.endpoint, "registration accepted");
                    None
                }
                AckStatus::NotFound => {
                    // The registry forgot us; register again.
                    reg.state.send_modify(|r| r.status = RegisterStatus::Pending);
                    tracing::info!(service = %ack.service, "registration lost, re-registering");
                    Some(self.register_request(&ack.service, &reg.endpoint, reg.weight))
                }
                status => {
                    reg.state.send_modify(|r| {
                        r.status = RegisterStatus::Rejected { code: status.into() };
                        r.error = ack.error.clone();
                    });
                    tracing::warn!(
                        service = %ack.service,
                        status = ?status,
                        error = %ack.error,
                        "registration rejected"
                    );
                    None
                }
            }
        };
        if let Some(req) = retry {
            self.send(req).await;
        }
    }

    fn register_request(&self, service: &str, endpoint: &str, weight: u32) -> Request {
        Request::Register {
            service_type: self.service_type,
            service: service.to_string(),
            endpoint: endpoint.to_string(),
            weight,
        }
    }

    /// Never waits: a request that does not fit is re-sent on the next tick.
    async fn send(&self, req: Request) {
        let msg = req.encode();
        let kind = wire::message_id(&msg).unwrap_or_default();
        if let Err(e) = self.dealer.send(msg, Wait::DontWait).await {
            tracing::debug!(
                service = req.service(),
                message = kind,
                error = %e,
                "registry request not queued"
            );
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
