//! Registry directory state.
//!
//! Pure data: no sockets, no tasks. The registry task owns one `Directory`
//! and is the only thing that mutates it, so every snapshot is taken from a
//! consistent state.
//!
//! Local records are keyed by (service type, service name, routing id) and
//! kept in registration order. Records learned from peer registries are
//! kept per peer and replaced wholesale by each newer peer snapshot.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use switchyard_core::wire::{
    AckStatus, Request, ServiceEntry, ServiceList, ServiceRecord, MAX_ENDPOINT_LEN,
    MAX_ROUTING_ID_LEN, MAX_SERVICE_LEN,
};
use switchyard_core::ServiceType;
use switchyard_transport::Endpoint;

type Key = (ServiceType, String);

#[derive(Debug, Clone)]
struct Entry {
    record: ServiceRecord,
    last_heartbeat: Instant,
}

#[derive(Debug, Clone)]
struct PeerState {
    seq: u64,
    last_seen: Instant,
    records: Vec<ServiceRecord>,
}

/// Why a request was refused. Sent back to the requester as an ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: AckStatus,
    pub reason: String,
}

impl Rejection {
    fn new(status: AckStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

#[derive(Debug)]
pub struct Directory {
    id: u32,
    seq: u64,
    local: BTreeMap<Key, Vec<Entry>>,
    peers: BTreeMap<u32, PeerState>,
}

impl Directory {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            seq: 0,
            local: BTreeMap::new(),
            peers: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    /// Bumped on every change to the broadcast view.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn local_len(&self) -> usize {
        self.local.values().map(Vec::len).sum()
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// Apply one provider request sent from `routing_id`.
    ///
    /// Returns whether the broadcast view changed; heartbeats never change
    /// it. On refusal the directory is untouched.
    pub fn apply(
        &mut self,
        routing_id: &Bytes,
        req: &Request,
        now: Instant,
        wall_ms: u64,
    ) -> Result<bool, Rejection> {
        validate(routing_id, req)?;
        let changed = match req {
            Request::Register {
                service_type,
                service,
                endpoint,
                weight,
            } => self.register(*service_type, service, endpoint, routing_id, *weight, now, wall_ms),
            Request::Heartbeat {
                service_type,
                service,
                ..
            } => {
                let entry = self.find_mut(*service_type, service, routing_id)?;
                entry.last_heartbeat = now;
                false
            }
            Request::UpdateWeight {
                service_type,
                service,
                weight,
                ..
            } => {
                let entry = self.find_mut(*service_type, service, routing_id)?;
                entry.last_heartbeat = now;
                let changed = entry.record.weight != *weight;
                entry.record.weight = *weight;
                changed
            }
            Request::Unregister {
                service_type,
                service,
                ..
            } => {
                let key = (*service_type, service.clone());
                let entries = self
                    .local
                    .get_mut(&key)
                    .ok_or_else(|| not_found(service))?;
                let before = entries.len();
                entries.retain(|e| e.record.routing_id != *routing_id);
                if entries.len() == before {
                    return Err(not_found(service));
                }
                if entries.is_empty() {
                    self.local.remove(&key);
                }
                true
            }
        };
        if changed {
            self.seq += 1;
        }
        Ok(changed)
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &mut self,
        service_type: ServiceType,
        service: &str,
        endpoint: &str,
        routing_id: &Bytes,
        weight: u32,
        now: Instant,
        wall_ms: u64,
    ) -> bool {
        let id = self.id;
        let entries = self.local.entry((service_type, service.to_string())).or_default();

        // Re-registration from the same socket updates in place.
        if let Some(e) = entries.iter_mut().find(|e| e.record.routing_id == *routing_id) {
            e.last_heartbeat = now;
            let changed = e.record.endpoint != endpoint || e.record.weight != weight;
            e.record.endpoint = endpoint.to_string();
            e.record.weight = weight;
            return changed;
        }

        let record = ServiceRecord {
            service_type,
            service: service.to_string(),
            endpoint: endpoint.to_string(),
            routing_id: routing_id.clone(),
            weight,
            registered_at: wall_ms,
            origin: id,
        };

        // A new identity at a known endpoint is a restarted provider.
        if let Some(e) = entries.iter_mut().find(|e| e.record.endpoint == endpoint) {
            tracing::debug!(
                service,
                endpoint,
                old = %hex::encode(&e.record.routing_id),
                new = %hex::encode(routing_id),
                "endpoint taken over by new identity"
            );
            e.record = record;
            e.last_heartbeat = now;
            return true;
        }

        entries.push(Entry {
            record,
            last_heartbeat: now,
        });
        true
    }

    fn find_mut(
        &mut self,
        service_type: ServiceType,
        service: &str,
        routing_id: &Bytes,
    ) -> Result<&mut Entry, Rejection> {
        self.local
            .get_mut(&(service_type, service.to_string()))
            .and_then(|entries| entries.iter_mut().find(|e| e.record.routing_id == *routing_id))
            .ok_or_else(|| not_found(service))
    }

    // ── Expiry ────────────────────────────────────────────────────────────────

    /// Drop local records whose last heartbeat is older than `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<ServiceRecord> {
        let mut expired = Vec::new();
        self.local.retain(|_, entries| {
            entries.retain(|e| {
                let alive = now.saturating_duration_since(e.last_heartbeat) <= timeout;
                if !alive {
                    expired.push(e.record.clone());
                }
                alive
            });
            !entries.is_empty()
        });
        if !expired.is_empty() {
            self.seq += 1;
        }
        expired
    }

    /// Forget peers not heard from within `silence`.
    pub fn expire_peers(&mut self, now: Instant, silence: Duration) -> Vec<u32> {
        let mut dropped = Vec::new();
        let mut changed = false;
        self.peers.retain(|id, peer| {
            let alive = now.saturating_duration_since(peer.last_seen) <= silence;
            if !alive {
                dropped.push(*id);
                changed |= !peer.records.is_empty();
            }
            alive
        });
        if changed {
            self.seq += 1;
        }
        dropped
    }

    // ── Federation ────────────────────────────────────────────────────────────

    /// Merge a snapshot broadcast by a peer registry.
    ///
    /// Our own broadcasts and snapshots not newer than the last one from the
    /// same peer are ignored. Records that originated here are dropped, and
    /// the rest replace everything previously learned from that peer.
    pub fn merge_peer(&mut self, list: &ServiceList, now: Instant) -> bool {
        if list.registry_id == self.id {
            return false;
        }
        let peer = self.peers.entry(list.registry_id).or_insert(PeerState {
            seq: 0,
            last_seen: now,
            records: Vec::new(),
        });
        peer.last_seen = now;
        if peer.seq != 0 && list.seq <= peer.seq {
            return false;
        }
        peer.seq = list.seq;

        let id = self.id;
        let records: Vec<ServiceRecord> = list
            .services
            .iter()
            .flat_map(|s| s.records.iter())
            .filter(|r| r.origin != id)
            .cloned()
            .collect();
        if records == peer.records {
            return false;
        }
        peer.records = records;
        self.seq += 1;
        true
    }

    pub fn peer_ids(&self) -> Vec<u32> {
        self.peers.keys().copied().collect()
    }

    // ── Snapshot ──────────────────────────────────────────────────────────────

    /// The merged view: local records first, then peer records that do not
    /// collide with a record already listed by routing id or endpoint.
    pub fn snapshot(&self) -> ServiceList {
        let mut merged: BTreeMap<Key, Vec<ServiceRecord>> = self
            .local
            .iter()
            .map(|(k, entries)| (k.clone(), entries.iter().map(|e| e.record.clone()).collect()))
            .collect();

        for peer in self.peers.values() {
            for rec in &peer.records {
                let list = merged
                    .entry((rec.service_type, rec.service.clone()))
                    .or_default();
                let clash = list
                    .iter()
                    .any(|r| r.routing_id == rec.routing_id || r.endpoint == rec.endpoint);
                if !clash {
                    list.push(rec.clone());
                }
            }
        }

        ServiceList {
            registry_id: self.id,
            seq: self.seq,
            services: merged
                .into_iter()
                .map(|((service_type, service), records)| ServiceEntry {
                    service_type,
                    service,
                    records,
                })
                .collect(),
        }
    }
}

fn not_found(service: &str) -> Rejection {
    Rejection::new(AckStatus::NotFound, format!("{service} is not registered"))
}

fn validate(routing_id: &Bytes, req: &Request) -> Result<(), Rejection> {
    let service = req.service();
    if service.is_empty() || service.len() > MAX_SERVICE_LEN {
        return Err(Rejection::new(AckStatus::InvalidService, "invalid service name"));
    }
    if routing_id.is_empty() || routing_id.len() > MAX_ROUTING_ID_LEN {
        return Err(Rejection::new(AckStatus::Malformed, "invalid routing id"));
    }
    if let Request::Register { endpoint, .. } = req {
        if endpoint.is_empty()
            || endpoint.len() > MAX_ENDPOINT_LEN
            || endpoint.parse::<Endpoint>().is_err()
        {
            return Err(Rejection::new(AckStatus::InvalidEndpoint, "invalid endpoint"));
        }
    }
    Ok(())
}
