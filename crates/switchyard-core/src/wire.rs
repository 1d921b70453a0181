//! Switchyard wire format — the registration and directory protocol.
//!
//! Every message is a multipart message. The first frame is a 2-byte message
//! id; each following field is one frame. Integers are little-endian, strings
//! are raw UTF-8. Changing a layout here is a breaking protocol change.
//!
//! Requests travel Receiver/SpotNode → Registry over a dealer/router pair; the
//! router supplies the sender's routing identity, so it never appears in a
//! request body. Directory snapshots travel Registry → subscribers as one
//! `ServiceList` message.

use bytes::Bytes;

use crate::frame::{Frame, Message};
use crate::types::ServiceType;

// ── Message ids ───────────────────────────────────────────────────────────────

pub const MSG_REGISTER: u16 = 0x0001;
pub const MSG_REGISTER_ACK: u16 = 0x0002;
pub const MSG_UNREGISTER: u16 = 0x0003;
pub const MSG_HEARTBEAT: u16 = 0x0004;
pub const MSG_SERVICE_LIST: u16 = 0x0005;
pub const MSG_UPDATE_WEIGHT: u16 = 0x0007;

// ── Limits ────────────────────────────────────────────────────────────────────

/// Longest accepted service name, in bytes.
pub const MAX_SERVICE_LEN: usize = 256;

/// Longest accepted endpoint string, in bytes.
pub const MAX_ENDPOINT_LEN: usize = 256;

/// Longest routing identity, in bytes. Identities are never empty.
pub const MAX_ROUTING_ID_LEN: usize = 255;

/// Weight used when a provider does not choose one.
pub const DEFAULT_WEIGHT: u32 = 1;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty message")]
    Empty,

    #[error("unknown message id: 0x{0:04x}")]
    UnknownMessage(u16),

    #[error("message truncated: missing {0}")]
    Truncated(&'static str),

    #[error("field {field} has length {len}, expected {expected}")]
    BadIntegerWidth {
        field: &'static str,
        len: usize,
        expected: usize,
    },

    #[error("field {field} is {len} bytes, limit {limit}")]
    TooLong {
        field: &'static str,
        len: usize,
        limit: usize,
    },

    #[error("field {0} is empty")]
    EmptyField(&'static str),

    #[error("field {0} is not valid UTF-8")]
    NotUtf8(&'static str),

    #[error("{0} trailing frames")]
    TrailingFrames(usize),

    #[error("unknown service type: {0}")]
    UnknownServiceType(u16),

    #[error("unknown topic mode: 0x{0:02x}")]
    UnknownTopicMode(u8),

    #[error("unknown ack status: 0x{0:02x}")]
    UnknownStatus(u8),
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// A request sent by a provider to the registry's request socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register {
        service_type: ServiceType,
        service: String,
        endpoint: String,
        weight: u32,
    },
    Unregister {
        service_type: ServiceType,
        service: String,
        endpoint: String,
    },
    Heartbeat {
        service_type: ServiceType,
        service: String,
        endpoint: String,
    },
    UpdateWeight {
        service_type: ServiceType,
        service: String,
        endpoint: String,
        weight: u32,
    },
}

impl Request {
    pub fn service(&self) -> &str {
        match self {
            Request::Register { service, .. }
            | Request::Unregister { service, .. }
            | Request::Heartbeat { service, .. }
            | Request::UpdateWeight { service, .. } => service,
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            Request::Register { endpoint, .. }
            | Request::Unregister { endpoint, .. }
            | Request::Heartbeat { endpoint, .. }
            | Request::UpdateWeight { endpoint, .. } => endpoint,
        }
    }

    pub fn service_type(&self) -> ServiceType {
        match self {
            Request::Register { service_type, .. }
            | Request::Unregister { service_type, .. }
            | Request::Heartbeat { service_type, .. }
            | Request::UpdateWeight { service_type, .. } => *service_type,
        }
    }

    pub fn encode(&self) -> Message {
        match self {
            Request::Register {
                service_type,
                service,
                endpoint,
                weight,
            } => vec![
                u16_frame(MSG_REGISTER),
                u16_frame((*service_type).into()),
                Frame::from(service),
                Frame::from(endpoint),
                u32_frame(*weight),
            ],
            Request::Unregister {
                service_type,
                service,
                endpoint,
            } => vec![
                u16_frame(MSG_UNREGISTER),
                u16_frame((*service_type).into()),
                Frame::from(service),
                Frame::from(endpoint),
            ],
            Request::Heartbeat {
                service_type,
                service,
                endpoint,
            } => vec![
                u16_frame(MSG_HEARTBEAT),
                u16_frame((*service_type).into()),
                Frame::from(service),
                Frame::from(endpoint),
            ],
            Request::UpdateWeight {
                service_type,
                service,
                endpoint,
                weight,
            } => vec![
                u16_frame(MSG_UPDATE_WEIGHT),
                u16_frame((*service_type).into()),
                Frame::from(service),
                Frame::from(endpoint),
                u32_frame(*weight),
            ],
        }
    }

    /// Decode a request body (routing identity already stripped).
    ///
    /// Empty service names are accepted here; the registry answers them with
    /// `AckStatus::InvalidService` rather than dropping them.
    pub fn decode(frames: &[Frame]) -> Result<Self, WireError> {
        let mut r = FrameReader::new(frames);
        let id = r.u16("message id")?;
        let req = match id {
            MSG_REGISTER | MSG_UPDATE_WEIGHT => {
                let service_type = ServiceType::try_from(r.u16("service type")?)?;
                let service = r.string("service", MAX_SERVICE_LEN)?;
                let endpoint = r.string("endpoint", MAX_ENDPOINT_LEN)?;
                let weight = r.u32("weight")?;
                if id == MSG_REGISTER {
                    Request::Register {
                        service_type,
                        service,
                        endpoint,
                        weight,
                    }
                } else {
                    Request::UpdateWeight {
                        service_type,
                        service,
                        endpoint,
                        weight,
                    }
                }
            }
            MSG_UNREGISTER | MSG_HEARTBEAT => {
                let service_type = ServiceType::try_from(r.u16("service type")?)?;
                let service = r.string("service", MAX_SERVICE_LEN)?;
                let endpoint = r.string("endpoint", MAX_ENDPOINT_LEN)?;
                if id == MSG_UNREGISTER {
                    Request::Unregister {
                        service_type,
                        service,
                        endpoint,
                    }
                } else {
                    Request::Heartbeat {
                        service_type,
                        service,
                        endpoint,
                    }
                }
            }
            other => return Err(WireError::UnknownMessage(other)),
        };
        r.finish()?;
        Ok(req)
    }
}

// ── Acknowledgment ────────────────────────────────────────────────────────────

/// Outcome code carried by a `RegisterAck`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    Ok = 0x00,
    /// The record named by a heartbeat, weight update or unregister is unknown.
    NotFound = 0x01,
    InvalidEndpoint = 0x02,
    InvalidService = 0x03,
    Malformed = 0xFF,
}

impl TryFrom<u8> for AckStatus {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(AckStatus::Ok),
            0x01 => Ok(AckStatus::NotFound),
            0x02 => Ok(AckStatus::InvalidEndpoint),
            0x03 => Ok(AckStatus::InvalidService),
            0xFF => Ok(AckStatus::Malformed),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

impl From<AckStatus> for u8 {
    fn from(s: AckStatus) -> u8 {
        s as u8
    }
}

/// Registry reply to any request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterAck {
    pub status: AckStatus,
    pub service: String,
    pub endpoint: String,
    pub error: String,
}

impl RegisterAck {
    pub fn ok(service: &str, endpoint: &str) -> Self {
        Self {
            status: AckStatus::Ok,
            service: service.to_string(),
            endpoint: endpoint.to_string(),
            error: String::new(),
        }
    }

    pub fn error(status: AckStatus, service: &str, endpoint: &str, error: impl Into<String>) -> Self {
        Self {
            status,
            service: service.to_string(),
            endpoint: endpoint.to_string(),
            error: error.into(),
        }
    }

    pub fn encode(&self) -> Message {
        vec![
            u16_frame(MSG_REGISTER_ACK),
            Frame::new(Bytes::copy_from_slice(&[self.status.into()])),
            Frame::from(&self.service),
            Frame::from(&self.endpoint),
            Frame::from(&self.error),
        ]
    }

    pub fn decode(frames: &[Frame]) -> Result<Self, WireError> {
        let mut r = FrameReader::new(frames);
        match r.u16("message id")? {
            MSG_REGISTER_ACK => {}
            other => return Err(WireError::UnknownMessage(other)),
        }
        let status = AckStatus::try_from(r.u8("status")?)?;
        let service = r.string("service", MAX_SERVICE_LEN)?;
        let endpoint = r.string("endpoint", MAX_ENDPOINT_LEN)?;
        let error = r.string("error", usize::MAX)?;
        r.finish()?;
        Ok(Self {
            status,
            service,
            endpoint,
            error,
        })
    }
}

// ── Directory snapshot ────────────────────────────────────────────────────────

/// One live provider, as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service_type: ServiceType,
    pub service: String,
    /// Endpoint clients connect to.
    pub endpoint: String,
    /// Identity of the provider's request socket. 1..=255 bytes.
    pub routing_id: Bytes,
    pub weight: u32,
    /// Wall-clock registration time, milliseconds since the Unix epoch.
    pub registered_at: u64,
    /// Id of the registry the provider registered with.
    pub origin: u32,
}

/// All records for one (type, service) pair, in registration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub service_type: ServiceType,
    pub service: String,
    pub records: Vec<ServiceRecord>,
}

/// Full directory snapshot broadcast by a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceList {
    pub registry_id: u32,
    /// Increments on every directory change. Receivers drop snapshots that
    /// are not newer than the last one seen from the same registry.
    pub seq: u64,
    pub services: Vec<ServiceEntry>,
}

impl ServiceList {
    pub fn encode(&self) -> Message {
        let mut out = vec![
            u16_frame(MSG_SERVICE_LIST),
            u32_frame(self.registry_id),
            u64_frame(self.seq),
            u32_frame(self.services.len() as u32),
        ];
        for entry in &self.services {
            out.push(u16_frame(entry.service_type.into()));
            out.push(Frame::from(&entry.service));
            out.push(u32_frame(entry.records.len() as u32));
            for rec in &entry.records {
                out.push(Frame::from(&rec.endpoint));
                out.push(Frame::new(rec.routing_id.clone()));
                out.push(u32_frame(rec.weight));
                out.push(u64_frame(rec.registered_at));
                out.push(u32_frame(rec.origin));
            }
        }
        out
    }

    pub fn decode(frames: &[Frame]) -> Result<Self, WireError> {
        let mut r = FrameReader::new(frames);
        match r.u16("message id")? {
            MSG_SERVICE_LIST => {}
            other => return Err(WireError::UnknownMessage(other)),
        }
        let registry_id = r.u32("registry id")?;
        let seq = r.u64("seq")?;
        let service_count = r.u32("service count")?;

        let mut services = Vec::new();
        for _ in 0..service_count {
            let service_type = ServiceType::try_from(r.u16("service type")?)?;
            let service = r.string("service", MAX_SERVICE_LEN)?;
            if service.is_empty() {
                return Err(WireError::EmptyField("service"));
            }
            let record_count = r.u32("record count")?;
            let mut records = Vec::new();
            for _ in 0..record_count {
                let endpoint = r.string("endpoint", MAX_ENDPOINT_LEN)?;
                let routing_id = r.bytes("routing id", MAX_ROUTING_ID_LEN)?;
                if routing_id.is_empty() {
                    return Err(WireError::EmptyField("routing id"));
                }
                records.push(ServiceRecord {
                    service_type,
                    service: service.clone(),
                    endpoint,
                    routing_id,
                    weight: r.u32("weight")?,
                    registered_at: r.u64("registered at")?,
                    origin: r.u32("origin")?,
                });
            }
            services.push(ServiceEntry {
                service_type,
                service,
                records,
            });
        }
        r.finish()?;
        Ok(Self {
            registry_id,
            seq,
            services,
        })
    }

    /// Records for one service, or an empty slice.
    pub fn records(&self, service_type: ServiceType, service: &str) -> &[ServiceRecord] {
        self.services
            .iter()
            .find(|e| e.service_type == service_type && e.service == service)
            .map(|e| e.records.as_slice())
            .unwrap_or(&[])
    }
}

/// Read the message id without decoding the body.
pub fn message_id(frames: &[Frame]) -> Result<u16, WireError> {
    FrameReader::new(frames).u16("message id")
}

// ── Field helpers ─────────────────────────────────────────────────────────────

fn u16_frame(v: u16) -> Frame {
    Frame::new(Bytes::copy_from_slice(&v.to_le_bytes()))
}

fn u32_frame(v: u32) -> Frame {
    Frame::new(Bytes::copy_from_slice(&v.to_le_bytes()))
}

fn u64_frame(v: u64) -> Frame {
    Frame::new(Bytes::copy_from_slice(&v.to_le_bytes()))
}

/// Sequential reader over a frame slice.
struct FrameReader<'a> {
    frames: &'a [Frame],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(frames: &'a [Frame]) -> Self {
        Self { frames, pos: 0 }
    }

    fn next(&mut self, field: &'static str) -> Result<&'a Frame, WireError> {
        if self.frames.is_empty() {
            return Err(WireError::Empty);
        }
        let f = self.frames.get(self.pos).ok_or(WireError::Truncated(field))?;
        self.pos += 1;
        Ok(f)
    }

    fn fixed<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], WireError> {
        let f = self.next(field)?;
        <[u8; N]>::try_from(&f[..]).map_err(|_| WireError::BadIntegerWidth {
            field,
            len: f.len(),
            expected: N,
        })
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, WireError> {
        Ok(self.fixed::<1>(field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, WireError> {
        self.fixed(field).map(u16::from_le_bytes)
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, WireError> {
        self.fixed(field).map(u32::from_le_bytes)
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, WireError> {
        self.fixed(field).map(u64::from_le_bytes)
    }

    fn bytes(&mut self, field: &'static str, limit: usize) -> Result<Bytes, WireError> {
        let f = self.next(field)?;
        if f.len() > limit {
            return Err(WireError::TooLong {
                field,
                len: f.len(),
                limit,
            });
        }
        Ok(f.as_bytes().clone())
    }

    fn string(&mut self, field: &'static str, limit: usize) -> Result<String, WireError> {
        let b = self.bytes(field, limit)?;
        String::from_utf8(b.to_vec()).map_err(|_| WireError::NotUtf8(field))
    }

    fn finish(self) -> Result<(), WireError> {
        match self.frames.len() - self.pos {
            0 => Ok(()),
            n => Err(WireError::TrailingFrames(n)),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
