//! Backend websocket messages.

use serde::{Deserialize, Serialize};

use crate::event_stream::RouterEvent;

/// Service domain events are delivered to.
pub const SERVICE_DOMAIN: &str = "habitron";
/// Service events are delivered through.
pub const SERVICE_NAME: &str = "update_entity";

/// Message sent to the backend.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outgoing<'a> {
    /// Authentication, the only message without an id.
    Auth { access_token: &'a str },
    /// Liveness check.
    Ping { id: u64 },
    /// Configuration query.
    GetConfig { id: u64 },
    /// Service call carrying one event.
    CallService {
        id: u64,
        domain: &'static str,
        service: &'static str,
        service_data: ServiceData<'a>,
    },
}

impl<'a> Outgoing<'a> {
    /// Service call delivering `event` on behalf of hub `hub_uid`.
    pub fn event(id: u64, hub_uid: &'a str, event: &RouterEvent) -> Self {
        Outgoing::CallService {
            id,
            domain: SERVICE_DOMAIN,
            service: SERVICE_NAME,
            service_data: ServiceData {
                hub_uid,
                rtr_nmbr: event.router,
                mod_nmbr: event.event.module,
                evnt_type: event.event.kind.code(),
                evnt_arg1: event.event.arg1,
                evnt_arg2: event.event.arg2,
            },
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Payload of an event service call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceData<'a> {
    pub hub_uid: &'a str,
    pub rtr_nmbr: u8,
    pub mod_nmbr: u8,
    pub evnt_type: u8,
    pub evnt_arg1: i32,
    pub evnt_arg2: i32,
}

/// Message received from the backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Incoming {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Pong {
        id: u64,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: serde_json::Value,
        #[serde(default)]
        error: Option<ErrorBody>,
    },
    /// Anything else, such as subscribed events.
    #[serde(other)]
    Other,
}

/// Error detail of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl Incoming {
    /// Parse one text frame.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Id of the request this message answers.
    pub fn reply_id(&self) -> Option<u64> {
        match self {
            Incoming::Pong { id } | Incoming::Result { id, .. } => Some(*id),
            _ => None,
        }
    }
}
