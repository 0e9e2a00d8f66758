//! Device event contracts shared by the command service and the worker.
//!
//! Event payloads travel through the outbox as opaque JSON; this library
//! owns the payload shapes on the write side and the lenient parsing the
//! worker applies on the read side. Dispatch is a closed switch over
//! [`DeviceEventKind`]; unknown event types deliberately parse to `None`
//! and are ignored by consumers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Emitted when a device is registered for a tenant.
pub const DEVICE_CREATED: &str = "device.created";
/// Emitted when a device transitions to retired.
pub const DEVICE_RETIRED: &str = "device.retired";
/// Emitted when a device transitions back to active.
pub const DEVICE_ACTIVATED: &str = "device.activated";

/// The closed set of device event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    Created,
    Retired,
    Activated,
}

impl DeviceEventKind {
    /// Map an outbox `event_type` string onto the closed set. Unknown
    /// types return `None`; consumers treat them as a successful no-op.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            DEVICE_CREATED => Some(Self::Created),
            DEVICE_RETIRED => Some(Self::Retired),
            DEVICE_ACTIVATED => Some(Self::Activated),
            _ => None,
        }
    }

    pub fn event_type(self) -> &'static str {
        match self {
            Self::Created => DEVICE_CREATED,
            Self::Retired => DEVICE_RETIRED,
            Self::Activated => DEVICE_ACTIVATED,
        }
    }
}

/// Payload carried by every device event.
///
/// All fields are optional on the read side: the worker must tolerate
/// payloads missing `device_id` (projection no-op) or `user_id`
/// (side-effect no-op). `user_id` is an opaque identity string, not
/// necessarily a UUID: compensation traffic authenticates as `system`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceEventPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DeviceEventPayload {
    /// Payload for `device.created`: `{device_id, user_id}`.
    pub fn created(device_id: Uuid, user_id: &str) -> Self {
        Self {
            device_id: Some(device_id.to_string()),
            user_id: Some(user_id.to_string()),
            reason: None,
        }
    }

    /// Payload for `device.retired` / `device.activated`:
    /// `{device_id, user_id, reason}`.
    pub fn status_changed(device_id: Uuid, user_id: &str, reason: &str) -> Self {
        Self {
            device_id: Some(device_id.to_string()),
            user_id: Some(user_id.to_string()),
            reason: Some(reason.to_string()),
        }
    }

    /// Lenient parse of an opaque payload. Unknown fields are ignored;
    /// anything that is not a JSON object yields an empty payload.
    pub fn parse(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("payload serialization is infallible")
    }
}
