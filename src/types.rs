use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Display;
use std::ops::Deref;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl Deref for DeviceId {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Correlation token embedded in request topics and echoed back in response
/// topics. Generated fresh for every request, never reused within a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for RequestId {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Credential material identifying this device, read from disk by the caller
/// and passed by reference into the transport and provisioning layers.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub private_key: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub ca_cert: Vec<u8>,
}

/// Where to reach the provisioning service for this tenant. Resolved once,
/// immutable input to the provisioning state machine.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningEndpoint {
    pub service_operations_host_name: String,
    pub id_scope: String,
}

/// Result of a successful registration. `assigned_hub` is the hostname of the
/// hub this device must connect to; any other assignment metadata returned by
/// the provider is carried along opaquely so it survives a save/load cycle.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecord {
    pub assigned_hub: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Whether this run needs to go through registration at all.
#[derive(Debug, Clone)]
pub enum Registration {
    /// No usable stored record, run the full register/poll handshake.
    Fresh,
    /// A stored record with a valid assigned hub, skip registration.
    PreRegistered(RegistrationRecord),
}

impl Registration {
    /// A stored record only counts if it actually names an assigned hub;
    /// anything else falls back to a fresh registration.
    pub fn from_stored(stored: Option<RegistrationRecord>) -> Self {
        match stored {
            Some(record) if !record.assigned_hub.is_empty() => Self::PreRegistered(record),
            _ => Self::Fresh,
        }
    }
}
