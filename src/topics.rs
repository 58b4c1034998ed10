//! Construction and classification of the fixed topic vocabulary spoken by
//! the provisioning service and the hub.
//!
//! Request topics embed a correlation id (`$rid`) in a query-style suffix and
//! responses arrive on per-status topics under a wildcard filter, so the
//! inverse direction is a classifier: given an inbound topic string, decide
//! which protocol family it belongs to and pull out the status code and query
//! parameters. Unknown topics classify as [`Inbound::Other`], never an error.

use crate::types::{DeviceId, RequestId};

/// Subscription filter covering all registration responses.
pub const REGISTRATION_RESPONSES: &str = "$dps/registrations/res/#";

/// Subscription filter covering all twin responses, including the
/// acknowledgements for reported-property patches.
pub const TWIN_RESPONSES: &str = "$iothub/twin/res/#";

/// Subscription filter for desired-property update notifications.
pub const DESIRED_UPDATES: &str = "$iothub/twin/PATCH/properties/desired/#";

const REGISTRATION_RESULT_PREFIX: &str = "$dps/registrations/res/";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const DESIRED_UPDATE_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

/// Topic for the initial register request.
pub fn register(rid: &RequestId) -> String {
    format!("$dps/registrations/PUT/iotdps-register/?$rid={rid}")
}

/// Topic for polling the status of an in-flight registration.
pub fn registration_status(rid: &RequestId, operation_id: &str) -> String {
    format!("$dps/registrations/GET/iotdps-get-operationstatus/?$rid={rid}&operationId={operation_id}")
}

/// Concrete topic a registration response arrives on.
pub fn registration_result(status: u16, rid: &RequestId, retry_after: Option<u64>) -> String {
    match retry_after {
        Some(seconds) => {
            format!("{REGISTRATION_RESULT_PREFIX}{status}/?$rid={rid}&retry-after={seconds}")
        }
        None => format!("{REGISTRATION_RESULT_PREFIX}{status}/?$rid={rid}"),
    }
}

/// Topic requesting the full twin document.
pub fn get_twin(rid: &RequestId) -> String {
    format!("$iothub/twin/GET/?$rid={rid}")
}

/// Topic for submitting a reported-properties patch.
pub fn update_reported(rid: &RequestId) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={rid}")
}

/// Concrete topic a twin response arrives on.
pub fn twin_response(status: u16, rid: &RequestId) -> String {
    format!("{TWIN_RESPONSE_PREFIX}{status}/?$rid={rid}")
}

/// Concrete topic a desired-property update notification arrives on.
pub fn desired_update(version: Option<u64>) -> String {
    match version {
        Some(version) => format!("{DESIRED_UPDATE_PREFIX}?$version={version}"),
        None => DESIRED_UPDATE_PREFIX.to_string(),
    }
}

/// Topic for device-to-cloud telemetry messages.
pub fn telemetry(device_id: &DeviceId) -> String {
    format!("devices/{device_id}/messages/events/")
}

/// Topic for batched device-to-cloud telemetry.
pub fn batch(device_id: &DeviceId) -> String {
    format!("devices/{device_id}/messages/events/batch=1")
}

/// Classification of an inbound topic string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Response to a register or registration-status request.
    RegistrationResult {
        status: u16,
        rid: Option<RequestId>,
        retry_after: Option<u64>,
    },
    /// Response to a twin GET request.
    TwinResponse { status: u16, rid: Option<RequestId> },
    /// Acknowledgement of a reported-properties patch; payload is ignored.
    ReportAccepted { rid: Option<RequestId> },
    /// Unsolicited desired-property update notification.
    DesiredUpdate { version: Option<u64> },
    /// Anything outside the known vocabulary.
    Other,
}

/// Classifies an inbound topic against the known vocabulary.
pub fn classify(topic: &str) -> Inbound {
    if let Some(rest) = topic.strip_prefix(REGISTRATION_RESULT_PREFIX) {
        let (status, query) = split_status(rest);
        return match status {
            Some(status) => Inbound::RegistrationResult {
                status,
                rid: query_param(query, "$rid").map(RequestId::from),
                retry_after: query_param(query, "retry-after").and_then(|v| v.parse().ok()),
            },
            None => Inbound::Other,
        };
    }

    if let Some(rest) = topic.strip_prefix(TWIN_RESPONSE_PREFIX) {
        let (status, query) = split_status(rest);
        let rid = query_param(query, "$rid").map(RequestId::from);
        return match status {
            Some(204) => Inbound::ReportAccepted { rid },
            Some(status) => Inbound::TwinResponse { status, rid },
            None => Inbound::Other,
        };
    }

    if let Some(rest) = topic.strip_prefix(DESIRED_UPDATE_PREFIX) {
        let query = rest.strip_prefix('?').unwrap_or(rest);
        return Inbound::DesiredUpdate {
            version: query_param(query, "$version").and_then(|v| v.parse().ok()),
        };
    }

    Inbound::Other
}

/// Splits `"{status}/?{query}"` into its parts. The status segment must be
/// numeric for the topic to count as part of the family at all.
fn split_status(rest: &str) -> (Option<u16>, &str) {
    let (status, query) = match rest.split_once("/?") {
        Some((status, query)) => (status, query),
        None => (rest, ""),
    };
    (status.parse().ok(), query)
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}
