//! Twin document payloads: parsing the desired side, merging configuration
//! and building reported-property patches.
//!
//! Only the `cfg` and `firmware` subtrees of the desired document are
//! consumed; everything else passes through untouched. Configuration merges
//! are shallow, later keys win.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fota::FotaRequest;

/// Device-owned configuration document, merged from the defaults and every
/// accepted desired-config update.
pub type LocalConfig = Map<String, Value>;

/// Initial configuration of a simulated asset tracker.
pub fn default_config() -> LocalConfig {
    let Value::Object(map) = json!({
        "act": false,
        "actwt": 60,
        "mvres": 300,
        "mvt": 3600,
        "gpst": 60,
        "acct": 1,
    }) else {
        unreachable!("default config literal is an object")
    };
    map
}

/// The subtrees of a desired document this engine acts on.
#[derive(Debug, Default, PartialEq)]
pub struct DesiredProperties {
    pub cfg: Option<Map<String, Value>>,
    pub firmware: Option<FotaRequest>,
}

#[derive(Deserialize)]
struct DesiredPatch {
    cfg: Option<Map<String, Value>>,
    firmware: Option<FotaRequest>,
}

#[derive(Deserialize)]
struct TwinDocument {
    desired: Option<DesiredPatch>,
}

impl From<DesiredPatch> for DesiredProperties {
    fn from(patch: DesiredPatch) -> Self {
        Self {
            cfg: patch.cfg,
            firmware: patch.firmware,
        }
    }
}

/// Parses the payload of a full-twin GET response.
pub fn parse_twin_document(payload: &[u8]) -> Result<DesiredProperties, serde_json::Error> {
    let document: TwinDocument = serde_json::from_slice(payload)?;
    Ok(document.desired.map(Into::into).unwrap_or_default())
}

/// Parses the payload of an unsolicited desired-update notification. The
/// notification is the patch itself, not wrapped in a document.
pub fn parse_desired_update(payload: &[u8]) -> Result<DesiredProperties, serde_json::Error> {
    let patch: DesiredPatch = serde_json::from_slice(payload)?;
    Ok(patch.into())
}

/// Shallow merge, replace-by-key, later keys win.
pub fn merge_config(config: &mut LocalConfig, update: Map<String, Value>) {
    for (key, value) in update {
        config.insert(key, value);
    }
}

/// Reported patch carrying the merged config and the fixed device status
/// snapshot.
pub fn config_report(config: &LocalConfig, snapshot: &Value) -> Value {
    let mut report = json!({ "cfg": config });
    if let (Value::Object(report), Value::Object(snapshot)) = (&mut report, snapshot) {
        for (key, value) in snapshot {
            report.insert(key.clone(), value.clone());
        }
    }
    report
}

/// Fixed device and modem status blocks reported alongside the config,
/// mirroring what a real tracker would sample at startup.
pub fn device_snapshot(version: &str) -> Value {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    json!({
        "dev": {
            "v": {
                "band": 666,
                "nw": "LAN",
                "modV": "device-simulator",
                "brdV": "device-simulator",
                "iccid": "12345678901234567890",
                "appV": version,
            },
            "ts": ts,
        },
        "roam": {
            "v": {
                "rsrp": 70,
                "area": 30401,
                "mccmnc": 24201,
                "cell": 16964098,
                "ip": "0.0.0.0",
            },
            "ts": ts,
        },
    })
}
