//! Simulated firmware-over-the-air updates.
//!
//! A desired `firmware.fwVersion` immediately produces a `downloading` report
//! and, after a fixed delay, a `current` report with the new version. There
//! are no failure states; a second trigger while downloading simply replaces
//! the pending version and restarts the delay.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Current,
    Downloading,
}

/// Firmware state as reported on the twin.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareState {
    pub status: Status,
    pub current_fw_version: String,
    pub pending_fw_version: String,
}

/// Desired `firmware` subtree of the twin.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FotaRequest {
    pub fw_version: String,
}

pub struct FotaSimulator {
    state: FirmwareState,
    delay: Duration,
    deadline: Option<Instant>,
}

impl FotaSimulator {
    pub fn new(current_version: impl Into<String>, delay: Duration) -> Self {
        Self {
            state: FirmwareState {
                status: Status::Current,
                current_fw_version: current_version.into(),
                pending_fw_version: String::new(),
            },
            delay,
            deadline: None,
        }
    }

    pub fn state(&self) -> &FirmwareState {
        &self.state
    }

    /// When the in-flight update completes, if one is in flight.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Starts (or restarts, last-write-wins) a simulated update towards the
    /// requested version. Returns the `downloading` report to publish.
    pub fn trigger(&mut self, request: FotaRequest) -> Value {
        info!(version = %request.fw_version, "firmware download started");
        self.state.status = Status::Downloading;
        self.state.pending_fw_version = request.fw_version;
        self.deadline = Some(Instant::now() + self.delay);
        report(&self.state)
    }

    /// Finishes the in-flight update. Returns the `current` report to
    /// publish, or `None` when nothing was in flight.
    pub fn complete(&mut self) -> Option<Value> {
        self.deadline.take()?;
        self.state.status = Status::Current;
        self.state.current_fw_version = self.state.pending_fw_version.clone();
        info!(version = %self.state.current_fw_version, "firmware update applied");
        Some(report(&self.state))
    }
}

fn report(state: &FirmwareState) -> Value {
    json!({ "firmware": state })
}
