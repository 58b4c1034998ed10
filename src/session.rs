//! Device session: a single dispatcher owning all per-session protocol state.
//!
//! Runs only after provisioning reached its terminal success state. One
//! `select!` loop drains the inbound message stream, operator events and the
//! firmware-update timer, so LocalConfig and FirmwareState are never touched
//! from more than one execution context and a dropped session cancels every
//! outstanding timer with it.

use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::fota::{FotaRequest, FotaSimulator};
use crate::topics::{self, Inbound};
use crate::transport::{Connection, Message, TransportError};
use crate::twin::{self, LocalConfig};
use crate::types::{DeviceId, RequestId};

/// Simulated events injected by the operator bridge, consumed as if they
/// were local triggers equivalent to desired-update notifications.
#[derive(Debug, Clone)]
pub enum OperatorEvent {
    /// Manual config override, merged and reported like a desired update.
    SetConfig(Map<String, Value>),
    /// One-off telemetry message.
    SendMessage(Value),
    /// Batched telemetry message.
    SendBatch(Value),
    /// Manual firmware update trigger.
    TriggerFota(FotaRequest),
    /// Arbitrary reported-properties patch.
    Report(Value),
}

pub struct Session<C: Connection> {
    conn: C,
    messages: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedReceiver<OperatorEvent>,
    config_tx: watch::Sender<LocalConfig>,
    device_id: DeviceId,
    config: LocalConfig,
    fota: FotaSimulator,
    snapshot: Value,
    twin_timeout: Duration,
}

/// Outstanding full-twin request: the id the response must carry and the
/// deadline for giving up on it.
type PendingGet = Option<(RequestId, Instant)>;

impl<C: Connection> Session<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: C,
        messages: mpsc::UnboundedReceiver<Message>,
        events: mpsc::UnboundedReceiver<OperatorEvent>,
        config_tx: watch::Sender<LocalConfig>,
        device_id: DeviceId,
        config: LocalConfig,
        fota: FotaSimulator,
        app_version: &str,
    ) -> Self {
        let snapshot = twin::device_snapshot(app_version);
        Self {
            conn,
            messages,
            events,
            config_tx,
            device_id,
            config,
            fota,
            snapshot,
            twin_timeout: Duration::from_secs(30),
        }
    }

    /// Runs the twin synchronization loop until the connection closes.
    #[instrument(name = "session", skip_all, fields(device_id = %self.device_id))]
    pub async fn run(mut self) -> Result<(), TransportError> {
        self.conn.subscribe(topics::TWIN_RESPONSES).await?;
        self.conn.subscribe(topics::DESIRED_UPDATES).await?;

        let rid = RequestId::new();
        info!("requesting twin document");
        self.conn
            .publish(&topics::get_twin(&rid), Vec::new())
            .await?;
        let mut pending_get: PendingGet = Some((rid, Instant::now() + self.twin_timeout));

        let mut events_open = true;
        loop {
            let fota_deadline = self.fota.deadline().unwrap_or_else(far_future);
            let get_deadline = pending_get
                .as_ref()
                .map(|(_, deadline)| *deadline)
                .unwrap_or_else(far_future);

            tokio::select! {
                message = self.messages.recv() => match message {
                    Some(message) => self.handle_message(message, &mut pending_get).await?,
                    None => {
                        info!("connection closed");
                        break;
                    }
                },

                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await?,
                    None => events_open = false,
                },

                () = tokio::time::sleep_until(fota_deadline) => {
                    if let Some(report) = self.fota.complete() {
                        self.publish_report(report).await?;
                    }
                }

                () = tokio::time::sleep_until(get_deadline) => {
                    warn!("timed out waiting for the twin document");
                    pending_get = None;
                }
            }
        }
        Ok(())
    }

    async fn handle_message(
        &mut self,
        message: Message,
        pending_get: &mut PendingGet,
    ) -> Result<(), TransportError> {
        match topics::classify(&message.topic) {
            Inbound::TwinResponse { status, rid } => match pending_get.as_ref() {
                Some((expected, _)) if rid.as_ref() == Some(expected) => {
                    *pending_get = None;
                    if (200..300).contains(&status) {
                        match twin::parse_twin_document(&message.payload) {
                            Ok(desired) => self.apply_twin_document(desired).await?,
                            Err(e) => warn!("malformed twin document: {e}"),
                        }
                    } else {
                        warn!(status, "twin request failed");
                    }
                }
                _ => debug!(?rid, "ignoring twin response for a different request id"),
            },

            Inbound::ReportAccepted { .. } => trace!("report acknowledged"),

            Inbound::DesiredUpdate { version } => {
                debug!(?version, "desired properties update");
                match twin::parse_desired_update(&message.payload) {
                    Ok(desired) => self.apply_desired(desired).await?,
                    Err(e) => warn!("malformed desired update: {e}"),
                }
            }

            Inbound::RegistrationResult { .. } | Inbound::Other => {
                warn!(topic = %message.topic, "unexpected topic");
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: OperatorEvent) -> Result<(), TransportError> {
        match event {
            OperatorEvent::SetConfig(update) => self.update_config(update).await?,
            OperatorEvent::SendMessage(message) => {
                let topic = topics::telemetry(&self.device_id);
                info!(%topic, "sending message");
                self.conn
                    .publish(&topic, message.to_string().into_bytes())
                    .await?;
            }
            OperatorEvent::SendBatch(batch) => {
                let topic = topics::batch(&self.device_id);
                info!(%topic, "sending batch");
                self.conn
                    .publish(&topic, batch.to_string().into_bytes())
                    .await?;
            }
            OperatorEvent::TriggerFota(request) => {
                let report = self.fota.trigger(request);
                self.publish_report(report).await?;
            }
            OperatorEvent::Report(patch) => self.publish_report(patch).await?,
        }
        Ok(())
    }

    /// Applies the desired side of the full twin document. Unlike a patch,
    /// this always reports back, so the hub gets the initial reported state
    /// with the device snapshot even when no config is desired.
    async fn apply_twin_document(
        &mut self,
        desired: twin::DesiredProperties,
    ) -> Result<(), TransportError> {
        self.update_config(desired.cfg.unwrap_or_default()).await?;
        if let Some(request) = desired.firmware {
            let report = self.fota.trigger(request);
            self.publish_report(report).await?;
        }
        Ok(())
    }

    async fn apply_desired(&mut self, desired: twin::DesiredProperties) -> Result<(), TransportError> {
        if let Some(update) = desired.cfg {
            self.update_config(update).await?;
        }
        if let Some(request) = desired.firmware {
            let report = self.fota.trigger(request);
            self.publish_report(report).await?;
        }
        Ok(())
    }

    async fn update_config(&mut self, update: Map<String, Value>) -> Result<(), TransportError> {
        twin::merge_config(&mut self.config, update);
        let config = Value::Object(self.config.clone());
        debug!(%config, "config updated");

        let report = twin::config_report(&self.config, &self.snapshot);
        self.publish_report(report).await?;
        self.config_tx.send_replace(self.config.clone());
        Ok(())
    }

    async fn publish_report(&self, report: Value) -> Result<(), TransportError> {
        let rid = RequestId::new();
        trace!(%rid, "reporting {report}");
        self.conn
            .publish(&topics::update_reported(&rid), report.to_string().into_bytes())
            .await
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{self, MockRemote};
    use crate::twin::default_config;
    use serde_json::json;

    fn rid_of(topic: &str) -> RequestId {
        let (_, query) = topic.split_once('?').expect("no query part");
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("$rid="))
            .expect("no $rid")
            .into()
    }

    fn spawn_session(
        config: LocalConfig,
    ) -> (
        MockRemote,
        mpsc::UnboundedSender<OperatorEvent>,
        watch::Receiver<LocalConfig>,
        tokio::task::JoinHandle<Result<(), TransportError>>,
    ) {
        let (conn, inbound, remote) = mock::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (config_tx, config_rx) = watch::channel(config.clone());

        let session = Session::new(
            conn,
            inbound,
            events_rx,
            config_tx,
            DeviceId::from("dev-01"),
            config,
            FotaSimulator::new("1.0.0", Duration::from_secs(10)),
            "1.0.0",
        );
        let handle = tokio::spawn(session.run());
        (remote, events_tx, config_rx, handle)
    }

    async fn expect_startup(remote: &mut MockRemote) -> RequestId {
        assert_eq!(remote.subscribed.recv().await.unwrap(), "$iothub/twin/res/#");
        assert_eq!(
            remote.subscribed.recv().await.unwrap(),
            "$iothub/twin/PATCH/properties/desired/#"
        );
        let get = remote.published.recv().await.unwrap();
        assert!(get.topic.starts_with("$iothub/twin/GET/"));
        rid_of(&get.topic)
    }

    fn report_body(message: &Message) -> Value {
        assert!(message
            .topic
            .starts_with("$iothub/twin/PATCH/properties/reported/"));
        serde_json::from_slice(&message.payload).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn it_requests_and_applies_the_twin_document() {
        let (mut remote, _events, mut config_rx, _handle) = spawn_session(default_config());
        let rid = expect_startup(&mut remote).await;

        // a response correlated to someone else's request never changes state
        remote.send(
            topics::twin_response(200, &RequestId::from("someone-else")),
            serde_json::to_vec(&json!({ "desired": { "cfg": { "actwt": 999 } } })).unwrap(),
        );
        remote.send(
            topics::twin_response(200, &rid),
            serde_json::to_vec(&json!({
                "desired": { "cfg": { "actwt": 120 }, "$version": 4 },
                "reported": {},
            }))
            .unwrap(),
        );

        let report = report_body(&remote.published.recv().await.unwrap());
        assert_eq!(report["cfg"]["actwt"], json!(120));
        assert_eq!(report["dev"]["v"]["appV"], json!("1.0.0"));

        config_rx.changed().await.unwrap();
        assert_eq!(config_rx.borrow()["actwt"], json!(120));
        // the stale response produced no report of its own
        assert!(remote.published.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn it_reports_the_initial_state_even_without_desired_config() {
        let (mut remote, _events, _config_rx, _handle) = spawn_session(default_config());
        let rid = expect_startup(&mut remote).await;

        remote.send(
            topics::twin_response(200, &rid),
            serde_json::to_vec(&json!({ "desired": { "$version": 1 }, "reported": {} })).unwrap(),
        );

        // the twin-get response itself must produce the first report, with
        // the defaults and the device snapshot
        let report = report_body(&remote.published.recv().await.unwrap());
        assert_eq!(report["cfg"], Value::Object(default_config()));
        assert_eq!(report["dev"]["v"]["appV"], json!("1.0.0"));
        assert_eq!(report["roam"]["v"]["cell"], json!(16964098));
        assert!(remote.published.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn it_merges_a_desired_config_update_and_reports_once() {
        let initial = json!({ "interval": 30, "mode": "auto" })
            .as_object()
            .unwrap()
            .clone();
        let (mut remote, _events, _config_rx, _handle) = spawn_session(initial);
        expect_startup(&mut remote).await;

        remote.send(
            topics::desired_update(Some(5)),
            serde_json::to_vec(&json!({ "cfg": { "interval": 60 }, "$version": 5 })).unwrap(),
        );

        let report = report_body(&remote.published.recv().await.unwrap());
        assert_eq!(report["cfg"]["interval"], json!(60));
        assert_eq!(report["cfg"]["mode"], json!("auto"));
        assert!(remote.published.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn it_runs_the_firmware_update_flow() {
        let (mut remote, _events, _config_rx, _handle) = spawn_session(default_config());
        expect_startup(&mut remote).await;

        remote.send(
            topics::desired_update(Some(6)),
            serde_json::to_vec(&json!({ "firmware": { "fwVersion": "2.0.0" } })).unwrap(),
        );

        let downloading = report_body(&remote.published.recv().await.unwrap());
        assert_eq!(
            downloading["firmware"],
            json!({
                "status": "downloading",
                "currentFwVersion": "1.0.0",
                "pendingFwVersion": "2.0.0",
            })
        );

        // next report only after the simulated download delay
        let done = report_body(&remote.published.recv().await.unwrap());
        assert_eq!(
            done["firmware"],
            json!({
                "status": "current",
                "currentFwVersion": "2.0.0",
                "pendingFwVersion": "2.0.0",
            })
        );
        assert!(remote.published.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn it_survives_unexpected_topics_and_malformed_payloads() {
        let (mut remote, _events, _config_rx, handle) = spawn_session(default_config());
        expect_startup(&mut remote).await;

        remote.send("some/other/topic".to_string(), b"noise".to_vec());
        remote.send(topics::desired_update(Some(7)), b"not json".to_vec());
        remote.send(
            topics::desired_update(Some(8)),
            serde_json::to_vec(&json!({ "cfg": { "act": true } })).unwrap(),
        );

        let report = report_body(&remote.published.recv().await.unwrap());
        assert_eq!(report["cfg"]["act"], json!(true));
        assert!(!handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn it_publishes_operator_events() {
        let (mut remote, events, _config_rx, _handle) = spawn_session(default_config());
        expect_startup(&mut remote).await;

        events
            .send(OperatorEvent::SendMessage(json!({ "btn": { "v": 1 } })))
            .unwrap();
        let message = remote.published.recv().await.unwrap();
        assert_eq!(message.topic, "devices/dev-01/messages/events/");
        assert_eq!(
            serde_json::from_slice::<Value>(&message.payload).unwrap(),
            json!({ "btn": { "v": 1 } })
        );

        events
            .send(OperatorEvent::SendBatch(json!([{ "temp": 21 }])))
            .unwrap();
        let batch = remote.published.recv().await.unwrap();
        assert_eq!(batch.topic, "devices/dev-01/messages/events/batch=1");

        events
            .send(OperatorEvent::Report(json!({ "custom": true })))
            .unwrap();
        let report = report_body(&remote.published.recv().await.unwrap());
        assert_eq!(report, json!({ "custom": true }));
    }

    #[tokio::test(start_paused = true)]
    async fn it_keeps_running_after_the_twin_request_times_out() {
        let (mut remote, _events, _config_rx, handle) = spawn_session(default_config());
        let rid = expect_startup(&mut remote).await;

        // no twin response at all; push a desired update after the timeout
        tokio::time::sleep(Duration::from_secs(60)).await;
        remote.send(
            topics::desired_update(Some(9)),
            serde_json::to_vec(&json!({ "cfg": { "gpst": 30 } })).unwrap(),
        );

        let report = report_body(&remote.published.recv().await.unwrap());
        assert_eq!(report["cfg"]["gpst"], json!(30));

        // a late twin response is stale by now and must be dropped
        remote.send(
            topics::twin_response(200, &rid),
            serde_json::to_vec(&json!({ "desired": { "cfg": { "gpst": 999 } } })).unwrap(),
        );
        remote.send(
            topics::desired_update(Some(10)),
            serde_json::to_vec(&json!({ "cfg": { "act": false } })).unwrap(),
        );
        let report = report_body(&remote.published.recv().await.unwrap());
        assert_eq!(report["cfg"]["gpst"], json!(30));
        assert!(!handle.is_finished());
    }
}
