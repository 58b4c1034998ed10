//! One authenticated publish/subscribe connection to either the provisioning
//! service or the assigned hub.
//!
//! The protocol engines only ever see the [`Connection`] trait plus a stream
//! of inbound `(topic, payload)` pairs; the MQTT machinery stays behind this
//! seam. The production implementation drives a rumqttc event loop from a
//! spawned task and forwards publishes into an unbounded channel, so slow
//! protocol handling never stalls the receive path.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::types::{DeviceIdentity, ProvisioningEndpoint};

/// An inbound message delivered by topic string.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection refused: {0:?}")]
    Refused(ConnectReturnCode),

    #[error("request failed: {0}")]
    Request(#[from] rumqttc::ClientError),
}

/// Capability the protocol engines use to talk to the remote end.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Handle to a live MQTT session.
pub struct MqttConnection {
    client: AsyncClient,
}

impl MqttConnection {
    /// Connects to the provisioning service with the DPS-flavored username.
    pub async fn to_provisioning(
        identity: &DeviceIdentity,
        endpoint: &ProvisioningEndpoint,
        port: u16,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Message>), TransportError> {
        let username = format!(
            "{}/registrations/{}/api-version=2019-03-31",
            endpoint.id_scope, identity.device_id
        );
        connect(
            identity,
            &endpoint.service_operations_host_name,
            port,
            username,
        )
        .await
    }

    /// Connects to the assigned hub with the hub-flavored username.
    pub async fn to_hub(
        identity: &DeviceIdentity,
        assigned_hub: &str,
        port: u16,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Message>), TransportError> {
        let username = format!(
            "{}/{}/?api-version=2018-06-30",
            assigned_hub, identity.device_id
        );
        connect(identity, assigned_hub, port, username).await
    }

    /// Sends a disconnect to the broker, stopping the event loop task.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("disconnect failed: {e}");
        }
    }
}

#[async_trait]
impl Connection for MqttConnection {
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client.subscribe(filter, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}

async fn connect(
    identity: &DeviceIdentity,
    host: &str,
    port: u16,
    username: String,
) -> Result<(MqttConnection, mpsc::UnboundedReceiver<Message>), TransportError> {
    let mut options = MqttOptions::new(identity.device_id.to_string(), host, port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_credentials(username, "");
    options.set_transport(Transport::Tls(TlsConfiguration::Simple {
        ca: identity.ca_cert.clone(),
        alpn: None,
        client_auth: Some((identity.client_cert.clone(), identity.private_key.clone())),
    }));

    let (client, mut eventloop) = AsyncClient::new(options, 16);

    // Wait for the broker to accept the session before handing out the
    // connection; a TLS or credential failure surfaces here as fatal.
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    break;
                }
                return Err(TransportError::Refused(ack.code));
            }
            Ok(_) => continue,
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        }
    }
    debug!("connected to {host}:{port}");

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if tx.send(message).is_err() {
                        // receiver dropped, session is being torn down
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) | Err(rumqttc::ConnectionError::RequestsDone) => {
                    trace!("session closed");
                    break;
                }
                Ok(event) => trace!(?event, "mqtt event"),
                Err(e) => {
                    warn!("connection lost: {e}");
                    break;
                }
            }
        }
    });

    Ok((MqttConnection { client }, rx))
}
