mod api;
mod cli;
mod config;
mod fota;
mod provision;
mod session;
mod store;
mod topics;
mod transport;
mod twin;
mod types;

use anyhow::{bail, Context, Result};
use config::Config;
use fota::FotaSimulator;
use session::Session;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};
use transport::MqttConnection;
use types::{DeviceId, DeviceIdentity, ProvisioningEndpoint, Registration};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("info".parse()?)
                    .add_directive("rumqttc=warn".parse()?),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();

    let config = Config::from(cli::parse());
    debug!("{:#?}", config);

    let device_file = store::load(&config.device_file).with_context(|| {
        format!("failed to load device file {}", config.device_file.display())
    })?;
    let ca_cert = std::fs::read(&config.ca_file)
        .with_context(|| format!("failed to read CA bundle {}", config.ca_file.display()))?;

    let identity = DeviceIdentity {
        device_id: DeviceId::from(device_file.client_id.clone()),
        private_key: device_file.private_key.clone().into_bytes(),
        client_cert: device_file.client_cert.clone().into_bytes(),
        ca_cert,
    };

    let record = match Registration::from_stored(device_file.registration) {
        Registration::PreRegistered(record) => {
            info!(assigned_hub = %record.assigned_hub, "using stored registration");
            record
        }
        Registration::Fresh => {
            let endpoint = resolve_endpoint(&config)?;
            info!(host = %endpoint.service_operations_host_name, "provisioning device");

            let (conn, mut messages) =
                MqttConnection::to_provisioning(&identity, &endpoint, config.mqtt_port).await?;
            let record =
                provision::provision(&conn, &mut messages, &identity.device_id, &config.provision)
                    .await?;
            conn.disconnect().await;

            store::save_registration(&config.device_file, &record)
                .context("failed to persist registration record")?;
            info!(
                "registration record written to {}",
                config.device_file.display()
            );
            record
        }
    };

    info!(host = %record.assigned_hub, "connecting to hub");
    let (conn, messages) =
        MqttConnection::to_hub(&identity, &record.assigned_hub, config.mqtt_port).await?;
    info!(device_id = %identity.device_id, "connected");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let initial_config = twin::default_config();
    let (config_tx, config_rx) = watch::channel(initial_config.clone());

    let api_state = api::ApiState::new(events_tx, config_rx);
    let api_address = config.api_address;
    tokio::spawn(async move {
        if let Err(e) = api::start(api_address, api_state).await {
            error!("operator API failed: {e}");
        }
    });

    let session = Session::new(
        conn,
        messages,
        events_rx,
        config_tx,
        identity.device_id.clone(),
        initial_config,
        FotaSimulator::new(config.app_version.as_str(), config.fota_delay),
        &config.app_version,
    );
    session.run().await?;

    Ok(())
}

/// Endpoint resolver collaborator: determines where the provisioning service
/// lives for this tenant. A missing ID scope is fatal to the run.
fn resolve_endpoint(config: &Config) -> Result<ProvisioningEndpoint> {
    let Some(id_scope) = config.id_scope.clone() else {
        bail!("device is not registered and no --id-scope was provided to provision with");
    };
    Ok(ProvisioningEndpoint {
        service_operations_host_name: config.dps_host.clone(),
        id_scope,
    })
}
