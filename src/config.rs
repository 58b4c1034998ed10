use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Cli;
use crate::provision::ProvisionOpts;

#[derive(Clone, Debug)]
pub struct Config {
    pub device_file: PathBuf,
    pub ca_file: PathBuf,
    pub dps_host: String,
    pub id_scope: Option<String>,
    pub mqtt_port: u16,
    pub api_address: SocketAddr,
    pub app_version: String,
    pub provision: ProvisionOpts,
    pub fota_delay: Duration,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        let mut provision = ProvisionOpts::default();
        if let Some(timeout) = cli.provision_timeout {
            provision.response_timeout = timeout;
        }
        if let Some(floor) = cli.poll_floor {
            provision.poll_floor = floor;
        }
        if let Some(max_polls) = cli.max_polls {
            provision.max_polls = max_polls;
        }

        Self {
            device_file: cli.device_file,
            ca_file: cli.ca_file,
            dps_host: cli.dps_host,
            id_scope: cli.id_scope,
            mqtt_port: cli.mqtt_port,
            api_address: cli.api_address,
            app_version: cli.app_version,
            provision,
            fota_delay: cli.fota_delay.unwrap_or(Duration::from_secs(10)),
        }
    }
}
