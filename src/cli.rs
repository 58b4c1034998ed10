use clap::Parser;
use std::net::SocketAddr;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Path to the device file holding credentials and the registration record
    #[arg(env = "TWINSIM_DEVICE_FILE", long = "device-file", value_name = "path")]
    pub device_file: PathBuf,

    /// Path to the CA certificate bundle used to verify the service
    #[arg(env = "TWINSIM_CA_FILE", long = "ca-file", value_name = "path")]
    pub ca_file: PathBuf,

    /// Provisioning service hostname
    #[arg(
        env = "TWINSIM_DPS_HOST",
        long = "dps-host",
        value_name = "host",
        default_value = "global.azure-devices-provisioning.net"
    )]
    pub dps_host: String,

    /// ID scope of the provisioning service; required unless the device file
    /// already carries a registration record
    #[arg(env = "TWINSIM_ID_SCOPE", long = "id-scope", value_name = "scope")]
    pub id_scope: Option<String>,

    /// MQTT port for the provisioning and hub connections
    #[arg(
        env = "TWINSIM_MQTT_PORT",
        long = "mqtt-port",
        value_name = "port",
        default_value_t = 8883
    )]
    pub mqtt_port: u16,

    /// Operator API listen address
    #[arg(
        env = "TWINSIM_API_ADDRESS",
        long = "api-address",
        value_name = "addr",
        default_value = "127.0.0.1:3001"
    )]
    pub api_address: SocketAddr,

    /// Firmware version this simulator reports as currently running
    #[arg(
        env = "TWINSIM_APP_VERSION",
        long = "app-version",
        value_name = "str",
        default_value = env!("CARGO_PKG_VERSION")
    )]
    pub app_version: String,

    /// How long to wait for a single registration response in milliseconds
    #[arg(
        env = "TWINSIM_PROVISION_TIMEOUT_MS",
        long = "provision-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub provision_timeout: Option<Duration>,

    /// Minimum wait between registration status polls in milliseconds
    #[arg(
        env = "TWINSIM_POLL_FLOOR_MS",
        long = "poll-floor-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub poll_floor: Option<Duration>,

    /// Maximum number of registration status polls before giving up
    #[arg(env = "TWINSIM_MAX_POLLS", long = "max-polls", value_name = "int")]
    pub max_polls: Option<u32>,

    /// Simulated firmware download time in milliseconds
    #[arg(
        env = "TWINSIM_FOTA_DELAY_MS",
        long = "fota-delay-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub fota_delay: Option<Duration>,
}

pub fn parse() -> Cli {
    Parser::parse()
}
