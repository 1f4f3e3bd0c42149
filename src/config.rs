//! Layered runtime configuration: environment variables first, CLI flags override.

use std::path::PathBuf;

pub const SERVICE_ID: &str = "tuya2mqtt";
pub const HOMIE_VERSION: &str = "5";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cloud credentials are required to run in online mode (set TUYA_API_KEY, TUYA_API_SECRET, TUYA_API_REGION)")]
    MissingCloudCredentials,
}

/// Cloud API credentials. Absent entirely when the operator chooses to run LAN-only.
#[derive(Clone, Debug)]
pub struct CloudCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub region: String,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "config::Args")]
pub struct Args {
    /// MQTT broker hostname.
    #[arg(long, env = "MQTT_BROKER_HOST", default_value = "localhost")]
    pub mqtt_broker_host: String,

    /// MQTT broker port.
    #[arg(long, env = "MQTT_BROKER_PORT", default_value = "1883")]
    pub mqtt_broker_port: u16,

    /// MQTT username, if the broker requires authentication.
    #[arg(long, env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,

    /// MQTT password, if the broker requires authentication.
    #[arg(long, env = "MQTT_PASSWORD")]
    pub mqtt_password: Option<String>,

    /// Tuya Cloud OpenAPI access key.
    #[arg(long, env = "TUYA_API_KEY")]
    pub tuya_api_key: Option<String>,

    /// Tuya Cloud OpenAPI access secret.
    #[arg(long, env = "TUYA_API_SECRET")]
    pub tuya_api_secret: Option<String>,

    /// Tuya Cloud OpenAPI region (e.g. "eu", "us", "cn").
    #[arg(long, env = "TUYA_API_REGION", default_value = "eu")]
    pub tuya_api_region: String,

    /// Path to the persisted device list.
    #[arg(long, env = "TUYA2MQTT_DEV_CONF_FILE", default_value = "devices.json")]
    pub devices_file: PathBuf,

    /// Path to the latest local scan snapshot.
    #[arg(long, env = "TUYA2MQTT_LOCAL_SCAN_FILE", default_value = "local_scan.json")]
    pub local_scan_file: PathBuf,

    /// Path to the extension settings file (Homie templates directory root, metrics cadence, etc).
    #[arg(long, env = "TUYA2MQTT_EXTANSIONS_SETTINGS_FILE", default_value = "extensions.json")]
    pub extensions_settings_file: PathBuf,

    /// Interval, in fractional seconds, between polling rounds.
    #[arg(long, env = "TUYA2MQTT_POLL_INTERVAL", default_value = "5.0")]
    pub poll_interval: f64,

    /// Directory of Homie device-description JSON templates.
    #[arg(long, env = "TUYA2MQTT_HOMIE_TEMPLATES_DIR", default_value = "templates")]
    pub homie_templates_dir: PathBuf,

    /// Interval, in seconds, between metrics snapshot publishes.
    #[arg(long, env = "TUYA2MQTT_METRICS_INTERVAL", default_value = "30")]
    pub metrics_interval_secs: u64,
}

impl Args {
    pub fn cloud_credentials(&self) -> Option<CloudCredentials> {
        Some(CloudCredentials {
            api_key: self.tuya_api_key.clone()?,
            api_secret: self.tuya_api_secret.clone()?,
            region: self.tuya_api_region.clone(),
        })
    }

    pub fn require_cloud_credentials(&self) -> Result<CloudCredentials, Error> {
        self.cloud_credentials().ok_or(Error::MissingCloudCredentials)
    }
}
