//! `LocalTransport`: the pluggable contract for talking to one device over the LAN.
//!
//! The real Tuya wire protocol (key derivation, encrypted framing) is out of scope; the
//! [`TcpJsonTransport`] here is a minimal stand-in that speaks newline-delimited JSON over a
//! per-call TCP connection, so the rest of the bridge is exercisable end to end.

use serde_json::{Map, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;

pub type Dps = Map<String, Value>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("invalid JSON response from device")]
    Json,
    #[error("network error: unable to connect")]
    Connect,
    #[error("timeout waiting for device")]
    Timeout,
    #[error("specified value out of range")]
    Range,
    #[error("unexpected payload from device")]
    Payload,
    #[error("network error: device unreachable")]
    Offline,
    #[error("device in unknown state")]
    State,
    #[error("function not supported by device")]
    Function,
    #[error("device detected in an unexpected protocol version, retry command")]
    DevType,
    #[error("check device key or version")]
    KeyOrVer,
}

impl Error {
    pub fn status(&self) -> crate::dp::ErrorStatus {
        use crate::dp::ErrorStatus as S;
        match self {
            Error::Json => S::Json,
            Error::Connect => S::Connect,
            Error::Timeout => S::Timeout,
            Error::Range => S::Range,
            Error::Payload => S::Payload,
            Error::Offline => S::Offline,
            Error::State => S::State,
            Error::Function => S::Function,
            Error::DevType => S::DevType,
            Error::KeyOrVer => S::KeyOrVer,
        }
    }

    pub fn to_dps(&self) -> Dps {
        let mut m = Map::new();
        m.insert("Err".into(), Value::String(self.status().code().to_string()));
        m.insert("Error".into(), Value::String(self.to_string()));
        m
    }
}

/// Everything a [`crate::pipeline::DeviceEntity`] needs from a concrete Tuya connection.
///
/// Implementations connect per call (no persistent socket), retry at most twice, and must not
/// block longer than roughly 5 seconds including retries.
pub trait LocalTransport: Send + Sync {
    fn status(&self) -> impl Future<Output = Result<Dps, Error>> + Send;
    fn turn_on(&self) -> impl Future<Output = Result<Dps, Error>> + Send;
    fn turn_off(&self) -> impl Future<Output = Result<Dps, Error>> + Send;
    fn set_status(&self, state: bool, channel: u32) -> impl Future<Output = Result<Dps, Error>> + Send;
    fn set_value(&self, dp: &str, value: Value) -> impl Future<Output = Result<Dps, Error>> + Send;
    fn set_values(&self, values: Map<String, Value>) -> impl Future<Output = Result<Dps, Error>> + Send;
    fn set_brightness_percentage(&self, percent: i64) -> impl Future<Output = Result<Dps, Error>> + Send;
    fn set_colourtemp_percentage(&self, percent: i64) -> impl Future<Output = Result<Dps, Error>> + Send;
    fn set_color_hsv(&self, h: f64, s: f64, v: f64) -> impl Future<Output = Result<Dps, Error>> + Send;
    fn set_color_rgb(&self, r: u8, g: u8, b: u8) -> impl Future<Output = Result<Dps, Error>> + Send;
    fn set_mode(&self, mode: &str) -> impl Future<Output = Result<Dps, Error>> + Send;
}

/// Connection parameters sufficient to reach one device.
#[derive(Clone, Debug)]
pub struct DeviceAddress {
    pub ip: String,
    pub local_key: String,
    pub version: String,
}

/// A minimal JSON-over-TCP transport: connects, sends one JSON request object terminated by
/// `\n`, reads one `\n`-terminated JSON response, disconnects. Bounded by `RETRIES` attempts and
/// `TIMEOUT` per attempt, with a short delay between retries, matching the contract's
/// "at most 2 retries, 5s nominal timeout, >=1s delay" requirement.
pub struct TcpJsonTransport {
    address: DeviceAddress,
}

impl TcpJsonTransport {
    const RETRIES: u32 = 2;
    const TIMEOUT: Duration = Duration::from_secs(5);
    const RETRY_DELAY: Duration = Duration::from_secs(1);

    pub fn new(address: DeviceAddress) -> Self {
        Self { address }
    }

    async fn request(&self, payload: Value) -> Result<Dps, Error> {
        let mut last_err = Error::Offline;
        for attempt in 0..=Self::RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Self::RETRY_DELAY).await;
            }
            match tokio::time::timeout(Self::TIMEOUT, self.request_once(&payload)).await {
                Ok(Ok(dps)) => return Ok(dps),
                Ok(Err(e)) => last_err = e,
                Err(_) => last_err = Error::Timeout,
            }
        }
        Err(last_err)
    }

    async fn request_once(&self, payload: &Value) -> Result<Dps, Error> {
        let mut stream = TcpStream::connect((self.address.ip.as_str(), 6668))
            .await
            .map_err(|_| Error::Connect)?;
        let mut line = serde_json::to_vec(payload).map_err(|_| Error::Json)?;
        line.push(b'\n');
        stream.write_all(&line).await.map_err(|_| Error::Connect)?;
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).await.map_err(|_| Error::Connect)?;
            if n == 0 || byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
        }
        let value: Value = serde_json::from_slice(&buf).map_err(|_| Error::Json)?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(Error::Payload),
        }
    }
}

impl LocalTransport for TcpJsonTransport {
    async fn status(&self) -> Result<Dps, Error> {
        self.request(serde_json::json!({"cmd": "status"})).await
    }

    async fn turn_on(&self) -> Result<Dps, Error> {
        self.set_status(true, 1).await
    }

    async fn turn_off(&self) -> Result<Dps, Error> {
        self.set_status(false, 1).await
    }

    async fn set_status(&self, state: bool, channel: u32) -> Result<Dps, Error> {
        self.request(serde_json::json!({"cmd": "set", "dps": {channel.to_string(): state}}))
            .await
    }

    async fn set_value(&self, dp: &str, value: Value) -> Result<Dps, Error> {
        self.request(serde_json::json!({"cmd": "set", "dps": {dp: value}})).await
    }

    async fn set_values(&self, values: Map<String, Value>) -> Result<Dps, Error> {
        self.request(serde_json::json!({"cmd": "set", "dps": Value::Object(values)}))
            .await
    }

    async fn set_brightness_percentage(&self, percent: i64) -> Result<Dps, Error> {
        self.request(serde_json::json!({"cmd": "set", "dps": {"3": percent}})).await
    }

    async fn set_colourtemp_percentage(&self, percent: i64) -> Result<Dps, Error> {
        self.request(serde_json::json!({"cmd": "set", "dps": {"4": percent}})).await
    }

    async fn set_color_hsv(&self, h: f64, s: f64, v: f64) -> Result<Dps, Error> {
        self.request(serde_json::json!({"cmd": "set", "dps": {"5": [h, s, v]}})).await
    }

    async fn set_color_rgb(&self, r: u8, g: u8, b: u8) -> Result<Dps, Error> {
        self.request(serde_json::json!({"cmd": "set", "dps": {"5": [r, g, b]}})).await
    }

    async fn set_mode(&self, mode: &str) -> Result<Dps, Error> {
        self.request(serde_json::json!({"cmd": "set", "dps": {"2": mode}})).await
    }
}
