//! `BridgeCore`: the orchestrator tying together the MQTT broker, the device registry, the
//! per-device command pipelines, the scanner, and the cloud client. Grounded in the original's
//! `core/bridge_polling_loop.py` (`Tuya2MqttBridge`).

use crate::broker::Broker;
use crate::cloud::CloudClient;
use crate::config;
use crate::dp;
use crate::homie_bridge::HomieLifecycle;
use crate::metrics::MetricsExt;
use crate::pipeline::{self, DeviceEntity, Operation, SwitchPayload};
use crate::registry::DeviceRegistry;
use crate::scanner::{ScanMode, Scanner};
use crate::transport::{DeviceAddress, TcpJsonTransport};
use homie5::client::QoS;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Offline,
    LanOnly,
    Online,
}

impl BridgeState {
    fn name(&self) -> &'static str {
        match self {
            BridgeState::Offline => "OFFLINE",
            BridgeState::LanOnly => "LAN_ONLY",
            BridgeState::Online => "ONLINE",
        }
    }
}

/// Determines the bridge's initial network state the way the original does: a LAN probe (a UDP
/// "connect" to a TEST-NET-1 address never actually sends a packet, but fails if there is no
/// route at all) gates `OFFLINE`, then a 1s-timeout TCP connect to a public DNS resolver
/// distinguishes `LAN_ONLY` from `ONLINE`.
pub async fn determine_net_state() -> BridgeState {
    if !probe_lan().await {
        return BridgeState::Offline;
    }
    if probe_internet().await {
        BridgeState::Online
    } else {
        BridgeState::LanOnly
    }
}

async fn probe_lan() -> bool {
    let Ok(socket) = tokio::net::UdpSocket::bind("0.0.0.0:0").await else { return false };
    socket.connect(("192.0.2.1", 9)).await.is_ok()
}

async fn probe_internet() -> bool {
    tokio::time::timeout(Duration::from_secs(1), tokio::net::TcpStream::connect(("1.1.1.1", 53)))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("the bridge is not ready to accept this request in its current state")]
    NotReady,
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error(transparent)]
    Registry(#[from] crate::registry::Error),
    #[error(transparent)]
    Broker(#[from] crate::broker::Error),
}

/// Everything `BridgeCore` needs to publish under `<service_id>/...` and drive one device's
/// command pipeline plus its most recent observed status (used for `toggle` and API-v2 encoding).
struct DeviceRuntime {
    entity: DeviceEntity<TcpJsonTransport>,
}

pub struct BridgeCore<C: CloudClient> {
    pub service_id: String,
    poll_interval: Duration,
    broker: Arc<Broker>,
    registry: Arc<DeviceRegistry>,
    cloud: Mutex<C>,
    state: Mutex<BridgeState>,
    metrics: Arc<MetricsExt>,
    runtimes: Mutex<HashMap<String, DeviceRuntime>>,
    scanner: Mutex<Scanner>,
    dispatch_limit: Semaphore,
    lifecycle: Arc<HomieLifecycle>,
}

impl<C: CloudClient + 'static> BridgeCore<C> {
    pub fn new(
        broker: Arc<Broker>,
        registry: Arc<DeviceRegistry>,
        cloud: C,
        metrics: Arc<MetricsExt>,
        poll_interval: Duration,
        initial_state: BridgeState,
        lifecycle: Arc<HomieLifecycle>,
    ) -> Self {
        let scanner = Scanner::new(Arc::clone(&registry));
        Self {
            service_id: config::SERVICE_ID.to_string(),
            poll_interval,
            broker,
            registry,
            cloud: Mutex::new(cloud),
            state: Mutex::new(initial_state),
            metrics,
            runtimes: Mutex::new(HashMap::new()),
            scanner: Mutex::new(scanner),
            dispatch_limit: Semaphore::new(4),
            lifecycle,
        }
    }

    pub async fn state(&self) -> BridgeState {
        *self.state.lock().await
    }

    async fn set_state(&self, new_state: BridgeState) {
        let mut guard = self.state.lock().await;
        if *guard != new_state {
            *guard = new_state;
            drop(guard);
            tracing::info!(state = new_state.name(), "bridge state changed");
            self.publish_bridge_status(new_state).await;
        }
    }

    async fn publish_bridge_status(&self, state: BridgeState) {
        let topic = format!("{}/bridge/status", self.service_id);
        if let Err(e) = self.broker.publish(topic, QoS::AtLeastOnce, true, state.name()).await {
            tracing::error!(error = %e, "failed to publish bridge status");
        }
    }

    fn require_state(&self, allowed: &[BridgeState], actual: BridgeState) -> Result<(), Error> {
        if allowed.contains(&actual) { Ok(()) } else { Err(Error::NotReady) }
    }

    /// Spawns one [`DeviceEntity`] per registered device with a connection-level transport.
    pub async fn spawn_device_runtimes(&self) {
        let devices = self.registry.all().await;
        let mut runtimes = self.runtimes.lock().await;
        for device in devices {
            let (Some(ip), Some(local_key)) = (device.ip.clone(), device.local_key.clone()) else {
                tracing::warn!(id = %device.id, "skipping device with no ip/local_key");
                continue;
            };
            let transport = TcpJsonTransport::new(DeviceAddress { ip, local_key, version: device.version.clone() });
            let entity = DeviceEntity::spawn(&device, transport);
            runtimes.insert(device.id.clone(), DeviceRuntime { entity });
        }
    }

    pub async fn stop_device_runtime(&self, dev_id: &str) {
        let mut runtimes = self.runtimes.lock().await;
        if let Some(runtime) = runtimes.remove(dev_id) {
            runtime.entity.stop_and_join().await;
        }
    }

    pub async fn stop_all_device_runtimes(&self) {
        let mut runtimes = self.runtimes.lock().await;
        let drained: Vec<_> = runtimes.drain().collect();
        drop(runtimes);
        for (_, runtime) in drained {
            runtime.entity.stop_and_join().await;
        }
    }

    /// The poll loop: every `poll_interval`, enqueue an `UpdateStatus` poll for every live
    /// device runtime.
    pub async fn run_poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            let runtimes = self.runtimes.lock().await;
            let handles: Vec<(String, pipeline::PipelineHandle)> =
                runtimes.iter().map(|(id, rt)| (id.clone(), rt.entity.handle())).collect();
            drop(runtimes);
            for (dev_id, handle) in handles {
                let this = Arc::clone(&self);
                let id = dev_id.clone();
                handle
                    .submit_poll(Box::new(move |result, latency| {
                        let this = Arc::clone(&this);
                        tokio::spawn(async move {
                            this.metrics.inc_total().await;
                            if latency > Duration::from_secs(5) {
                                this.metrics.inc_slow().await;
                            }
                            this.handle_poll_result(&id, result).await;
                        });
                    }))
                    .await;
            }
        }
    }

    async fn handle_poll_result(&self, dev_id: &str, result: Result<Map<String, Value>, crate::transport::Error>) {
        match result {
            Ok(dps) => {
                let human = self.translate_status(dev_id, &dps).await;
                self.publish_device_status(dev_id, &human).await;
                self.lifecycle.publish_status(dev_id, &human).await;
            }
            Err(e) => {
                self.metrics.record_error(e.status().metric_bucket()).await;
                let mut error_doc = Map::new();
                for (k, v) in e.to_dps() {
                    error_doc.insert(k.to_lowercase(), v);
                }
                self.publish_device_status(dev_id, &error_doc).await;
                if e.status() == dp::ErrorStatus::KeyOrVer {
                    self.self_publish_update_key(dev_id).await;
                }
            }
        }
    }

    /// Translates raw DP-numbered values into the device's human DP codes, auto-registering any
    /// unknown DP it encounters, and rescales brightness/temperature back to percent.
    async fn translate_status(&self, dev_id: &str, dps: &Map<String, Value>) -> Map<String, Value> {
        let Some(device) = self.registry.get(dev_id).await else { return Map::new() };
        let mut out = Map::new();
        for (dp_num, value) in dps {
            match device.mapping.get(dp_num) {
                Some(m) => {
                    out.insert(m.code.clone(), value.clone());
                }
                None => {
                    if let Err(e) = self.registry.insert_unknown_dp(dev_id, dp_num).await {
                        tracing::error!(error = %e, "failed to register unknown dp");
                    }
                }
            }
        }
        for key in ["bright_value", "bright_value_v2"] {
            if let Some(raw) = out.get(key).and_then(Value::as_i64) {
                out.insert(key.into(), Value::from(dp::bright_raw_to_percent(raw)));
            }
        }
        for key in ["temp_value", "temp_value_v2"] {
            if let Some(raw) = out.get(key).and_then(Value::as_i64) {
                out.insert(key.into(), Value::from(dp::temp_raw_to_percent(raw)));
            }
        }
        out
    }

    async fn publish_device_status(&self, dev_id: &str, dps: &Map<String, Value>) {
        let topic = format!("{}/devices/{}/status", self.service_id, dev_id);
        let payload = serde_json::to_vec(dps).unwrap_or_default();
        if let Err(e) = self.broker.publish(topic, QoS::AtLeastOnce, false, payload).await {
            tracing::error!(error = %e, "failed to publish device status");
        }
    }

    async fn self_publish_update_key(&self, dev_id: &str) {
        let topic = format!("{}/bridge/request/update_key", self.service_id);
        let payload = serde_json::json!({"device_id": dev_id}).to_string();
        if let Err(e) = self.broker.publish(topic, QoS::AtLeastOnce, false, payload).await {
            tracing::error!(error = %e, "failed to self-publish update_key request");
        }
    }

    // -- MQTT request handlers, invoked from the dispatch table wired in `main`/`commands`. --

    pub async fn on_device_command(&self, ident: &str, payload: &[u8]) -> Result<(), Error> {
        self.require_state(&[BridgeState::LanOnly, BridgeState::Online], self.state().await)?;
        let Some(dev_id) = self.registry.resolve(ident).await else {
            tracing::warn!(ident, "unknown device identifier");
            return Err(Error::UnknownDevice(ident.to_string()));
        };
        let runtimes = self.runtimes.lock().await;
        let Some(runtime) = runtimes.get(&dev_id) else { return Err(Error::UnknownDevice(dev_id)) };
        let handle = runtime.entity.handle();
        drop(runtimes);

        let mut actions: Map<String, Value> = serde_json::from_slice(payload).unwrap_or_default();
        let api_v2 = actions.remove("api_ver").and_then(|v| v.as_i64()) == Some(2);
        if api_v2 {
            handle.submit_control(Operation::SetStatus(actions), None).await;
            return Ok(());
        }
        for (cmd, value) in actions {
            let op = match cmd.as_str() {
                "bright" => value.as_i64().map(Operation::Brightness),
                "color_temp" => value.as_i64().map(Operation::ColorTemp),
                "color_hsv" => value.as_array().filter(|a| a.len() == 3).map(|a| {
                    Operation::ColorHsv([
                        a[0].as_f64().unwrap_or(0.0),
                        a[1].as_f64().unwrap_or(0.0),
                        a[2].as_f64().unwrap_or(0.0),
                    ])
                }),
                "color_rgb" => value.as_array().filter(|a| a.len() == 3).map(|a| {
                    Operation::ColorRgb([
                        a[0].as_u64().unwrap_or(0) as u8,
                        a[1].as_u64().unwrap_or(0) as u8,
                        a[2].as_u64().unwrap_or(0) as u8,
                    ])
                }),
                "work_mode" => value.as_str().map(|m| Operation::Mode(m.to_string())),
                "scene" => Some(Operation::Scene),
                "switch" => value.as_bool().map(|b| Operation::Switch(SwitchPayload::Simple(b))),
                "toggle" => value.as_str().map(|code| Operation::ToggleSwitch { dp_code: code.to_string() }),
                _ => None,
            };
            if let Some(op) = op {
                handle.submit_control(op, None).await;
            } else {
                tracing::warn!(cmd, "unrecognized or malformed apiv1 command, dropping");
            }
        }
        Ok(())
    }

    pub async fn on_scan(&self) -> Result<(), Error> {
        self.require_state(&[BridgeState::LanOnly, BridgeState::Online], self.state().await)?;
        self.run_scan(ScanMode::Basic, None).await;
        Ok(())
    }

    pub async fn on_scan_gen(&self, scan_time: Option<Duration>) -> Result<(), Error> {
        self.require_state(&[BridgeState::LanOnly, BridgeState::Online], self.state().await)?;
        self.run_scan(ScanMode::Incremental, scan_time).await;
        Ok(())
    }

    pub async fn on_scan_gen_all(&self, scan_time: Option<Duration>) -> Result<(), Error> {
        self.require_state(&[BridgeState::LanOnly, BridgeState::Online], self.state().await)?;
        self.run_scan(ScanMode::IncrementalSnapshot, scan_time).await;
        Ok(())
    }

    async fn run_scan(&self, mode: ScanMode, scan_time: Option<Duration>) {
        let _permit = self.dispatch_limit.acquire().await;
        let response_topic = format!(
            "{}/bridge/response/{}",
            self.service_id,
            match mode {
                ScanMode::Basic => "scan",
                ScanMode::Incremental => "scan_gen",
                ScanMode::IncrementalSnapshot => "scan_gen_all",
            }
        );
        let broker = Arc::clone(&self.broker);
        let mut cloud = self.cloud.lock().await;
        let mut scanner = self.scanner.lock().await;
        let result = scanner
            .scan(&mut *cloud, mode, scan_time, |batch| {
                let payload = serde_json::to_vec(batch).unwrap_or_default();
                let broker = Arc::clone(&broker);
                let topic = response_topic.clone();
                tokio::spawn(async move {
                    if let Err(e) = broker.publish(topic, QoS::AtLeastOnce, false, payload).await {
                        tracing::error!(error = %e, "failed to publish scan result");
                    }
                });
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "scan failed");
        }
    }

    pub async fn stop_scan(&self) {
        self.scanner.lock().await.stop_handle().store(true, Ordering::SeqCst);
    }

    pub async fn on_set_scan_time(&self, _seconds: u64) {}

    pub async fn on_friendly_name(&self, dev_id: &str, friendly_name: &str) -> Result<(), Error> {
        self.registry.set_friendly_name(dev_id, friendly_name).await?;
        if let Some(device) = self.registry.get(dev_id).await {
            self.lifecycle.rename(dev_id, &device).await;
        }
        Ok(())
    }

    pub async fn on_remove_device(&self, dev_ids: &[String]) -> Result<Vec<String>, Error> {
        let mut removed = Vec::new();
        for dev_id in dev_ids {
            if self.registry.get(dev_id).await.is_some() {
                self.stop_device_runtime(dev_id).await;
                self.registry.remove(dev_id).await?;
                self.lifecycle.drop_bridge(dev_id).await;
                removed.push(dev_id.clone());
            }
        }
        Ok(removed)
    }

    /// React to an externally published empty retained `homie/5/{id}/$state`: tear down the Tuya
    /// side of a twin that was removed straight from the Homie tree rather than through
    /// `bridge/request/remove`.
    pub async fn on_homie_external_removal(&self, homie_id: &str) -> Result<(), Error> {
        let Some(dev_id) = self.lifecycle.dev_id_for_homie_id(homie_id).await else { return Ok(()) };
        if self.registry.get(&dev_id).await.is_some() {
            self.stop_device_runtime(&dev_id).await;
            self.registry.remove(&dev_id).await?;
            self.lifecycle.drop_bridge(&dev_id).await;
        }
        Ok(())
    }

    /// Handle an incoming Homie `.../set` for one device twin: resolve the Tuya device behind the
    /// Homie id, coerce and enqueue the write through its own command pipeline.
    pub async fn on_homie_set(&self, homie_id: &str, node_id: &str, prop_id: &str, value_raw: &str) -> Result<(), Error> {
        self.require_state(&[BridgeState::LanOnly, BridgeState::Online], self.state().await)?;
        let Some(dev_id) = self.lifecycle.dev_id_for_homie_id(homie_id).await else {
            return Err(Error::UnknownDevice(homie_id.to_string()));
        };
        let Some(bridge) = self.lifecycle.bridge_for(&dev_id).await else {
            return Err(Error::UnknownDevice(dev_id));
        };
        let runtimes = self.runtimes.lock().await;
        let Some(runtime) = runtimes.get(&dev_id) else { return Err(Error::UnknownDevice(dev_id)) };
        let handle = runtime.entity.handle();
        drop(runtimes);
        bridge
            .on_set(&self.broker, node_id, prop_id, value_raw, move |dp_code, value| {
                let mut payload = Map::new();
                payload.insert(dp_code, value);
                tokio::spawn(async move {
                    handle.submit_control(Operation::SetStatus(payload), None).await;
                });
            })
            .await;
        Ok(())
    }

    /// `homie/5/$broadcast/switch_led`: flip `switch_led` on every twin that has one, through
    /// whichever node that property lives under for each device.
    pub async fn on_broadcast_switch_led(&self, value_raw: &str) {
        for (dev_id, bridge) in self.lifecycle.all_bridges().await {
            let Some(node_id) = bridge.node_for_switch_led() else { continue };
            let runtimes = self.runtimes.lock().await;
            let Some(handle) = runtimes.get(&dev_id).map(|rt| rt.entity.handle()) else { continue };
            drop(runtimes);
            bridge
                .on_set(&self.broker, &node_id, "switch_led", value_raw, move |dp_code, value| {
                    let mut payload = Map::new();
                    payload.insert(dp_code, value);
                    tokio::spawn(async move {
                        handle.submit_control(Operation::SetStatus(payload), None).await;
                    });
                })
                .await;
        }
    }

    /// Refreshes one device's local key from the cloud, as the original's `_update_device_key`
    /// does: the MQTT request only carries `device_id`, the new key always comes from the cloud
    /// listing rather than from the caller.
    pub async fn on_update_device_key(&self, dev_id: &str) -> Result<(), Error> {
        self.require_state(&[BridgeState::Online], self.state().await)?;
        let mut cloud = self.cloud.lock().await;
        cloud.set_device_id(dev_id);
        let cloud_devices = cloud.get_devices().await.map_err(|_| Error::NotReady)?;
        drop(cloud);
        let Some(new_key) = cloud_devices
            .iter()
            .find(|d| d.get("id").and_then(Value::as_str) == Some(dev_id))
            .and_then(|d| d.get("key").and_then(Value::as_str))
        else {
            tracing::warn!(dev_id, "device not found in cloud listing, key not updated");
            return Ok(());
        };
        self.registry.set_local_key(dev_id, new_key).await?;
        self.stop_device_runtime(dev_id).await;
        if let Some(device) = self.registry.get(dev_id).await {
            let (Some(ip), Some(local_key)) = (device.ip.clone(), device.local_key.clone()) else {
                return Ok(());
            };
            let transport =
                TcpJsonTransport::new(DeviceAddress { ip, local_key, version: device.version.clone() });
            let entity = DeviceEntity::spawn(&device, transport);
            self.runtimes.lock().await.insert(dev_id.to_string(), DeviceRuntime { entity });
            self.lifecycle.republish_description(&device).await;
        }
        Ok(())
    }

    pub async fn on_add_devices(&self, device_ids: &[String]) -> Result<Vec<crate::registry::DeviceBrief>, Error> {
        self.require_state(&[BridgeState::Online], self.state().await)?;
        let mut cloud = self.cloud.lock().await;
        cloud.set_device_id(&device_ids.join(","));
        let cloud_devices = cloud.get_devices().await.map_err(|_| Error::NotReady)?;
        drop(cloud);
        let (new_devices, joined) = self.registry.add_or_merge(cloud_devices, device_ids).await?;
        self.registry.write_and_load(&joined).await?;
        self.spawn_device_runtimes().await;
        let source = if new_devices.is_empty() { &joined } else { &new_devices };
        let added: Vec<crate::registry::Device> =
            source.iter().filter_map(|v| serde_json::from_value(v.clone()).ok()).collect();
        for device in &added {
            self.lifecycle.create_bridge(device).await;
        }
        let briefs = added.into_iter().map(|d| d.brief()).collect();
        Ok(briefs)
    }

    pub async fn graceful_shutdown(&self) {
        tracing::info!("shutting down bridge");
        self.stop_all_device_runtimes().await;
        self.set_state(BridgeState::Offline).await;
    }
}
