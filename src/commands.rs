pub mod run {
    use crate::bridge::BridgeCore;
    use crate::broker::{Broker, Handler};
    use crate::cloud::TuyaOpenApiClient;
    use crate::homie_bridge::{HomieLifecycle, TemplateManager, TuyaHomieConverter};
    use crate::metrics::MetricsExt;
    use crate::registry::DeviceRegistry;
    use crate::{config, signals};
    use homie5::client::QoS;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Runs the bridge as a long-lived daemon: connects to MQTT, loads the device registry,
    /// spawns one pipeline per device, and serves requests until SIGINT/SIGTERM.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        config: config::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Registry(#[from] crate::registry::Error),
        #[error(transparent)]
        Broker(#[from] crate::broker::Error),
        #[error("mqtt event loop terminated")]
        EventLoop,
        #[error(transparent)]
        Config(#[from] crate::config::Error),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let cfg = args.config;
        let registry = Arc::new(DeviceRegistry::new(cfg.devices_file.clone(), cfg.local_scan_file.clone()));
        let loaded = registry.load().await?;
        tracing::info!(devices = loaded, "loaded device registry");

        let last_will = rumqttc::v5::mqttbytes::v5::LastWill::new(
            format!("{}/bridge/status", config::SERVICE_ID),
            "OFFLINE",
            rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
            true,
            None,
        );
        let (mut broker, event_loop) = Broker::connect(
            config::SERVICE_ID,
            &cfg.mqtt_broker_host,
            cfg.mqtt_broker_port,
            cfg.mqtt_username.as_deref(),
            cfg.mqtt_password.as_deref(),
            Some(last_will),
        );

        // Credentials are mandatory: the original's `CloudAPI._init_cloud` exits(1) the same way
        // when `API_KEY`/`API_SECRET`/`API_REGION` are not all set.
        let credentials = cfg.require_cloud_credentials()?;
        let cloud = TuyaOpenApiClient::new(credentials);
        let initial_state = crate::bridge::determine_net_state().await;

        // `BridgeCore` and the handlers it drives need to publish through the same broker, so the
        // broker is wrapped in an `Arc` only after every handler closure has been registered
        // against it with `&mut self`.
        let bridge_cell = Arc::new(tokio::sync::OnceCell::<Arc<BridgeCore<TuyaOpenApiClient>>>::new());
        register_handlers(&mut broker, Arc::clone(&bridge_cell));

        let broker = Arc::new(broker);
        let metrics = Arc::new(MetricsExt::new(
            config::SERVICE_ID,
            Arc::clone(&broker),
            Duration::from_secs(cfg.metrics_interval_secs),
        ));

        // `HomieLifecycle` is built before `BridgeCore` so its twins exist (and can be notified
        // from `BridgeCore`'s own handlers) from the moment the bridge starts dispatching.
        let templates = TemplateManager::load(&cfg.homie_templates_dir);
        let converter = TuyaHomieConverter::new(templates);
        let lifecycle = Arc::new(HomieLifecycle::new(converter, Arc::clone(&broker)));
        for device in registry.all().await {
            lifecycle.create_bridge(&device).await;
        }

        let bridge = Arc::new(BridgeCore::new(
            Arc::clone(&broker),
            Arc::clone(&registry),
            cloud,
            Arc::clone(&metrics),
            Duration::from_secs_f64(cfg.poll_interval),
            initial_state,
            Arc::clone(&lifecycle),
        ));
        bridge_cell
            .set(Arc::clone(&bridge))
            .unwrap_or_else(|_| unreachable!("set exactly once before the broker starts dispatching"));
        bridge.spawn_device_runtimes().await;

        let broker_subscriptions = [
            format!("{}/bridge/request/scan", config::SERVICE_ID),
            format!("{}/bridge/request/scan_gen", config::SERVICE_ID),
            format!("{}/bridge/request/scan_gen_all", config::SERVICE_ID),
            format!("{}/bridge/request/stop_scan", config::SERVICE_ID),
            format!("{}/bridge/request/scan_time", config::SERVICE_ID),
            format!("{}/bridge/request/remove", config::SERVICE_ID),
            format!("{}/bridge/request/add", config::SERVICE_ID),
            format!("{}/bridge/request/update_key", config::SERVICE_ID),
            format!("{}/bridge/request/friendly_name", config::SERVICE_ID),
            format!("{}/devices/+/set", config::SERVICE_ID),
            "homie/5/+/+/+/set".to_string(),
            "homie/5/+/$state".to_string(),
            "homie/5/$broadcast/switch_led".to_string(),
        ];
        for topic in broker_subscriptions {
            broker.subscribe(topic, QoS::AtLeastOnce).await?;
        }

        let cancel = CancellationToken::new();
        let metrics_task = tokio::spawn(Arc::clone(&metrics).run(cancel.clone()));
        let poll_task = tokio::spawn(Arc::clone(&bridge).run_poll_loop());
        let shutdown_task = tokio::spawn(signals::wait_for_shutdown(cancel.clone()));

        tokio::select! {
            result = broker.run(event_loop) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "mqtt event loop terminated");
                }
            }
            _ = cancel.cancelled() => {}
        }

        poll_task.abort();
        metrics_task.abort();
        let _ = shutdown_task.await;
        bridge.graceful_shutdown().await;
        Ok(())
    }

    /// Registers every request-topic handler against the not-yet-shared `Broker`. Each handler
    /// closure captures the cell rather than the bridge directly, since `BridgeCore` cannot be
    /// constructed until after the broker it publishes through has been wrapped in its final
    /// `Arc` — by the time any message is dispatched the cell is always populated.
    fn register_handlers(broker: &mut Broker, bridge: Arc<tokio::sync::OnceCell<Arc<BridgeCore<TuyaOpenApiClient>>>>) {
        let sid = config::SERVICE_ID;

        let on_scan: Handler = {
            let bridge = Arc::clone(&bridge);
            Arc::new(move |_publish| {
                let Some(bridge) = bridge.get().cloned() else { return };
                tokio::spawn(async move {
                    if let Err(e) = bridge.on_scan().await {
                        tracing::warn!(error = %e, "scan request rejected");
                    }
                });
            })
        };
        broker.on(format!("{sid}/bridge/request/scan"), on_scan);

        let on_scan_gen: Handler = {
            let bridge = Arc::clone(&bridge);
            Arc::new(move |publish| {
                let Some(bridge) = bridge.get().cloned() else { return };
                let scan_time = scan_time_from_payload(&publish.payload);
                tokio::spawn(async move {
                    if let Err(e) = bridge.on_scan_gen(scan_time).await {
                        tracing::warn!(error = %e, "scan_gen request rejected");
                    }
                });
            })
        };
        broker.on(format!("{sid}/bridge/request/scan_gen"), on_scan_gen);

        let on_scan_gen_all: Handler = {
            let bridge = Arc::clone(&bridge);
            Arc::new(move |publish| {
                let Some(bridge) = bridge.get().cloned() else { return };
                let scan_time = scan_time_from_payload(&publish.payload);
                tokio::spawn(async move {
                    if let Err(e) = bridge.on_scan_gen_all(scan_time).await {
                        tracing::warn!(error = %e, "scan_gen_all request rejected");
                    }
                });
            })
        };
        broker.on(format!("{sid}/bridge/request/scan_gen_all"), on_scan_gen_all);

        let on_stop_scan: Handler = {
            let bridge = Arc::clone(&bridge);
            Arc::new(move |_publish| {
                let Some(bridge) = bridge.get().cloned() else { return };
                tokio::spawn(async move { bridge.stop_scan().await });
            })
        };
        broker.on(format!("{sid}/bridge/request/stop_scan"), on_stop_scan);

        let on_device_command: Handler = {
            let bridge = Arc::clone(&bridge);
            Arc::new(move |publish| {
                let Some(bridge) = bridge.get().cloned() else { return };
                let Ok(topic) = std::str::from_utf8(&publish.topic) else { return };
                let parts: Vec<&str> = topic.split('/').collect();
                let Some(ident) = parts.get(2).map(|s| s.to_string()) else { return };
                let payload = publish.payload.to_vec();
                tokio::spawn(async move {
                    if let Err(e) = bridge.on_device_command(&ident, &payload).await {
                        tracing::warn!(error = %e, "device command failed");
                    }
                });
            })
        };
        broker.on(format!("{sid}/devices/+/set"), on_device_command);

        let on_remove: Handler = {
            let bridge = Arc::clone(&bridge);
            Arc::new(move |publish| {
                let Some(bridge) = bridge.get().cloned() else { return };
                let payload = publish.payload.to_vec();
                tokio::spawn(async move {
                    let Ok(v) = serde_json::from_slice::<serde_json::Value>(&payload) else { return };
                    let Some(ids) = v.get("device_ids").and_then(|x| x.as_array()) else { return };
                    let ids: Vec<String> = ids.iter().filter_map(|x| x.as_str().map(str::to_string)).collect();
                    let _ = bridge.on_remove_device(&ids).await;
                });
            })
        };
        broker.on(format!("{sid}/bridge/request/remove"), on_remove);

        let on_add: Handler = {
            let bridge = Arc::clone(&bridge);
            Arc::new(move |publish| {
                let Some(bridge) = bridge.get().cloned() else { return };
                let payload = publish.payload.to_vec();
                tokio::spawn(async move {
                    let Ok(v) = serde_json::from_slice::<serde_json::Value>(&payload) else { return };
                    let Some(ids) = v.get("device_ids").and_then(|x| x.as_array()) else { return };
                    let ids: Vec<String> = ids.iter().filter_map(|x| x.as_str().map(str::to_string)).collect();
                    if let Err(e) = bridge.on_add_devices(&ids).await {
                        tracing::warn!(error = %e, "add_devices request failed");
                    }
                });
            })
        };
        broker.on(format!("{sid}/bridge/request/add"), on_add);

        let on_update_key: Handler = {
            let bridge = Arc::clone(&bridge);
            Arc::new(move |publish| {
                let Some(bridge) = bridge.get().cloned() else { return };
                let payload = publish.payload.to_vec();
                tokio::spawn(async move {
                    let Ok(v) = serde_json::from_slice::<serde_json::Value>(&payload) else { return };
                    let Some(dev_id) = v.get("device_id").and_then(|x| x.as_str()).map(str::to_string) else {
                        return;
                    };
                    if let Err(e) = bridge.on_update_device_key(&dev_id).await {
                        tracing::warn!(error = %e, "update_key request failed");
                    }
                });
            })
        };
        broker.on(format!("{sid}/bridge/request/update_key"), on_update_key);

        let on_friendly_name: Handler = {
            let bridge = Arc::clone(&bridge);
            Arc::new(move |publish| {
                let Some(bridge) = bridge.get().cloned() else { return };
                let payload = publish.payload.to_vec();
                tokio::spawn(async move {
                    let Ok(v) = serde_json::from_slice::<serde_json::Value>(&payload) else { return };
                    let (Some(dev_id), Some(name)) = (
                        v.get("device_id").and_then(|x| x.as_str()),
                        v.get("friendly_name").and_then(|x| x.as_str()),
                    ) else {
                        return;
                    };
                    let _ = bridge.on_friendly_name(dev_id, name).await;
                });
            })
        };
        broker.on(format!("{sid}/bridge/request/friendly_name"), on_friendly_name);

        let on_scan_time: Handler = {
            let bridge = Arc::clone(&bridge);
            Arc::new(move |publish| {
                let Some(bridge) = bridge.get().cloned() else { return };
                let Ok(v) = serde_json::from_slice::<serde_json::Value>(&publish.payload) else { return };
                let Some(seconds) = v.get("seconds").and_then(|x| x.as_u64()) else { return };
                tokio::spawn(async move { bridge.on_set_scan_time(seconds).await });
            })
        };
        broker.on(format!("{sid}/bridge/request/scan_time"), on_scan_time);

        let on_homie_set: Handler = {
            let bridge = Arc::clone(&bridge);
            Arc::new(move |publish| {
                let Some(bridge) = bridge.get().cloned() else { return };
                let Ok(topic) = std::str::from_utf8(&publish.topic) else { return };
                let parts: Vec<&str> = topic.split('/').collect();
                // homie / 5 / {homie_id} / {node_id} / {prop_id} / set
                let (Some(homie_id), Some(node_id), Some(prop_id)) = (parts.get(2), parts.get(3), parts.get(4)) else {
                    return;
                };
                let (homie_id, node_id, prop_id) = (homie_id.to_string(), node_id.to_string(), prop_id.to_string());
                let Ok(value_raw) = std::str::from_utf8(&publish.payload) else { return };
                let value_raw = value_raw.to_string();
                tokio::spawn(async move {
                    if let Err(e) = bridge.on_homie_set(&homie_id, &node_id, &prop_id, &value_raw).await {
                        tracing::warn!(error = %e, "homie set request failed");
                    }
                });
            })
        };
        broker.on("homie/5/+/+/+/set", on_homie_set);

        let on_homie_state: Handler = {
            let bridge = Arc::clone(&bridge);
            Arc::new(move |publish| {
                let Some(bridge) = bridge.get().cloned() else { return };
                if !publish.payload.is_empty() {
                    return;
                }
                let Ok(topic) = std::str::from_utf8(&publish.topic) else { return };
                let parts: Vec<&str> = topic.split('/').collect();
                let Some(homie_id) = parts.get(2).map(|s| s.to_string()) else { return };
                tokio::spawn(async move {
                    if let Err(e) = bridge.on_homie_external_removal(&homie_id).await {
                        tracing::warn!(error = %e, "homie external removal failed");
                    }
                });
            })
        };
        broker.on("homie/5/+/$state", on_homie_state);

        let on_broadcast_switch_led: Handler = {
            let bridge = Arc::clone(&bridge);
            Arc::new(move |publish| {
                let Some(bridge) = bridge.get().cloned() else { return };
                let Ok(payload) = std::str::from_utf8(&publish.payload) else { return };
                let val = payload.trim().to_lowercase();
                if val != "true" && val != "false" {
                    tracing::debug!(payload, "ignoring unexpected switch_led broadcast payload");
                    return;
                }
                tokio::spawn(async move { bridge.on_broadcast_switch_led(&val).await });
            })
        };
        broker.on("homie/5/$broadcast/switch_led", on_broadcast_switch_led);
    }

    fn scan_time_from_payload(payload: &[u8]) -> Option<Duration> {
        let v: serde_json::Value = serde_json::from_slice(payload).ok()?;
        v.get("scan_time").and_then(|x| x.as_u64()).map(Duration::from_secs)
    }
}

pub mod devices {
    use crate::registry::{DeviceBrief, DeviceRegistry};
    use csv_core::WriteResult;
    use std::io::Write;
    use std::path::PathBuf;

    #[derive(clap::ValueEnum, Clone, Debug)]
    pub enum Format {
        Table,
        Jsonl,
        Csv,
    }

    /// Lists the devices currently in the local registry.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Path to the persisted device list.
        #[arg(long, default_value = "devices.json")]
        devices_file: PathBuf,
        /// Path to the latest local scan snapshot (unused for listing, kept for symmetry).
        #[arg(long, default_value = "local_scan.json")]
        local_scan_file: PathBuf,
        /// Write the listing to this file instead of stdout.
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Listing format.
        #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
        format: Format,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Registry(#[from] crate::registry::Error),
        #[error("could not open the output file at {1:?}")]
        OpenOutputFile(#[source] std::io::Error, PathBuf),
        #[error("could not write the device listing")]
        Write(#[source] std::io::Error),
        #[error("could not serialize a device to JSON")]
        SerializeJson(#[source] serde_json::Error),
    }

    const HEADERS: [&str; 5] = ["ID", "Label", "Friendly Name", "Category", "DP Count"];

    pub async fn run(args: Args) -> Result<(), Error> {
        let registry = DeviceRegistry::new(args.devices_file, args.local_scan_file);
        registry.load().await?;
        let briefs: Vec<DeviceBrief> = registry.all().await.iter().map(|d| d.brief()).collect();

        let mut io: Box<dyn Write> = match &args.output {
            None => Box::new(std::io::stdout().lock()),
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ),
        };

        match args.format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                table.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                table.set_header(HEADERS);
                for brief in &briefs {
                    table.add_row(brief_row(brief));
                }
                write!(io, "{table}").map_err(Error::Write)?;
            }
            Format::Jsonl => {
                for brief in &briefs {
                    serde_json::to_writer(&mut io, brief).map_err(Error::SerializeJson)?;
                    writeln!(io).map_err(Error::Write)?;
                }
            }
            Format::Csv => {
                write_csv_row(&mut *io, &HEADERS)?;
                for brief in &briefs {
                    let row = brief_row(brief);
                    write_csv_row(&mut *io, &[&row[0], &row[1], &row[2], &row[3], &row[4]])?;
                }
            }
        }
        io.flush().map_err(Error::Write)
    }

    fn brief_row(brief: &DeviceBrief) -> [String; 5] {
        [
            brief.id.clone(),
            brief.label.clone(),
            brief.friendly_name.clone(),
            brief.category.clone(),
            brief.dp_map.len().to_string(),
        ]
    }

    fn write_csv_row(io: &mut dyn Write, values: &[&str]) -> Result<(), Error> {
        let max_len = 2 + 2 * values.iter().map(|v| v.len()).max().unwrap_or(0);
        let mut buf = vec![0u8; max_len];
        let mut writer = csv_core::Writer::new();
        for value in values {
            let (WriteResult::InputEmpty, _, ob) = writer.field(value.as_bytes(), &mut buf) else {
                panic!("csv field buffer undersized");
            };
            io.write_all(&buf[..ob]).map_err(Error::Write)?;
            let (WriteResult::InputEmpty, ob) = writer.delimiter(&mut buf) else {
                panic!("csv delimiter buffer undersized");
            };
            io.write_all(&buf[..ob]).map_err(Error::Write)?;
        }
        let (WriteResult::InputEmpty, ob) = writer.terminator(&mut buf) else {
            panic!("csv terminator buffer undersized");
        };
        io.write_all(&buf[..ob]).map_err(Error::Write)
    }
}
