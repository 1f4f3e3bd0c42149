//! `DeviceRegistry`: the in-memory map of known devices, their friendly-name index, and the
//! on-disk persisted configuration. Grounded in the original's `core/device_repository.py`.

use crate::dp::{self, DpMap, DpMapping};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read {1:?}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("could not parse {1:?} as JSON")]
    Parse(#[source] serde_json::Error, PathBuf),
    #[error("could not write {1:?}")]
    Write(#[source] std::io::Error, PathBuf),
    #[error("could not serialize device list")]
    Serialize(#[source] serde_json::Error),
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("no local scan file is present; run a scan before adding devices")]
    NoLocalScan,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default, rename = "key")]
    pub local_key: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub mapping: DpMap,
    /// Fields the Tuya cloud returns that are not otherwise modeled; preserved so the Homie
    /// converter's `extensions.tuya` projection has access to them.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_version() -> String {
    "3.4".to_string()
}

impl Device {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn brief(&self) -> DeviceBrief {
        let mut dp_map = HashMap::new();
        for m in self.mapping.values() {
            let info = dp::dp_type_info(&m.code);
            dp_map.insert(
                m.code.clone(),
                info.map(|i| serde_json::json!({"type": i.kind, "range": i.range})),
            );
        }
        DeviceBrief {
            id: self.id.clone(),
            label: self
                .extra
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(&self.id)
                .to_string(),
            friendly_name: self.friendly_name.clone().unwrap_or_default(),
            category: self
                .category
                .as_deref()
                .and_then(dp::device_category_label)
                .unwrap_or("")
                .to_string(),
            dp_map,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct DeviceBrief {
    pub id: String,
    pub label: String,
    pub friendly_name: String,
    pub category: String,
    pub dp_map: HashMap<String, Option<Value>>,
}

struct Inner {
    devices: HashMap<String, Device>,
    name_to_id: HashMap<String, String>,
}

/// Thread-safe registry of [`Device`]s. All mutation and file I/O goes through a single
/// `tokio::sync::Mutex`, matching the original's single re-entrant lock around both maps and
/// all file access.
pub struct DeviceRegistry {
    inner: Mutex<Inner>,
    devices_file: PathBuf,
    local_scan_file: PathBuf,
}

impl DeviceRegistry {
    pub fn new(devices_file: PathBuf, local_scan_file: PathBuf) -> Self {
        Self {
            inner: Mutex::new(Inner {
                devices: HashMap::new(),
                name_to_id: HashMap::new(),
            }),
            devices_file,
            local_scan_file,
        }
    }

    /// Reads a JSON file containing an array of objects, returning an empty vec if the file is
    /// absent or malformed (logged, never fatal — matching the original's `read()`).
    async fn read_array(path: &Path) -> Vec<Value> {
        match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<Value>>(&bytes) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(?path, error = %e, "error reading device config, ignoring");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(?path, "config file not found");
                Vec::new()
            }
            Err(e) => {
                tracing::error!(?path, error = %e, "error reading device config");
                Vec::new()
            }
        }
    }

    async fn read_object(path: &Path) -> Option<serde_json::Map<String, Value>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).ok(),
            Err(_) => None,
        }
    }

    async fn write_json(path: &Path, value: &Value) -> Result<(), Error> {
        let bytes = serde_json::to_vec_pretty(value).map_err(Error::Serialize)?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| Error::Write(e, path.to_path_buf()))
    }

    /// Hydrate the registry from the persisted `devices.json` file. Returns the number of
    /// devices loaded.
    pub async fn load(&self) -> Result<usize, Error> {
        let raw = Self::read_array(&self.devices_file).await;
        let mut inner = self.inner.lock().await;
        inner.devices.clear();
        let mut n = 0;
        for entry in raw {
            match serde_json::from_value::<Device>(entry) {
                Ok(dev) => {
                    inner.devices.insert(dev.id.clone(), dev);
                    n += 1;
                }
                Err(e) => tracing::error!(error = %e, "skipping malformed device entry"),
            }
        }
        Self::rebuild_name_index(&mut inner);
        Ok(n)
    }

    fn rebuild_name_index(inner: &mut Inner) {
        inner.name_to_id = inner
            .devices
            .values()
            .filter_map(|d| d.friendly_name.clone().map(|n| (n, d.id.clone())))
            .collect();
    }

    pub async fn get(&self, dev_id: &str) -> Option<Device> {
        self.inner.lock().await.devices.get(dev_id).cloned()
    }

    pub async fn all(&self) -> Vec<Device> {
        self.inner.lock().await.devices.values().cloned().collect()
    }

    /// Resolve an identifier that may be either a `dev_id` or a registered friendly name.
    pub async fn resolve(&self, identifier: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        if inner.devices.contains_key(identifier) {
            Some(identifier.to_string())
        } else {
            inner.name_to_id.get(identifier).cloned()
        }
    }

    pub async fn set_friendly_name(&self, dev_id: &str, friendly_name: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        let dev = inner
            .devices
            .get_mut(dev_id)
            .ok_or_else(|| Error::UnknownDevice(dev_id.to_string()))?;
        dev.friendly_name = Some(friendly_name.to_string());
        Self::rebuild_name_index(&mut inner);
        drop(inner);
        self.persist().await
    }

    pub async fn set_local_key(&self, dev_id: &str, local_key: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        let dev = inner
            .devices
            .get_mut(dev_id)
            .ok_or_else(|| Error::UnknownDevice(dev_id.to_string()))?;
        dev.local_key = Some(local_key.to_string());
        drop(inner);
        self.persist().await
    }

    pub async fn remove(&self, dev_id: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.devices.remove(dev_id);
        Self::rebuild_name_index(&mut inner);
        drop(inner);
        self.persist().await
    }

    /// Auto-extend a device's mapping with a placeholder entry for a DP number the bridge has
    /// never seen described, then persist.
    pub async fn insert_unknown_dp(&self, dev_id: &str, dp_num: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if let Some(dev) = inner.devices.get_mut(dev_id) {
            dev.mapping.entry(dp_num.to_string()).or_insert(DpMapping {
                code: dp_num.to_string(),
                dp_type: "Unknown".to_string(),
                values: serde_json::json!({}),
            });
        }
        drop(inner);
        self.persist().await
    }

    async fn persist(&self) -> Result<(), Error> {
        let inner = self.inner.lock().await;
        let array: Vec<Value> = inner.devices.values().map(Device::to_value).collect();
        drop(inner);
        Self::write_json(&self.devices_file, &Value::Array(array)).await
    }

    /// Join a local scan snapshot with a cloud response for a set of requested ids.
    ///
    /// Mirrors `join_local_and_cloud_configs`: for each cloud entry, find the matching local-scan
    /// record by substring match against `gwId`, copy `ip`/`version` across, then either append
    /// onto the existing persisted config (when one exists, restricted to `id_whitelist` and not
    /// already present) or build a filtered list from scratch.
    ///
    /// Returns `(newly_added, joined_config)`.
    pub async fn add_or_merge(
        &self,
        cloud_entries: Vec<Value>,
        id_whitelist: &[String],
    ) -> Result<(Vec<Value>, Vec<Value>), Error> {
        let local_scan = Self::read_object(&self.local_scan_file)
            .await
            .ok_or(Error::NoLocalScan)?;

        let mut joined = Vec::new();
        for mut dev in cloud_entries {
            let Some(dev_id) = dev.get("id").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            for scan_record in local_scan.values() {
                if scan_record.get("Error").is_some() || scan_record.get("Err").is_some() {
                    continue;
                }
                let gw_id = scan_record.get("gwId").and_then(Value::as_str).unwrap_or("");
                if gw_id.contains(&dev_id) {
                    if let Some(obj) = dev.as_object_mut() {
                        obj.insert("ip".into(), scan_record["ip"].clone());
                        obj.insert("version".into(), scan_record["version"].clone());
                    }
                    joined.push(dev);
                    break;
                }
            }
        }

        let whitelist: std::collections::HashSet<&str> =
            id_whitelist.iter().map(String::as_str).collect();
        let current = Self::read_array(&self.devices_file).await;
        if !current.is_empty() {
            let present: std::collections::HashSet<&str> = current
                .iter()
                .filter_map(|d| d.get("id").and_then(Value::as_str))
                .collect();
            let mut new_devices = Vec::new();
            let mut merged = current.clone();
            for dev in joined {
                let Some(dev_id) = dev.get("id").and_then(Value::as_str).map(str::to_string) else {
                    continue;
                };
                if !present.contains(dev_id.as_str()) && whitelist.contains(dev_id.as_str()) {
                    merged.push(dev.clone());
                    new_devices.push(dev);
                }
            }
            Ok((new_devices, merged))
        } else {
            let filtered: Vec<Value> = joined
                .into_iter()
                .filter(|d| {
                    d.get("id")
                        .and_then(Value::as_str)
                        .is_some_and(|id| whitelist.contains(id))
                })
                .collect();
            Ok((Vec::new(), filtered))
        }
    }

    /// Persist an already-joined config array and reload the in-memory registry from it.
    pub async fn write_and_load(&self, joined_config: &[Value]) -> Result<usize, Error> {
        Self::write_json(&self.devices_file, &Value::Array(joined_config.to_vec())).await?;
        self.load().await
    }

    /// Merge newly discovered `ip -> record` entries into the local scan file without
    /// overwriting any pre-existing key.
    pub async fn merge_local_scan(&self, new_entries: &[(String, Value)]) -> Result<(), Error> {
        let mut scan = Self::read_object(&self.local_scan_file).await.unwrap_or_default();
        for (ip, record) in new_entries {
            scan.entry(ip.clone()).or_insert_with(|| record.clone());
        }
        Self::write_json(&self.local_scan_file, &Value::Object(scan)).await
    }
}
