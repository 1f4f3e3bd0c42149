//! Local-network discovery: listens on Tuya's three UDP broadcast ports, decodes device
//! announcements, and merges each newly seen device with the Tuya cloud. Grounded in the
//! original's `bridge/scanner.py`; socket setup follows the `socket2` + `spawn_blocking` +
//! `UdpSocket::from_std` pattern used elsewhere in the retrieval pack for broadcast discovery.

use crate::cloud::CloudClient;
use crate::registry::DeviceRegistry;
use serde_json::Value;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

const UDP_PORT: u16 = 6666;
const UDP_PORTS: u16 = 6667;
const UDP_PORT_APP: u16 = 6669;
const DEFAULT_SCAN_TIME: Duration = Duration::from_secs(15);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not bind discovery socket on port {1}")]
    Bind(#[source] std::io::Error, u16),
}

/// How a scan should report what it finds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScanMode {
    /// `scan`: one publish at the end, containing everything found.
    Basic,
    /// `scan_gen`: one publish per newly discovered device.
    Incremental,
    /// `scan_gen_all`: one publish per newly discovered device, each carrying the full
    /// cumulative snapshot so far (insertion order preserved).
    IncrementalSnapshot,
}

/// One decoded broadcast packet, prior to any cloud merge.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub ip: String,
    pub dev_id: String,
    pub mac: Option<String>,
    pub raw: serde_json::Map<String, Value>,
}

fn bind_udp(port: u16) -> Result<Socket, Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| Error::Bind(e, port))?;
    socket.set_nonblocking(true).map_err(|e| Error::Bind(e, port))?;
    socket.set_broadcast(true).map_err(|e| Error::Bind(e, port))?;
    socket.set_reuse_address(true).map_err(|e| Error::Bind(e, port))?;
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into()).map_err(|e| Error::Bind(e, port))?;
    Ok(socket)
}

async fn open_listeners() -> Result<[UdpSocket; 3], Error> {
    let sockets = tokio::task::spawn_blocking(|| -> Result<[Socket; 3], Error> {
        Ok([bind_udp(UDP_PORT)?, bind_udp(UDP_PORTS)?, bind_udp(UDP_PORT_APP)?])
    })
    .await
    .expect("socket setup task panicked")?;
    let [a, b, c] = sockets;
    Ok([
        UdpSocket::from_std(a.into()).expect("socket already configured non-blocking"),
        UdpSocket::from_std(b.into()).expect("socket already configured non-blocking"),
        UdpSocket::from_std(c.into()).expect("socket already configured non-blocking"),
    ])
}

/// Decodes a broadcast payload. The real Tuya UDP framing is AES-encrypted; since
/// [`crate::transport::TcpJsonTransport`] is a plaintext JSON stand-in, the broadcast payload
/// here is expected to already be a JSON object (no `tinytuya.decrypt_udp` step).
fn decode_announcement(ip: std::net::IpAddr, data: &[u8]) -> Option<Announcement> {
    let value: Value = serde_json::from_slice(data).ok()?;
    let mut raw = value.as_object()?.clone();
    let gw_id = raw.get("gwId").and_then(Value::as_str)?.to_string();
    let mac = raw.get("mac").and_then(Value::as_str).map(str::to_string).or_else(|| {
        if gw_id.len() == 20 {
            hex_to_mac(&gw_id[gw_id.len() - 12..])
        } else {
            None
        }
    });
    if let Some(mac) = &mac {
        raw.insert("mac".into(), Value::String(mac.clone()));
    }
    raw.entry("id").or_insert_with(|| Value::String(gw_id.clone()));
    raw.insert("ip".into(), Value::String(ip.to_string()));
    raw.insert("origin".into(), Value::String("broadcast".into()));
    Some(Announcement { ip: ip.to_string(), dev_id: gw_id, mac, raw })
}

fn hex_to_mac(hex: &str) -> Option<String> {
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let bytes: Vec<String> = (0..12).step_by(2).map(|i| hex[i..i + 2].to_string()).collect();
    Some(bytes.join(":"))
}

/// Scans the LAN, publishing results through `publish` per [`ScanMode`], merging every new
/// device with the cloud, and persisting the raw scan snapshot. Returns once `scan_time` elapses
/// or `stop` is flipped.
///
/// Does not own a [`CloudClient`]: a scan is an infrequent, exclusive operation, and the cloud
/// client lives behind `BridgeCore`'s single `tokio::sync::Mutex`, so the caller passes its guard
/// in for the duration of one scan rather than the scanner holding a client of its own.
pub struct Scanner {
    registry: Arc<DeviceRegistry>,
    stop: Arc<AtomicBool>,
}

impl Scanner {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry, stop: Arc::new(AtomicBool::new(false)) }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub async fn scan<C, F>(
        &mut self,
        cloud: &mut C,
        mode: ScanMode,
        scan_time: Option<Duration>,
        mut publish: F,
    ) -> Result<(), Error>
    where
        C: CloudClient,
        F: FnMut(&serde_json::Map<String, Value>),
    {
        self.stop.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + scan_time.unwrap_or(DEFAULT_SCAN_TIME);
        let sockets = open_listeners().await?;
        let mut seen_ips: HashMap<String, ()> = HashMap::new();
        let mut cumulative = serde_json::Map::new();
        let mut new_scan_entries = Vec::new();

        while Instant::now() < deadline && !self.stop.load(Ordering::SeqCst) {
            let mut buf0 = [0u8; 4096];
            let mut buf1 = [0u8; 4096];
            let mut buf2 = [0u8; 4096];
            let remaining = deadline.saturating_duration_since(Instant::now()).min(Duration::from_secs(1));
            let recv = tokio::time::timeout(remaining, async {
                tokio::select! {
                    r = sockets[0].recv_from(&mut buf0) => r.map(|(n, addr)| (n, addr, 0)),
                    r = sockets[1].recv_from(&mut buf1) => r.map(|(n, addr)| (n, addr, 1)),
                    r = sockets[2].recv_from(&mut buf2) => r.map(|(n, addr)| (n, addr, 2)),
                }
            })
            .await;
            let Ok(Ok((n, addr, which))) = recv else { continue };
            if seen_ips.contains_key(&addr.ip().to_string()) {
                continue;
            }
            let buf = match which {
                0 => &buf0,
                1 => &buf1,
                _ => &buf2,
            };
            let Some(announcement) = decode_announcement(addr.ip(), &buf[..n]) else { continue };
            seen_ips.insert(announcement.ip.clone(), ());
            new_scan_entries.push((announcement.ip.clone(), Value::Object(announcement.raw.clone())));

            let Some(merged) = self.merge_with_cloud(cloud, announcement).await else { continue };
            match mode {
                ScanMode::Basic => {
                    cumulative.insert(merged.0, merged.1);
                }
                ScanMode::Incremental => {
                    let mut single = serde_json::Map::new();
                    single.insert(merged.0.clone(), merged.1.clone());
                    publish(&single);
                    cumulative.insert(merged.0, merged.1);
                }
                ScanMode::IncrementalSnapshot => {
                    cumulative.insert(merged.0, merged.1);
                    publish(&cumulative);
                }
            }
        }

        if mode == ScanMode::Basic {
            publish(&cumulative);
        }
        if cumulative.is_empty() {
            publish(&serde_json::Map::new());
        }
        if let Err(e) = self.registry.merge_local_scan(&new_scan_entries).await {
            tracing::error!(error = %e, "failed to persist local scan snapshot");
        }
        Ok(())
    }

    /// For one freshly discovered device, look it up on the cloud unless it is already known to
    /// the registry — in which case the announcement is skipped entirely and never re-emitted —
    /// and fold in `name`/`product_name`/`mac`/`icon` on a match.
    async fn merge_with_cloud<C: CloudClient>(
        &mut self,
        cloud: &mut C,
        announcement: Announcement,
    ) -> Option<(String, Value)> {
        if self.registry.get(&announcement.dev_id).await.is_some() {
            return None;
        }
        let mut entry = announcement.raw;
        entry.insert("merge_with_cloud".into(), Value::Bool(false));
        cloud.set_device_id(&announcement.dev_id);
        match cloud.get_devices().await {
            Ok(devices) => {
                if let Some(cloud_dev) = devices.iter().find(|d| d.get("id").and_then(Value::as_str) == Some(announcement.dev_id.as_str())) {
                    entry.insert("merge_with_cloud".into(), Value::Bool(true));
                    for key in ["name", "product_name", "mac", "icon"] {
                        if let Some(v) = cloud_dev.get(key) {
                            entry.insert(key.into(), v.clone());
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!(dev_id = %announcement.dev_id, error = %e, "cloud merge skipped");
            }
        }
        Some((announcement.ip, Value::Object(entry)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_20_hex_id_into_mac() {
        let mac = hex_to_mac("a1b2c3d4e5f6").unwrap();
        assert_eq!(mac, "a1:b2:c3:d4:e5:f6");
    }

    #[test]
    fn decode_announcement_extracts_gwid_and_ip() {
        let payload = serde_json::json!({"gwId": "abc123"});
        let bytes = serde_json::to_vec(&payload).unwrap();
        let a = decode_announcement("192.0.2.5".parse().unwrap(), &bytes).unwrap();
        assert_eq!(a.dev_id, "abc123");
        assert_eq!(a.ip, "192.0.2.5");
    }

    #[test]
    fn decode_announcement_rejects_missing_gwid() {
        let payload = serde_json::json!({"foo": "bar"});
        let bytes = serde_json::to_vec(&payload).unwrap();
        assert!(decode_announcement("192.0.2.5".parse().unwrap(), &bytes).is_none());
    }
}
