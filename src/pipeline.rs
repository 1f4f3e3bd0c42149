//! `DeviceEntity` + its command pipeline: a priority queue with TTL-drop semantics, a dedicated
//! worker task, and the command-translation policies that turn a high-level request into
//! [`crate::transport::LocalTransport`] calls. Grounded in the original's
//! `core/tuya_device_entity.py`.

use crate::dp;
use crate::registry::Device;
use crate::transport::{Dps, Error as TransportError, LocalTransport};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("the device worker is shutting down")]
    ShuttingDown,
}

/// A request the worker ultimately turns into one or more [`LocalTransport`] calls.
#[derive(Debug, Clone)]
pub enum Operation {
    Switch(SwitchPayload),
    ToggleSwitch { dp_code: String },
    Brightness(i64),
    ColorTemp(i64),
    ColorHsv([f64; 3]),
    ColorRgb([u8; 3]),
    Mode(String),
    /// API-v1 `scene` command: accepted, has no effect, matching the reference no-op.
    Scene,
    SetStatus(serde_json::Map<String, Value>),
    UpdateStatus,
}

#[derive(Debug, Clone)]
pub enum SwitchPayload {
    Simple(bool),
    Channel { state: bool, switch_num: u32 },
}

pub type CommandResult = Result<Dps, TransportError>;
pub type Callback = Box<dyn FnOnce(CommandResult, Duration) + Send>;

struct Command {
    priority: u8,
    seq: u64,
    op: Operation,
    callback: Option<Callback>,
    enq_time: Instant,
    ttl: Duration,
}

impl Command {
    fn key(&self) -> (u8, std::cmp::Reverse<u64>) {
        // BinaryHeap is a max-heap; we want priority 0 (control) dequeued before priority 1
        // (poll), and within equal priority, the lowest sequence number first.
        (u8::MAX - self.priority, std::cmp::Reverse(self.seq))
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for Command {}
impl PartialOrd for Command {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Command {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

const PRIORITY_CONTROL: u8 = 0;
const PRIORITY_POLL: u8 = 1;
const DEFAULT_TTL_CONTROL: Duration = Duration::from_millis(5_000);
const DEFAULT_TTL_POLL: Duration = Duration::from_millis(800);

struct Queue {
    heap: Mutex<BinaryHeap<Command>>,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl Queue {
    fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    async fn push(&self, cmd: Command) {
        self.heap.lock().await.push(cmd);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn pop(&self) -> Option<Command> {
        loop {
            {
                let mut heap = self.heap.lock().await;
                if let Some(cmd) = heap.pop() {
                    return Some(cmd);
                }
            }
            if self.closed.load(AtomicOrdering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Drain whatever is left, resolving each callback with a shutdown error so every enqueued
    /// command still receives exactly one callback invocation.
    async fn drain(&self) {
        let mut heap = self.heap.lock().await;
        while let Some(cmd) = heap.pop() {
            if let Some(cb) = cmd.callback {
                cb(Err(TransportError::Offline), Duration::ZERO);
            }
        }
    }
}

/// A handle used to submit work to a running device worker.
#[derive(Clone)]
pub struct PipelineHandle {
    queue: Arc<Queue>,
    seq: Arc<AtomicU64>,
}

impl PipelineHandle {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    async fn enqueue(&self, op: Operation, priority: u8, ttl: Duration, callback: Option<Callback>) {
        let cmd = Command {
            priority,
            seq: self.next_seq(),
            op,
            callback,
            enq_time: Instant::now(),
            ttl,
        };
        self.queue.push(cmd).await;
    }

    pub async fn submit_control(&self, op: Operation, callback: Option<Callback>) {
        self.enqueue(op, PRIORITY_CONTROL, DEFAULT_TTL_CONTROL, callback).await;
    }

    pub async fn submit_poll(&self, callback: Callback) {
        self.enqueue(Operation::UpdateStatus, PRIORITY_POLL, DEFAULT_TTL_POLL, Some(callback))
            .await;
    }
}

/// The live runtime object owning a [`Device`], its [`LocalTransport`], command pipeline, and
/// worker task.
pub struct DeviceEntity<T: LocalTransport + 'static> {
    pub dev_id: String,
    handle: PipelineHandle,
    worker: tokio::task::JoinHandle<()>,
    last_status: Arc<Mutex<Dps>>,
    is_type_c: bool,
    _transport: std::marker::PhantomData<T>,
}

impl<T: LocalTransport + 'static> DeviceEntity<T> {
    pub fn spawn(device: &Device, transport: T) -> Self {
        let is_type_c = Self::detect_type_c(device);
        let mapping = device.mapping.clone();
        let queue = Arc::new(Queue::new());
        let last_status: Arc<Mutex<Dps>> = Arc::new(Mutex::new(Dps::new()));
        let worker_queue = Arc::clone(&queue);
        let worker_status = Arc::clone(&last_status);
        let worker = tokio::spawn(Self::worker_loop(
            worker_queue,
            Arc::new(transport),
            mapping,
            is_type_c,
            worker_status,
        ));
        Self {
            dev_id: device.id.clone(),
            handle: PipelineHandle { queue, seq: Arc::new(AtomicU64::new(0)) },
            worker,
            last_status,
            is_type_c,
            _transport: std::marker::PhantomData,
        }
    }

    fn detect_type_c(device: &Device) -> bool {
        device
            .mapping
            .get("2")
            .map(|m| m.code.contains("bright"))
            .unwrap_or(false)
    }

    pub fn is_type_c(&self) -> bool {
        self.is_type_c
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Stop the worker: close the submission channel so any blocked `pop()` wakes, drain what
    /// remains so every still-queued command still gets a callback, then join.
    pub async fn stop_and_join(self) {
        self.handle.queue.close();
        self.handle.queue.drain().await;
        let _ = self.worker.await;
    }

    async fn worker_loop(
        queue: Arc<Queue>,
        transport: Arc<T>,
        mapping: dp::DpMap,
        is_type_c: bool,
        last_status: Arc<Mutex<Dps>>,
    ) {
        while let Some(cmd) = queue.pop().await {
            if Instant::now().saturating_duration_since(cmd.enq_time) > cmd.ttl {
                tracing::debug!(priority = cmd.priority, "command dropped: ttl expired");
                continue;
            }
            let start = Instant::now();
            let result = Self::execute(&transport, &mapping, is_type_c, cmd.op, &last_status).await;
            let latency = start.elapsed();
            if let Some(cb) = cmd.callback {
                cb(result, latency);
            }
        }
    }

    async fn execute(
        transport: &T,
        mapping: &dp::DpMap,
        is_type_c: bool,
        op: Operation,
        last_status: &Mutex<Dps>,
    ) -> CommandResult {
        match op {
            Operation::Switch(SwitchPayload::Simple(true)) => transport.turn_on().await,
            Operation::Switch(SwitchPayload::Simple(false)) => transport.turn_off().await,
            Operation::Switch(SwitchPayload::Channel { state, switch_num }) => {
                transport.set_status(state, switch_num).await
            }
            Operation::ToggleSwitch { dp_code } => {
                let Some((dp_num, _)) = mapping.iter().find(|(_, m)| m.code == dp_code) else {
                    tracing::warn!(dp_code, "toggle requested for unknown dp code, dropping");
                    return Ok(Dps::new());
                };
                let current = last_status.lock().await.get(dp_num).and_then(Value::as_bool).unwrap_or(false);
                transport.set_value(dp_num, Value::Bool(!current)).await
            }
            Operation::Brightness(percent) => {
                if is_type_c {
                    let raw = dp::percent_to_bright_raw(percent);
                    transport.set_value("2", Value::from(raw)).await
                } else {
                    transport.set_brightness_percentage(percent).await
                }
            }
            Operation::ColorTemp(percent) => transport.set_colourtemp_percentage(percent).await,
            Operation::ColorHsv([h, s, v]) => transport.set_color_hsv(h, s, v).await,
            Operation::ColorRgb([r, g, b]) => transport.set_color_rgb(r, g, b).await,
            Operation::Mode(mode) => {
                if dp::TUYA_DEVICE_MODES.contains(&mode.as_str()) {
                    transport.set_mode(&mode).await
                } else {
                    tracing::warn!(mode, "unknown work_mode, dropping command");
                    Ok(Dps::new())
                }
            }
            Operation::Scene => Ok(Dps::new()),
            Operation::SetStatus(payload) => {
                let mut data = serde_json::Map::new();
                for (code, value) in payload {
                    let Some((dp_num, m)) = mapping.iter().find(|(_, m)| m.code == code) else {
                        continue;
                    };
                    let encoded = if value == Value::String("toggle".to_string()) {
                        let current = last_status
                            .lock()
                            .await
                            .get(dp_num)
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        Value::Bool(!current)
                    } else {
                        encode_dp_value(&m.dp_type, &m.values, value)
                    };
                    data.insert(dp_num.clone(), encoded);
                }
                transport.set_values(data).await
            }
            Operation::UpdateStatus => {
                let result = transport.status().await;
                if let Ok(dps) = &result {
                    *last_status.lock().await = dps.clone();
                }
                result
            }
        }
    }
}

/// Encodes a human-level value for `set_status` (API v2) given the DP's declared type:
/// `Boolean` passes through, `Integer` scales a percent into the declared `[min, max]` range,
/// `Enum`/`Json` pass through unchanged.
fn encode_dp_value(dp_type: &str, values: &Value, value: Value) -> Value {
    match dp_type {
        "Boolean" => value,
        "Integer" => {
            let min = values.get("min").and_then(Value::as_i64).unwrap_or(0);
            let max = values.get("max").and_then(Value::as_i64).unwrap_or(100);
            if min == max {
                return Value::from(min);
            }
            let percent = match &value {
                Value::Number(n) => n.as_i64().unwrap_or(-1),
                Value::String(s) => s.parse::<f64>().map(|f| f as i64).unwrap_or(-1),
                _ => -1,
            };
            Value::from(dp::scale_percent_to_range(percent, min, max))
        }
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_ordering_is_priority_then_sequence() {
        let mut heap = BinaryHeap::new();
        let mk = |priority, seq| Command {
            priority,
            seq,
            op: Operation::Scene,
            callback: None,
            enq_time: Instant::now(),
            ttl: Duration::from_secs(1),
        };
        heap.push(mk(1, 0));
        heap.push(mk(0, 1));
        heap.push(mk(0, 0));
        heap.push(mk(1, 1));
        let order: Vec<(u8, u64)> = std::iter::from_fn(|| heap.pop().map(|c| (c.priority, c.seq))).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn encode_integer_scales_percent() {
        let values = serde_json::json!({"min": 10, "max": 1000});
        assert_eq!(encode_dp_value("Integer", &values, Value::from(50)), Value::from(505));
    }

    #[test]
    fn encode_boolean_passthrough() {
        let v = encode_dp_value("Boolean", &Value::Null, Value::Bool(true));
        assert_eq!(v, Value::Bool(true));
    }
}
