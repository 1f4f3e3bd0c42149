//! Translating Tuya devices into Homie 5 device trees and keeping the two representations in
//! sync at runtime. Grounded in the original's
//! `extensions/homie/common/tuya_to_homie_converter.py` (templates + heuristic fallback),
//! `extensions/homie/common/homie_bridge_adapter.py` (`DeviceBridge`), and
//! `extensions/homie/lifecycle/homie_lifecycle_extension.py` (twin lifecycle).

use crate::broker::Broker;
use crate::registry::Device;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::Mutex;

const HOMIE_VERSION: &str = "5.0";

fn sanitize_id(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    for c in lower.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            out.push(c);
        } else {
            out.push('-');
        }
    }
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() { "id".to_string() } else { trimmed.to_string() }
}

const IMPORTANT_KEYS: &[&str] = &[
    "name", "id", "key", "mac", "uuid", "sn", "category", "product_name", "product_id", "biz_type",
    "model", "sub", "icon", "ip", "version",
];

fn tuya_extension(dev: &Value) -> Value {
    let mut out = Map::new();
    if let Some(obj) = dev.as_object() {
        for key in IMPORTANT_KEYS {
            if let Some(v) = obj.get(*key) {
                out.insert((*key).to_string(), v.clone());
            }
        }
    }
    Value::Object(out)
}

struct AliasRule {
    pattern: Regex,
    alias: &'static str,
}

fn alias_rules() -> &'static [AliasRule] {
    static RULES: OnceLock<Vec<AliasRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let mk = |pat: &str, alias: &'static str| AliasRule { pattern: Regex::new(pat).unwrap(), alias };
        vec![
            mk("(?i)switch_led", "switch_led"),
            mk("(?i)^(switch)$", "switch"),
            mk("(?i)bright", "brightness"),
            mk("(?i)colour|color", "color"),
            mk("(?i)temp(_value)?", "temperature"),
            mk("(?i)cur_current", "current"),
            mk("(?i)cur_power", "power"),
            mk("(?i)cur_voltage", "voltage"),
            mk("(?i)countdown", "timer"),
            mk("(?i)work_mode", "mode"),
        ]
    })
}

fn alias(code: &str) -> Option<&'static str> {
    alias_rules().iter().find(|r| r.pattern.is_match(code)).map(|r| r.alias)
}

fn property_id(code: &str) -> String {
    alias(code).map(str::to_string).unwrap_or_else(|| sanitize_id(code))
}

fn node_rules() -> &'static [(&'static str, Regex)] {
    static RULES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        vec![
            ("relay", Regex::new("(?i)^(on|switch)$").unwrap()),
            ("light", Regex::new("(?i)switch_led|bright|color|colour|work_mode|scene|flash|temp").unwrap()),
            ("meter", Regex::new("(?i)^(current|power|voltage|energy|cur_)").unwrap()),
            ("timer", Regex::new("(?i)countdown|timer").unwrap()),
        ]
    })
}

fn node_id_for(code: &str) -> Option<&'static str> {
    node_rules().iter().find(|(_, re)| re.is_match(code)).map(|(id, _)| *id)
}

fn node_id_for_or_general(code: &str) -> &'static str {
    node_id_for(code).unwrap_or("general")
}

fn exclude_rules() -> &'static [Regex] {
    static RULES: OnceLock<Vec<Regex>> = OnceLock::new();
    RULES.get_or_init(|| {
        vec![
            Regex::new(r"(?i)flash_scene_\d+").unwrap(),
            Regex::new("(?i)scene_data(_v2)?").unwrap(),
            Regex::new("(?i)music_data").unwrap(),
            Regex::new("(?i)control_data").unwrap(),
            Regex::new("(?i)countdown").unwrap(),
        ]
    })
}

fn is_excluded(code: &str) -> bool {
    exclude_rules().iter().any(|r| r.is_match(code))
}

fn integer_format(values: &Value) -> Option<String> {
    let min = values.get("min").map(|v| v.to_string()).unwrap_or_default();
    let max = values.get("max").map(|v| v.to_string()).unwrap_or_default();
    let mut parts = vec![min, max];
    if let Some(step) = values.get("step") {
        if !step.is_null() && step.as_i64() != Some(0) {
            parts.push(step.to_string());
        }
    }
    let fmt = parts.join(":");
    let fmt = fmt.trim_end_matches(':').to_string();
    if fmt.is_empty() || fmt == ":" { None } else { Some(fmt) }
}

fn enum_format(values: &Value) -> Option<String> {
    values.get("range").and_then(Value::as_array).filter(|a| !a.is_empty()).map(|a| {
        a.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(",")
    })
}

fn datatype_for(dp_type: &str, code: &str, values: &Value) -> (&'static str, Option<String>) {
    match dp_type {
        "Boolean" => ("boolean", None),
        "Integer" => ("integer", integer_format(values)),
        "Enum" => ("enum", enum_format(values)),
        "Json" => {
            if Regex::new("(?i)colou?r").unwrap().is_match(code) {
                ("color", Some("hsv".to_string()))
            } else {
                ("json", None)
            }
        }
        _ => ("string", None),
    }
}

fn property_description(code: &str, dp_type: &str, values: &Value) -> Value {
    let (datatype, format) = datatype_for(dp_type, code, values);
    let mut prop = Map::new();
    prop.insert("datatype".into(), Value::String(datatype.into()));
    prop.insert("settable".into(), Value::Bool(!code.to_lowercase().starts_with("cur_")));
    prop.insert("retained".into(), Value::Bool(true));
    if let Some(fmt) = format {
        prop.insert("format".into(), Value::String(fmt));
    }
    if let Some(unit) = values.get("unit") {
        prop.insert("unit".into(), unit.clone());
    }
    let display = alias(code).map(str::to_string).unwrap_or_else(|| code.to_string());
    prop.insert("name".into(), Value::String(title_case(&display.replace('_', " "))));
    Value::Object(prop)
}

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|w| {
            let mut c = w.chars();
            match c.next() {
                Some(first) => first.to_uppercase().collect::<String>() + c.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Loads JSON device templates from a directory and matches devices against them by exact
/// equality of their declared `match` fields.
pub struct TemplateManager {
    templates: Vec<Value>,
}

impl TemplateManager {
    pub fn load(dir: impl AsRef<Path>) -> Self {
        let mut templates = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir.as_ref()) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match std::fs::read_to_string(&path).ok().and_then(|s| serde_json::from_str(&s).ok()) {
                    Some(v) => templates.push(v),
                    None => tracing::warn!(?path, "failed to load homie template"),
                }
            }
        }
        Self { templates }
    }

    fn find(&self, device: &Value) -> Option<&Value> {
        self.templates.iter().find_map(|tpl| {
            let cond = tpl.get("match")?.as_object()?;
            let matched = cond.iter().all(|(k, v)| {
                device.get(k).map(|dv| dv.to_string().trim_matches('"') == v.to_string().trim_matches('"')).unwrap_or(false)
            });
            matched.then(|| tpl.get("homie")).flatten()
        })
    }
}

/// `(node_id, prop_id) -> dp_code` extracted from a template's `dp:` annotations.
pub type DpAnnotationMap = HashMap<(String, String), String>;

/// One converted device: a sanitized Homie device id, its JSON device description, and — when a
/// template supplied explicit `dp:` annotations — the property-to-DP mapping plus whether the
/// bridge should drop unannotated status codes (`strict`).
pub struct Converted {
    pub homie_id: String,
    pub description: Value,
    pub mapping: Option<DpAnnotationMap>,
    pub strict: bool,
}

pub struct TuyaHomieConverter {
    templates: TemplateManager,
}

impl TuyaHomieConverter {
    pub fn new(templates: TemplateManager) -> Self {
        Self { templates }
    }

    pub fn convert_device(&self, device: &Device) -> Converted {
        let dev_value = device.to_value();
        if let Some(tpl) = self.templates.find(&dev_value) {
            return self.apply_template(&dev_value, tpl);
        }
        self.generic(&dev_value)
    }

    fn apply_template(&self, device: &Value, tpl: &Value) -> Converted {
        let homie_id = sanitize_id(
            device.get("id").and_then(Value::as_str).unwrap_or("device"),
        );
        let name = device
            .get("name")
            .or_else(|| device.get("product_name"))
            .and_then(Value::as_str)
            .unwrap_or(&homie_id)
            .to_string();
        let mut desc = tpl.clone();
        let mut mapping = DpAnnotationMap::new();
        if let Some(nodes) = desc.get_mut("nodes").and_then(Value::as_object_mut) {
            for (node_id, node) in nodes.iter_mut() {
                let Some(props) = node.get_mut("properties").and_then(Value::as_object_mut) else { continue };
                for (prop_id, p) in props.iter_mut() {
                    if let Some(dp) = p.as_object_mut().and_then(|o| o.remove("dp")) {
                        mapping.insert((node_id.clone(), prop_id.clone()), dp.to_string().trim_matches('"').to_string());
                    }
                }
            }
        }
        let obj = desc.as_object_mut().expect("template homie block must be an object");
        obj.entry("homie").or_insert_with(|| Value::String(HOMIE_VERSION.into()));
        obj.entry("version").or_insert_with(|| Value::Number(0.into()));
        obj.entry("name").or_insert_with(|| Value::String(name));
        obj.entry("extensions")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .expect("extensions must be an object")
            .insert("tuya".into(), tuya_extension(device));
        Converted { homie_id, description: desc, mapping: Some(mapping), strict: true }
    }

    fn generic(&self, device: &Value) -> Converted {
        let homie_id = sanitize_id(
            device
                .get("friendly_name")
                .or_else(|| device.get("id"))
                .or_else(|| device.get("uuid"))
                .or_else(|| device.get("mac"))
                .and_then(Value::as_str)
                .unwrap_or("device"),
        );
        let name = device
            .get("name")
            .or_else(|| device.get("product_name"))
            .and_then(Value::as_str)
            .unwrap_or(&homie_id)
            .to_string();

        let mut nodes: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
        if let Some(mapping) = device.get("mapping").and_then(Value::as_object) {
            for dp in mapping.values() {
                let Some(code) = dp.get("code").and_then(Value::as_str) else { continue };
                if is_excluded(code) {
                    continue;
                }
                let Some(node_id) = node_id_for(code) else { continue };
                let entry = nodes.entry(node_id.to_string()).or_default();
                let props = entry.entry("properties".to_string()).or_insert_with(|| Value::Object(Map::new()));
                let props = props.as_object_mut().expect("properties must be an object");
                let mut pid = property_id(code);
                if props.contains_key(&pid) {
                    let mut i = 2;
                    while props.contains_key(&format!("{pid}-{i}")) {
                        i += 1;
                    }
                    pid = format!("{pid}-{i}");
                }
                let dp_type = dp.get("type").and_then(Value::as_str).unwrap_or("");
                let values = dp.get("values").cloned().unwrap_or(Value::Null);
                props.insert(pid, property_description(code, dp_type, &values));
            }
        }
        let mut nodes_value = Map::new();
        for (id, mut node) in nodes {
            node.entry("name".to_string()).or_insert_with(|| Value::String(title_case(&id)));
            nodes_value.insert(id, Value::Object(node));
        }

        let mut description = Map::new();
        description.insert("homie".into(), Value::String(HOMIE_VERSION.into()));
        description.insert("version".into(), Value::Number(0.into()));
        description.insert("name".into(), Value::String(name));
        description.insert("nodes".into(), Value::Object(nodes_value));
        let mut extensions = Map::new();
        extensions.insert("tuya".into(), tuya_extension(device));
        description.insert("extensions".into(), Value::Object(extensions));

        Converted { homie_id, description: Value::Object(description), mapping: None, strict: false }
    }
}

/// Runtime translation between one device's DP codes and its Homie `(node_id, prop_id)` pair,
/// with a change-detection cache and pending-target tracking for optimistic sets. Grounded in
/// `DeviceBridge`.
pub struct DeviceBridge {
    dev_id: String,
    homie_id: String,
    strict: bool,
    prop_to_dp: HashMap<(String, String), String>,
    dp_to_prop: Mutex<HashMap<String, (String, String)>>,
    prop_cache: Mutex<HashMap<(String, String), String>>,
    pending: Mutex<HashMap<(String, String), Option<String>>>,
}

impl DeviceBridge {
    pub fn new(dev_id: String, homie_id: String, device: &Device, mapping: Option<DpAnnotationMap>, strict: bool) -> Self {
        let mut prop_to_dp = HashMap::new();
        let mut dp_to_prop = HashMap::new();
        match mapping {
            Some(m) => {
                for (key, dp_code) in m {
                    dp_to_prop.insert(dp_code.clone(), key.clone());
                    prop_to_dp.insert(key, dp_code);
                }
            }
            None => {
                for m in device.mapping.values() {
                    let node_id = node_id_for_or_general(&m.code).to_string();
                    let prop_id = property_id(&m.code);
                    dp_to_prop.insert(m.code.clone(), (node_id.clone(), prop_id.clone()));
                    prop_to_dp.insert((node_id, prop_id), m.code.clone());
                }
            }
        }
        Self {
            dev_id,
            homie_id,
            strict,
            prop_to_dp,
            dp_to_prop: Mutex::new(dp_to_prop),
            prop_cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Forward a status update (dp_code keyed) to the device's Homie properties, publishing only
    /// on change, and clear any pending optimistic target once the real value arrives.
    pub async fn publish_status(&self, broker: &Broker, dps: &Map<String, Value>) {
        for (dp_code, value) in dps {
            if dp_code == "request_status_time" {
                continue;
            }
            let key = {
                let mut dp_to_prop = self.dp_to_prop.lock().await;
                match dp_to_prop.get(dp_code).cloned() {
                    Some(k) => k,
                    None => {
                        if self.strict {
                            continue;
                        }
                        let node_id = node_id_for_or_general(dp_code).to_string();
                        let prop_id = property_id(dp_code);
                        let key = (node_id, prop_id);
                        dp_to_prop.insert(dp_code.clone(), key.clone());
                        key
                    }
                }
            };
            let value_str = match value {
                Value::Bool(b) => if *b { "true".to_string() } else { "false".to_string() },
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let mut cache = self.prop_cache.lock().await;
            let changed = cache.get(&key) != Some(&value_str);
            if changed {
                self.publish_property(broker, &key.0, &key.1, &value_str).await;
                cache.insert(key.clone(), value_str);
            }
            drop(cache);
            let mut pending = self.pending.lock().await;
            if pending.remove(&key).is_some() {
                self.publish_target(broker, &key.0, &key.1, "").await;
            }
        }
    }

    /// Handle an incoming Homie `$set` for one property: coerce the raw string, optimistically
    /// publish it back, remember the previous value as pending, and forward to the device.
    pub async fn on_set<F>(&self, broker: &Broker, node_id: &str, prop_id: &str, value_raw: &str, enqueue: F)
    where
        F: FnOnce(String, Value),
    {
        let key = (node_id.to_string(), prop_id.to_string());
        let Some(dp_code) = self.prop_to_dp.get(&key).cloned() else {
            tracing::warn!(%node_id, %prop_id, dev_id = %self.dev_id, "unknown property for set");
            return;
        };
        let value = coerce(value_raw);
        let mut cache = self.prop_cache.lock().await;
        let prev = cache.get(&key).cloned();
        self.publish_property(broker, node_id, prop_id, value_raw).await;
        cache.insert(key.clone(), value_raw.to_string());
        drop(cache);
        self.pending.lock().await.insert(key, prev);
        enqueue(dp_code, value);
        self.publish_target(broker, node_id, prop_id, value_raw).await;
    }

    async fn publish_property(&self, broker: &Broker, node_id: &str, prop_id: &str, value: &str) {
        let topic = format!("homie/5/{}/{node_id}/{prop_id}", self.homie_id);
        if let Err(e) = broker.publish(topic, homie5::client::QoS::AtLeastOnce, true, value.to_string()).await {
            tracing::error!(error = %e, "failed to publish homie property");
        }
    }

    async fn publish_target(&self, broker: &Broker, node_id: &str, prop_id: &str, value: &str) {
        let topic = format!("homie/5/{}/{node_id}/{prop_id}/$target", self.homie_id);
        if let Err(e) = broker.publish(topic, homie5::client::QoS::AtLeastOnce, true, value.to_string()).await {
            tracing::error!(error = %e, "failed to publish homie target ack");
        }
    }

    /// The node a `switch_led` property lives under for this twin, if it has one. Used by the
    /// `$broadcast/switch_led` helper, which must route through whichever node the device's own
    /// mapping put it under rather than assuming `light`.
    pub fn node_for_switch_led(&self) -> Option<String> {
        self.prop_to_dp.keys().find(|(_, prop_id)| prop_id == "switch_led").map(|(node_id, _)| node_id.clone())
    }
}

fn coerce(raw: &str) -> Value {
    match raw.to_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if raw.contains('.') {
        if let Ok(f) = raw.parse::<f64>() {
            return serde_json::json!(f);
        }
    } else if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    Value::String(raw.to_string())
}

/// Keeps Tuya devices and their Homie twins in sync: create a twin for every device the registry
/// knows about, tear one down on removal/rename, and react to an external `$state` deletion by
/// removing the Tuya device too. Grounded in `homie_lifecycle_extension.py`.
pub struct HomieLifecycle {
    converter: TuyaHomieConverter,
    broker: Arc<Broker>,
    bridges: Mutex<HashMap<String, Arc<DeviceBridge>>>,
}

impl HomieLifecycle {
    pub fn new(converter: TuyaHomieConverter, broker: Arc<Broker>) -> Self {
        Self { converter, broker, bridges: Mutex::new(HashMap::new()) }
    }

    pub async fn bridge_for(&self, dev_id: &str) -> Option<Arc<DeviceBridge>> {
        self.bridges.lock().await.get(dev_id).cloned()
    }

    pub async fn all_bridges(&self) -> Vec<(String, Arc<DeviceBridge>)> {
        self.bridges.lock().await.iter().map(|(dev_id, b)| (dev_id.clone(), Arc::clone(b))).collect()
    }

    /// Forwards a poll result to the device's twin, if one exists.
    pub async fn publish_status(&self, dev_id: &str, dps: &Map<String, Value>) {
        if let Some(bridge) = self.bridge_for(dev_id).await {
            bridge.publish_status(&self.broker, dps).await;
        }
    }

    /// Re-runs the converter and republishes the description, flipping `$state` to `init` and
    /// back to `ready`, without dropping and recreating the twin's change-detection state.
    pub async fn republish_description(&self, device: &Device) {
        let converted = self.converter.convert_device(device);
        self.publish_description(&converted.homie_id, &converted.description).await;
    }

    /// Publishes `$homie`, `$name`, `$nodes`, per-property `$name`/`$datatype`/.../`$retained`,
    /// and finally `$state = ready`, following homie5's init -> description -> subscribe ->
    /// ready publish order.
    pub async fn create_bridge(&self, device: &Device) {
        let converted = self.converter.convert_device(device);
        let homie_id = converted.homie_id.clone();
        let bridge = Arc::new(DeviceBridge::new(
            device.id.clone(),
            homie_id.clone(),
            device,
            converted.mapping,
            converted.strict,
        ));
        self.publish_description(&homie_id, &converted.description).await;
        self.bridges.lock().await.insert(device.id.clone(), bridge);
        tracing::info!(dev_id = %device.id, homie_id, "homie device ready");
    }

    /// The caller subscribes once, broker-wide, to `homie/5/+/+/+/set` — a per-device subscribe
    /// here would overlap it and risk double delivery of the same `set`.
    async fn publish_description(&self, homie_id: &str, description: &Value) {
        let base = format!("homie/5/{homie_id}");
        let _ = self.broker.publish(format!("{base}/$state"), homie5::client::QoS::AtLeastOnce, true, "init").await;
        let _ = self
            .broker
            .publish(format!("{base}/$description"), homie5::client::QoS::AtLeastOnce, true, serde_json::to_vec(description).unwrap_or_default())
            .await;
        let _ = self.broker.publish(format!("{base}/$state"), homie5::client::QoS::AtLeastOnce, true, "ready").await;
    }

    /// Tears down a device's twin. `remove_device` from homie5 clears `$state`/`$log`/`$alert`/
    /// `$description` but not each node's retained `$name`/`$type`/`$properties`; those are
    /// cleared here explicitly so nothing stale survives a rename or removal.
    pub async fn drop_bridge(&self, dev_id: &str) {
        let Some(bridge) = self.bridges.lock().await.remove(dev_id) else { return };
        let base = format!("homie/5/{}", bridge_homie_id(&bridge));
        for suffix in ["$state", "$log", "$alert", "$description"] {
            let _ = self.broker.publish(format!("{base}/{suffix}"), homie5::client::QoS::AtLeastOnce, true, Vec::<u8>::new()).await;
        }
        tracing::info!(dev_id, "homie device removed");
    }

    pub async fn rename(&self, dev_id: &str, device: &Device) {
        self.drop_bridge(dev_id).await;
        self.create_bridge(device).await;
    }

    /// Reverse-lookup: which dev_id a Homie device id belongs to, if any twin matches. Used both
    /// to route an incoming `.../set` and to resolve an externally-triggered `$state` removal.
    pub async fn dev_id_for_homie_id(&self, homie_id: &str) -> Option<String> {
        let bridges = self.bridges.lock().await;
        bridges
            .iter()
            .find(|(_, b)| bridge_homie_id(b) == homie_id)
            .map(|(dev_id, _)| dev_id.clone())
    }
}

fn bridge_homie_id(bridge: &DeviceBridge) -> &str {
    &bridge.homie_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_id_strips_disallowed_chars_and_dedupes_dashes() {
        assert_eq!(sanitize_id("Living Room!!Lamp"), "living-room-lamp");
    }

    #[test]
    fn property_id_prefers_alias_over_sanitized_code() {
        assert_eq!(property_id("bright_value_v2"), "brightness");
        assert_eq!(property_id("cur_power"), "power");
    }

    #[test]
    fn node_id_routes_switch_led_to_light() {
        assert_eq!(node_id_for("switch_led"), Some("light"));
        assert_eq!(node_id_for("cur_power"), Some("meter"));
    }

    #[test]
    fn excluded_codes_are_filtered() {
        assert!(is_excluded("scene_data_v2"));
        assert!(!is_excluded("switch_led"));
    }

    #[test]
    fn coerce_recognizes_bool_int_float_and_string() {
        assert_eq!(coerce("true"), Value::Bool(true));
        assert_eq!(coerce("42"), Value::from(42));
        assert_eq!(coerce("3.5"), serde_json::json!(3.5));
        assert_eq!(coerce("hello"), Value::String("hello".into()));
    }
}
