//! The closed dictionaries used to render a device's data points in human terms, and the
//! percent/raw scaling rules shared by the command pipeline and the status-publication path.

use std::collections::HashMap;

/// Error taxonomy published on a device's status topic as `{"Err": "9xx", ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, strum::EnumString)]
pub enum ErrorStatus {
    #[strum(serialize = "900")]
    Json,
    #[strum(serialize = "901")]
    Connect,
    #[strum(serialize = "902")]
    Timeout,
    #[strum(serialize = "903")]
    Range,
    #[strum(serialize = "904")]
    Payload,
    #[strum(serialize = "905")]
    Offline,
    #[strum(serialize = "906")]
    State,
    #[strum(serialize = "907")]
    Function,
    #[strum(serialize = "908")]
    DevType,
    #[strum(serialize = "909")]
    CloudKey,
    #[strum(serialize = "910")]
    CloudResp,
    #[strum(serialize = "911")]
    CloudToken,
    #[strum(serialize = "912")]
    Params,
    #[strum(serialize = "913")]
    Cloud,
    #[strum(serialize = "914")]
    KeyOrVer,
}

impl ErrorStatus {
    pub fn code(&self) -> &'static str {
        (*self).into()
    }

    pub fn metric_bucket(&self) -> String {
        format!("ERR_{}", self.code())
    }
}

/// Closed set of device operating modes accepted by `work_mode`.
pub const TUYA_DEVICE_MODES: &[&str] = &["white", "colour", "scene", "music"];

/// Human-readable description of a DP's declared type/range, used by `DeviceRegistry::brief`.
pub struct DpTypeInfo {
    pub kind: &'static str,
    pub range: &'static [&'static str],
}

/// `HRF_DP_TYPES`: closed dictionary from DP code to a human-readable type/range description.
pub fn dp_type_info(code: &str) -> Option<DpTypeInfo> {
    macro_rules! bool_switch {
        ($($name:literal),* $(,)?) => {
            match code {
                $($name => return Some(DpTypeInfo { kind: "bool", range: &["true", "false"] }),)*
                _ => {}
            }
        };
    }
    bool_switch!(
        "switch", "switch_led", "switch_led_1", "switch_1", "switch_2", "switch_3", "switch_4",
        "switch_5", "switch_6", "switch_7", "switch_8", "switch_9", "switch_10",
    );
    match code {
        "work_mode" => Some(DpTypeInfo { kind: "string", range: &["white", "colour", "scene", "music"] }),
        "bright_value" | "bright_value_v2" | "bright_value_1" | "brightness_min_1" => {
            Some(DpTypeInfo { kind: "int", range: &[] })
        }
        "temp_value" | "temp_value_v2" => Some(DpTypeInfo { kind: "int", range: &[] }),
        "colour_data" | "colour_data_v2" => Some(DpTypeInfo { kind: "list", range: &[] }),
        "relay_status" => Some(DpTypeInfo { kind: "string", range: &["on", "off"] }),
        "switch_inching" => Some(DpTypeInfo { kind: "string", range: &[] }),
        "scene_data" | "countdown_1" | "countdown" | "music_data" | "control_data" => {
            Some(DpTypeInfo { kind: "", range: &[] })
        }
        _ => None,
    }
}

/// `HRF_TUYA_DEVICE_CATEGORY`: closed dictionary from Tuya product category code to a human label.
pub fn device_category_label(category: &str) -> Option<&'static str> {
    Some(match category {
        "dj" => "Light",
        "dd" => "Strip Lights",
        "dc" => "String Lights",
        "fwd" => "Ambiance Light",
        "xdd" => "Ceiling Light",
        "gyd" => "Motion Sensor Light",
        "fsd" => "Ceiling Fat Light",
        "tyndg" => "Solar Light",
        "tgq" => "Dimmer",
        "sxd" => "Spotlight",
        "ykq" => "Remote Control",
        "kg" => "Switch",
        "cz" => "Socket",
        "pc" => "Power Strip",
        _ => return None,
    })
}

/// Scales a Tuya raw `bright_value*`/`temp_value*` reading into a 0-100 percent, clamped at the
/// declared endpoints. Inverse of [`percent_to_bright_raw`].
pub fn bright_raw_to_percent(raw: i64) -> i64 {
    const MIN_RAW: i64 = 10;
    const MAX_RAW: i64 = 1000;
    if raw < MIN_RAW {
        return 0;
    }
    if raw > MAX_RAW {
        return 100;
    }
    (raw - MIN_RAW) * 100 / (MAX_RAW - MIN_RAW)
}

pub fn temp_raw_to_percent(raw: i64) -> i64 {
    if raw <= 0 {
        return 0;
    }
    if raw >= 1000 {
        return 100;
    }
    raw / 10
}

/// Scales a 0-100 percent into the 10-1000 raw range used by type-C brightness DPs.
pub fn percent_to_bright_raw(percent: i64) -> i64 {
    10 + (1000 - 10) * percent.clamp(0, 100) / 100
}

/// Generic percent-to-raw scaling for an `Integer` DP with a declared `[min, max]`, matching the
/// `set_status` (API v2) encoding rule: `min + round(percent*(max-min)/100)`.
pub fn scale_percent_to_range(percent: i64, min: i64, max: i64) -> i64 {
    if percent <= 0 {
        return min;
    }
    if percent >= 100 {
        return max;
    }
    min + (percent * (max - min) + 50) / 100
}

/// A device's raw-DP-number-keyed mapping entry.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DpMapping {
    pub code: String,
    #[serde(rename = "type")]
    pub dp_type: String,
    #[serde(default)]
    pub values: serde_json::Value,
}

pub type DpMap = HashMap<String, DpMapping>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bright_round_trip_endpoints() {
        assert_eq!(bright_raw_to_percent(percent_to_bright_raw(0)), 0);
        assert_eq!(bright_raw_to_percent(percent_to_bright_raw(100)), 100);
    }

    #[test]
    fn temp_round_trip_endpoints() {
        assert_eq!(temp_raw_to_percent(0), 0);
        assert_eq!(temp_raw_to_percent(1000), 100);
    }

    #[test]
    fn scale_percent_matches_scenario_s2() {
        assert_eq!(scale_percent_to_range(50, 10, 1000), 505);
    }

    #[test]
    fn error_status_code_round_trips() {
        assert_eq!(ErrorStatus::KeyOrVer.code(), "914");
        assert_eq!(ErrorStatus::KeyOrVer.metric_bucket(), "ERR_914");
    }
}
