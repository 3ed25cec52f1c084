// Bike Tracker - BLE Wire Protocol
//
// Everything that crosses the GATT boundary: UUIDs, the config/command/
// location decoders and the status/history JSON.  The firmware's GATT server
// only moves bytes; all interpretation happens here.

use anyhow::{bail, Context};
use log::{debug, warn};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::history::{FixHistory, HistoryEntry};
use crate::mode::DeviceMode;
use crate::position::{distance_m, PositionFix};
use crate::settings::{self, Configuration, FieldUpdate};
use crate::store::KvStore;
use crate::tuning::Tuning;

// ---------------------------------------------------------------------------
// GATT layout
// ---------------------------------------------------------------------------
pub const SERVICE_UUID: u128 = 0x0000_1234_0000_1000_8000_0080_5f9b_34fb;
pub const LOCATION_UUID: u128 = 0x0000_1235_0000_1000_8000_0080_5f9b_34fb;
pub const CONFIG_UUID: u128 = 0x0000_1236_0000_1000_8000_0080_5f9b_34fb;
pub const STATUS_UUID: u128 = 0x0000_1237_0000_1000_8000_0080_5f9b_34fb;
pub const COMMAND_UUID: u128 = 0x0000_1238_0000_1000_8000_0080_5f9b_34fb;
pub const HISTORY_UUID: u128 = 0x0000_1239_0000_1000_8000_0080_5f9b_34fb;

pub const DEVICE_NAME_PREFIX: &str = "BikeTrk_";

/// Writes longer than this are refused before parsing.
pub const MAX_WRITE_LEN: usize = 256;

/// `BikeTrk_XXXX` from the last two bytes of the BLE MAC.
pub fn device_name(mac: &[u8; 6]) -> String {
    format!("{DEVICE_NAME_PREFIX}{:02X}{:02X}", mac[4], mac[5])
}

fn write_text(bytes: &[u8]) -> anyhow::Result<&str> {
    if bytes.len() > MAX_WRITE_LEN {
        bail!("write of {} bytes exceeds {MAX_WRITE_LEN}", bytes.len());
    }
    Ok(std::str::from_utf8(bytes).context("write is not UTF-8")?.trim())
}

// ---------------------------------------------------------------------------
// Config characteristic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWrite {
    /// Reset every field to its default.
    Clear,
    Update {
        updates: Vec<FieldUpdate>,
        /// Keys that were present but failed validation.
        rejected: Vec<String>,
    },
}

struct ConfigField {
    long: &'static str,
    short: &'static str,
    parse: fn(&Value) -> anyhow::Result<FieldUpdate>,
}

const CONFIG_FIELDS: [ConfigField; 4] = [
    ConfigField {
        long: "phone_number",
        short: "p",
        parse: parse_phone,
    },
    ConfigField {
        long: "update_interval",
        short: "i",
        parse: parse_interval,
    },
    ConfigField {
        long: "alert_enabled",
        short: "a",
        parse: parse_alerts,
    },
    ConfigField {
        long: "motion_sensitivity",
        short: "s",
        parse: parse_sensitivity,
    },
];

/// An empty phone number is passed through as `Phone("")`; the decoder
/// turns it into a clear.
fn parse_phone(value: &Value) -> anyhow::Result<FieldUpdate> {
    let phone = match value {
        Value::String(s) => s.trim(),
        other => bail!("expected a string, got {other}"),
    };
    if phone.is_empty() {
        return Ok(FieldUpdate::Phone(String::new()));
    }
    settings::validate_phone(phone).map(FieldUpdate::Phone)
}

fn parse_interval(value: &Value) -> anyhow::Result<FieldUpdate> {
    let seconds = value.as_i64().context("expected an integer")?;
    settings::validate_interval(seconds).map(FieldUpdate::Interval)
}

fn parse_alerts(value: &Value) -> anyhow::Result<FieldUpdate> {
    match value {
        Value::Bool(b) => Ok(FieldUpdate::Alerts(*b)),
        Value::Number(n) if n.as_u64() == Some(0) => Ok(FieldUpdate::Alerts(false)),
        Value::Number(n) if n.as_u64() == Some(1) => Ok(FieldUpdate::Alerts(true)),
        other => bail!("expected a boolean, got {other}"),
    }
}

fn parse_sensitivity(value: &Value) -> anyhow::Result<FieldUpdate> {
    let v = value.as_f64().context("expected a number")?;
    settings::validate_sensitivity(v).map(FieldUpdate::Sensitivity)
}

fn is_clear(value: &Value) -> bool {
    match value {
        Value::String(s) => s.eq_ignore_ascii_case("CLEAR"),
        Value::Object(map) => map
            .get("cmd")
            .and_then(Value::as_str)
            .is_some_and(|c| c.eq_ignore_ascii_case("CLEAR")),
        _ => false,
    }
}

/// Decode a write to the Config characteristic.  Fields are validated one
/// by one: bad fields land in `rejected` while the good ones still apply.
pub fn decode_config(bytes: &[u8]) -> anyhow::Result<ConfigWrite> {
    let text = write_text(bytes)?;
    if text.eq_ignore_ascii_case("CLEAR") {
        return Ok(ConfigWrite::Clear);
    }

    let value: Value = serde_json::from_str(text).context("config is not JSON")?;
    if is_clear(&value) {
        return Ok(ConfigWrite::Clear);
    }
    let Value::Object(map) = value else {
        bail!("config must be a JSON object");
    };

    let mut updates = Vec::new();
    let mut rejected = Vec::new();
    for field in &CONFIG_FIELDS {
        let Some(raw) = map.get(field.long).or_else(|| map.get(field.short)) else {
            continue;
        };
        match (field.parse)(raw) {
            Ok(FieldUpdate::Phone(phone)) if phone.is_empty() => return Ok(ConfigWrite::Clear),
            Ok(update) => updates.push(update),
            Err(e) => {
                warn!("Config field {} rejected: {e:#}", field.long);
                rejected.push(field.long.to_owned());
            }
        }
    }

    for key in map.keys() {
        if !CONFIG_FIELDS.iter().any(|f| f.long == key || f.short == key) {
            debug!("Ignoring unknown config key {key}");
        }
    }
    Ok(ConfigWrite::Update { updates, rejected })
}

// ---------------------------------------------------------------------------
// Command characteristic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Push the most recent history entries.
    Sync,
    ClearHistory,
    /// Zero-based history page.
    Page(usize),
    TestSms,
}

pub fn parse_command(bytes: &[u8]) -> anyhow::Result<Command> {
    let text = write_text(bytes)?;
    if let Some(page) = text.strip_prefix("GPS_PAGE:") {
        let page = page
            .trim()
            .parse()
            .with_context(|| format!("bad page number {page:?}"))?;
        return Ok(Command::Page(page));
    }
    match text {
        "SYNC" => Ok(Command::Sync),
        "CLEAR_HISTORY" => Ok(Command::ClearHistory),
        "TEST_SMS" => Ok(Command::TestSms),
        other => bail!("unknown command {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Location characteristic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PhoneLocation {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub speed: f32,
}

impl PhoneLocation {
    pub fn into_fix(self, now_ms: u64) -> PositionFix {
        PositionFix {
            speed_kmh: self.speed,
            ..PositionFix::new(self.lat, self.lon, now_ms)
        }
    }
}

/// Decode a phone-supplied position.  Null island and out-of-range
/// coordinates are refused the same way modem fixes are.
pub fn decode_location(bytes: &[u8]) -> anyhow::Result<PhoneLocation> {
    let location: PhoneLocation =
        serde_json::from_str(write_text(bytes)?).context("location is not valid JSON")?;
    let in_range = location.lat.abs() <= 90.0 && location.lon.abs() <= 180.0;
    if !in_range || (location.lat == 0.0 && location.lon == 0.0) {
        bail!("implausible location {}, {}", location.lat, location.lon);
    }
    Ok(location)
}

// ---------------------------------------------------------------------------
// Status characteristic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub ble: bool,
    pub phone_configured: bool,
    pub phone: String,
    pub interval: u32,
    pub alerts: bool,
    pub sensitivity: f32,
    pub user_present: bool,
    pub moving: bool,
    pub mode: DeviceMode,
    pub gps_valid: bool,
    #[serde(serialize_with = "coordinate_text")]
    pub lat: f64,
    #[serde(serialize_with = "coordinate_text")]
    pub lon: f64,
}

/// The app reads coordinates as text, six decimals like the SMS body.
fn coordinate_text<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value:.6}"))
}

impl StatusSnapshot {
    pub fn new(
        config: &Configuration,
        link: bool,
        present: bool,
        moving: bool,
        mode: DeviceMode,
        fix: Option<&PositionFix>,
    ) -> Self {
        Self {
            ble: link,
            phone_configured: config.phone_configured(),
            phone: config.phone_number.clone(),
            interval: config.report_interval_s,
            alerts: config.alerts_enabled,
            sensitivity: config.motion_sensitivity,
            user_present: present,
            moving,
            mode,
            gps_valid: fix.is_some_and(|f| f.valid),
            lat: fix.map_or(0.0, |f| f.latitude),
            lon: fix.map_or(0.0, |f| f.longitude),
        }
    }

    /// Field-by-field comparison.  Positions only count as changed once they
    /// are `epsilon_m` apart so GNSS jitter does not cause notify churn.
    pub fn differs_from(&self, other: &StatusSnapshot, epsilon_m: f64) -> bool {
        let moved = self.gps_valid
            && other.gps_valid
            && distance_m(self.lat, self.lon, other.lat, other.lon) >= epsilon_m;

        self.ble != other.ble
            || self.phone_configured != other.phone_configured
            || self.phone != other.phone
            || self.interval != other.interval
            || self.alerts != other.alerts
            || self.sensitivity != other.sensitivity
            || self.user_present != other.user_present
            || self.moving != other.moving
            || self.mode != other.mode
            || self.gps_valid != other.gps_valid
            || moved
    }
}

/// Remembers the last snapshot that was actually notified.
#[derive(Debug, Clone)]
pub struct StatusNotifier {
    last: Option<StatusSnapshot>,
    epsilon_m: f64,
}

impl StatusNotifier {
    pub fn new(tuning: &Tuning) -> Self {
        Self {
            last: None,
            epsilon_m: tuning.status_position_epsilon_m,
        }
    }

    /// JSON to notify, or `None` when nothing meaningful changed.
    pub fn offer(&mut self, snapshot: StatusSnapshot) -> anyhow::Result<Option<String>> {
        if let Some(last) = &self.last {
            if !snapshot.differs_from(last, self.epsilon_m) {
                return Ok(None);
            }
        }
        self.force(snapshot).map(Some)
    }

    /// Notify regardless of the last snapshot, e.g. right after connect.
    pub fn force(&mut self, snapshot: StatusSnapshot) -> anyhow::Result<String> {
        let json = serde_json::to_string(&snapshot)?;
        self.last = Some(snapshot);
        Ok(json)
    }

}

// ---------------------------------------------------------------------------
// History characteristic
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HistoryBulk<'a> {
    history: &'a [HistoryEntry],
    count: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryPage<'a> {
    history: &'a [HistoryEntry],
    page: usize,
    total_pages: usize,
    total_points: usize,
    points_per_page: usize,
}

/// The newest `len` entries, oldest first.
pub fn history_push_json(
    history: &FixHistory,
    store: &impl KvStore,
    len: usize,
) -> anyhow::Result<String> {
    let entries = history.recent(store, len)?;
    Ok(serde_json::to_string(&HistoryBulk {
        history: &entries,
        count: entries.len(),
    })?)
}

/// Zero-based page `page` of the whole log, oldest first.  Pages past the
/// end come back empty with the metadata still filled in.
pub fn history_page_json(
    history: &FixHistory,
    store: &impl KvStore,
    page: usize,
    per_page: usize,
) -> anyhow::Result<String> {
    let per_page = per_page.max(1);
    let total_points = history.len();
    let entries = history.range(store, page.saturating_mul(per_page), per_page)?;
    Ok(serde_json::to_string(&HistoryPage {
        history: &entries,
        page,
        total_pages: total_points.div_ceil(per_page),
        total_points,
        points_per_page: per_page,
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::FixSource;
    use crate::store::MemoryStore;

    fn update(bytes: &[u8]) -> (Vec<FieldUpdate>, Vec<String>) {
        match decode_config(bytes).unwrap() {
            ConfigWrite::Update { updates, rejected } => (updates, rejected),
            ConfigWrite::Clear => panic!("unexpected clear"),
        }
    }

    #[test]
    fn long_and_short_keys_decode_alike() {
        let long = update(br#"{"phone_number":"+4915550","update_interval":120,"alert_enabled":false,"motion_sensitivity":0.7}"#);
        let short = update(br#"{"p":"+4915550","i":120,"a":false,"s":0.7}"#);
        assert_eq!(long, short);
        assert_eq!(long.0.len(), 4);
        assert!(long.1.is_empty());
    }

    #[test]
    fn invalid_fields_are_rejected_individually() {
        let (updates, rejected) = update(br#"{"phone_number":"abc","update_interval":30,"s":0.4}"#);
        assert_eq!(updates, vec![FieldUpdate::Sensitivity(0.4)]);
        assert_eq!(rejected, vec!["phone_number".to_string(), "update_interval".to_string()]);
    }

    #[test]
    fn all_clear_spellings() {
        for raw in [&b"CLEAR"[..], b"\"CLEAR\"", br#"{"cmd":"CLEAR"}"#, br#"{"phone_number":""}"#] {
            assert_eq!(decode_config(raw).unwrap(), ConfigWrite::Clear, "{raw:?}");
        }
    }

    #[test]
    fn oversized_or_malformed_writes_are_refused() {
        assert!(decode_config(&[b' '; MAX_WRITE_LEN + 1]).is_err());
        assert!(decode_config(b"{not json").is_err());
        assert!(decode_config(b"[1,2]").is_err());
    }

    #[test]
    fn identical_config_write_changes_nothing() {
        let mut config = Configuration::default();
        let write = br#"{"p":"+15550001","i":600}"#;

        let (updates, _) = update(write);
        assert!(config.apply(&updates));
        let (updates, _) = update(write);
        assert!(!config.apply(&updates));
    }

    #[test]
    fn commands() {
        assert_eq!(parse_command(b"SYNC").unwrap(), Command::Sync);
        assert_eq!(parse_command(b"CLEAR_HISTORY\n").unwrap(), Command::ClearHistory);
        assert_eq!(parse_command(b"GPS_PAGE:3").unwrap(), Command::Page(3));
        assert_eq!(parse_command(b"TEST_SMS").unwrap(), Command::TestSms);
        assert!(parse_command(b"GPS_PAGE:-1").is_err());
        assert!(parse_command(b"REBOOT").is_err());
    }

    #[test]
    fn phone_location() {
        let loc = decode_location(br#"{"lat":48.1,"lon":11.5,"speed":3.5}"#).unwrap();
        assert_eq!(loc.into_fix(9).fix_ms, 9);
        assert_eq!(decode_location(br#"{"lat":48.1,"lon":11.5}"#).unwrap().speed, 0.0);
        assert!(decode_location(br#"{"lat":0,"lon":0}"#).is_err());
        assert!(decode_location(br#"{"lat":91,"lon":0}"#).is_err());
    }

    #[test]
    fn device_name_uses_last_mac_bytes() {
        assert_eq!(device_name(&[0, 1, 2, 3, 0xAB, 0x0C]), "BikeTrk_AB0C");
    }

    fn snapshot(lat: f64) -> StatusSnapshot {
        let fix = PositionFix::new(lat, 13.405, 0);
        StatusSnapshot::new(
            &Configuration::default(),
            true,
            true,
            false,
            DeviceMode::LinkReady,
            Some(&fix),
        )
    }

    #[test]
    fn status_notify_suppressed_below_ten_metres() {
        let mut notifier = StatusNotifier::new(&Tuning::default());
        assert!(notifier.offer(snapshot(52.52)).unwrap().is_some());

        // ~5.6 m north.
        assert!(notifier.offer(snapshot(52.52005)).unwrap().is_none());
        // ~11 m from the last notified position.
        assert!(notifier.offer(snapshot(52.5201)).unwrap().is_some());
    }

    #[test]
    fn status_notify_on_any_other_field() {
        let mut notifier = StatusNotifier::new(&Tuning::default());
        notifier.offer(snapshot(52.52)).unwrap();
        assert!(notifier.offer(snapshot(52.52)).unwrap().is_none());

        let away = StatusSnapshot {
            user_present: false,
            mode: DeviceMode::Away,
            ..snapshot(52.52)
        };
        let json = notifier.offer(away).unwrap().unwrap();
        assert!(json.contains(r#""mode":"AWAY""#));
        assert!(json.contains(r#""user_present":false"#));
    }

    #[test]
    fn status_coordinates_are_text() {
        let json = StatusNotifier::new(&Tuning::default())
            .force(snapshot(52.52))
            .unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert!(v["lat"].is_string());
        assert_eq!(v["lat"], "52.520000");
        assert_eq!(v["lon"], "13.405000");
        assert_eq!(v["gps_valid"], true);
    }

    fn filled_history(store: &mut MemoryStore, n: u64) -> FixHistory {
        let mut history = FixHistory::load(store, 50);
        for t in 1..=n {
            history
                .append(
                    store,
                    HistoryEntry {
                        lat: 1.0,
                        lon: 2.0,
                        speed: 0.0,
                        time_ms: t,
                        source: FixSource::Modem,
                    },
                )
                .unwrap();
        }
        history
    }

    #[test]
    fn history_push_carries_most_recent_entries() {
        let mut store = MemoryStore::new();
        let history = filled_history(&mut store, 12);

        let json: Value = serde_json::from_str(&history_push_json(&history, &store, 10).unwrap()).unwrap();
        assert_eq!(json["count"], 10);
        assert_eq!(json["history"][0]["time"], 3);
        assert_eq!(json["history"][9]["src"], 1);
    }

    #[test]
    fn history_pages_are_zero_based() {
        let mut store = MemoryStore::new();
        let history = filled_history(&mut store, 23);

        let json: Value = serde_json::from_str(&history_page_json(&history, &store, 2, 10).unwrap()).unwrap();
        assert_eq!(json["totalPages"], 3);
        assert_eq!(json["totalPoints"], 23);
        assert_eq!(json["pointsPerPage"], 10);
        assert_eq!(json["history"].as_array().unwrap().len(), 3);
        assert_eq!(json["history"][0]["time"], 21);

        let past: Value = serde_json::from_str(&history_page_json(&history, &store, 9, 10).unwrap()).unwrap();
        assert_eq!(past["page"], 9);
        assert!(past["history"].as_array().unwrap().is_empty());
    }
}
