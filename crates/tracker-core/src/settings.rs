// Bike Tracker - User Configuration
//
// User configuration persisted in NVS.
//
// Survives every kind of reset including power loss.  Written only from
// validated BLE configuration writes and reset to defaults by a clear.

use std::ops::RangeInclusive;

use anyhow::bail;
use log::{info, warn};

use crate::store::KvStore;

pub const NAMESPACE: &str = "config";
const KEY_PHONE: &str = "phone";
const KEY_INTERVAL: &str = "interval";
const KEY_ALERTS: &str = "alerts";
const KEY_SENSITIVITY: &str = "sens";

pub const PHONE_MAX_LEN: usize = 19;
pub const INTERVAL_RANGE_S: RangeInclusive<u32> = 60..=3600;
pub const SENSITIVITY_RANGE: RangeInclusive<f32> = 0.1..=1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub phone_number: String,
    pub report_interval_s: u32,
    pub alerts_enabled: bool,
    pub motion_sensitivity: f32,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            phone_number: String::new(),
            report_interval_s: 300,
            alerts_enabled: true,
            motion_sensitivity: 0.5,
        }
    }
}

/// One validated field from a configuration write.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Phone(String),
    Interval(u32),
    Alerts(bool),
    Sensitivity(f32),
}

impl Configuration {
    pub fn phone_configured(&self) -> bool {
        !self.phone_number.is_empty()
    }

    /// Whether an SMS alert may be sent at all.
    pub fn can_alert(&self) -> bool {
        self.alerts_enabled && self.phone_configured()
    }

    /// Load from storage.  Missing, unreadable or out-of-range fields fall
    /// back to their defaults individually.
    pub fn load(store: &impl KvStore) -> Self {
        let defaults = Self::default();

        let phone_number = match store.get_str(NAMESPACE, KEY_PHONE) {
            Ok(Some(phone)) if validate_phone(&phone).is_ok() => phone,
            Ok(_) => defaults.phone_number,
            Err(e) => {
                warn!("Config: phone unreadable ({e:#}), using default");
                defaults.phone_number
            }
        };
        let report_interval_s = match store.get_u32(NAMESPACE, KEY_INTERVAL) {
            Ok(Some(v)) if INTERVAL_RANGE_S.contains(&v) => v,
            Ok(_) => defaults.report_interval_s,
            Err(e) => {
                warn!("Config: interval unreadable ({e:#}), using default");
                defaults.report_interval_s
            }
        };
        let alerts_enabled = match store.get_bool(NAMESPACE, KEY_ALERTS) {
            Ok(Some(v)) => v,
            Ok(None) => defaults.alerts_enabled,
            Err(e) => {
                warn!("Config: alerts flag unreadable ({e:#}), using default");
                defaults.alerts_enabled
            }
        };
        let motion_sensitivity = match store.get_f32(NAMESPACE, KEY_SENSITIVITY) {
            Ok(Some(v)) if SENSITIVITY_RANGE.contains(&v) => v,
            Ok(_) => defaults.motion_sensitivity,
            Err(e) => {
                warn!("Config: sensitivity unreadable ({e:#}), using default");
                defaults.motion_sensitivity
            }
        };

        Self {
            phone_number,
            report_interval_s,
            alerts_enabled,
            motion_sensitivity,
        }
    }

    pub fn save(&self, store: &mut impl KvStore) -> anyhow::Result<()> {
        store.set_str(NAMESPACE, KEY_PHONE, &self.phone_number)?;
        store.set_u32(NAMESPACE, KEY_INTERVAL, self.report_interval_s)?;
        store.set_bool(NAMESPACE, KEY_ALERTS, self.alerts_enabled)?;
        store.set_f32(NAMESPACE, KEY_SENSITIVITY, self.motion_sensitivity)?;
        Ok(())
    }

    /// Apply validated updates.  Returns `true` only if a value actually
    /// changed, so repeating an identical write is a no-op.
    pub fn apply(&mut self, updates: &[FieldUpdate]) -> bool {
        let before = self.clone();
        for update in updates {
            match update {
                FieldUpdate::Phone(phone) => self.phone_number.clone_from(phone),
                FieldUpdate::Interval(seconds) => self.report_interval_s = *seconds,
                FieldUpdate::Alerts(enabled) => self.alerts_enabled = *enabled,
                FieldUpdate::Sensitivity(value) => self.motion_sensitivity = *value,
            }
        }
        let changed = *self != before;
        if changed {
            info!(
                "Config updated: phone={} interval={}s alerts={} sensitivity={:.2}",
                if self.phone_configured() { "set" } else { "unset" },
                self.report_interval_s,
                self.alerts_enabled,
                self.motion_sensitivity
            );
        }
        changed
    }
}

// ---------------------------------------------------------------------------
// Field validators
// ---------------------------------------------------------------------------

/// Accepts an optional leading `+` followed by digits, at most
/// [`PHONE_MAX_LEN`] characters in total.  Empty input is handled by the
/// caller (it means "clear").
pub fn validate_phone(phone: &str) -> anyhow::Result<String> {
    let phone = phone.trim();
    if phone.is_empty() {
        bail!("phone number is empty");
    }
    if phone.len() > PHONE_MAX_LEN {
        bail!("phone number longer than {PHONE_MAX_LEN} characters");
    }
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        bail!("phone number must be digits with an optional leading '+'");
    }
    Ok(phone.to_owned())
}

pub fn validate_interval(seconds: i64) -> anyhow::Result<u32> {
    match u32::try_from(seconds) {
        Ok(s) if INTERVAL_RANGE_S.contains(&s) => Ok(s),
        _ => bail!(
            "interval {seconds}s outside {}..={}",
            INTERVAL_RANGE_S.start(),
            INTERVAL_RANGE_S.end()
        ),
    }
}

pub fn validate_sensitivity(value: f64) -> anyhow::Result<f32> {
    let value = value as f32;
    if !value.is_finite() || !SENSITIVITY_RANGE.contains(&value) {
        bail!(
            "sensitivity {value} outside {}..={}",
            SENSITIVITY_RANGE.start(),
            SENSITIVITY_RANGE.end()
        );
    }
    Ok(value)
}
