// Bike Tracker - Positioning
//
// Acquisition runs the GNSS receiver for a bounded number of polls and
// persists any valid fix at once.  When it fails, the stored fix may stand in
// (`Cached`) while it is young, but only for a limited number of consecutive
// cycles so ever-staler coordinates are not re-sent as if current.

use log::{info, warn};

use crate::history::{FixHistory, FixSource};
use crate::modem::{AtChannel, CellModem};
use crate::retained::CrossSleepState;
use crate::store::KvStore;
use crate::tuning::Tuning;

pub const NAMESPACE: &str = "gps-data";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f32,
    pub speed_kmh: f32,
    pub course: f32,
    /// Receiver UTC timestamp, `yyyyMMddhhmmss.sss`.
    pub utc: String,
    /// Device wall-clock ms when the fix was taken.
    pub fix_ms: u64,
    pub valid: bool,
}

impl PositionFix {
    pub fn new(latitude: f64, longitude: f64, fix_ms: u64) -> Self {
        Self {
            latitude,
            longitude,
            fix_ms,
            valid: true,
            ..Self::default()
        }
    }

    /// `None` when the fix claims to come from the future, which happens
    /// after the RTC lost power: its real age is unknown.
    pub fn age_ms(&self, now_ms: u64) -> Option<u64> {
        now_ms.checked_sub(self.fix_ms)
    }

    pub fn lat_str(&self) -> String {
        format!("{:.6}", self.latitude)
    }

    pub fn lon_str(&self) -> String {
        format!("{:.6}", self.longitude)
    }

    pub fn geo_uri(&self) -> String {
        format!("geo:{:.6},{:.6}", self.latitude, self.longitude)
    }

    /// Great-circle distance in metres.
    pub fn distance_m(&self, other: &PositionFix) -> f64 {
        distance_m(self.latitude, self.longitude, other.latitude, other.longitude)
    }

    // ---- persistence ------------------------------------------------------

    pub fn load(store: &impl KvStore) -> anyhow::Result<Option<Self>> {
        if !store.get_bool(NAMESPACE, "valid")?.unwrap_or(false) {
            return Ok(None);
        }
        let text = |key: &str| -> anyhow::Result<String> {
            Ok(store.get_str(NAMESPACE, key)?.unwrap_or_default())
        };
        let number = |key: &str| -> anyhow::Result<f32> {
            Ok(text(key)?.parse().unwrap_or(0.0))
        };

        let (Ok(latitude), Ok(longitude)) = (text("lat")?.parse::<f64>(), text("lon")?.parse::<f64>()) else {
            warn!("Stored fix has unparsable coordinates, ignoring it");
            return Ok(None);
        };
        Ok(Some(Self {
            latitude,
            longitude,
            altitude: number("alt")?,
            speed_kmh: number("speed")?,
            course: number("course")?,
            utc: text("datetime")?,
            fix_ms: store.get_u64(NAMESPACE, "timestamp")?.unwrap_or(0),
            valid: true,
        }))
    }

    pub fn save(&self, store: &mut impl KvStore) -> anyhow::Result<()> {
        store.set_str(NAMESPACE, "lat", &self.lat_str())?;
        store.set_str(NAMESPACE, "lon", &self.lon_str())?;
        store.set_str(NAMESPACE, "datetime", &self.utc)?;
        store.set_str(NAMESPACE, "alt", &format!("{:.1}", self.altitude))?;
        store.set_str(NAMESPACE, "speed", &format!("{:.2}", self.speed_kmh))?;
        store.set_str(NAMESPACE, "course", &format!("{:.1}", self.course))?;
        store.set_u64(NAMESPACE, "timestamp", self.fix_ms)?;
        store.set_bool(NAMESPACE, "valid", self.valid)?;
        Ok(())
    }
}

pub fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

// ---------------------------------------------------------------------------
// AT+CGNSINF decoding
// ---------------------------------------------------------------------------

type FieldSetter = fn(&mut PositionFix, &str) -> Option<()>;

/// `+CGNSINF: <run>,<fix>,<utc>,<lat>,<lon>,<alt>,<speed>,<course>,...`
const GNSS_FIELDS: [(usize, FieldSetter); 6] = [
    (2, set_utc),
    (3, set_latitude),
    (4, set_longitude),
    (5, set_altitude),
    (6, set_speed),
    (7, set_course),
];

fn set_utc(fix: &mut PositionFix, v: &str) -> Option<()> {
    fix.utc = v.to_owned();
    Some(())
}

fn set_latitude(fix: &mut PositionFix, v: &str) -> Option<()> {
    fix.latitude = coordinate(v, 90.0)?;
    Some(())
}

fn set_longitude(fix: &mut PositionFix, v: &str) -> Option<()> {
    fix.longitude = coordinate(v, 180.0)?;
    Some(())
}

fn set_altitude(fix: &mut PositionFix, v: &str) -> Option<()> {
    fix.altitude = optional_number(v)?;
    Some(())
}

fn set_speed(fix: &mut PositionFix, v: &str) -> Option<()> {
    fix.speed_kmh = optional_number(v)?;
    Some(())
}

fn set_course(fix: &mut PositionFix, v: &str) -> Option<()> {
    fix.course = optional_number(v)?;
    Some(())
}

fn coordinate(v: &str, limit: f64) -> Option<f64> {
    let value: f64 = v.parse().ok()?;
    (value != 0.0 && value.abs() <= limit).then_some(value)
}

fn optional_number(v: &str) -> Option<f32> {
    if v.is_empty() {
        Some(0.0)
    } else {
        v.parse().ok()
    }
}

/// Decode a CGNSINF response.  `None` unless the receiver is running, has
/// a fix, and both coordinates are present and non-zero.
pub fn parse_cgnsinf(response: &str, now_ms: u64) -> Option<PositionFix> {
    let line = response
        .lines()
        .find_map(|l| l.trim().strip_prefix("+CGNSINF:"))?;
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();

    if fields.first() != Some(&"1") || fields.get(1) != Some(&"1") {
        return None;
    }

    let mut fix = PositionFix {
        fix_ms: now_ms,
        valid: true,
        ..PositionFix::default()
    };
    for (index, set) in GNSS_FIELDS {
        set(&mut fix, fields.get(index).copied().unwrap_or(""))?;
    }
    Some(fix)
}

// ---------------------------------------------------------------------------
// Outcome policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FixOutcome {
    /// Acquired this cycle.
    Fresh(PositionFix),
    /// Acquisition failed; reusing a stored fix still inside the staleness
    /// ceiling.
    Cached(PositionFix),
    /// No reliable location.  `last_known` is the stale fix, if any ever
    /// existed, for the "outdated" wording.
    None { last_known: Option<PositionFix> },
}

impl FixOutcome {
    pub fn fix(&self) -> Option<&PositionFix> {
        match self {
            FixOutcome::Fresh(fix) | FixOutcome::Cached(fix) => Some(fix),
            FixOutcome::None { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Positioning {
    attempts: u32,
    retry_delay_ms: u32,
    warmup_ms: u32,
    reset_first: bool,
    staleness_ms: u64,
    cached_ceiling: u32,
}

impl Positioning {
    pub fn new(tuning: &Tuning) -> Self {
        Self {
            attempts: tuning.fix_attempts,
            retry_delay_ms: tuning.fix_retry_delay_ms,
            warmup_ms: tuning.gnss_warmup_ms,
            reset_first: tuning.reset_before_fix,
            staleness_ms: tuning.cache_staleness_ms,
            cached_ceiling: tuning.cached_fix_ceiling,
        }
    }

    /// Power GNSS, poll for a fix, persist and log it, power GNSS off.
    /// Transient failures all end in `None`.
    pub fn acquire<C: AtChannel, S: KvStore>(
        &self,
        modem: &mut CellModem<C>,
        store: &mut S,
        history: &mut FixHistory,
        now_ms: u64,
    ) -> Option<PositionFix> {
        if self.reset_first {
            if let Err(e) = modem.reset() {
                warn!("Modem reset before GNSS failed: {e:#}");
            }
        }
        if let Err(e) = modem.enable_gnss() {
            warn!("GNSS power-on failed: {e:#}");
            return None;
        }
        modem.channel_mut().pause_ms(self.warmup_ms);

        let mut acquired = None;
        for attempt in 1..=self.attempts {
            match modem.gnss_info() {
                Ok(Some(response)) => {
                    if let Some(fix) = parse_cgnsinf(&response, now_ms) {
                        info!(
                            "GNSS fix on attempt {attempt}: {}, {}",
                            fix.lat_str(),
                            fix.lon_str()
                        );
                        acquired = Some(fix);
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("CGNSINF poll failed: {e:#}"),
            }
            if attempt < self.attempts {
                modem.channel_mut().pause_ms(self.retry_delay_ms);
            }
        }

        if let Some(fix) = &acquired {
            if let Err(e) = fix.save(store) {
                warn!("Persisting fix failed: {e:#}");
            }
            if let Err(e) = history.append_fix(store, fix, FixSource::Modem) {
                warn!("Logging fix failed: {e:#}");
            }
        } else {
            warn!("No GNSS fix after {} attempts", self.attempts);
        }

        if let Err(e) = modem.disable_gnss() {
            warn!("GNSS power-off failed: {e:#}");
        }
        acquired
    }

    /// Classify an acquisition result and update the cached-fix counter.
    /// `stored_dated` is false when the stored fix was taken under an earlier
    /// wall-clock epoch; such a fix is never `Cached`.
    pub fn classify(
        &self,
        acquired: Option<PositionFix>,
        stored: Option<PositionFix>,
        stored_dated: bool,
        now_ms: u64,
        retained: &mut CrossSleepState,
    ) -> FixOutcome {
        if let Some(fix) = acquired {
            retained.consecutive_cached_fixes = 0;
            return FixOutcome::Fresh(fix);
        }

        let Some(stored) = stored.filter(|f| f.valid) else {
            return FixOutcome::None { last_known: None };
        };

        let young = stored_dated
            && stored
                .age_ms(now_ms)
                .is_some_and(|age| age < self.staleness_ms);
        if !young {
            return FixOutcome::None {
                last_known: Some(stored),
            };
        }

        if retained.consecutive_cached_fixes >= self.cached_ceiling {
            warn!(
                "{} cached fixes in a row, reporting no reliable location",
                retained.consecutive_cached_fixes
            );
            return FixOutcome::None {
                last_known: Some(stored),
            };
        }

        retained.consecutive_cached_fixes += 1;
        FixOutcome::Cached(stored)
    }
}
