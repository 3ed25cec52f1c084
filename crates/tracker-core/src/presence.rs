// Bike Tracker - Presence Debouncing
//
// A person is "present" when the ranging sensor sees something closer than
// the threshold.  A changed reading must hold for the debounce interval
// before it is reported.

use log::{info, warn};

use crate::tuning::Tuning;

pub trait RangeSensor {
    fn read_distance_mm(&mut self) -> anyhow::Result<u16>;
}

#[derive(Debug, Clone)]
pub struct PresenceDebouncer {
    threshold_mm: u16,
    debounce_ms: u64,
    stable: Option<bool>,
    candidate: Option<(bool, u64)>,
}

impl PresenceDebouncer {
    pub fn new(tuning: &Tuning) -> Self {
        Self {
            threshold_mm: tuning.presence_threshold_mm,
            debounce_ms: tuning.presence_debounce_ms,
            stable: None,
            candidate: None,
        }
    }

    pub fn is_present(&self) -> bool {
        self.stable.unwrap_or(false)
    }

    /// Feed one distance reading.  The first reading is taken as-is so a
    /// freshly woken device has an answer without waiting.
    pub fn update(&mut self, distance_mm: u16, now_ms: u64) -> bool {
        let raw = distance_mm < self.threshold_mm;

        let Some(stable) = self.stable else {
            self.stable = Some(raw);
            return raw;
        };

        if raw == stable {
            self.candidate = None;
            return stable;
        }

        match self.candidate {
            Some((value, since)) if value == raw => {
                if now_ms.saturating_sub(since) >= self.debounce_ms {
                    info!("Presence -> {}", if raw { "present" } else { "away" });
                    self.stable = Some(raw);
                    self.candidate = None;
                }
            }
            _ => self.candidate = Some((raw, now_ms)),
        }

        self.is_present()
    }

    /// Read the sensor and debounce.  Errors keep the last reported value.
    pub fn poll(&mut self, sensor: &mut impl RangeSensor, now_ms: u64) -> bool {
        match sensor.read_distance_mm() {
            Ok(mm) => self.update(mm, now_ms),
            Err(e) => {
                warn!("Range sensor read failed: {e:#}");
                self.is_present()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEAR: u16 = 300;
    const FAR: u16 = 2_000;

    #[test]
    fn first_reading_is_immediate() {
        let mut p = PresenceDebouncer::new(&Tuning::default());
        assert!(p.update(NEAR, 0));
    }

    #[test]
    fn change_must_persist_for_debounce_interval() {
        let mut p = PresenceDebouncer::new(&Tuning::default());
        p.update(NEAR, 0);

        assert!(p.update(FAR, 100));
        assert!(p.update(FAR, 300), "only 200 ms so far");
        assert!(!p.update(FAR, 350));
    }

    #[test]
    fn flicker_restarts_the_debounce() {
        let mut p = PresenceDebouncer::new(&Tuning::default());
        p.update(NEAR, 0);

        p.update(FAR, 100);
        p.update(NEAR, 200);
        p.update(FAR, 300);
        assert!(p.update(FAR, 500));
        assert!(!p.update(FAR, 550));
    }

    struct Broken;

    impl RangeSensor for Broken {
        fn read_distance_mm(&mut self) -> anyhow::Result<u16> {
            anyhow::bail!("no ack")
        }
    }

    #[test]
    fn sensor_error_keeps_last_value() {
        let mut p = PresenceDebouncer::new(&Tuning::default());
        p.update(NEAR, 0);
        assert!(p.poll(&mut Broken, 1_000));
    }
}
