// Bike Tracker - Cross-Sleep State
//
// State that must survive deep sleep but not a cold boot.
//
// The firmware keeps the encoded words in RTC slow memory.  This is a
// separate tier from the NVS-backed `crate::settings` and fix storage:
// nothing here is ever written to flash.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CrossSleepState {
    /// An alert pair went out since the phone last connected.
    pub already_alerted: bool,
    /// Wall-clock ms of the last successful alert.
    pub last_alert_ms: u64,
    /// Woken by motion and the alert has not gone out yet.
    pub pending_motion_alert: bool,
    /// The accelerometer's wake-up interrupt is configured; skip its reset.
    pub motion_sensor_ready: bool,
    pub consecutive_cached_fixes: u32,
}

pub const WORDS: usize = 6;

const MAGIC: u32 = 0x4254_524B; // "BTRK"
const FLAG_ALERTED: u32 = 1 << 0;
const FLAG_PENDING: u32 = 1 << 1;
const FLAG_SENSOR_READY: u32 = 1 << 2;

impl CrossSleepState {
    /// Pack into RTC words: magic, flags, last alert (lo, hi), cached
    /// counter, checksum.
    pub fn to_words(&self) -> [u32; WORDS] {
        let mut flags = 0;
        if self.already_alerted {
            flags |= FLAG_ALERTED;
        }
        if self.pending_motion_alert {
            flags |= FLAG_PENDING;
        }
        if self.motion_sensor_ready {
            flags |= FLAG_SENSOR_READY;
        }

        let mut words = [
            MAGIC,
            flags,
            self.last_alert_ms as u32,
            (self.last_alert_ms >> 32) as u32,
            self.consecutive_cached_fixes,
            0,
        ];
        words[WORDS - 1] = checksum(&words[..WORDS - 1]);
        words
    }

    /// `None` when the image was never written (first power-up leaves RTC
    /// memory undefined) or is damaged.
    pub fn from_words(words: &[u32; WORDS]) -> Option<Self> {
        if words[0] != MAGIC || words[WORDS - 1] != checksum(&words[..WORDS - 1]) {
            return None;
        }
        let flags = words[1];
        Some(Self {
            already_alerted: flags & FLAG_ALERTED != 0,
            pending_motion_alert: flags & FLAG_PENDING != 0,
            motion_sensor_ready: flags & FLAG_SENSOR_READY != 0,
            last_alert_ms: u64::from(words[2]) | (u64::from(words[3]) << 32),
            consecutive_cached_fixes: words[4],
        })
    }

    /// Phone came back: the alert episode is over.
    pub fn end_episode(&mut self) {
        self.already_alerted = false;
        self.pending_motion_alert = false;
        self.consecutive_cached_fixes = 0;
    }
}

fn checksum(words: &[u32]) -> u32 {
    words
        .iter()
        .fold(0x811C_9DC5u32, |acc, w| (acc ^ w).wrapping_mul(0x0100_0193))
}
