// Bike Tracker - Behavioral Tuning
//
// Every threshold, timeout and ceiling the state machines use.  Firmware
// revisions disagreed on most of these, so they are plain data with
// field-tested defaults rather than constants baked into the logic.

/// Linear map from the user's sensitivity setting to an acceleration
/// threshold: higher sensitivity gives a lower threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensitivityCurve {
    /// Threshold (g) at zero sensitivity.
    pub max_g: f32,
    /// Threshold drop (g) between zero and full sensitivity.
    pub range_g: f32,
}

impl SensitivityCurve {
    pub fn threshold_g(&self, sensitivity: f32) -> f32 {
        self.max_g - sensitivity.clamp(0.0, 1.0) * self.range_g
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    // ---- Motion -----------------------------------------------------------
    /// Software detection threshold on the delta from the adaptive reference.
    pub motion_detect: SensitivityCurve,
    /// Hardware wake-up threshold programmed before motion-only sleep.
    pub motion_wake: SensitivityCurve,
    /// Fraction the reference moves toward a sample while moving.
    pub reference_blend: f32,
    /// Quiet time before "moving" clears.
    pub motion_dwell_ms: u64,

    // ---- Presence ---------------------------------------------------------
    pub presence_threshold_mm: u16,
    pub presence_debounce_ms: u64,

    // ---- Positioning ------------------------------------------------------
    pub fix_attempts: u32,
    pub fix_retry_delay_ms: u32,
    pub gnss_warmup_ms: u32,
    /// Reset the modem before every acquisition for a clean GNSS state.
    pub reset_before_fix: bool,
    /// A stored fix older than this is never reused as `Cached`.
    pub cache_staleness_ms: u64,
    /// Consecutive `Cached` outcomes tolerated before reporting no location.
    pub cached_fix_ceiling: u32,

    // ---- Alerting ---------------------------------------------------------
    pub alert_attempts: u32,
    pub alert_retry_delay_ms: u32,
    /// Back-off before retrying a failed first alert in the same session.
    pub alert_backoff_ms: u64,
    /// Failed alerts tolerated in one wake before sleeping on a timer and
    /// trying again on the next wake.
    pub alert_session_attempts: u32,
    /// Time a motion-woken device waits for the phone to reconnect.
    pub reconnect_grace_ms: u64,

    // ---- Sleep ------------------------------------------------------------
    /// Stillness required before a disconnected device goes back to sleep.
    pub idle_sleep_ms: u64,

    // ---- BLE protocol -----------------------------------------------------
    pub history_push_len: usize,
    pub history_page_len: usize,
    /// Position movement below this does not count as a status change.
    pub status_position_epsilon_m: f64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            motion_detect: SensitivityCurve {
                max_g: 2.0,
                range_g: 1.0,
            },
            // LSM6DSL wake threshold LSB is 31.25 mg at +-2 g; keep at least 2 LSB.
            motion_wake: SensitivityCurve {
                max_g: 0.5,
                range_g: 0.4375,
            },
            reference_blend: 0.02,
            motion_dwell_ms: 1_000,

            presence_threshold_mm: 800,
            presence_debounce_ms: 250,

            fix_attempts: 60,
            fix_retry_delay_ms: 2_000,
            gnss_warmup_ms: 2_000,
            reset_before_fix: true,
            cache_staleness_ms: 5 * 60 * 1_000,
            cached_fix_ceiling: 3,

            alert_attempts: 3,
            alert_retry_delay_ms: 5_000,
            alert_backoff_ms: 60_000,
            alert_session_attempts: 3,
            reconnect_grace_ms: 20_000,

            idle_sleep_ms: 10_000,

            history_push_len: 10,
            history_page_len: 10,
            status_position_epsilon_m: 10.0,
        }
    }
}
