// Bike Tracker - Motion Detection
//
// Adaptive-baseline detector: the reference vector creeps toward the current
// sample while moving so sustained vibration cannot desensitize it forever,
// and snaps to the sample once the device has been still for the dwell time.

use log::{debug, info};

use crate::tuning::Tuning;

/// One accelerometer reading in g.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccelSample {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl AccelSample {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &AccelSample) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    fn blend_toward(&mut self, target: &AccelSample, weight: f32) {
        self.x = self.x * (1.0 - weight) + target.x * weight;
        self.y = self.y * (1.0 - weight) + target.y * weight;
        self.z = self.z * (1.0 - weight) + target.z * weight;
    }
}

/// Accelerometer capability as the detector and the sleep path need it.
pub trait Accelerometer {
    /// `Ok(None)` when no new sample is ready yet.
    fn read_sample(&mut self) -> anyhow::Result<Option<AccelSample>>;

    /// Program the sensor's own wake-up interrupt for motion-only sleep.
    fn arm_wake(&mut self, threshold_g: f32) -> anyhow::Result<()>;

    /// Read back and discard any latched interrupt so sleep does not end
    /// immediately on a stale event.
    fn clear_latched(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct MotionDetector {
    reference: AccelSample,
    initialised: bool,
    moving: bool,
    last_motion_ms: u64,
    threshold_g: f32,
    blend: f32,
    dwell_ms: u64,
}

impl MotionDetector {
    pub fn new(tuning: &Tuning, sensitivity: f32) -> Self {
        Self {
            // Gravity on Z until the first real sample arrives.
            reference: AccelSample::new(0.0, 0.0, 1.0),
            initialised: false,
            moving: false,
            last_motion_ms: 0,
            threshold_g: tuning.motion_detect.threshold_g(sensitivity),
            blend: tuning.reference_blend,
            dwell_ms: tuning.motion_dwell_ms,
        }
    }

    pub fn set_threshold(&mut self, threshold_g: f32) {
        self.threshold_g = threshold_g;
    }

    pub fn is_moving(&self) -> bool {
        self.moving
    }

    pub fn reference(&self) -> AccelSample {
        self.reference
    }

    pub fn ms_since_motion(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_motion_ms)
    }

    /// Feed one sample and return the debounced moving flag.
    pub fn update(&mut self, sample: AccelSample, now_ms: u64) -> bool {
        if !self.initialised {
            self.reference = sample;
            self.initialised = true;
            self.last_motion_ms = now_ms;
            return self.moving;
        }

        let delta = sample.distance(&self.reference);
        if delta > self.threshold_g {
            if !self.moving {
                info!("Motion detected, delta {delta:.3} g");
            }
            self.moving = true;
            self.last_motion_ms = now_ms;
            self.reference.blend_toward(&sample, self.blend);
        } else if self.moving && now_ms.saturating_sub(self.last_motion_ms) >= self.dwell_ms {
            info!("Motion stopped");
            self.moving = false;
            self.reference = sample;
        } else {
            debug!("delta {delta:.3} g below {:.3} g", self.threshold_g);
        }

        self.moving
    }

    /// Treat the current moment as still, e.g. right after arming wake-up.
    pub fn reset(&mut self, now_ms: u64) {
        self.moving = false;
        self.last_motion_ms = now_ms;
        self.initialised = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REST: AccelSample = AccelSample::new(0.0, 0.0, 1.0);
    const SHOVE: AccelSample = AccelSample::new(1.8, 0.0, 1.0);

    fn detector() -> MotionDetector {
        // Sensitivity 1.0 -> 1.0 g threshold.
        MotionDetector::new(&Tuning::default(), 1.0)
    }

    #[test]
    fn first_sample_only_seeds_reference() {
        let mut d = detector();
        assert!(!d.update(SHOVE, 0));
        assert_eq!(d.reference(), SHOVE);
    }

    #[test]
    fn delta_above_threshold_asserts_and_nudges_reference() {
        let mut d = detector();
        d.update(REST, 0);
        assert!(d.update(SHOVE, 10));

        let r = d.reference();
        assert!((r.x - 0.036).abs() < 1e-4, "reference moved 2% toward sample, got {r:?}");
    }

    #[test]
    fn clears_only_after_dwell_and_snaps_reference() {
        let mut d = detector();
        d.update(REST, 0);
        d.update(SHOVE, 100);

        let quiet = AccelSample::new(0.1, 0.0, 1.0);
        assert!(d.update(quiet, 600), "still inside dwell window");
        assert!(!d.update(quiet, 1_100));
        assert_eq!(d.reference(), quiet);
    }

    #[test]
    fn sustained_vibration_keeps_motion_asserted() {
        let mut d = detector();
        d.update(REST, 0);
        for step in 1..50u64 {
            let sample = if step % 2 == 0 { SHOVE } else { AccelSample::new(-0.5, 0.0, 1.0) };
            d.update(sample, step * 20);
        }
        assert!(d.is_moving());
    }

    #[test]
    fn lower_sensitivity_needs_harder_shove() {
        let mut d = MotionDetector::new(&Tuning::default(), 0.1);
        d.update(REST, 0);
        assert!(!d.update(AccelSample::new(1.5, 0.0, 1.0), 10));
        assert!(d.update(AccelSample::new(2.0, 0.0, 1.0), 20));
    }
}
