// Bike Tracker - Analog IR Proximity Sensor
//
// The sensor output sits on GPIO2 / ADC1 channel 2 and is sampled with the
// oneshot ADC driver through raw ESP-IDF calls.  Output voltage falls with
// distance, roughly d[cm] = 29.988 * V^-1.173 across the 10-80 cm band.

use anyhow::bail;
use esp_idf_sys::{self as sys, esp};
use tracker_core::presence::RangeSensor;

use crate::config::*;

const CHANNEL: sys::adc_channel_t = sys::adc_channel_t_ADC_CHANNEL_2; // GPIO2

pub struct IrProximity {
    handle: sys::adc_oneshot_unit_handle_t,
}

impl IrProximity {
    /// Set up ADC1 for the sensor pin.  A failed setup is logged and leaves
    /// the sensor in a state where every read errors.
    pub fn new() -> Self {
        let mut handle: sys::adc_oneshot_unit_handle_t = core::ptr::null_mut();
        unsafe {
            let unit_cfg = sys::adc_oneshot_unit_init_cfg_t {
                unit_id: sys::adc_unit_t_ADC_UNIT_1,
                ulp_mode: sys::adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
                ..core::mem::zeroed()
            };
            let ret = sys::adc_oneshot_new_unit(&unit_cfg, &mut handle);
            if ret != sys::ESP_OK {
                log::error!("ADC unit init failed ({})", ret);
                return Self { handle: core::ptr::null_mut() };
            }

            let chan_cfg = sys::adc_oneshot_chan_cfg_t {
                atten: sys::adc_atten_t_ADC_ATTEN_DB_11,
                bitwidth: sys::adc_bitwidth_t_ADC_BITWIDTH_12,
            };
            let ret = sys::adc_oneshot_config_channel(handle, CHANNEL, &chan_cfg);
            if ret != sys::ESP_OK {
                log::error!("ADC channel config failed ({})", ret);
            }
        }
        Self { handle }
    }
}

impl RangeSensor for IrProximity {
    fn read_distance_mm(&mut self) -> anyhow::Result<u16> {
        if self.handle.is_null() {
            bail!("proximity ADC not initialised");
        }
        let mut raw: i32 = 0;
        esp!(unsafe { sys::adc_oneshot_read(self.handle, CHANNEL, &mut raw) })?;
        Ok(volts_to_mm((raw as f32 / 4095.0) * ADC_FULL_SCALE_V))
    }
}

impl Drop for IrProximity {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe {
                sys::adc_oneshot_del_unit(self.handle);
            }
        }
    }
}

fn volts_to_mm(volts: f32) -> u16 {
    if volts < PROXIMITY_MIN_V {
        return PROXIMITY_FAR_MM;
    }
    let cm = 29.988 * volts.powf(-1.173);
    (cm * 10.0).clamp(0.0, PROXIMITY_FAR_MM as f32) as u16
}
