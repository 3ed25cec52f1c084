// Bike Tracker - Power Management
//
// Wake-cause classification on the way up and deep-sleep entry on the way
// down.  What to sleep for is decided by the tracker; this only programs
// the wake sources.

use esp_idf_sys as sys;
use tracker_core::{SleepPlan, WakeCause};

use crate::config::*;

pub fn wake_cause() -> WakeCause {
    let cause = unsafe { sys::esp_sleep_get_wakeup_cause() };
    match cause {
        sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_GPIO => WakeCause::Motion,
        sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_TIMER => WakeCause::Timer,
        _ => WakeCause::ColdBoot,
    }
}

/// Program the wake source for `plan` and enter deep sleep.
/// This function does not return.
pub fn enter_deep_sleep(plan: SleepPlan) -> ! {
    match plan {
        SleepPlan::MotionOnly { threshold_g } => {
            log::info!(
                "Entering deep sleep, wake on motion > {threshold_g:.3} g (GPIO{})",
                PIN_ACCEL_INT1
            );
            let ret = unsafe {
                sys::esp_deep_sleep_enable_gpio_wakeup(
                    1u64 << PIN_ACCEL_INT1,
                    sys::esp_deepsleep_gpio_wake_up_mode_t_ESP_GPIO_WAKEUP_GPIO_HIGH,
                )
            };
            if ret != sys::ESP_OK {
                log::error!("GPIO wake config failed ({})", ret);
            }
        }
        SleepPlan::Timer { seconds } => {
            log::info!("Entering deep sleep, timer wake in {seconds} s");
            unsafe {
                sys::esp_sleep_enable_timer_wakeup(u64::from(seconds) * 1_000_000);
            }
        }
    }

    unsafe { sys::esp_deep_sleep_start() }
}
