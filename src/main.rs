// Bike Tracker - Firmware Entry Point
//
// Every wake starts here, including wakes from deep sleep:
//   1. Classify the wake (cold boot, accelerometer interrupt, timer).
//   2. Restore the RTC-retained state and open NVS.
//   3. Bring up the accelerometer, proximity sensor and SIM7070G link.
//   4. Start the BLE server unless this is an alert-retry wake.
//   5. Run the tracker loop until it asks for deep sleep.
//
// All decisions live in `tracker_core::Tracker`; this file only wires the
// hardware to it and carries out the sleep it asks for.

mod config;
mod drivers;
mod rtc;
mod storage;
mod tasks;

use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use esp_idf_hal::gpio::AnyIOPin;
use esp_idf_hal::i2c::{I2cConfig, I2cDriver};
use esp_idf_hal::prelude::*;
use esp_idf_hal::uart::{config::Config as UartConfig, UartDriver};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use tracker_core::{Hardware, LinkEvent, Tracker, Tuning};

use crate::config::*;
use crate::drivers::lsm6dsl::{Lsm6dsl, SharedBus};
use crate::drivers::proximity::IrProximity;
use crate::drivers::sim7070g::Sim7070g;
use crate::storage::Storage;
use crate::tasks::ble::BleServer;

// ---------------------------------------------------------------------------
// Utility: wall-clock milliseconds.  The RTC keeps counting through deep
// sleep, so values from different wakes compare directly.
// ---------------------------------------------------------------------------
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------
fn main() -> anyhow::Result<()> {
    // Link esp-idf-sys runtime patches and initialise logging.
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    log::info!("Bike tracker firmware starting");

    let cause = tasks::power::wake_cause();
    let saved = rtc::load();

    // ---- Peripherals ------------------------------------------------------
    let peripherals = Peripherals::take()?;

    let nvs = match EspDefaultNvsPartition::take() {
        Ok(partition) => Some(partition),
        Err(e) => {
            log::error!("NVS partition unavailable: {e}");
            None
        }
    };
    let store = Storage::open(nvs.as_ref());

    // ---- I2C bus (LSM6DSL) ------------------------------------------------
    let i2c_config = I2cConfig::new().baudrate(I2C_BAUD_KHZ.kHz().into());
    let i2c = I2cDriver::new(
        peripherals.i2c0,
        peripherals.pins.gpio6, // SDA
        peripherals.pins.gpio7, // SCL
        &i2c_config,
    )
    .context("I2C bring-up")?;
    let i2c_bus: SharedBus = Box::leak(Box::new(Mutex::new(i2c)));

    let mut accelerometer = Lsm6dsl::new(i2c_bus);
    let wake_configured = saved.is_some_and(|s| s.motion_sensor_ready);
    if !accelerometer.probe() {
        log::error!("LSM6DSL not responding on either address");
        // Continue anyway: reads fail soft and the modem can still report.
    } else if let Err(e) = accelerometer.init(wake_configured) {
        log::error!("LSM6DSL init failed: {e:#}");
    }

    // ---- SIM7070G UART ----------------------------------------------------
    let uart = UartDriver::new(
        peripherals.uart1,
        peripherals.pins.gpio4, // TX
        peripherals.pins.gpio5, // RX
        Option::<AnyIOPin>::None,
        Option::<AnyIOPin>::None,
        &UartConfig::new().baudrate(Hertz(SIM_BAUD)),
    )
    .context("SIM7070G UART bring-up")?;

    let hardware = Hardware {
        store,
        accelerometer,
        range_sensor: IrProximity::new(),
        modem: Sim7070g::new(uart),
    };
    let mut tracker = Tracker::boot(hardware, Tuning::default(), cause, saved, now_ms());
    rtc::save(&tracker.retained());

    // ---- BLE --------------------------------------------------------------
    let (link_tx, link_rx) = mpsc::channel::<LinkEvent>();
    let ble = if tracker.session().starts_ble() {
        match BleServer::start(peripherals.modem, nvs.clone(), link_tx) {
            Ok(server) => Some(server),
            Err(e) => {
                log::error!("BLE start failed: {e:#}");
                None
            }
        }
    } else {
        log::info!("Alert-retry wake, BLE stays off");
        drop(link_tx);
        None
    };

    // ---- Tracker loop -----------------------------------------------------
    let period = Duration::from_millis(LOOP_PERIOD_MS);
    loop {
        let events: Vec<LinkEvent> = link_rx.try_iter().collect();
        let report = tracker.tick(events, now_ms());
        rtc::save(&tracker.retained());

        if let Some(server) = &ble {
            for note in &report.notifications {
                if let Err(e) = server.publish(note) {
                    log::warn!("BLE notify failed: {e:#}");
                }
            }
        }

        if let Some(plan) = report.sleep {
            tasks::power::enter_deep_sleep(plan);
        }

        thread::sleep(period);
    }
}
