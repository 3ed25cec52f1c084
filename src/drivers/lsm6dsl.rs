// Bike Tracker - LSM6DSL Accelerometer Driver
//
// Register-level driver over the shared I2C bus.  Only the accelerometer is
// used; the gyroscope stays powered down.  The wake-up engine drives INT1,
// which doubles as the deep-sleep wake GPIO.

use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use esp_idf_hal::i2c::I2cDriver;
use tracker_core::motion::{AccelSample, Accelerometer};

use crate::config::*;

/// Thread-safe handle to a shared I2C bus.
pub type SharedBus = &'static Mutex<I2cDriver<'static>>;

// LSM6DSL register addresses
const REG_WHO_AM_I: u8 = 0x0F;
const REG_CTRL1_XL: u8 = 0x10;
const REG_CTRL3_C: u8 = 0x12;
const REG_CTRL6_C: u8 = 0x15;
const REG_WAKE_UP_SRC: u8 = 0x1B;
const REG_STATUS: u8 = 0x1E;
const REG_OUTX_L_XL: u8 = 0x28; // Start of 6-byte accel burst
const REG_TAP_CFG: u8 = 0x58;
const REG_WAKE_UP_THS: u8 = 0x5B;
const REG_WAKE_UP_DUR: u8 = 0x5C;
const REG_MD1_CFG: u8 = 0x5E;
const WHO_AM_I_EXPECTED: u8 = 0x6A;

const CTRL1_52HZ_2G: u8 = 0x30;
const CTRL3_BDU_IF_INC: u8 = 0x44;
const CTRL3_SW_RESET: u8 = 0x01;
const CTRL6_XL_LOW_POWER: u8 = 0x10;
const STATUS_XLDA: u8 = 0x01;
const TAP_CFG_INTERRUPTS_LATCHED: u8 = 0x81;
const MD1_INT1_WU: u8 = 0x20;

pub struct Lsm6dsl {
    bus: SharedBus,
    addr: u8,
}

impl Lsm6dsl {
    pub fn new(bus: SharedBus) -> Self {
        Self {
            bus,
            addr: I2C_ADDRS_LSM6DSL[0],
        }
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, I2cDriver<'static>>> {
        self.bus.lock().map_err(|_| anyhow!("I2C bus mutex poisoned"))
    }

    fn write_reg(&self, reg: u8, value: u8) -> anyhow::Result<()> {
        self.lock()?.write(self.addr, &[reg, value], I2C_TIMEOUT_TICKS)?;
        Ok(())
    }

    fn read_regs(&self, reg: u8, buf: &mut [u8]) -> anyhow::Result<()> {
        self.lock()?.write_read(self.addr, &[reg], buf, I2C_TIMEOUT_TICKS)?;
        Ok(())
    }

    /// Find the sensor on either address.
    pub fn probe(&mut self) -> bool {
        for addr in I2C_ADDRS_LSM6DSL {
            self.addr = addr;
            let mut who = [0u8; 1];
            if self.read_regs(REG_WHO_AM_I, &mut who).is_ok() && who[0] == WHO_AM_I_EXPECTED {
                log::info!("LSM6DSL found at 0x{addr:02X}");
                return true;
            }
        }
        false
    }

    /// Configure the accelerometer for sampling (52 Hz, +-2 g).  A sensor
    /// whose wake-up engine is already armed from before sleep is not reset.
    pub fn init(&self, wake_configured: bool) -> anyhow::Result<()> {
        if !wake_configured {
            self.write_reg(REG_CTRL3_C, CTRL3_SW_RESET)?;
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        self.write_reg(REG_CTRL3_C, CTRL3_BDU_IF_INC)?;
        self.write_reg(REG_CTRL1_XL, CTRL1_52HZ_2G)?;
        self.write_reg(REG_CTRL6_C, 0x00)?;

        log::info!("LSM6DSL initialised (+-2g, 52Hz)");
        Ok(())
    }
}

impl Accelerometer for Lsm6dsl {
    fn read_sample(&mut self) -> anyhow::Result<Option<AccelSample>> {
        let mut status = [0u8; 1];
        self.read_regs(REG_STATUS, &mut status)?;
        if status[0] & STATUS_XLDA == 0 {
            return Ok(None);
        }

        let mut raw = [0u8; 6];
        self.read_regs(REG_OUTX_L_XL, &mut raw)?;
        Ok(Some(AccelSample::new(
            i16::from_le_bytes([raw[0], raw[1]]) as f32 * ACCEL_SCALE_2G,
            i16::from_le_bytes([raw[2], raw[3]]) as f32 * ACCEL_SCALE_2G,
            i16::from_le_bytes([raw[4], raw[5]]) as f32 * ACCEL_SCALE_2G,
        )))
    }

    fn arm_wake(&mut self, threshold_g: f32) -> anyhow::Result<()> {
        let ths = (threshold_g / WAKE_THS_LSB_G).round().clamp(1.0, 63.0) as u8;

        self.write_reg(REG_CTRL6_C, CTRL6_XL_LOW_POWER)?;
        self.write_reg(REG_WAKE_UP_DUR, 0x00)?;
        self.write_reg(REG_WAKE_UP_THS, ths)?;
        self.write_reg(REG_TAP_CFG, TAP_CFG_INTERRUPTS_LATCHED)?;
        self.write_reg(REG_MD1_CFG, MD1_INT1_WU)?;

        log::info!("Wake-up armed at {threshold_g:.3} g (THS={ths})");
        Ok(())
    }

    /// Reading WAKE_UP_SRC releases a latched INT1.
    fn clear_latched(&mut self) -> anyhow::Result<()> {
        let mut src = [0u8; 1];
        self.read_regs(REG_WAKE_UP_SRC, &mut src)?;
        log::debug!("WAKE_UP_SRC 0x{:02X}", src[0]);
        Ok(())
    }
}
