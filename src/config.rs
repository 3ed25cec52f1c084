// Bike Tracker - Hardware & System Configuration
// Target: ESP32-C3 (RISC-V) + LSM6DSL + SIM7070G + analog IR proximity sensor

// ---------------------------------------------------------------------------
// GPIO Pin Definitions
// ---------------------------------------------------------------------------
pub const PIN_ACCEL_INT1: i32 = 0;  // LSM6DSL INT1, wake-up interrupt (active HIGH)
// GPIO2 / ADC1 channel 2: proximity sensor analog output.
// GPIO4 / GPIO5: SIM7070G UART TX / RX.
// GPIO6 / GPIO7: I2C SDA / SCL.

// ---------------------------------------------------------------------------
// I2C Bus
// ---------------------------------------------------------------------------
/// SA0 low / high.  The first one that answers WHO_AM_I is used.
pub const I2C_ADDRS_LSM6DSL: [u8; 2] = [0x6A, 0x6B];
pub const I2C_BAUD_KHZ: u32 = 400;
pub const I2C_TIMEOUT_TICKS: u32 = 1000; // FreeRTOS ticks

// ---------------------------------------------------------------------------
// SIM7070G UART
// ---------------------------------------------------------------------------
pub const SIM_BAUD: u32 = 115_200;
pub const UART_READ_TICKS: u32 = 2;      // per read() call while waiting for a pattern

// ---------------------------------------------------------------------------
// Proximity sensor (Sharp GP2Y0A21-class, 10-80 cm)
// ---------------------------------------------------------------------------
pub const ADC_FULL_SCALE_V: f32 = 3.3;   // 11 dB attenuation
pub const PROXIMITY_MIN_V: f32 = 0.4;    // below this nothing is in range
pub const PROXIMITY_FAR_MM: u16 = 2_000; // reported when nothing is in range

// ---------------------------------------------------------------------------
// LSM6DSL Scale Factors
// ---------------------------------------------------------------------------
pub const ACCEL_SCALE_2G: f32 = 0.000_061;  // g/LSB at +-2 g
pub const WAKE_THS_LSB_G: f32 = 2.0 / 64.0; // wake threshold step, FS/64

// ---------------------------------------------------------------------------
// BLE
// ---------------------------------------------------------------------------
pub const BLE_APP_ID: u16 = 0;
pub const BLE_MAX_ATTR_LEN: usize = 512;

// ---------------------------------------------------------------------------
// Timing (milliseconds)
// ---------------------------------------------------------------------------
pub const LOOP_PERIOD_MS: u64 = 50; // 20 Hz sensing
