pub mod ble;
pub mod power;
