// Bike Tracker - Tracker Core
//
// Decision logic for the bike tracker firmware.
//
// Everything in this crate is hardware-free: the firmware binary supplies
// the accelerometer, ranging sensor, modem UART and NVS partition through
// the traits in `motion`, `presence`, `modem` and `store`, feeds BLE
// callbacks in as `events::LinkEvent`s and acts on the
// `controller::TickReport` each loop iteration returns.

pub mod alert;
pub mod controller;
pub mod events;
pub mod history;
pub mod mode;
pub mod modem;
pub mod motion;
pub mod position;
pub mod presence;
pub mod protocol;
pub mod retained;
pub mod settings;
pub mod store;
pub mod tuning;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{Hardware, Session, SleepPlan, TickReport, Tracker, WakeCause};
pub use events::{LinkEvent, Notification};
pub use mode::DeviceMode;
pub use tuning::Tuning;
