// Bike Tracker - Link Events
//
// The BLE stack calls back from its own task.  Callbacks only package what
// happened into a `LinkEvent` and queue it; the main loop applies events at
// the top of each tick, before any sensing or alerting.

// ---------------------------------------------------------------------------
// Inbound (BLE task -> main loop)
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    /// Raw bytes written to the Config characteristic.
    ConfigWritten(Vec<u8>),
    /// Raw bytes written to the Command characteristic.
    CommandReceived(Vec<u8>),
    /// Raw bytes written to the Location characteristic.
    LocationWritten(Vec<u8>),
}

// ---------------------------------------------------------------------------
// Outbound (main loop -> BLE task)
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// JSON for the Status characteristic.
    Status(String),
    /// JSON for the History characteristic.
    History(String),
}
