// Bike Tracker - Device Mode
//
// The single source of truth for what the device is doing.  The tracker
// loop and the BLE status notification both read it.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum DeviceMode {
    #[default]
    #[serde(rename = "DISCONNECTED")]
    Disconnected,
    /// Companion connected and the rider is nearby.
    #[serde(rename = "READY")]
    LinkReady,
    /// Companion connected, nobody nearby.
    #[serde(rename = "AWAY")]
    Away,
    /// Disconnected and moving; an alert is due.
    #[serde(rename = "ALERT")]
    Alert,
    /// An alert went out this episode; periodic reports follow.
    #[serde(rename = "REPORTING")]
    Reporting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeInputs {
    pub link: bool,
    pub moving: bool,
    pub present: bool,
    pub alerted: bool,
    pub pending: bool,
}

impl DeviceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceMode::Disconnected => "DISCONNECTED",
            DeviceMode::LinkReady => "READY",
            DeviceMode::Away => "AWAY",
            DeviceMode::Alert => "ALERT",
            DeviceMode::Reporting => "REPORTING",
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, DeviceMode::LinkReady | DeviceMode::Away)
    }

    pub fn next(self, inputs: ModeInputs) -> DeviceMode {
        let next = if inputs.link {
            if inputs.present {
                DeviceMode::LinkReady
            } else {
                DeviceMode::Away
            }
        } else if inputs.alerted {
            DeviceMode::Reporting
        } else if inputs.moving || inputs.pending {
            DeviceMode::Alert
        } else {
            DeviceMode::Disconnected
        };

        if next != self {
            log::info!("Mode {} -> {}", self.as_str(), next.as_str());
        }
        next
    }
}

impl std::fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
