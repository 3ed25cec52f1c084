// Bike Tracker - BLE GATT Server
//
// One primary service with five characteristics:
//
//   0x1235 Location  write        phone-supplied fix
//   0x1236 Config    write        settings JSON or CLEAR
//   0x1237 Status    read/notify  device status JSON
//   0x1238 Command   write        SYNC / CLEAR_HISTORY / GPS_PAGE:<n> / TEST_SMS
//   0x1239 History   read/notify  fix log JSON
//
// Bluedroid callbacks run on the BT task.  They only record GATT handles and
// forward link activity as `LinkEvent`s; the main loop applies them on its
// next tick and hands back notifications through `publish`.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail};
use enumset::{enum_set, EnumSet};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::bt::ble::gap::{AdvConfiguration, BleGapEvent, EspBleGap};
use esp_idf_svc::bt::ble::gatt::server::{ConnectionId, EspGatts, GattsEvent};
use esp_idf_svc::bt::ble::gatt::{
    AutoResponse, GattCharacteristic, GattDescriptor, GattId, GattInterface, GattServiceId,
    GattStatus, Handle, Permission, Property,
};
use esp_idf_svc::bt::{Ble, BtDriver, BtStatus, BtUuid};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_sys as sys;
use log::{debug, info, warn};
use tracker_core::protocol::{
    self, COMMAND_UUID, CONFIG_UUID, HISTORY_UUID, LOCATION_UUID, SERVICE_UUID, STATUS_UUID,
};
use tracker_core::{LinkEvent, Notification};

use crate::config::*;

type BleDriver = BtDriver<'static, Ble>;
type Gap = EspBleGap<'static, Ble, Arc<BleDriver>>;
type Gatts = EspGatts<'static, Ble, Arc<BleDriver>>;

const CCCD_UUID: u16 = 0x2902;
const CCCD_NOTIFY: u8 = 0x01;
const SERVICE_HANDLES: u16 = 16;
const DEFAULT_MTU: u16 = 23;
const ADV_FLAGS: u8 = 0x06; // general discoverable, BR/EDR not supported

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attr {
    Location,
    Config,
    Status,
    Command,
    History,
}

/// Creation order.  Bluedroid appends a descriptor to the most recently
/// added characteristic, so each notify characteristic gets its CCCD before
/// the next characteristic is added.
const ATTRS: [Attr; 5] = [
    Attr::Location,
    Attr::Config,
    Attr::Status,
    Attr::Command,
    Attr::History,
];

impl Attr {
    fn uuid(self) -> u128 {
        match self {
            Attr::Location => LOCATION_UUID,
            Attr::Config => CONFIG_UUID,
            Attr::Status => STATUS_UUID,
            Attr::Command => COMMAND_UUID,
            Attr::History => HISTORY_UUID,
        }
    }

    fn notifies(self) -> bool {
        matches!(self, Attr::Status | Attr::History)
    }

    fn characteristic(self) -> GattCharacteristic {
        let (permissions, properties): (EnumSet<Permission>, EnumSet<Property>) =
            if self.notifies() {
                (enum_set!(Permission::Read), enum_set!(Property::Read | Property::Notify))
            } else {
                (enum_set!(Permission::Write), enum_set!(Property::Write))
            };
        GattCharacteristic {
            uuid: BtUuid::uuid128(self.uuid()),
            permissions,
            properties,
            max_len: BLE_MAX_ATTR_LEN,
            auto_rsp: AutoResponse::ByGatt,
        }
    }

    fn link_event(self, value: &[u8]) -> Option<LinkEvent> {
        match self {
            Attr::Location => Some(LinkEvent::LocationWritten(value.to_vec())),
            Attr::Config => Some(LinkEvent::ConfigWritten(value.to_vec())),
            Attr::Command => Some(LinkEvent::CommandReceived(value.to_vec())),
            Attr::Status | Attr::History => None,
        }
    }
}

#[derive(Debug)]
struct GattState {
    gatt_if: Option<GattInterface>,
    service: Option<Handle>,
    next_attr: usize,
    values: Vec<(Attr, Handle)>,
    cccds: Vec<(Attr, Handle)>,
    subscribed: Vec<Attr>,
    conn: Option<ConnectionId>,
    mtu: u16,
}

impl Default for GattState {
    fn default() -> Self {
        Self {
            gatt_if: None,
            service: None,
            next_attr: 0,
            values: Vec::new(),
            cccds: Vec::new(),
            subscribed: Vec::new(),
            conn: None,
            mtu: DEFAULT_MTU,
        }
    }
}

impl GattState {
    fn value_handle(&self, attr: Attr) -> Option<Handle> {
        self.values.iter().find(|(a, _)| *a == attr).map(|(_, h)| *h)
    }

    fn attr_at(handle: Handle, table: &[(Attr, Handle)]) -> Option<Attr> {
        table.iter().find(|(_, h)| *h == handle).map(|(a, _)| *a)
    }
}

pub struct BleServer {
    gap: Gap,
    gatts: Gatts,
    name: String,
    events: Sender<LinkEvent>,
    state: Mutex<GattState>,
}

impl BleServer {
    /// Bring up Bluedroid, register the GATT app and start advertising once
    /// the stack reports the service is in place.
    pub fn start(
        modem: Modem,
        nvs: Option<EspDefaultNvsPartition>,
        events: Sender<LinkEvent>,
    ) -> anyhow::Result<Arc<Self>> {
        let bt = Arc::new(BtDriver::new(modem, nvs)?);

        let server = Arc::new(Self {
            gap: EspBleGap::new(bt.clone())?,
            gatts: EspGatts::new(bt)?,
            name: protocol::device_name(&ble_mac()),
            events,
            state: Mutex::new(GattState::default()),
        });

        let gap_server = server.clone();
        server.gap.subscribe(move |event| {
            if let Err(e) = gap_server.on_gap_event(event) {
                warn!("BLE GAP: {e:#}");
            }
        })?;

        let gatts_server = server.clone();
        server.gatts.subscribe(move |(gatt_if, event)| {
            if let Err(e) = gatts_server.on_gatts_event(gatt_if, event) {
                warn!("BLE GATTS: {e:#}");
            }
        })?;

        server.gatts.register_app(BLE_APP_ID)?;
        info!("BLE server starting as {}", server.name);
        Ok(server)
    }

    /// Update the characteristic value and notify the phone if it subscribed.
    pub fn publish(&self, note: &Notification) -> anyhow::Result<()> {
        let (attr, json) = match note {
            Notification::Status(json) => (Attr::Status, json),
            Notification::History(json) => (Attr::History, json),
        };
        let payload = json.as_bytes();

        let state = self.state()?;
        let Some(handle) = state.value_handle(attr) else {
            debug!("{attr:?} not registered yet, dropping update");
            return Ok(());
        };

        self.gatts
            .set_attr(handle, &payload[..payload.len().min(BLE_MAX_ATTR_LEN)])?;

        if let (Some(gatt_if), Some(conn)) = (state.gatt_if, state.conn) {
            if state.subscribed.contains(&attr) {
                let room = usize::from(state.mtu.saturating_sub(3));
                if payload.len() > room {
                    warn!(
                        "{attr:?} notification of {} bytes exceeds MTU payload {room}",
                        payload.len()
                    );
                }
                self.gatts.notify(gatt_if, conn, handle, payload)?;
            }
        }
        Ok(())
    }

    fn state(&self) -> anyhow::Result<MutexGuard<'_, GattState>> {
        self.state.lock().map_err(|_| anyhow!("GATT state mutex poisoned"))
    }

    fn forward(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!("Main loop gone, link event dropped");
        }
    }

    fn on_gap_event(&self, event: BleGapEvent) -> anyhow::Result<()> {
        if let BleGapEvent::AdvertisingConfigured(status) = event {
            check_bt(status)?;
            self.gap.start_advertising()?;
            info!("Advertising");
        }
        Ok(())
    }

    fn on_gatts_event(&self, gatt_if: GattInterface, event: GattsEvent) -> anyhow::Result<()> {
        match event {
            GattsEvent::ServiceRegistered { status, app_id } => {
                check_gatt(status)?;
                if app_id != BLE_APP_ID {
                    return Ok(());
                }
                self.state()?.gatt_if = Some(gatt_if);

                // The 128-bit UUID fills most of the advertising packet, so
                // the name goes in the scan response.
                self.gap.set_device_name(&self.name)?;
                self.gap.set_adv_conf(&AdvConfiguration {
                    flag: ADV_FLAGS,
                    service_uuid: Some(BtUuid::uuid128(SERVICE_UUID)),
                    ..Default::default()
                })?;
                self.gap.set_adv_conf(&AdvConfiguration {
                    set_scan_rsp: true,
                    include_name: true,
                    include_txpower: true,
                    ..Default::default()
                })?;

                self.gatts.create_service(
                    gatt_if,
                    &GattServiceId {
                        id: GattId {
                            uuid: BtUuid::uuid128(SERVICE_UUID),
                            inst_id: 0,
                        },
                        is_primary: true,
                    },
                    SERVICE_HANDLES,
                )?;
            }
            GattsEvent::ServiceCreated {
                status,
                service_handle,
                ..
            } => {
                check_gatt(status)?;
                let mut state = self.state()?;
                state.service = Some(service_handle);
                state.next_attr = 0;
                self.add_next(&state)?;
            }
            GattsEvent::CharacteristicAdded {
                status,
                attr_handle,
                service_handle,
                char_uuid,
            } => {
                check_gatt(status)?;
                let mut state = self.state()?;
                let attr = *ATTRS
                    .get(state.next_attr)
                    .ok_or_else(|| anyhow!("unexpected characteristic {attr_handle}"))?;
                if char_uuid != BtUuid::uuid128(attr.uuid()) {
                    bail!("characteristic {attr_handle} does not match {attr:?}");
                }
                state.values.push((attr, attr_handle));

                if attr.notifies() {
                    self.gatts.add_descriptor(
                        service_handle,
                        &GattDescriptor {
                            uuid: BtUuid::uuid16(CCCD_UUID),
                            permissions: enum_set!(Permission::Read | Permission::Write),
                        },
                    )?;
                } else {
                    state.next_attr += 1;
                    self.add_next(&state)?;
                }
            }
            GattsEvent::DescriptorAdded {
                status,
                attr_handle,
                ..
            } => {
                check_gatt(status)?;
                let mut state = self.state()?;
                if let Some(&attr) = ATTRS.get(state.next_attr) {
                    state.cccds.push((attr, attr_handle));
                }
                state.next_attr += 1;
                self.add_next(&state)?;
            }
            GattsEvent::ServiceStarted { status, .. } => {
                check_gatt(status)?;
                info!("GATT service started");
            }
            GattsEvent::PeerConnected { conn_id, .. } => {
                {
                    let mut state = self.state()?;
                    state.conn = Some(conn_id);
                    state.mtu = DEFAULT_MTU;
                    state.subscribed.clear();
                }
                info!("Phone connected (conn {conn_id})");
                self.forward(LinkEvent::Connected);
            }
            GattsEvent::PeerDisconnected { .. } => {
                {
                    let mut state = self.state()?;
                    state.conn = None;
                    state.subscribed.clear();
                }
                info!("Phone disconnected");
                self.forward(LinkEvent::Disconnected);
                self.gap.start_advertising()?;
            }
            GattsEvent::Mtu { mtu, .. } => {
                debug!("MTU {mtu}");
                self.state()?.mtu = mtu;
            }
            GattsEvent::Write {
                conn_id,
                trans_id,
                handle,
                need_rsp,
                is_prep,
                value,
                ..
            } => {
                if is_prep {
                    warn!("Prepared write to {handle} ignored");
                    return Ok(());
                }

                let mut state = self.state()?;
                if let Some(attr) = GattState::attr_at(handle, &state.cccds) {
                    let enabled = value.first().is_some_and(|v| v & CCCD_NOTIFY != 0);
                    state.subscribed.retain(|a| *a != attr);
                    if enabled {
                        state.subscribed.push(attr);
                    }
                    debug!("{attr:?} notifications {}", if enabled { "on" } else { "off" });
                    // Descriptors added without an auto-response control
                    // are answered by the application.
                    if need_rsp {
                        self.gatts
                            .send_response(gatt_if, conn_id, trans_id, GattStatus::Ok, None)?;
                    }
                } else if let Some(attr) = GattState::attr_at(handle, &state.values) {
                    drop(state);
                    debug!("{attr:?} write, {} bytes", value.len());
                    if let Some(event) = attr.link_event(value) {
                        self.forward(event);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Add the next characteristic in creation order, or start the service
    /// once all of them are in place.
    fn add_next(&self, state: &GattState) -> anyhow::Result<()> {
        let Some(service) = state.service else {
            return Ok(());
        };
        match ATTRS.get(state.next_attr) {
            Some(attr) => self
                .gatts
                .add_characteristic(service, &attr.characteristic(), &[])?,
            None => self.gatts.start_service(service)?,
        }
        Ok(())
    }
}

fn check_bt(status: BtStatus) -> anyhow::Result<()> {
    if !matches!(status, BtStatus::Success) {
        bail!("BT status {status:?}");
    }
    Ok(())
}

fn check_gatt(status: GattStatus) -> anyhow::Result<()> {
    if !matches!(status, GattStatus::Ok) {
        bail!("GATT status {status:?}");
    }
    Ok(())
}

fn ble_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    let ret = unsafe { sys::esp_read_mac(mac.as_mut_ptr(), sys::esp_mac_type_t_ESP_MAC_BT) };
    if ret != sys::ESP_OK {
        warn!("BT MAC read failed ({})", ret);
    }
    mac
}
