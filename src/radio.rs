//! SoftDevice radio driver.
//!
//! The scanner engine issues non-blocking [`RadioRequest`]s; this task
//! executes them one at a time against the S140 Central API and posts
//! the outcome back as [`Event`]s:
//!
//! ```text
//! Scanner ──REQUESTS──► driver_task ──► central::scan / connect / gatt_client
//!    ▲                                             │
//!    └─────────────EVENTS◄──────────── on_ble_event (raw SoftDevice events)
//! ```
//!
//! Disconnects, GATT timeouts and the raw primary-service / read
//! responses used by fallback discovery are picked off the SoftDevice
//! event stream in [`on_ble_event`]; everything else comes back from the
//! awaited `nrf-softdevice` call.

use core::sync::atomic::{AtomicBool, Ordering};

use blesc::ble::{AddrKind, Characteristic, ConnHandle, PeerAddress, Uuid128};
use blesc::config::{
    BLE_CONNECT_TIMEOUT, BLE_CONN_INTERVAL_MAX, BLE_CONN_INTERVAL_MIN, BLE_SCAN_INTERVAL,
    BLE_SCAN_WINDOW, BLE_SLAVE_LATENCY, BLE_SUP_TIMEOUT, MAX_DATA_LEN,
};
use blesc::ble::adv_parser::{find_bleam_service_uuid, has_apple_manufacturer_data};
use blesc::platform::{
    AdvReport, DiscoveryEvent, Event, GattEvent, LinkEvent, Payload, ServiceEvent, ServiceRange,
    UuidKind, MAX_ADV_LEN, MAX_PAYLOAD_LEN,
};
use blesc::TransportError;
use defmt::{debug, info, trace, warn};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use heapless::Vec;
use nrf_softdevice::ble::gatt_client::{self, DiscoverError};
use nrf_softdevice::ble::{central, Address, AddressType, Connection, HvxType, Uuid};
use nrf_softdevice::raw;
use nrf_softdevice::Softdevice;

/// Requests from the engine to the radio.
#[derive(Clone, Debug, defmt::Format)]
pub enum RadioRequest {
    StartScan,
    StopScan,
    Connect(PeerAddress),
    Disconnect(ConnHandle),
    DiscoverService { conn: ConnHandle, uuid: Uuid128 },
    EnableNotifications { conn: ConnHandle, characteristic: Characteristic },
    Write { conn: ConnHandle, characteristic: Characteristic, data: Vec<u8, MAX_DATA_LEN> },
    Read { conn: ConnHandle, characteristic: Characteristic },
    DiscoverPrimary { conn: ConnHandle, start: u16 },
    ReadHandle { conn: ConnHandle, handle: u16 },
}

/// Everything the engine reacts to.
pub static EVENTS: Channel<CriticalSectionRawMutex, Event, 16> = Channel::new();

/// Work for [`driver_task`].
pub static REQUESTS: Channel<CriticalSectionRawMutex, RadioRequest, 8> = Channel::new();

/// Raised by [`on_ble_event`] when the link drops.
static LINK_LOST: Signal<CriticalSectionRawMutex, ConnHandle> = Signal::new();

/// A raw GATTC procedure issued for fallback discovery is outstanding.
static RAW_PROCEDURE: AtomicBool = AtomicBool::new(false);

/// Service base of the BLEAM being discovered. `Client::uuid()` takes no
/// `self`, so the per-peer UUID is handed over through here.
static SERVICE_UUID: BlockingMutex<CriticalSectionRawMutex, core::cell::Cell<Uuid128>> =
    BlockingMutex::new(core::cell::Cell::new(blesc::ble::BASE_UUID));

fn post(event: Event) {
    if EVENTS.try_send(event).is_err() {
        warn!("Event queue full - dropping event");
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BLEAM GATT client
// ═══════════════════════════════════════════════════════════════════════════

/// The BLEAM service is keyed by a per-peer 128-bit UUID, so the client
/// is written out by hand instead of with `#[gatt_client(uuid = ...)]`.
#[derive(Default)]
pub struct BleamClient {
    challenge: u16,
    challenge_cccd: u16,
    signature: u16,
    rssi: u16,
    health: u16,
    time: u16,
}

/// Characteristic UUIDs share the service base; only bytes 12-13 differ.
fn characteristic_uuid(characteristic: Characteristic) -> Uuid {
    let mut full = SERVICE_UUID.lock(|c| c.get());
    full[12..14].copy_from_slice(&characteristic.uuid16().to_le_bytes());
    Uuid::new_128(&full)
}

impl BleamClient {
    fn value_handle(&self, characteristic: Characteristic) -> u16 {
        match characteristic {
            Characteristic::Challenge => self.challenge,
            Characteristic::Signature => self.signature,
            Characteristic::Rssi => self.rssi,
            Characteristic::Health => self.health,
            Characteristic::Time => self.time,
        }
    }

    async fn enable_notifications(
        &self,
        conn: &Connection,
        characteristic: Characteristic,
    ) -> Result<(), TransportError> {
        if characteristic != Characteristic::Challenge || self.challenge_cccd == 0 {
            return Err(TransportError::InvalidHandle);
        }
        gatt_client::write(conn, self.challenge_cccd, &[0x01, 0x00])
            .await
            .map_err(|_| TransportError::WriteFailed)
    }
}

impl gatt_client::Client for BleamClient {
    type Event = Payload;

    fn uuid() -> Uuid {
        Uuid::new_128(&SERVICE_UUID.lock(|c| c.get()))
    }

    fn new_undiscovered(_conn: Connection) -> Self {
        Self::default()
    }

    fn discovered_characteristic(
        &mut self,
        characteristic: &gatt_client::Characteristic,
        descriptors: &[gatt_client::Descriptor],
    ) {
        let Some(uuid) = characteristic.uuid else {
            return;
        };
        let handle = characteristic.handle_value;
        if uuid == characteristic_uuid(Characteristic::Challenge) {
            self.challenge = handle;
            let cccd = Uuid::new_16(0x2902);
            if let Some(d) = descriptors.iter().find(|d| d.uuid == Some(cccd)) {
                self.challenge_cccd = d.handle;
            }
        } else if uuid == characteristic_uuid(Characteristic::Signature) {
            self.signature = handle;
        } else if uuid == characteristic_uuid(Characteristic::Rssi) {
            self.rssi = handle;
        } else if uuid == characteristic_uuid(Characteristic::Health) {
            self.health = handle;
        } else if uuid == characteristic_uuid(Characteristic::Time) {
            self.time = handle;
        }
    }

    fn discovery_complete(&mut self) -> Result<(), DiscoverError> {
        let handles = [
            self.challenge,
            self.challenge_cccd,
            self.signature,
            self.rssi,
            self.health,
            self.time,
        ];
        if handles.contains(&0) {
            return Err(DiscoverError::ServiceIncomplete);
        }
        Ok(())
    }

    fn on_hvx(
        &self,
        _conn: &Connection,
        type_: HvxType,
        handle: u16,
        data: &[u8],
    ) -> Option<Self::Event> {
        if handle != self.challenge || !matches!(type_, HvxType::Notification) {
            return None;
        }
        Payload::from_slice(&data[..data.len().min(MAX_PAYLOAD_LEN)]).ok()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Raw SoftDevice events
// ═══════════════════════════════════════════════════════════════════════════

fn uuid_kind(uuid_type: u8) -> UuidKind {
    match u32::from(uuid_type) {
        raw::BLE_UUID_TYPE_UNKNOWN => UuidKind::Unknown,
        raw::BLE_UUID_TYPE_BLE => UuidKind::Sig,
        _ => UuidKind::Vendor,
    }
}

/// Hook for `Softdevice::run_with_callback`: sees every BLE event.
pub fn on_ble_event(evt: *const raw::ble_evt_t) {
    // SAFETY: the SoftDevice hands out a valid event for the duration of the call.
    let evt = unsafe { &*evt };
    match u32::from(evt.header.evt_id) {
        raw::BLE_GAP_EVTS_BLE_GAP_EVT_DISCONNECTED => {
            let gap = unsafe { &evt.evt.gap_evt };
            let reason = unsafe { gap.params.disconnected.reason };
            RAW_PROCEDURE.store(false, Ordering::Release);
            LINK_LOST.signal(gap.conn_handle);
            post(Event::Link(LinkEvent::Disconnected {
                conn: gap.conn_handle,
                reason,
            }));
        }
        raw::BLE_GATTC_EVTS_BLE_GATTC_EVT_TIMEOUT => {
            let gattc = unsafe { &evt.evt.gattc_evt };
            post(Event::Link(LinkEvent::GattTimeout {
                conn: gattc.conn_handle,
            }));
        }
        raw::BLE_GATTS_EVTS_BLE_GATTS_EVT_TIMEOUT => {
            let gatts = unsafe { &evt.evt.gatts_evt };
            post(Event::Link(LinkEvent::GattTimeout {
                conn: gatts.conn_handle,
            }));
        }
        raw::BLE_GATTC_EVTS_BLE_GATTC_EVT_PRIM_SRVC_DISC_RSP => {
            if !RAW_PROCEDURE.swap(false, Ordering::AcqRel) {
                return;
            }
            let gattc = unsafe { &evt.evt.gattc_evt };
            let success = u32::from(gattc.gatt_status) == raw::BLE_GATT_STATUS_SUCCESS;
            let mut services = Vec::new();
            if success {
                let rsp = unsafe { &gattc.params.prim_srvc_disc_rsp };
                for s in unsafe { rsp.services.as_slice(rsp.count as usize) } {
                    let range = ServiceRange {
                        start_handle: s.handle_range.start_handle,
                        end_handle: s.handle_range.end_handle,
                        uuid16: s.uuid.uuid,
                        kind: uuid_kind(s.uuid.type_),
                    };
                    if services.push(range).is_err() {
                        break;
                    }
                }
            }
            post(Event::Gatt(GattEvent::PrimaryServices {
                conn: gattc.conn_handle,
                success,
                services,
            }));
        }
        raw::BLE_GATTC_EVTS_BLE_GATTC_EVT_READ_RSP => {
            if !RAW_PROCEDURE.swap(false, Ordering::AcqRel) {
                return;
            }
            let gattc = unsafe { &evt.evt.gattc_evt };
            let success = u32::from(gattc.gatt_status) == raw::BLE_GATT_STATUS_SUCCESS;
            let mut data = Payload::new();
            if success {
                let rsp = unsafe { &gattc.params.read_rsp };
                let bytes = unsafe { rsp.data.as_slice(rsp.len as usize) };
                let _ = data.extend_from_slice(&bytes[..bytes.len().min(MAX_PAYLOAD_LEN)]);
            }
            post(Event::Gatt(GattEvent::HandleRead {
                conn: gattc.conn_handle,
                success,
                data,
            }));
        }
        _ => {}
    }
}

/// Every BLEAM has its own base, so the one registered for a discovery is
/// dropped again once the handles are known.
fn release_vendor_base() {
    // SAFETY: a null type pointer removes the most recently added base.
    let ret = unsafe { raw::sd_ble_uuid_vs_remove(core::ptr::null_mut()) };
    if ret != raw::NRF_SUCCESS {
        debug!("Vendor UUID base not released: {}", ret);
    }
}

fn raw_result(ret: u32) -> Result<(), TransportError> {
    if ret == raw::NRF_SUCCESS {
        Ok(())
    } else {
        RAW_PROCEDURE.store(false, Ordering::Release);
        Err(TransportError::Raw(ret))
    }
}

fn discover_primary(conn: ConnHandle, start: u16) -> Result<(), TransportError> {
    RAW_PROCEDURE.store(true, Ordering::Release);
    // SAFETY: plain SVC call; the response arrives through `on_ble_event`.
    let ret = unsafe { raw::sd_ble_gattc_primary_services_discover(conn, start, core::ptr::null()) };
    raw_result(ret)
}

fn read_handle(conn: ConnHandle, handle: u16) -> Result<(), TransportError> {
    RAW_PROCEDURE.store(true, Ordering::Release);
    // SAFETY: as above.
    let ret = unsafe { raw::sd_ble_gattc_read(conn, handle, 0) };
    raw_result(ret)
}

// ═══════════════════════════════════════════════════════════════════════════
// Driver task
// ═══════════════════════════════════════════════════════════════════════════

pub async fn driver_task(sd: &'static Softdevice) -> ! {
    let mut pending: Option<RadioRequest> = None;
    loop {
        let request = match pending.take() {
            Some(request) => request,
            None => REQUESTS.receive().await,
        };
        match request {
            RadioRequest::StartScan => pending = scan(sd).await,
            RadioRequest::Connect(peer) => pending = connect_and_serve(sd, peer).await,
            other => trace!("No link for {}", other),
        }
    }
}

/// Scan until the engine asks for something else. Only BLEAM-looking
/// reports are forwarded.
async fn scan(sd: &Softdevice) -> Option<RadioRequest> {
    debug!("Radio scanning");
    let config = central::ScanConfig {
        interval: u32::from(BLE_SCAN_INTERVAL),
        window: u32::from(BLE_SCAN_WINDOW),
        ..Default::default()
    };

    let scan = central::scan(sd, &config, |params| {
        // SAFETY: the report buffer is valid for the duration of the callback.
        let data =
            unsafe { core::slice::from_raw_parts(params.data.p_data, params.data.len as usize) };
        if find_bleam_service_uuid(data).is_none() && !has_apple_manufacturer_data(data) {
            return None;
        }
        let report = AdvReport {
            mac: params.peer_addr.addr,
            rssi: params.rssi,
            data: Vec::from_slice(&data[..data.len().min(MAX_ADV_LEN)]).unwrap_or_default(),
        };
        if EVENTS.try_send(Event::Link(LinkEvent::Advertisement(report))).is_err() {
            trace!("Event queue full - dropping report");
        }
        None::<()>
    });

    match select(REQUESTS.receive(), scan).await {
        Either::First(RadioRequest::StopScan) => None,
        Either::First(next) => Some(next),
        Either::Second(result) => {
            if let Err(e) = result {
                warn!("Scan ended: {:?}", defmt::Debug2Format(&e));
            }
            None
        }
    }
}

fn address_type(kind: AddrKind) -> AddressType {
    match kind {
        AddrKind::RandomStatic => AddressType::RandomStatic,
        AddrKind::RandomPrivateResolvable => AddressType::RandomPrivateResolvable,
        AddrKind::RandomPrivateNonResolvable => AddressType::RandomPrivateNonResolvable,
    }
}

async fn connect_and_serve(sd: &Softdevice, peer: PeerAddress) -> Option<RadioRequest> {
    let address = Address::new(address_type(peer.kind), peer.mac);
    let whitelist = [&address];
    let config = central::ConnectConfig {
        scan_config: central::ScanConfig {
            whitelist: Some(&whitelist),
            timeout: BLE_CONNECT_TIMEOUT,
            ..Default::default()
        },
        conn_params: raw::ble_gap_conn_params_t {
            min_conn_interval: BLE_CONN_INTERVAL_MIN,
            max_conn_interval: BLE_CONN_INTERVAL_MAX,
            slave_latency: BLE_SLAVE_LATENCY,
            conn_sup_timeout: BLE_SUP_TIMEOUT,
        },
        ..Default::default()
    };

    let conn = match central::connect(sd, &config).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("Connect failed: {:?}", defmt::Debug2Format(&e));
            post(Event::Link(LinkEvent::ConnectTimeout));
            return None;
        }
    };
    let Some(handle) = conn.handle() else {
        post(Event::Link(LinkEvent::ConnectTimeout));
        return None;
    };

    info!("Link up, handle {}", handle);
    LINK_LOST.reset();
    post(Event::Link(LinkEvent::Connected { conn: handle }));
    serve(&conn, handle).await
}

enum Step {
    Continue,
    Discovered(BleamClient),
    /// Leave the connection, handing over a request that needs the idle radio.
    Leave(Option<RadioRequest>),
}

/// Serve requests on a live link until it drops.
async fn serve(conn: &Connection, handle: ConnHandle) -> Option<RadioRequest> {
    let client = loop {
        let request = match select(REQUESTS.receive(), LINK_LOST.wait()).await {
            Either::First(request) => request,
            Either::Second(_) => return None,
        };
        match execute(conn, handle, None, request).await {
            Step::Continue => {}
            Step::Discovered(client) => break client,
            Step::Leave(next) => return next,
        }
    };

    // Notifications must be listened for while writes are in flight.
    let requests = async {
        loop {
            let request = REQUESTS.receive().await;
            match execute(conn, handle, Some(&client), request).await {
                Step::Continue | Step::Discovered(_) => {}
                Step::Leave(next) => return next,
            }
        }
    };
    let notifications = gatt_client::run(conn, &client, |data| {
        post(Event::Service(ServiceEvent::Notification {
            conn: handle,
            characteristic: Characteristic::Challenge,
            data,
        }));
    });

    match select(notifications, requests).await {
        Either::First(_) => None,
        Either::Second(next) => next,
    }
}

/// Any failure on a live link is answered by dropping it; the engine
/// recovers on the resulting disconnect.
fn drop_link(conn: &Connection, e: TransportError) {
    warn!("GATT error {}, disconnecting", e);
    if let Err(e) = conn.disconnect() {
        debug!("Disconnect: {:?}", defmt::Debug2Format(&e));
    }
}

async fn execute(
    conn: &Connection,
    handle: ConnHandle,
    client: Option<&BleamClient>,
    request: RadioRequest,
) -> Step {
    match request {
        RadioRequest::StartScan | RadioRequest::Connect(_) => return Step::Leave(Some(request)),
        RadioRequest::StopScan => {}
        RadioRequest::Disconnect(_) => {
            if let Err(e) = conn.disconnect() {
                debug!("Disconnect: {:?}", defmt::Debug2Format(&e));
            }
        }
        RadioRequest::DiscoverService { uuid, .. } => {
            SERVICE_UUID.lock(|c| c.set(uuid));
            let discovered = gatt_client::discover::<BleamClient>(conn).await;
            release_vendor_base();
            match discovered {
                Ok(client) => {
                    post(Event::Discovery(DiscoveryEvent::Complete { conn: handle }));
                    return Step::Discovered(client);
                }
                Err(DiscoverError::ServiceNotFound) => {
                    post(Event::Discovery(DiscoveryEvent::ServiceNotFound { conn: handle }));
                }
                Err(e) => {
                    warn!("Discovery failed: {:?}", defmt::Debug2Format(&e));
                    post(Event::Discovery(DiscoveryEvent::Failed { conn: handle }));
                }
            }
        }
        RadioRequest::EnableNotifications { characteristic, .. } => {
            let result = match client {
                Some(client) => client.enable_notifications(conn, characteristic).await,
                None => Err(TransportError::InvalidHandle),
            };
            if let Err(e) = result {
                drop_link(conn, e);
            }
        }
        RadioRequest::Write {
            characteristic,
            data,
            ..
        } => {
            let Some(attr) = client.map(|c| c.value_handle(characteristic)) else {
                drop_link(conn, TransportError::InvalidHandle);
                return Step::Continue;
            };
            match gatt_client::write(conn, attr, &data).await {
                Ok(()) => post(Event::Service(ServiceEvent::WriteComplete { conn: handle })),
                Err(_) => drop_link(conn, TransportError::WriteFailed),
            }
        }
        RadioRequest::Read { characteristic, .. } => {
            let Some(attr) = client.map(|c| c.value_handle(characteristic)) else {
                drop_link(conn, TransportError::InvalidHandle);
                return Step::Continue;
            };
            let mut buf = [0u8; MAX_PAYLOAD_LEN];
            match gatt_client::read(conn, attr, &mut buf).await {
                Ok(len) => post(Event::Service(ServiceEvent::ReadResponse {
                    conn: handle,
                    characteristic,
                    data: Payload::from_slice(&buf[..len.min(MAX_PAYLOAD_LEN)]).unwrap_or_default(),
                })),
                Err(_) => drop_link(conn, TransportError::ReadFailed),
            }
        }
        RadioRequest::DiscoverPrimary { start, .. } => {
            if let Err(e) = discover_primary(handle, start) {
                drop_link(conn, e);
            }
        }
        RadioRequest::ReadHandle { handle: attr, .. } => {
            if let Err(e) = read_handle(handle, attr) {
                drop_link(conn, e);
            }
        }
    }
    Step::Continue
}
