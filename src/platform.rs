//! Contracts between the protocol engine and the hardware.
//!
//! The engine never blocks: it issues requests through these traits and
//! learns about their outcome from the [`Event`]s fed back into
//! [`Scanner::handle`](crate::scheduler::Scanner::handle). The firmware
//! implements them on top of the SoftDevice and Embassy; tests
//! implement them with recording mocks.

use heapless::Vec;

use crate::ble::{Characteristic, ConnHandle, Mac, PeerAddress, Uuid128};
use crate::config::{APP_KEY_LEN, DIGEST_LEN};
use crate::error::{Error, TransportError};

/// Largest advertisement payload (legacy advertising).
pub const MAX_ADV_LEN: usize = 31;

/// Largest notification / read payload handled by the engine.
pub const MAX_PAYLOAD_LEN: usize = 32;

/// Services reported in one primary-service discovery response.
pub const MAX_SERVICES_PER_RESPONSE: usize = 4;

pub type Payload = Vec<u8, MAX_PAYLOAD_LEN>;

/// One-shot timers owned by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerId {
    /// Short scan that ends early when nothing is seen.
    EcoWindow,
    /// Upper bound on a scan once a peer has been seen.
    ScanConnect,
    /// Wait for the next authentication message from the peer.
    Inactivity,
}

pub const TIMER_COUNT: usize = 3;

impl TimerId {
    pub const ALL: [TimerId; TIMER_COUNT] =
        [TimerId::EcoWindow, TimerId::ScanConnect, TimerId::Inactivity];

    pub const fn index(self) -> usize {
        match self {
            TimerId::EcoWindow => 0,
            TimerId::ScanConnect => 1,
            TimerId::Inactivity => 2,
        }
    }
}

/// How the stack classifies a discovered service UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UuidKind {
    /// Bluetooth SIG 16-bit UUID.
    Sig,
    /// Vendor-specific base registered with the stack.
    Vendor,
    /// 128-bit UUID the stack does not know.
    Unknown,
}

/// A primary service as reported by handle-range discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceRange {
    pub start_handle: u16,
    pub end_handle: u16,
    pub uuid16: u16,
    pub kind: UuidKind,
}

/// Raw advertisement report.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvReport {
    pub mac: Mac,
    pub rssi: i8,
    pub data: Vec<u8, MAX_ADV_LEN>,
}

/// GAP level events.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkEvent {
    Advertisement(AdvReport),
    Connected { conn: ConnHandle },
    Disconnected { conn: ConnHandle, reason: u8 },
    /// Connection establishment gave up.
    ConnectTimeout,
    /// GATT client or server procedure timed out.
    GattTimeout { conn: ConnHandle },
}

/// Outcome of standard discovery of the BLEAM service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoveryEvent {
    /// Service and characteristics resolved.
    Complete { conn: ConnHandle },
    /// The peer does not list the service.
    ServiceNotFound { conn: ConnHandle },
    /// Discovery procedure failed.
    Failed { conn: ConnHandle },
}

/// BLEAM characteristic traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServiceEvent {
    Notification {
        conn: ConnHandle,
        characteristic: Characteristic,
        data: Payload,
    },
    ReadResponse {
        conn: ConnHandle,
        characteristic: Characteristic,
        data: Payload,
    },
    /// The last write left the radio.
    WriteComplete { conn: ConnHandle },
}

/// Raw GATT client responses used by fallback discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GattEvent {
    PrimaryServices {
        conn: ConnHandle,
        /// `false` when the peer answered with an ATT error
        /// (attribute not found marks the end of the handle space).
        success: bool,
        services: Vec<ServiceRange, MAX_SERVICES_PER_RESPONSE>,
    },
    HandleRead {
        conn: ConnHandle,
        success: bool,
        data: Payload,
    },
}

/// Everything the engine reacts to.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    Link(LinkEvent),
    Discovery(DiscoveryEvent),
    Service(ServiceEvent),
    Gatt(GattEvent),
    Timer(TimerId),
    /// One second of wall-clock time passed.
    Tick,
}

/// BLE stack operations. All requests are non-blocking; completions come
/// back as events.
pub trait Radio {
    fn start_scan(&mut self) -> Result<(), TransportError>;
    fn stop_scan(&mut self);
    fn connect(&mut self, peer: PeerAddress) -> Result<(), TransportError>;
    fn disconnect(&mut self, conn: ConnHandle) -> Result<(), TransportError>;

    /// Standard discovery of the service with this full 128-bit UUID.
    fn discover_service(&mut self, conn: ConnHandle, uuid: &Uuid128)
        -> Result<(), TransportError>;
    fn enable_notifications(
        &mut self,
        conn: ConnHandle,
        characteristic: Characteristic,
    ) -> Result<(), TransportError>;
    fn write(
        &mut self,
        conn: ConnHandle,
        characteristic: Characteristic,
        data: &[u8],
    ) -> Result<(), TransportError>;
    fn read(&mut self, conn: ConnHandle, characteristic: Characteristic)
        -> Result<(), TransportError>;

    /// Primary-service discovery from `start_handle` upwards.
    fn discover_primary_services(
        &mut self,
        conn: ConnHandle,
        start_handle: u16,
    ) -> Result<(), TransportError>;
    /// Read the attribute value at `handle`.
    fn read_handle(&mut self, conn: ConnHandle, handle: u16) -> Result<(), TransportError>;
}

/// Monotonic time and one-shot timers.
pub trait Clock {
    fn now_ms(&self) -> u64;
    /// (Re)arm `timer` to fire once after `after_ms`.
    fn start_timer(&mut self, timer: TimerId, after_ms: u32);
    fn stop_timer(&mut self, timer: TimerId);
}

/// HMAC and randomness.
pub trait CryptoProvider {
    fn hmac_sha256(&mut self, key: &[u8; APP_KEY_LEN], msg: &[u8])
        -> Result<[u8; DIGEST_LEN], Error>;
    /// Fill `buf` from the hardware RNG.
    fn random_bytes(&mut self, buf: &mut [u8]) -> Result<(), Error>;
}

/// Node-level side effects.
pub trait NodeControl {
    /// Current battery level in tenths of a volt.
    fn battery_level(&mut self) -> u8;
    fn reset(&mut self);
    fn enter_dfu(&mut self);
    /// Erase the stored config and restart into provisioning.
    fn unconfigure(&mut self);
}

/// Everything the scheduler needs.
pub trait Platform: Radio + Clock + CryptoProvider + NodeControl {}

impl<T: Radio + Clock + CryptoProvider + NodeControl> Platform for T {}
