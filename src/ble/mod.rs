//! BLEAM protocol subsystem.
//!
//! The node works in **Central** role against a BLEAM peer:
//!
//! 1. **Advertisement parsing** - recognizes BLEAM service UUIDs and the
//!    Apple manufacturer record used by backgrounded iOS peers.
//! 2. **Peer cache** - collects RSSI samples per peer and remembers which
//!    MACs resolved (or failed to resolve) to a BLEAM.
//! 3. **Fallback discovery** - handle-range service search for peers whose
//!    standard discovery does not surface the BLEAM service.
//! 4. **Authentication** - HMAC challenge/response in both directions.
//! 5. **Send pipeline** - fragments signature, health and RSSI data into
//!    single-MTU writes.
//!
//! Everything here is plain state plus the wire format; the radio itself
//! sits behind [`crate::platform::Radio`].

pub mod adv_parser;
pub mod auth;
pub mod discovery;
pub mod peer_cache;
pub mod send;

use crate::config::{BLEAM_SERVICE_UUID, PEER_UUID_LEN};

/// BLE device address, least significant byte first (as on air).
pub type Mac = [u8; 6];

/// Unique BLEAM identity carried inside its service UUID.
pub type PeerUuid = [u8; PEER_UUID_LEN];

/// Connection handle assigned by the BLE stack.
pub type ConnHandle = u16;

/// Full 128-bit UUID, little-endian byte order.
pub type Uuid128 = [u8; 16];

/// Base UUID shared by the BLEAM service and its characteristics.
/// Bytes 12-13 carry the 16-bit id, bytes 2-11 the embedded peer UUID.
pub const BASE_UUID: Uuid128 = [
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    (BLEAM_SERVICE_UUID & 0xFF) as u8,
    (BLEAM_SERVICE_UUID >> 8) as u8,
    0x00, 0x00,
];

/// Offset of the low byte of the 16-bit id inside a 128-bit UUID.
const ID_OFFSET: usize = 12;

/// Offset of the first embedded peer UUID byte. The peer UUID runs
/// downward from here: `uuid[0]` at 11, `uuid[9]` at 2.
const EMBEDDED_TOP: usize = ID_OFFSET - 1;

/// Write `uuid` into a copy of [`BASE_UUID`].
pub fn encode_embedded_uuid(uuid: &PeerUuid) -> Uuid128 {
    let mut full = BASE_UUID;
    for (i, b) in uuid.iter().enumerate() {
        full[EMBEDDED_TOP - i] = *b;
    }
    full
}

/// Recover the peer UUID from a full 128-bit service UUID.
pub fn decode_embedded_uuid(full: &Uuid128) -> PeerUuid {
    let mut uuid = [0u8; PEER_UUID_LEN];
    for (i, b) in uuid.iter_mut().enumerate() {
        *b = full[EMBEDDED_TOP - i];
    }
    uuid
}

/// 16-bit id stored at bytes 12-13.
pub fn uuid16_of(full: &[u8]) -> Option<u16> {
    let lo = *full.get(ID_OFFSET)?;
    let hi = *full.get(ID_OFFSET + 1)?;
    Some(u16::from_le_bytes([lo, hi]))
}

/// Characteristics of the BLEAM service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Characteristic {
    /// Notifications from the BLEAM: command byte + payload.
    Challenge,
    /// Signature (or salt) written by the node.
    Signature,
    /// Packed RSSI records.
    Rssi,
    /// Health records.
    Health,
    /// BLEAM wall clock, milliseconds since midnight.
    Time,
}

impl Characteristic {
    pub const fn uuid16(self) -> u16 {
        match self {
            Characteristic::Challenge => 0xB501,
            Characteristic::Signature => 0xB502,
            Characteristic::Rssi => 0xB503,
            Characteristic::Health => 0xB504,
            Characteristic::Time => 0xB505,
        }
    }

    pub fn from_uuid16(uuid: u16) -> Option<Self> {
        match uuid {
            0xB501 => Some(Characteristic::Challenge),
            0xB502 => Some(Characteristic::Signature),
            0xB503 => Some(Characteristic::Rssi),
            0xB504 => Some(Characteristic::Health),
            0xB505 => Some(Characteristic::Time),
            _ => None,
        }
    }
}

/// Random address sub-types, from the two top bits of the address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddrKind {
    RandomStatic,
    RandomPrivateResolvable,
    RandomPrivateNonResolvable,
}

impl AddrKind {
    /// Decode from the most significant byte of `mac`.
    /// `0b10` is reserved and yields `None`.
    pub fn from_mac(mac: &Mac) -> Option<Self> {
        match mac[5] >> 6 {
            0b11 => Some(AddrKind::RandomStatic),
            0b01 => Some(AddrKind::RandomPrivateResolvable),
            0b00 => Some(AddrKind::RandomPrivateNonResolvable),
            _ => None,
        }
    }
}

/// Address handed to the radio when connecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerAddress {
    pub kind: AddrKind,
    pub mac: Mac,
}
