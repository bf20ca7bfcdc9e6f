//! Application-wide constants and compile-time configuration.
//!
//! All timing parameters, capacities and protocol constants live here
//! so they can be tuned in one place. The per-node identity
//! (`NodeConfig`) is the only runtime configuration and is persisted
//! in flash by the firmware.

use crate::error::StorageError;

// Firmware

/// Firmware version id reported in every health record.
pub const FW_VERSION_ID: u16 = 8;

// Peer tracking

/// Number of BLEAM peers tracked at once (peer records and MAC lists).
pub const MAX_PEERS: usize = 8;

/// Length of the unique peer identity embedded in the service UUID.
pub const PEER_UUID_LEN: usize = 10;

/// RSSI samples collected per peer before the record is ready to deliver.
pub const SAMPLES_PER_MESSAGE: usize = 5;

/// Capacity of the outgoing RSSI queue (records).
pub const RSSI_QUEUE_LEN: usize = 20;

// BLEAM protocol

/// 16-bit id of the BLEAM service inside the shared base UUID.
pub const BLEAM_SERVICE_UUID: u16 = 0xB500;

/// Largest single write payload (ATT MTU 23 minus the 3 byte header).
pub const MAX_DATA_LEN: usize = 20;

/// Application key length.
pub const APP_KEY_LEN: usize = 16;

/// Salt length used in the challenge-response exchange.
pub const SALT_LEN: usize = 16;

/// HMAC-SHA256 output length.
pub const DIGEST_LEN: usize = 32;

// Timing (all in milliseconds unless noted)

/// Maximum time spent scanning once a peer has been seen.
pub const SCAN_CONNECT_MS: u32 = 10_000;

/// Short scan that closes early when no peer shows up.
pub const ECO_SCAN_MS: u32 = 1_000;

/// Time the node waits on the peer for the next authentication message.
pub const INACTIVITY_TIMEOUT_MS: u32 = 3_000;

/// Expiry of allow/deny list entries.
pub const MAC_LIST_TTL_MS: u64 = 30_000;

/// Duty-cycle granularity (seconds). Scanners in the field wake on
/// multiples of this so that they stay roughly in step.
pub const TIME_PERIOD_SECS: u32 = 10;

/// Periods per wake during the day.
pub const DAY_PERIODS: u32 = 1;

/// Periods per wake during the night.
pub const NIGHT_PERIODS: u32 = 6;

/// Seconds in a day; the system clock wraps here.
pub const SECS_PER_DAY: u32 = 24 * 60 * 60;

/// System time (seconds since midnight) at which day mode starts.
pub const DAYTIME_START: u32 = 6 * 60 * 60;

/// System time (seconds since midnight) at which night mode starts.
pub const NIGHTTIME_START: u32 = 60 * 60;

// BLE link parameters

/// Connection interval range (in 1.25 ms units). 120..200 = 150..250 ms.
pub const BLE_CONN_INTERVAL_MIN: u16 = 120;
pub const BLE_CONN_INTERVAL_MAX: u16 = 200;

/// BLE slave latency.
pub const BLE_SLAVE_LATENCY: u16 = 0;

/// BLE supervision timeout (in 10 ms units). 400 = 4 s.
pub const BLE_SUP_TIMEOUT: u16 = 400;

/// Scan interval and window (in 0.625 ms units).
pub const BLE_SCAN_INTERVAL: u16 = 0x00A0;
pub const BLE_SCAN_WINDOW: u16 = 0x0050;

/// Connection establishment timeout (in 10 ms units). 300 = 3 s.
pub const BLE_CONNECT_TIMEOUT: u16 = 0x012C;

// Node config storage

/// Flash page index where the node config starts (4 KB per page on nRF52840).
pub const STORAGE_FLASH_PAGE_START: u32 = 240;

/// Number of flash pages reserved for the node config.
pub const STORAGE_FLASH_PAGE_COUNT: u32 = 4;

/// Timings used by the connection scheduler.
///
/// Defaults mirror the constants above; tests shrink them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SchedulerConfig {
    pub scan_connect_ms: u32,
    pub eco_scan_ms: u32,
    pub inactivity_ms: u32,
    pub mac_list_ttl_ms: u64,
}

impl SchedulerConfig {
    pub const fn new() -> Self {
        Self {
            scan_connect_ms: SCAN_CONNECT_MS,
            eco_scan_ms: ECO_SCAN_MS,
            inactivity_ms: INACTIVITY_TIMEOUT_MS,
            mac_list_ttl_ms: MAC_LIST_TTL_MS,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Provisioned identity of this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeConfig {
    /// Id stamped on every RSSI record sent to a BLEAM.
    pub node_id: u16,
    /// Shared key used to sign challenges.
    pub app_key: [u8; APP_KEY_LEN],
}

impl NodeConfig {
    /// Serialized size: `node_id` (LE) followed by the key.
    pub const SERIALIZED_LEN: usize = 2 + APP_KEY_LEN;

    pub const fn new(node_id: u16, app_key: [u8; APP_KEY_LEN]) -> Self {
        Self { node_id, app_key }
    }

    /// Serialize into `buf`, returning the number of bytes written.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let out = buf
            .get_mut(..Self::SERIALIZED_LEN)
            .ok_or(StorageError::BufferTooSmall)?;
        out[..2].copy_from_slice(&self.node_id.to_le_bytes());
        out[2..].copy_from_slice(&self.app_key);
        Ok(Self::SERIALIZED_LEN)
    }

    /// Parse a stored record. Anything but the exact length is corrupt.
    pub fn deserialize(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() != Self::SERIALIZED_LEN {
            return Err(StorageError::Corrupt);
        }
        let mut app_key = [0u8; APP_KEY_LEN];
        app_key.copy_from_slice(&data[2..]);
        Ok(Self {
            node_id: u16::from_le_bytes([data[0], data[1]]),
            app_key,
        })
    }
}
