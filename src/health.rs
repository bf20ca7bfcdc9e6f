//! Node health reporting.
//!
//! Two records travel on the health characteristic: a general status
//! record sent on every delivery, and a detailed error record sent only
//! when the last reset was caused by an SDK assert or error. The reset
//! cause itself lives in RAM that survives soft resets.

use crate::config::FW_VERSION_ID;

/// Length of the (truncated) source file name kept with an error.
pub const ERR_FILE_NAME_LEN: usize = 13;

/// Record type tags. Zero marks an empty slot.
pub const MSG_TYPE_GENERAL: u8 = 0x01;
pub const MSG_TYPE_ERROR: u8 = 0x02;

/// Why the node last came up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ErrorKind {
    HardReset = 0x00,
    SdAssert = 0x01,
    AppMemAccess = 0x02,
    SoftReset = 0x0F,
    SdkAssert = 0x11,
    SdkError = 0x12,
    Unknown = 0xFF,
}

impl ErrorKind {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x00 => ErrorKind::HardReset,
            0x01 => ErrorKind::SdAssert,
            0x02 => ErrorKind::AppMemAccess,
            0x0F => ErrorKind::SoftReset,
            0x11 => ErrorKind::SdkAssert,
            0x12 => ErrorKind::SdkError,
            _ => ErrorKind::Unknown,
        }
    }

    /// Only SDK faults carry a location worth sending.
    pub fn has_details(self) -> bool {
        matches!(self, ErrorKind::SdkAssert | ErrorKind::SdkError)
    }
}

/// Error state kept across soft resets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RetainedError {
    /// Random id so the backend can tell repeated reports apart.
    pub random_id: u16,
    pub kind: ErrorKind,
    pub err_code: u32,
    pub line_num: u16,
    pub file_name: [u8; ERR_FILE_NAME_LEN],
}

impl RetainedError {
    pub const fn hard_reset(random_id: u16) -> Self {
        Self {
            random_id,
            kind: ErrorKind::HardReset,
            err_code: 0,
            line_num: 0,
            file_name: [0; ERR_FILE_NAME_LEN],
        }
    }

    /// Record a fault at `file:line`. Only the file name (not its
    /// directories) is kept, truncated to fit.
    pub fn fault(random_id: u16, kind: ErrorKind, err_code: u32, file: &str, line: u32) -> Self {
        let name = file.rsplit(['/', '\\']).next().unwrap_or(file).as_bytes();
        let mut file_name = [0u8; ERR_FILE_NAME_LEN];
        let len = name.len().min(ERR_FILE_NAME_LEN);
        file_name[..len].copy_from_slice(&name[..len]);
        Self {
            random_id,
            kind,
            err_code,
            line_num: line.min(u16::MAX as u32) as u16,
            file_name,
        }
    }

    /// Work out the reset cause on boot.
    ///
    /// `warm` tells whether the retained RAM marker survived, i.e. whether
    /// `retained` holds data from a previous run. A cold boot starts over
    /// with a hard reset; a warm boot after a clean run becomes a soft
    /// reset; recorded faults are kept until the next cold boot.
    pub fn on_boot(retained: Option<Self>, warm: bool, random_id: u16) -> Self {
        match retained {
            Some(mut prev) if warm => {
                if prev.kind == ErrorKind::HardReset {
                    prev.kind = ErrorKind::SoftReset;
                }
                prev
            }
            _ => Self::hard_reset(random_id),
        }
    }
}

/// General status record (15 bytes on the wire).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HealthGeneral {
    /// Battery voltage in tenths of a volt.
    pub battery_lvl: u8,
    pub fw_id: u16,
    /// Minutes since boot.
    pub uptime: u32,
    /// Seconds since midnight.
    pub system_time: u32,
    pub err_id: u16,
    pub err_type: ErrorKind,
}

impl HealthGeneral {
    pub const WIRE_LEN: usize = 15;

    pub fn new(battery_lvl: u8, uptime: u32, system_time: u32, err: &RetainedError) -> Self {
        Self {
            battery_lvl,
            fw_id: FW_VERSION_ID,
            uptime,
            system_time,
            err_id: err.random_id,
            err_type: err.kind,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0] = MSG_TYPE_GENERAL;
        out[1] = self.battery_lvl;
        out[2..4].copy_from_slice(&self.fw_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.uptime.to_le_bytes());
        out[8..12].copy_from_slice(&self.system_time.to_le_bytes());
        out[12..14].copy_from_slice(&self.err_id.to_le_bytes());
        out[14] = self.err_type as u8;
        out
    }
}

/// Detailed error record (20 bytes on the wire).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HealthError {
    pub err_code: u32,
    pub line_num: u16,
    pub file_name: [u8; ERR_FILE_NAME_LEN],
}

impl HealthError {
    pub const WIRE_LEN: usize = 20;

    /// Details for faults that have them.
    pub fn from_retained(err: &RetainedError) -> Option<Self> {
        err.kind.has_details().then_some(Self {
            err_code: err.err_code,
            line_num: err.line_num,
            file_name: err.file_name,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0] = MSG_TYPE_ERROR;
        out[1..5].copy_from_slice(&self.err_code.to_le_bytes());
        out[5..7].copy_from_slice(&self.line_num.to_le_bytes());
        out[7..].copy_from_slice(&self.file_name);
        out
    }
}
