//! Advertisement payload parsing.
//!
//! Advertising data is a sequence of `[len][type][len - 1 bytes]`
//! structures. Only two record types matter here.

use super::{uuid16_of, Uuid128};
use crate::config::BLEAM_SERVICE_UUID;

/// Complete list of 128-bit service UUIDs.
pub const AD_TYPE_UUID128_COMPLETE: u8 = 0x07;

/// Manufacturer specific data.
pub const AD_TYPE_MANUFACTURER: u8 = 0xFF;

/// Apple company id, little-endian.
pub const APPLE_COMPANY_ID: [u8; 2] = [0x4C, 0x00];

/// Iterate `(type, payload)` pairs, stopping at the first malformed record.
pub fn records(data: &[u8]) -> Records<'_> {
    Records { data, pos: 0 }
}

pub struct Records<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.pos;
        let len = *self.data.get(i)? as usize;
        if len == 0 || i + len >= self.data.len() {
            self.pos = self.data.len();
            return None;
        }
        self.pos = i + len + 1;
        Some((self.data[i + 1], &self.data[i + 2..i + 1 + len]))
    }
}

/// Return the first advertised 128-bit UUID whose bytes 12-13 carry the
/// BLEAM service id.
pub fn find_bleam_service_uuid(data: &[u8]) -> Option<Uuid128> {
    records(data)
        .filter(|(ad_type, _)| *ad_type == AD_TYPE_UUID128_COMPLETE)
        .flat_map(|(_, payload)| payload.chunks_exact(16))
        .find(|chunk| uuid16_of(chunk) == Some(BLEAM_SERVICE_UUID))
        .and_then(|chunk| chunk.try_into().ok())
}

/// True if the advertisement carries Apple manufacturer data, which is
/// how a backgrounded iOS BLEAM shows up.
pub fn has_apple_manufacturer_data(data: &[u8]) -> bool {
    records(data).any(|(ad_type, payload)| {
        ad_type == AD_TYPE_MANUFACTURER && payload.starts_with(&APPLE_COMPANY_ID)
    })
}
