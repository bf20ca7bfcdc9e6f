//! Peer records and TTL MAC lists.
//!
//! `PeerCache` holds the BLEAMs seen in the current scan cycle together
//! with their RSSI samples. `MacList` remembers, for a limited time,
//! which MACs turned out to be BLEAMs (allow-list, with the resolved
//! UUID) and which did not (deny-list). Both are fixed-size tables.

use super::{Mac, PeerUuid};
use crate::config::{MAX_PEERS, PEER_UUID_LEN, SAMPLES_PER_MESSAGE};
use crate::error::Error;

/// One RSSI observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sample {
    pub rssi: i8,
    /// Angle of arrival.
    pub aoa: u8,
}

impl Sample {
    /// Value of an unused sample slot.
    pub const EMPTY: Self = Self { rssi: i8::MIN, aoa: 0 };
}

/// A BLEAM observed during the current scan cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerRecord {
    pub active: bool,
    pub uuid: PeerUuid,
    pub mac: Mac,
    samples: [Sample; SAMPLES_PER_MESSAGE],
    sample_count: usize,
    pub last_seen: u64,
}

impl PeerRecord {
    pub const fn empty() -> Self {
        Self {
            active: false,
            uuid: [0; PEER_UUID_LEN],
            mac: [0; 6],
            samples: [Sample::EMPTY; SAMPLES_PER_MESSAGE],
            sample_count: 0,
            last_seen: 0,
        }
    }

    /// Samples collected so far.
    pub fn samples(&self) -> &[Sample] {
        &self.samples[..self.sample_count]
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Most recent sample, if any.
    pub fn last_sample(&self) -> Option<Sample> {
        self.samples().last().copied()
    }

    /// Full records are waiting for delivery and take no more samples.
    pub fn is_ready(&self) -> bool {
        self.sample_count >= SAMPLES_PER_MESSAGE
    }
}

/// Fixed table of peer records.
pub struct PeerCache {
    records: [PeerRecord; MAX_PEERS],
}

impl PeerCache {
    pub const fn new() -> Self {
        Self {
            records: [PeerRecord::empty(); MAX_PEERS],
        }
    }

    /// Find or allocate the slot for a peer and mark it active.
    ///
    /// Matches on UUID first (updating the MAC if the peer rotated it),
    /// then on MAC (updating the UUID), then takes the first inactive
    /// slot. Returns `None` when the table is full; nothing is evicted.
    ///
    /// A MAC is held by at most one active record: when a UUID match takes
    /// over a MAC another record still holds, that other record is cleared.
    pub fn record_candidate(&mut self, uuid: &PeerUuid, mac: &Mac, now: u64) -> Option<usize> {
        let index = self
            .records
            .iter()
            .position(|r| r.active && r.uuid == *uuid)
            .or_else(|| self.records.iter().position(|r| r.active && r.mac == *mac))
            .or_else(|| self.records.iter().position(|r| !r.active));

        let Some(index) = index else {
            warn!("Peer table full - dropping candidate");
            return None;
        };

        if let Some(stale) = self
            .records
            .iter()
            .enumerate()
            .position(|(i, r)| i != index && r.active && r.mac == *mac)
        {
            debug!("MAC moved from slot {} to {}", stale, index);
            self.records[stale] = PeerRecord::empty();
        }

        let record = &mut self.records[index];
        if record.active && record.uuid != *uuid {
            // Same MAC now advertises another identity: samples belong to the old one.
            record.samples = [Sample::EMPTY; SAMPLES_PER_MESSAGE];
            record.sample_count = 0;
        }
        if !record.active {
            debug!("New peer in slot {}", index);
        }
        record.active = true;
        record.uuid = *uuid;
        record.mac = *mac;
        record.last_seen = now;
        Some(index)
    }

    /// Append a sample. Returns `true` only for the call that fills the
    /// record; samples offered to a full or inactive record are dropped.
    pub fn append_sample(&mut self, index: usize, rssi: i8, aoa: u8) -> bool {
        let Some(record) = self.records.get_mut(index) else {
            return false;
        };
        if !record.active || record.is_ready() {
            return false;
        }
        record.samples[record.sample_count] = Sample { rssi, aoa };
        record.sample_count += 1;
        record.is_ready()
    }

    /// Return the slot to its pristine, inactive state.
    pub fn clear(&mut self, index: usize) {
        if let Some(record) = self.records.get_mut(index) {
            *record = PeerRecord::empty();
        }
    }

    pub fn clear_all(&mut self) {
        self.records = [PeerRecord::empty(); MAX_PEERS];
    }

    pub fn get(&self, index: usize) -> Option<&PeerRecord> {
        self.records.get(index)
    }

    /// Lowest-index active record (slots fill in discovery order).
    pub fn first_active(&self) -> Option<usize> {
        self.records.iter().position(|r| r.active)
    }

    /// Lowest-index active record holding a full message.
    pub fn first_ready(&self) -> Option<usize> {
        self.records.iter().position(|r| r.active && r.is_ready())
    }

    pub fn active_count(&self) -> usize {
        self.records.iter().filter(|r| r.active).count()
    }
}

impl Default for PeerCache {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MAC lists
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug)]
struct MacEntry<V> {
    active: bool,
    mac: Mac,
    value: V,
    timestamp: u64,
}

/// Fixed-size MAC table whose entries expire after `ttl_ms`.
///
/// Expiry is lazy: `lookup` deactivates every stale entry it walks past,
/// and `sweep` does the same for the whole table.
pub struct MacList<V, const N: usize> {
    entries: [MacEntry<V>; N],
    ttl_ms: u64,
}

/// MACs of iOS peers that resolved to a BLEAM, with the resolved UUID.
pub type AllowList = MacList<PeerUuid, MAX_PEERS>;

/// MACs that failed fallback discovery.
pub type DenyList = MacList<(), MAX_PEERS>;

impl<V: Copy + Default + PartialEq, const N: usize> MacList<V, N> {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            entries: [MacEntry {
                active: false,
                mac: [0; 6],
                value: V::default(),
                timestamp: 0,
            }; N],
            ttl_ms,
        }
    }

    fn expired(&self, entry: &MacEntry<V>, now: u64) -> bool {
        now.saturating_sub(entry.timestamp) > self.ttl_ms
    }

    /// Look `mac` up. A live match has its timestamp refreshed and, when
    /// `update` differs from the stored value, its value replaced.
    pub fn lookup(&mut self, mac: &Mac, now: u64, update: Option<V>) -> Option<V> {
        for i in 0..N {
            if !self.entries[i].active {
                continue;
            }
            if self.expired(&self.entries[i], now) {
                self.entries[i].active = false;
                continue;
            }
            let entry = &mut self.entries[i];
            if entry.mac == *mac {
                entry.timestamp = now;
                if let Some(value) = update {
                    if entry.value != value {
                        entry.value = value;
                    }
                }
                return Some(entry.value);
            }
        }
        None
    }

    pub fn contains(&mut self, mac: &Mac, now: u64) -> bool {
        self.lookup(mac, now, None).is_some()
    }

    /// Insert or refresh `mac`. Expired slots are reused; when every slot
    /// is live the insert fails and nothing is evicted.
    pub fn insert(&mut self, mac: &Mac, value: V, now: u64) -> Result<(), Error> {
        if self.lookup(mac, now, Some(value)).is_some() {
            return Ok(());
        }
        let slot = (0..N)
            .find(|&i| !self.entries[i].active || self.expired(&self.entries[i], now))
            .ok_or(Error::ListFull)?;
        self.entries[slot] = MacEntry {
            active: true,
            mac: *mac,
            value,
            timestamp: now,
        };
        Ok(())
    }

    /// Deactivate every expired entry.
    pub fn sweep(&mut self, now: u64) {
        for i in 0..N {
            if self.entries[i].active && self.expired(&self.entries[i], now) {
                self.entries[i].active = false;
            }
        }
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.active = false;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.active).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
