//! Outgoing data to the BLEAM.
//!
//! One write is in flight at a time. Each write completion moves the
//! pipeline one step through
//!
//! ```text
//! Signature chunks -> Health records -> RSSI batches -> idle
//! ```
//!
//! and the caller is told when the signature has gone out and when
//! everything has been drained.

use heapless::Vec;

use super::{Characteristic, ConnHandle};
use crate::config::{DIGEST_LEN, MAX_DATA_LEN, RSSI_QUEUE_LEN};
use crate::error::TransportError;
use crate::health::{HealthError, HealthGeneral};
use crate::platform::Radio;
use crate::ring::RingBuffer;

/// One RSSI sample as sent to the BLEAM (4 bytes, little-endian).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RssiRecord {
    /// Node id of the scanner that took the sample.
    pub sender_id: u16,
    pub rssi: i8,
    pub aoa: u8,
}

impl RssiRecord {
    pub const WIRE_LEN: usize = 4;

    pub fn write_to(&self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.sender_id.to_le_bytes());
        out[2] = self.rssi as u8;
        out[3] = self.aoa;
    }
}

/// Records per write.
pub const RSSI_BATCH: usize = MAX_DATA_LEN / RssiRecord::WIRE_LEN;

/// Characteristic the pipeline is currently writing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendTarget {
    None,
    Signature,
    Health,
    Rssi,
}

/// What a pipeline step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendStatus {
    /// A write was issued; wait for its completion.
    InFlight,
    /// The last signature chunk was acknowledged.
    SignatureSent,
    /// Health and RSSI queues are empty.
    Done,
    /// Nothing to do (not attached, or a write is already in flight).
    Idle,
}

pub struct SendPipeline {
    conn: Option<ConnHandle>,
    target: SendTarget,
    cursor: usize,
    pending: Vec<u8, DIGEST_LEN>,
    general: Option<HealthGeneral>,
    error: Option<HealthError>,
    queue: RingBuffer<RssiRecord, RSSI_QUEUE_LEN>,
}

impl SendPipeline {
    pub const fn new() -> Self {
        Self {
            conn: None,
            target: SendTarget::None,
            cursor: 0,
            pending: Vec::new(),
            general: None,
            error: None,
            queue: RingBuffer::new(),
        }
    }

    /// Bind to a connection whose BLEAM service is discovered.
    pub fn attach(&mut self, conn: ConnHandle) {
        self.conn = Some(conn);
        self.target = SendTarget::None;
        self.cursor = 0;
    }

    /// Forget the connection together with everything queued for it.
    pub fn detach(&mut self) {
        self.conn = None;
        self.target = SendTarget::None;
        self.cursor = 0;
        self.pending.clear();
        self.general = None;
        self.error = None;
        self.queue.clear();
    }

    pub fn is_attached(&self) -> bool {
        self.conn.is_some()
    }

    pub fn target(&self) -> SendTarget {
        self.target
    }

    /// A write is outstanding.
    pub fn is_busy(&self) -> bool {
        self.target != SendTarget::None
    }

    pub fn queued_rssi(&self) -> usize {
        self.queue.len()
    }

    /// Start sending `bytes` on the signature characteristic, in
    /// `MAX_DATA_LEN` chunks. Refused with `Busy` while another write is
    /// outstanding.
    pub fn send_signature(
        &mut self,
        radio: &mut impl Radio,
        bytes: &[u8],
    ) -> Result<SendStatus, TransportError> {
        if self.is_busy() {
            return Err(TransportError::Busy);
        }
        self.pending.clear();
        // Never longer than a digest.
        let _ = self.pending.extend_from_slice(&bytes[..bytes.len().min(DIGEST_LEN)]);
        self.cursor = 0;
        self.target = SendTarget::Signature;
        self.step(radio)
    }

    /// Replace the pending health records.
    pub fn queue_health(&mut self, general: HealthGeneral, error: Option<HealthError>) {
        self.general = Some(general);
        self.error = error;
    }

    /// Queue a sample, dropping the oldest one when full.
    pub fn queue_rssi(&mut self, record: RssiRecord) {
        if self.queue.push(record).is_some() {
            debug!("RSSI queue full - oldest sample dropped");
        }
    }

    /// Start sending queued data if the link is idle.
    pub fn kick(&mut self, radio: &mut impl Radio) -> Result<SendStatus, TransportError> {
        if self.conn.is_none() || self.target != SendTarget::None {
            return Ok(SendStatus::Idle);
        }
        self.step(radio)
    }

    /// The previous write completed; issue the next one.
    pub fn on_write_complete(
        &mut self,
        radio: &mut impl Radio,
    ) -> Result<SendStatus, TransportError> {
        if self.conn.is_none() {
            return Ok(SendStatus::Idle);
        }
        self.step(radio)
    }

    fn step(&mut self, radio: &mut impl Radio) -> Result<SendStatus, TransportError> {
        let Some(conn) = self.conn else {
            return Ok(SendStatus::Idle);
        };
        match self.target {
            SendTarget::Signature => self.send_signature_chunk(radio, conn),
            SendTarget::None | SendTarget::Health => self.send_health(radio, conn),
            SendTarget::Rssi => self.send_rssi(radio, conn),
        }
    }

    fn send_signature_chunk(
        &mut self,
        radio: &mut impl Radio,
        conn: ConnHandle,
    ) -> Result<SendStatus, TransportError> {
        if self.cursor >= self.pending.len() {
            self.target = SendTarget::None;
            self.cursor = 0;
            self.pending.clear();
            return Ok(SendStatus::SignatureSent);
        }
        let end = (self.cursor + MAX_DATA_LEN).min(self.pending.len());
        radio.write(conn, Characteristic::Signature, &self.pending[self.cursor..end])?;
        trace!("Signature chunk {}..{}", self.cursor, end);
        self.cursor = end;
        Ok(SendStatus::InFlight)
    }

    fn send_health(
        &mut self,
        radio: &mut impl Radio,
        conn: ConnHandle,
    ) -> Result<SendStatus, TransportError> {
        if let Some(general) = self.general {
            self.target = SendTarget::Health;
            radio.write(conn, Characteristic::Health, &general.to_bytes())?;
            self.general = None;
            return Ok(SendStatus::InFlight);
        }
        if let Some(error) = self.error {
            self.target = SendTarget::Health;
            radio.write(conn, Characteristic::Health, &error.to_bytes())?;
            self.error = None;
            return Ok(SendStatus::InFlight);
        }
        self.send_rssi(radio, conn)
    }

    fn send_rssi(
        &mut self,
        radio: &mut impl Radio,
        conn: ConnHandle,
    ) -> Result<SendStatus, TransportError> {
        let batch = self.queue.front_run(RSSI_BATCH);
        if batch.is_empty() {
            self.queue.clear();
            self.target = SendTarget::None;
            return Ok(SendStatus::Done);
        }

        let mut buf = [0u8; MAX_DATA_LEN];
        for (record, out) in batch.iter().zip(buf.chunks_exact_mut(RssiRecord::WIRE_LEN)) {
            record.write_to(out);
        }
        let count = batch.len();
        self.target = SendTarget::Rssi;
        radio.write(conn, Characteristic::Rssi, &buf[..count * RssiRecord::WIRE_LEN])?;
        self.queue.consume(count);
        trace!("RSSI batch of {} sent, {} left", count, self.queue.len());
        Ok(SendStatus::InFlight)
    }
}

impl Default for SendPipeline {
    fn default() -> Self {
        Self::new()
    }
}
