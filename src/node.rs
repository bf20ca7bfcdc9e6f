//! [`Platform`](blesc::Platform) on top of the SoftDevice and Embassy.
//!
//! Radio requests are queued to the driver task, timers are kept as
//! deadlines the main loop sleeps on, and node control maps onto
//! [`crate::power`].

use blesc::ble::auth;
use blesc::ble::{Characteristic, ConnHandle, PeerAddress, Uuid128};
use blesc::config::{APP_KEY_LEN, DIGEST_LEN};
use blesc::platform::{
    Clock, CryptoProvider, NodeControl, Radio, TimerId, TIMER_COUNT,
};
use blesc::{Error, TransportError};
use defmt::{info, warn};
use embassy_time::{Duration, Instant};
use heapless::Vec;
use nrf_softdevice::Softdevice;

use crate::power;
use crate::radio::{RadioRequest, REQUESTS};

/// Attempts at drawing from the SoftDevice RNG pool before giving up.
const RNG_RETRIES: usize = 100;

pub struct FirmwarePlatform {
    sd: &'static Softdevice,
    deadlines: [Option<Instant>; TIMER_COUNT],
    unconfigure: bool,
}

impl FirmwarePlatform {
    pub fn new(sd: &'static Softdevice) -> Self {
        Self {
            sd,
            deadlines: [None; TIMER_COUNT],
            unconfigure: false,
        }
    }

    /// The earliest armed timer.
    pub fn next_deadline(&self) -> Option<(TimerId, Instant)> {
        TimerId::ALL
            .iter()
            .filter_map(|&t| self.deadlines[t.index()].map(|at| (t, at)))
            .min_by_key(|&(_, at)| at)
    }

    /// Disarm a timer that just fired.
    pub fn expire(&mut self, timer: TimerId) {
        self.deadlines[timer.index()] = None;
    }

    /// Whether the engine asked for the config to be wiped. Flash access is
    /// async, so the main loop carries it out.
    pub fn take_unconfigure(&mut self) -> bool {
        core::mem::take(&mut self.unconfigure)
    }

    fn request(&self, request: RadioRequest) -> Result<(), TransportError> {
        REQUESTS.try_send(request).map_err(|_| TransportError::Busy)
    }
}

impl Radio for FirmwarePlatform {
    fn start_scan(&mut self) -> Result<(), TransportError> {
        self.request(RadioRequest::StartScan)
    }

    fn stop_scan(&mut self) {
        if self.request(RadioRequest::StopScan).is_err() {
            warn!("Radio queue full - stop scan dropped");
        }
    }

    fn connect(&mut self, peer: PeerAddress) -> Result<(), TransportError> {
        self.request(RadioRequest::Connect(peer))
    }

    fn disconnect(&mut self, conn: ConnHandle) -> Result<(), TransportError> {
        self.request(RadioRequest::Disconnect(conn))
    }

    fn discover_service(&mut self, conn: ConnHandle, uuid: &Uuid128) -> Result<(), TransportError> {
        self.request(RadioRequest::DiscoverService { conn, uuid: *uuid })
    }

    fn enable_notifications(
        &mut self,
        conn: ConnHandle,
        characteristic: Characteristic,
    ) -> Result<(), TransportError> {
        self.request(RadioRequest::EnableNotifications {
            conn,
            characteristic,
        })
    }

    fn write(
        &mut self,
        conn: ConnHandle,
        characteristic: Characteristic,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let data = Vec::from_slice(data).map_err(|_| TransportError::WriteFailed)?;
        self.request(RadioRequest::Write {
            conn,
            characteristic,
            data,
        })
    }

    fn read(&mut self, conn: ConnHandle, characteristic: Characteristic) -> Result<(), TransportError> {
        self.request(RadioRequest::Read {
            conn,
            characteristic,
        })
    }

    fn discover_primary_services(
        &mut self,
        conn: ConnHandle,
        start_handle: u16,
    ) -> Result<(), TransportError> {
        self.request(RadioRequest::DiscoverPrimary {
            conn,
            start: start_handle,
        })
    }

    fn read_handle(&mut self, conn: ConnHandle, handle: u16) -> Result<(), TransportError> {
        self.request(RadioRequest::ReadHandle { conn, handle })
    }
}

impl Clock for FirmwarePlatform {
    fn now_ms(&self) -> u64 {
        Instant::now().as_millis()
    }

    fn start_timer(&mut self, timer: TimerId, after_ms: u32) {
        self.deadlines[timer.index()] =
            Some(Instant::now() + Duration::from_millis(u64::from(after_ms)));
    }

    fn stop_timer(&mut self, timer: TimerId) {
        self.deadlines[timer.index()] = None;
    }
}

impl CryptoProvider for FirmwarePlatform {
    fn hmac_sha256(&mut self, key: &[u8; APP_KEY_LEN], msg: &[u8]) -> Result<[u8; DIGEST_LEN], Error> {
        auth::hmac_sha256(key, msg)
    }

    fn random_bytes(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        // The pool refills in the background; a short spin is enough.
        for _ in 0..RNG_RETRIES {
            if nrf_softdevice::random_bytes(self.sd, buf).is_ok() {
                return Ok(());
            }
        }
        warn!("RNG pool exhausted");
        Err(Error::Entropy)
    }
}

impl NodeControl for FirmwarePlatform {
    fn battery_level(&mut self) -> u8 {
        power::battery_level()
    }

    fn reset(&mut self) {
        info!("Remote reboot");
        power::reset()
    }

    fn enter_dfu(&mut self) {
        info!("Remote DFU");
        power::enter_dfu()
    }

    fn unconfigure(&mut self) {
        info!("Remote unconfigure");
        self.unconfigure = true;
    }
}
