//! Fallback discovery of the BLEAM service.
//!
//! iOS hides the 128-bit UUIDs of services registered by a backgrounded
//! app: they show up in primary-service discovery with an unknown UUID
//! type, so standard discovery by UUID never finds them. This walks the
//! handle space by hand instead. Every candidate service has its
//! declaration read to obtain the full UUID, and the first one whose
//! bytes 12-13 carry the BLEAM service id wins.
//!
//! This is a heuristic built around observed iOS behaviour; nothing in
//! the Bluetooth specification promises it works.

use super::{uuid16_of, ConnHandle, Uuid128};
use crate::error::TransportError;
use crate::platform::{Radio, ServiceRange, UuidKind};

/// First valid attribute handle.
const FIRST_HANDLE: u16 = 0x0001;
/// Last valid attribute handle.
const LAST_HANDLE: u16 = 0xFFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum State {
    Idle,
    /// Waiting for a primary-service response.
    Discovering,
    /// Waiting for the declaration read of a candidate service.
    Reading { resume_at: Option<u16> },
}

/// Result of a discovery step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoveryOutcome {
    /// A request is outstanding; wait for its response.
    Pending,
    /// Found it: the full service UUID.
    Complete(Uuid128),
    /// The whole handle space was searched.
    NotFound,
    /// The radio refused a request.
    Error,
}

pub struct FallbackDiscovery {
    state: State,
    conn: ConnHandle,
    target: u16,
}

impl FallbackDiscovery {
    pub const fn new() -> Self {
        Self {
            state: State::Idle,
            conn: 0,
            target: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != State::Idle
    }

    /// Begin searching `conn` for the service with 16-bit id `target`.
    pub fn start(
        &mut self,
        radio: &mut impl Radio,
        conn: ConnHandle,
        target: u16,
    ) -> DiscoveryOutcome {
        info!("Fallback discovery started on conn {}", conn);
        self.conn = conn;
        self.target = target;
        self.discover_from(radio, FIRST_HANDLE)
    }

    /// Abandon the search (link lost).
    pub fn cancel(&mut self) {
        self.state = State::Idle;
    }

    /// Handle a primary-service discovery response.
    pub fn on_services(
        &mut self,
        radio: &mut impl Radio,
        conn: ConnHandle,
        success: bool,
        services: &[ServiceRange],
    ) -> DiscoveryOutcome {
        if self.state != State::Discovering || conn != self.conn {
            return DiscoveryOutcome::Pending;
        }
        let Some(last) = services.last().filter(|_| success) else {
            debug!("Service discovery exhausted");
            return self.finish(DiscoveryOutcome::NotFound);
        };

        if let Some(candidate) = services.iter().find(|s| self.is_candidate(s)) {
            debug!(
                "Candidate service {}..{} kind {}",
                candidate.start_handle,
                candidate.end_handle,
                candidate.kind
            );
            self.state = State::Reading {
                resume_at: next_handle(candidate.end_handle),
            };
            return match radio.read_handle(self.conn, candidate.start_handle) {
                Ok(()) => DiscoveryOutcome::Pending,
                Err(e) => self.fail(e),
            };
        }

        match next_handle(last.end_handle) {
            Some(start) => self.discover_from(radio, start),
            None => self.finish(DiscoveryOutcome::NotFound),
        }
    }

    /// Handle the declaration read of a candidate service.
    pub fn on_read(
        &mut self,
        radio: &mut impl Radio,
        conn: ConnHandle,
        success: bool,
        data: &[u8],
    ) -> DiscoveryOutcome {
        let State::Reading { resume_at } = self.state else {
            return DiscoveryOutcome::Pending;
        };
        if conn != self.conn {
            return DiscoveryOutcome::Pending;
        }

        if success && data.len() == 16 && uuid16_of(data) == Some(self.target) {
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(data);
            info!("Fallback discovery found the service");
            return self.finish(DiscoveryOutcome::Complete(uuid));
        }

        match resume_at {
            Some(start) => self.discover_from(radio, start),
            None => self.finish(DiscoveryOutcome::NotFound),
        }
    }

    fn is_candidate(&self, service: &ServiceRange) -> bool {
        match service.kind {
            UuidKind::Vendor => service.uuid16 == self.target,
            UuidKind::Unknown => true,
            UuidKind::Sig => false,
        }
    }

    fn discover_from(&mut self, radio: &mut impl Radio, start: u16) -> DiscoveryOutcome {
        self.state = State::Discovering;
        match radio.discover_primary_services(self.conn, start) {
            Ok(()) => DiscoveryOutcome::Pending,
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, e: TransportError) -> DiscoveryOutcome {
        warn!("Fallback discovery error: {}", e);
        self.finish(DiscoveryOutcome::Error)
    }

    fn finish(&mut self, outcome: DiscoveryOutcome) -> DiscoveryOutcome {
        self.state = State::Idle;
        outcome
    }
}

impl Default for FallbackDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle after `end`, or `None` at the top of the handle space.
fn next_handle(end: u16) -> Option<u16> {
    if end >= LAST_HANDLE {
        None
    } else {
        Some(end + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{encode_embedded_uuid, Characteristic, PeerAddress};
    use crate::config::BLEAM_SERVICE_UUID;

    #[derive(Debug, PartialEq)]
    enum Req {
        Discover(u16),
        Read(u16),
    }

    #[derive(Default)]
    struct Gatt {
        reqs: std::vec::Vec<Req>,
        fail: bool,
    }

    impl Radio for Gatt {
        fn start_scan(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn stop_scan(&mut self) {}
        fn connect(&mut self, _: PeerAddress) -> Result<(), TransportError> {
            Ok(())
        }
        fn disconnect(&mut self, _: ConnHandle) -> Result<(), TransportError> {
            Ok(())
        }
        fn discover_service(&mut self, _: ConnHandle, _: &Uuid128) -> Result<(), TransportError> {
            Ok(())
        }
        fn enable_notifications(
            &mut self,
            _: ConnHandle,
            _: Characteristic,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        fn write(&mut self, _: ConnHandle, _: Characteristic, _: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
        fn read(&mut self, _: ConnHandle, _: Characteristic) -> Result<(), TransportError> {
            Ok(())
        }
        fn discover_primary_services(
            &mut self,
            _: ConnHandle,
            start: u16,
        ) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Busy);
            }
            self.reqs.push(Req::Discover(start));
            Ok(())
        }
        fn read_handle(&mut self, _: ConnHandle, handle: u16) -> Result<(), TransportError> {
            self.reqs.push(Req::Read(handle));
            Ok(())
        }
    }

    fn svc(start: u16, end: u16, uuid16: u16, kind: UuidKind) -> ServiceRange {
        ServiceRange {
            start_handle: start,
            end_handle: end,
            uuid16,
            kind,
        }
    }

    const CONN: ConnHandle = 3;

    #[test]
    fn finds_hidden_service_on_second_page() {
        let mut gatt = Gatt::default();
        let mut disc = FallbackDiscovery::new();
        assert_eq!(
            disc.start(&mut gatt, CONN, BLEAM_SERVICE_UUID),
            DiscoveryOutcome::Pending
        );

        let page1 = [
            svc(1, 5, 0x1800, UuidKind::Sig),
            svc(6, 9, 0x1801, UuidKind::Sig),
        ];
        disc.on_services(&mut gatt, CONN, true, &page1);

        let page2 = [
            svc(10, 14, 0x180A, UuidKind::Sig),
            svc(15, 30, 0, UuidKind::Unknown),
        ];
        disc.on_services(&mut gatt, CONN, true, &page2);

        let uuid = encode_embedded_uuid(&[4; 10]);
        assert_eq!(
            disc.on_read(&mut gatt, CONN, true, &uuid),
            DiscoveryOutcome::Complete(uuid)
        );
        assert_eq!(
            gatt.reqs,
            [Req::Discover(1), Req::Discover(10), Req::Read(15)]
        );
        assert!(!disc.is_active());
    }

    #[test]
    fn wrong_uuid_resumes_after_candidate() {
        let mut gatt = Gatt::default();
        let mut disc = FallbackDiscovery::new();
        disc.start(&mut gatt, CONN, BLEAM_SERVICE_UUID);
        disc.on_services(
            &mut gatt,
            CONN,
            true,
            &[svc(1, 8, 0, UuidKind::Unknown), svc(9, 12, 0, UuidKind::Unknown)],
        );
        let mut other = encode_embedded_uuid(&[1; 10]);
        other[13] = 0xB7;
        assert_eq!(
            disc.on_read(&mut gatt, CONN, true, &other),
            DiscoveryOutcome::Pending
        );
        assert_eq!(disc.on_read(&mut gatt, CONN, true, &[0; 2]), DiscoveryOutcome::Pending);
        assert_eq!(gatt.reqs, [Req::Discover(1), Req::Read(1), Req::Discover(9)]);
    }

    #[test]
    fn vendor_service_with_matching_id_is_read() {
        let mut gatt = Gatt::default();
        let mut disc = FallbackDiscovery::new();
        disc.start(&mut gatt, CONN, BLEAM_SERVICE_UUID);
        disc.on_services(
            &mut gatt,
            CONN,
            true,
            &[
                svc(1, 4, 0xB700, UuidKind::Vendor),
                svc(5, 9, BLEAM_SERVICE_UUID, UuidKind::Vendor),
            ],
        );
        assert_eq!(gatt.reqs, [Req::Discover(1), Req::Read(5)]);
    }

    #[test]
    fn att_error_ends_search() {
        let mut gatt = Gatt::default();
        let mut disc = FallbackDiscovery::new();
        disc.start(&mut gatt, CONN, BLEAM_SERVICE_UUID);
        assert_eq!(
            disc.on_services(&mut gatt, CONN, false, &[]),
            DiscoveryOutcome::NotFound
        );
    }

    #[test]
    fn top_of_handle_space_ends_search() {
        let mut gatt = Gatt::default();
        let mut disc = FallbackDiscovery::new();
        disc.start(&mut gatt, CONN, BLEAM_SERVICE_UUID);
        assert_eq!(
            disc.on_services(
                &mut gatt,
                CONN,
                true,
                &[svc(1, 0xFFFF, 0x1800, UuidKind::Sig)]
            ),
            DiscoveryOutcome::NotFound
        );

        let mut disc = FallbackDiscovery::new();
        disc.start(&mut gatt, CONN, BLEAM_SERVICE_UUID);
        disc.on_services(&mut gatt, CONN, true, &[svc(1, 0xFFFF, 0, UuidKind::Unknown)]);
        assert_eq!(
            disc.on_read(&mut gatt, CONN, true, &[0; 16]),
            DiscoveryOutcome::NotFound
        );
    }

    #[test]
    fn transport_error_is_reported() {
        let mut gatt = Gatt {
            fail: true,
            ..Default::default()
        };
        let mut disc = FallbackDiscovery::new();
        assert_eq!(
            disc.start(&mut gatt, CONN, BLEAM_SERVICE_UUID),
            DiscoveryOutcome::Error
        );
        assert!(!disc.is_active());
    }

    #[test]
    fn stray_responses_are_ignored() {
        let mut gatt = Gatt::default();
        let mut disc = FallbackDiscovery::new();
        assert_eq!(
            disc.on_read(&mut gatt, CONN, true, &[0; 16]),
            DiscoveryOutcome::Pending
        );
        disc.start(&mut gatt, CONN, BLEAM_SERVICE_UUID);
        assert_eq!(
            disc.on_services(&mut gatt, CONN + 1, true, &[svc(1, 2, 0, UuidKind::Unknown)]),
            DiscoveryOutcome::Pending
        );
        assert_eq!(gatt.reqs, [Req::Discover(1)]);
    }
}
