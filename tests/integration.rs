//! Integration tests for the scanner engine, driven through its public
//! API with a recording platform.

use blesc::ble::auth::{hmac_sha256, HALF_DIGEST_LEN};
use blesc::ble::{encode_embedded_uuid, Characteristic, ConnHandle, Mac, PeerAddress, PeerUuid, Uuid128};
use blesc::config::{APP_KEY_LEN, DIGEST_LEN, MAX_PEERS};
use blesc::health::{HealthGeneral, RetainedError};
use blesc::platform::{
    AdvReport, Clock, CryptoProvider, DiscoveryEvent, Event, GattEvent, LinkEvent, NodeControl,
    Payload, Radio, ServiceEvent, ServiceRange, TimerId, UuidKind,
};
use blesc::scheduler::Probe;
use blesc::{Error, NodeConfig, ScanState, Scanner, SchedulerConfig, TransportError};
use heapless::Vec;

// ═══════════════════════════════════════════════════════════════════════════
// Recording platform
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq)]
enum Call {
    StartScan,
    StopScan,
    Connect(Mac),
    Disconnect(ConnHandle),
    DiscoverService(Uuid128),
    Notify(Characteristic),
    Write(Characteristic, std::vec::Vec<u8>),
    Read(Characteristic),
    Primary(u16),
    ReadHandle(u16),
    Reset,
    Dfu,
    Unconfigure,
}

#[derive(Default)]
struct Node {
    calls: std::vec::Vec<Call>,
    armed: [bool; 3],
    now: u64,
}

impl Node {
    fn armed(&self, timer: TimerId) -> bool {
        self.armed[timer.index()]
    }

    fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    fn writes(&self, ch: Characteristic) -> std::vec::Vec<std::vec::Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Write(w, data) if *w == ch => Some(data.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Radio for Node {
    fn start_scan(&mut self) -> Result<(), TransportError> {
        self.calls.push(Call::StartScan);
        Ok(())
    }
    fn stop_scan(&mut self) {
        self.calls.push(Call::StopScan);
    }
    fn connect(&mut self, peer: PeerAddress) -> Result<(), TransportError> {
        self.calls.push(Call::Connect(peer.mac));
        Ok(())
    }
    fn disconnect(&mut self, conn: ConnHandle) -> Result<(), TransportError> {
        self.calls.push(Call::Disconnect(conn));
        Ok(())
    }
    fn discover_service(&mut self, _: ConnHandle, uuid: &Uuid128) -> Result<(), TransportError> {
        self.calls.push(Call::DiscoverService(*uuid));
        Ok(())
    }
    fn enable_notifications(&mut self, _: ConnHandle, ch: Characteristic) -> Result<(), TransportError> {
        self.calls.push(Call::Notify(ch));
        Ok(())
    }
    fn write(&mut self, _: ConnHandle, ch: Characteristic, data: &[u8]) -> Result<(), TransportError> {
        self.calls.push(Call::Write(ch, data.to_vec()));
        Ok(())
    }
    fn read(&mut self, _: ConnHandle, ch: Characteristic) -> Result<(), TransportError> {
        self.calls.push(Call::Read(ch));
        Ok(())
    }
    fn discover_primary_services(&mut self, _: ConnHandle, start: u16) -> Result<(), TransportError> {
        self.calls.push(Call::Primary(start));
        Ok(())
    }
    fn read_handle(&mut self, _: ConnHandle, handle: u16) -> Result<(), TransportError> {
        self.calls.push(Call::ReadHandle(handle));
        Ok(())
    }
}

impl Clock for Node {
    fn now_ms(&self) -> u64 {
        self.now
    }
    fn start_timer(&mut self, timer: TimerId, _: u32) {
        self.armed[timer.index()] = true;
    }
    fn stop_timer(&mut self, timer: TimerId) {
        self.armed[timer.index()] = false;
    }
}

impl CryptoProvider for Node {
    fn hmac_sha256(&mut self, key: &[u8; APP_KEY_LEN], msg: &[u8]) -> Result<[u8; DIGEST_LEN], Error> {
        hmac_sha256(key, msg)
    }
    fn random_bytes(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        buf.fill(SALT_BYTE);
        Ok(())
    }
}

impl NodeControl for Node {
    fn battery_level(&mut self) -> u8 {
        31
    }
    fn reset(&mut self) {
        self.calls.push(Call::Reset);
    }
    fn enter_dfu(&mut self) {
        self.calls.push(Call::Dfu);
    }
    fn unconfigure(&mut self) {
        self.calls.push(Call::Unconfigure);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════════════════════

const KEY: [u8; APP_KEY_LEN] = [0x2B; APP_KEY_LEN];
const NODE_ID: u16 = 0x0A0B;
const SALT_BYTE: u8 = 0x33;
const CONN: ConnHandle = 4;
const MAC: Mac = [0x10, 0x20, 0x30, 0x40, 0x50, 0xC0];
const IOS_MAC: Mac = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
const PEER: PeerUuid = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

fn scanner() -> Scanner {
    Scanner::new(
        SchedulerConfig::new(),
        NodeConfig::new(NODE_ID, KEY),
        RetainedError::hard_reset(0x1234),
    )
}

fn bleam_adv(mac: Mac, uuid: &PeerUuid, rssi: i8) -> Event {
    let mut data = Vec::new();
    data.extend_from_slice(&[17, 0x07]).unwrap();
    data.extend_from_slice(&encode_embedded_uuid(uuid)).unwrap();
    Event::Link(LinkEvent::Advertisement(AdvReport { mac, rssi, data }))
}

fn apple_adv(mac: Mac, rssi: i8) -> Event {
    let data = Vec::from_slice(&[5, 0xFF, 0x4C, 0x00, 0x10, 0x01]).unwrap();
    Event::Link(LinkEvent::Advertisement(AdvReport { mac, rssi, data }))
}

fn notify(bytes: &[u8]) -> Event {
    Event::Service(ServiceEvent::Notification {
        conn: CONN,
        characteristic: Characteristic::Challenge,
        data: Payload::from_slice(bytes).unwrap(),
    })
}

fn write_done() -> Event {
    Event::Service(ServiceEvent::WriteComplete { conn: CONN })
}

fn connected() -> Event {
    Event::Link(LinkEvent::Connected { conn: CONN })
}

fn disconnected() -> Event {
    Event::Link(LinkEvent::Disconnected {
        conn: CONN,
        reason: 0x13,
    })
}

fn salt_command() -> [u8; 17] {
    let mut msg = [0xA5u8; 17];
    msg[0] = 0;
    msg
}

/// Scan, collect a full record from `PEER` and get the service discovered.
fn connect_to_bleam(s: &mut Scanner, p: &mut Node) {
    s.start(p);
    for rssi in [-50, -51, -52, -53, -54] {
        s.handle(p, bleam_adv(MAC, &PEER, rssi));
    }
    assert_eq!(s.state(), ScanState::Connecting);
    s.handle(p, connected());
    assert_eq!(
        p.calls.last(),
        Some(&Call::DiscoverService(encode_embedded_uuid(&PEER)))
    );
    s.handle(p, Event::Discovery(DiscoveryEvent::Complete { conn: CONN }));
    assert_eq!(p.calls.last(), Some(&Call::Notify(Characteristic::Challenge)));
}

/// Open a remote operation and return the digest the BLEAM must send back.
fn open_remote(s: &mut Scanner, p: &mut Node, command: u8) -> [u8; DIGEST_LEN] {
    s.handle(p, notify(&[command]));
    assert_eq!(
        p.calls.last(),
        Some(&Call::Write(Characteristic::Signature, vec![SALT_BYTE; 16]))
    );
    s.handle(p, write_done());
    hmac_sha256(&KEY, &[SALT_BYTE; 16]).unwrap()
}

fn sign(half: u8, digest: &[u8]) -> std::vec::Vec<u8> {
    let mut msg = vec![half];
    msg.extend_from_slice(digest);
    msg
}

// ═══════════════════════════════════════════════════════════════════════════
// Delivery
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn quiet_window_goes_idle_without_connecting() {
    let mut p = Node::default();
    let mut s = scanner();
    s.start(&mut p);
    s.handle(&mut p, Event::Timer(TimerId::EcoWindow));
    assert_eq!(s.state(), ScanState::Idle);
    assert_eq!(s.peers().active_count(), 0);
    assert!(!p.calls.iter().any(|c| matches!(c, Call::Connect(_))));
    assert_eq!(p.calls.last(), Some(&Call::StopScan));

    // Late scan-window expiry while idle changes nothing.
    s.handle(&mut p, Event::Timer(TimerId::ScanConnect));
    assert_eq!(s.state(), ScanState::Idle);
}

#[test]
fn full_record_connects_before_scan_window_ends() {
    let mut p = Node::default();
    let mut s = scanner();
    s.start(&mut p);
    for rssi in [-50, -51, -52, -53] {
        s.handle(&mut p, bleam_adv(MAC, &PEER, rssi));
        assert_eq!(s.state(), ScanState::Scanning);
    }
    s.handle(&mut p, bleam_adv(MAC, &PEER, -54));
    assert_eq!(s.state(), ScanState::Connecting);
    assert!(!p.armed(TimerId::ScanConnect));
    assert_eq!(p.count(&Call::Connect(MAC)), 1);
}

#[test]
fn full_delivery_then_time_sync() {
    let mut p = Node::default();
    let mut s = scanner();
    connect_to_bleam(&mut s, &mut p);

    s.handle(&mut p, notify(&salt_command()));
    let digest = hmac_sha256(&KEY, &[0xA5; 16]).unwrap();
    s.handle(&mut p, write_done());
    s.handle(&mut p, write_done());
    assert_eq!(
        p.writes(Characteristic::Signature),
        vec![digest[..20].to_vec(), digest[20..].to_vec()]
    );

    // Health goes out before the samples.
    let health = p.writes(Characteristic::Health);
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].len(), HealthGeneral::WIRE_LEN);
    assert_eq!(health[0][1], 31);

    s.handle(&mut p, write_done());
    let rssi = p.writes(Characteristic::Rssi);
    assert_eq!(rssi.len(), 1);
    assert_eq!(
        rssi[0],
        vec![
            0x0B, 0x0A, -50i8 as u8, 0, 0x0B, 0x0A, -51i8 as u8, 0, 0x0B, 0x0A, -52i8 as u8, 0,
            0x0B, 0x0A, -53i8 as u8, 0, 0x0B, 0x0A, -54i8 as u8, 0,
        ]
    );

    // Freshly booted: the BLEAM's clock is read before leaving.
    s.handle(&mut p, write_done());
    assert_eq!(p.calls.last(), Some(&Call::Read(Characteristic::Time)));
    assert_eq!(s.peers().active_count(), 0);
    assert!(s.is_allowed(&MAC, 0));

    let ms = 3_723_000u32.to_le_bytes();
    s.handle(
        &mut p,
        Event::Service(ServiceEvent::ReadResponse {
            conn: CONN,
            characteristic: Characteristic::Time,
            data: Payload::from_slice(&ms).unwrap(),
        }),
    );
    assert_eq!(s.clock().time(), 3_723);
    assert!(!s.clock().needs_sync());
    assert_eq!(p.calls.last(), Some(&Call::Disconnect(CONN)));

    s.handle(&mut p, disconnected());
    assert_eq!(s.state(), ScanState::Scanning);
    assert_eq!(p.calls.last(), Some(&Call::StartScan));
}

#[test]
fn synced_clock_skips_time_read() {
    let mut p = Node::default();
    let mut s = scanner();
    connect_to_bleam(&mut s, &mut p);
    s.handle(&mut p, notify(&salt_command()));
    for _ in 0..4 {
        s.handle(&mut p, write_done());
    }
    s.handle(
        &mut p,
        Event::Service(ServiceEvent::ReadResponse {
            conn: CONN,
            characteristic: Characteristic::Time,
            data: Payload::from_slice(&1_000u32.to_le_bytes()).unwrap(),
        }),
    );
    s.handle(&mut p, disconnected());

    // Second delivery, clock still fresh.
    p.calls.clear();
    for rssi in [-60, -61, -62, -63, -64] {
        s.handle(&mut p, bleam_adv(MAC, &PEER, rssi));
    }
    s.handle(&mut p, connected());
    s.handle(&mut p, Event::Discovery(DiscoveryEvent::Complete { conn: CONN }));
    s.handle(&mut p, notify(&salt_command()));
    for _ in 0..4 {
        s.handle(&mut p, write_done());
    }
    assert_eq!(p.count(&Call::Read(Characteristic::Time)), 0);
    assert_eq!(p.calls.last(), Some(&Call::Disconnect(CONN)));
}

#[test]
fn twelve_queued_samples_go_out_in_three_writes() {
    let mut p = Node::default();
    let mut s = scanner();
    assert!(!s.queue_sample(-40, 0));
    connect_to_bleam(&mut s, &mut p);
    // Five samples come from the record, seven more are queued here.
    for i in 0..7 {
        assert!(s.queue_sample(-40 - i, 0));
    }

    s.handle(&mut p, notify(&salt_command()));
    s.handle(&mut p, write_done());
    s.handle(&mut p, write_done());
    assert_eq!(p.writes(Characteristic::Health).len(), 1);
    for _ in 0..3 {
        s.handle(&mut p, write_done());
    }
    let rssi = p.writes(Characteristic::Rssi);
    let sizes: std::vec::Vec<usize> = rssi.iter().map(|w| w.len() / 4).collect();
    assert_eq!(sizes, vec![5, 5, 2]);
    assert_eq!(rssi[1][2], -45i8 as u8);
    assert_eq!(rssi[1][10], -50i8 as u8);
    assert_eq!(rssi[2][6], -54i8 as u8);
    assert_eq!(p.count(&Call::Read(Characteristic::Time)), 0);

    // Last completion drains the queue.
    s.handle(&mut p, write_done());
    assert_eq!(p.calls.last(), Some(&Call::Read(Characteristic::Time)));
    assert_eq!(p.writes(Characteristic::Rssi).len(), 3);
    assert_eq!(s.queued_rssi(), 0);
}

#[test]
fn interrupted_upload_is_not_sent_to_the_next_bleam() {
    let mut p = Node::default();
    let mut s = scanner();
    s.start(&mut p);
    for _ in 0..5 {
        s.handle(&mut p, bleam_adv(MAC, &PEER, -40));
    }
    s.handle(&mut p, connected());
    s.handle(&mut p, Event::Discovery(DiscoveryEvent::Complete { conn: CONN }));
    s.handle(&mut p, notify(&salt_command()));
    s.handle(&mut p, write_done());
    s.handle(&mut p, write_done());
    assert_eq!(p.writes(Characteristic::Health).len(), 1);
    assert_eq!(s.queued_rssi(), 5);

    // Link lost while the health record is in flight.
    s.handle(&mut p, disconnected());
    assert_eq!(s.queued_rssi(), 0);
    assert_eq!(s.state(), ScanState::Scanning);

    let other_mac: Mac = [0x77, 0x66, 0x55, 0x44, 0x33, 0xC2];
    let other: PeerUuid = [0xB0; 10];
    p.calls.clear();
    for _ in 0..5 {
        s.handle(&mut p, bleam_adv(other_mac, &other, -70));
    }
    assert_eq!(p.calls.last(), Some(&Call::Connect(other_mac)));
    s.handle(&mut p, connected());
    s.handle(&mut p, Event::Discovery(DiscoveryEvent::Complete { conn: CONN }));
    s.handle(&mut p, notify(&salt_command()));
    for _ in 0..4 {
        s.handle(&mut p, write_done());
    }

    let rssi = p.writes(Characteristic::Rssi);
    assert_eq!(rssi.len(), 1);
    let values: std::vec::Vec<i8> = rssi[0].chunks(4).map(|r| r[2] as i8).collect();
    assert_eq!(values, vec![-70; 5]);
}

#[test]
fn command_during_outstanding_write_drops_the_link() {
    let mut p = Node::default();
    let mut s = scanner();
    connect_to_bleam(&mut s, &mut p);
    s.handle(&mut p, notify(&salt_command()));
    assert_eq!(p.writes(Characteristic::Signature).len(), 1);

    // DFU request before the first chunk is acknowledged.
    s.handle(&mut p, notify(&[1]));
    assert_eq!(p.writes(Characteristic::Signature).len(), 1);
    assert_eq!(p.calls.last(), Some(&Call::Disconnect(CONN)));
    assert_eq!(s.peers().active_count(), 0);

    // The stale completion issues nothing.
    s.handle(&mut p, write_done());
    assert_eq!(p.writes(Characteristic::Signature).len(), 1);
    assert_eq!(p.count(&Call::Dfu), 0);
}

// ═══════════════════════════════════════════════════════════════════════════
// Failures
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn silent_bleam_is_dropped_after_inactivity() {
    let mut p = Node::default();
    let mut s = scanner();
    connect_to_bleam(&mut s, &mut p);
    assert!(p.armed(TimerId::Inactivity));

    s.handle(&mut p, Event::Timer(TimerId::Inactivity));
    assert_eq!(p.calls.last(), Some(&Call::Disconnect(CONN)));
    assert_eq!(s.peers().active_count(), 0);

    s.handle(&mut p, disconnected());
    assert_eq!(s.state(), ScanState::Scanning);
    assert_eq!(s.connection(), None);
}

#[test]
fn wrong_signature_cancels_remote_reboot() {
    let mut p = Node::default();
    let mut s = scanner();
    connect_to_bleam(&mut s, &mut p);
    let digest = open_remote(&mut s, &mut p, 4);

    s.handle(&mut p, notify(&sign(2, &digest[..HALF_DIGEST_LEN])));
    assert!(p.armed(TimerId::Inactivity));
    let mut bad = digest[HALF_DIGEST_LEN..].to_vec();
    bad[0] ^= 0xFF;
    s.handle(&mut p, notify(&sign(3, &bad)));

    assert_eq!(p.count(&Call::Reset), 0);
    assert_eq!(p.calls.last(), Some(&Call::Disconnect(CONN)));
    assert!(!p.armed(TimerId::Inactivity));
    assert_eq!(s.peers().active_count(), 0);
}

#[test]
fn full_peer_table_drops_new_candidates() {
    let mut p = Node::default();
    let mut s = scanner();
    s.start(&mut p);
    for i in 0..=MAX_PEERS as u8 {
        let mut uuid = PEER;
        uuid[0] = i;
        let mac = [i, 0, 0, 0, 0, 0xC0];
        s.handle(&mut p, bleam_adv(mac, &uuid, -70));
    }
    assert_eq!(s.peers().active_count(), MAX_PEERS);
    assert_eq!(s.state(), ScanState::Scanning);
}

#[test]
fn failed_discovery_moves_on() {
    let mut p = Node::default();
    let mut s = scanner();
    s.start(&mut p);
    s.handle(&mut p, bleam_adv(MAC, &PEER, -60));
    s.handle(&mut p, Event::Timer(TimerId::ScanConnect));
    s.handle(&mut p, connected());
    s.handle(&mut p, Event::Discovery(DiscoveryEvent::Failed { conn: CONN }));
    assert_eq!(p.calls.last(), Some(&Call::Disconnect(CONN)));
    assert_eq!(s.peers().active_count(), 0);
    assert_eq!(s.probe(), Probe::None);
}

// ═══════════════════════════════════════════════════════════════════════════
// Remote operations
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn signed_reboot_resets_the_node() {
    let mut p = Node::default();
    let mut s = scanner();
    connect_to_bleam(&mut s, &mut p);
    let digest = open_remote(&mut s, &mut p, 4);

    // Halves may arrive in either order.
    s.handle(&mut p, notify(&sign(3, &digest[HALF_DIGEST_LEN..])));
    assert_eq!(p.count(&Call::Reset), 0);
    s.handle(&mut p, notify(&sign(2, &digest[..HALF_DIGEST_LEN])));
    assert_eq!(p.count(&Call::Reset), 1);
}

#[test]
fn signed_dfu_and_unconfigure() {
    let mut p = Node::default();
    let mut s = scanner();
    connect_to_bleam(&mut s, &mut p);
    let digest = open_remote(&mut s, &mut p, 1);
    s.handle(&mut p, notify(&sign(2, &digest[..HALF_DIGEST_LEN])));
    s.handle(&mut p, notify(&sign(3, &digest[HALF_DIGEST_LEN..])));
    assert_eq!(p.count(&Call::Dfu), 1);

    let digest = open_remote(&mut s, &mut p, 5);
    s.handle(&mut p, notify(&sign(2, &digest[..HALF_DIGEST_LEN])));
    s.handle(&mut p, notify(&sign(3, &digest[HALF_DIGEST_LEN..])));
    assert_eq!(p.count(&Call::Unconfigure), 1);
}

#[test]
fn sign_without_challenge_is_rejected() {
    let mut p = Node::default();
    let mut s = scanner();
    connect_to_bleam(&mut s, &mut p);
    s.handle(&mut p, notify(&sign(2, &[0u8; HALF_DIGEST_LEN])));
    assert_eq!(p.calls.last(), Some(&Call::Disconnect(CONN)));
    assert_eq!(p.count(&Call::Reset), 0);
}

// ═══════════════════════════════════════════════════════════════════════════
// Fallback discovery
// ═══════════════════════════════════════════════════════════════════════════

fn services(list: &[ServiceRange]) -> Event {
    Event::Gatt(GattEvent::PrimaryServices {
        conn: CONN,
        success: true,
        services: Vec::from_slice(list).unwrap(),
    })
}

fn hidden_service() -> [ServiceRange; 2] {
    [
        ServiceRange {
            start_handle: 1,
            end_handle: 5,
            uuid16: 0x1800,
            kind: UuidKind::Sig,
        },
        ServiceRange {
            start_handle: 6,
            end_handle: 12,
            uuid16: 0,
            kind: UuidKind::Unknown,
        },
    ]
}

#[test]
fn ios_device_is_probed_and_remembered() {
    let mut p = Node::default();
    let mut s = scanner();
    s.start(&mut p);

    s.handle(&mut p, apple_adv(IOS_MAC, -66));
    assert_eq!(p.calls.last(), Some(&Call::Connect(IOS_MAC)));
    assert_eq!(s.probe(), Probe::Probing { mac: IOS_MAC, rssi: -66 });

    s.handle(&mut p, connected());
    assert_eq!(p.calls.last(), Some(&Call::Primary(1)));
    s.handle(&mut p, services(&hidden_service()));
    assert_eq!(p.calls.last(), Some(&Call::ReadHandle(6)));

    let full = encode_embedded_uuid(&PEER);
    s.handle(
        &mut p,
        Event::Gatt(GattEvent::HandleRead {
            conn: CONN,
            success: true,
            data: Payload::from_slice(&full).unwrap(),
        }),
    );
    assert_eq!(s.probe(), Probe::None);
    assert!(s.is_allowed(&IOS_MAC, 0));
    assert_eq!(s.peers().active_count(), 1);
    assert_eq!(p.calls.last(), Some(&Call::Disconnect(CONN)));

    s.handle(&mut p, disconnected());
    assert_eq!(s.state(), ScanState::Scanning);

    // Known now: further sightings feed the record without probing.
    let connects = p.count(&Call::Connect(IOS_MAC));
    s.handle(&mut p, apple_adv(IOS_MAC, -67));
    assert_eq!(p.count(&Call::Connect(IOS_MAC)), connects);
    let index = s.peers().first_active().unwrap();
    assert_eq!(s.peers().get(index).unwrap().uuid, PEER);
}

#[test]
fn ios_device_without_bleam_is_denied() {
    let mut p = Node::default();
    let mut s = scanner();
    s.start(&mut p);

    s.handle(&mut p, apple_adv(IOS_MAC, -70));
    s.handle(&mut p, connected());
    s.handle(&mut p, services(&hidden_service()));
    // Some other vendor's service.
    let mut other = encode_embedded_uuid(&PEER);
    other[12] = 0x34;
    other[13] = 0x12;
    s.handle(
        &mut p,
        Event::Gatt(GattEvent::HandleRead {
            conn: CONN,
            success: true,
            data: Payload::from_slice(&other).unwrap(),
        }),
    );
    assert_eq!(p.calls.last(), Some(&Call::Primary(13)));
    s.handle(
        &mut p,
        Event::Gatt(GattEvent::PrimaryServices {
            conn: CONN,
            success: false,
            services: Vec::new(),
        }),
    );
    assert!(s.is_denied(&IOS_MAC, 0));
    assert_eq!(p.calls.last(), Some(&Call::Disconnect(CONN)));
    s.handle(&mut p, disconnected());

    let connects = p.count(&Call::Connect(IOS_MAC));
    s.handle(&mut p, apple_adv(IOS_MAC, -70));
    assert_eq!(p.count(&Call::Connect(IOS_MAC)), connects);
    assert_eq!(s.probe(), Probe::None);
}

#[test]
fn hidden_service_is_probed_on_reconnect() {
    let mut p = Node::default();
    let mut s = scanner();
    s.start(&mut p);
    s.handle(&mut p, bleam_adv(MAC, &PEER, -58));
    s.handle(&mut p, Event::Timer(TimerId::ScanConnect));
    s.handle(&mut p, connected());

    s.handle(&mut p, Event::Discovery(DiscoveryEvent::ServiceNotFound { conn: CONN }));
    assert_eq!(s.probe(), Probe::Pending { mac: MAC, rssi: -58 });
    assert_eq!(p.calls.last(), Some(&Call::Disconnect(CONN)));

    s.handle(&mut p, disconnected());
    assert_eq!(s.probe(), Probe::Probing { mac: MAC, rssi: -58 });
    assert_eq!(p.calls.last(), Some(&Call::Connect(MAC)));
    assert_eq!(p.count(&Call::Connect(MAC)), 2);

    s.handle(&mut p, connected());
    assert_eq!(p.calls.last(), Some(&Call::Primary(1)));
}

#[test]
fn record_completed_by_fallback_connects_after_it() {
    let mut p = Node::default();
    let mut s = scanner();
    s.start(&mut p);
    for rssi in [-50, -51, -52, -53] {
        s.handle(&mut p, bleam_adv(MAC, &PEER, rssi));
    }

    // The same BLEAM shows up again under a rotated iOS address.
    s.handle(&mut p, apple_adv(IOS_MAC, -55));
    s.handle(&mut p, connected());
    s.handle(&mut p, services(&hidden_service()));
    let full = encode_embedded_uuid(&PEER);
    s.handle(
        &mut p,
        Event::Gatt(GattEvent::HandleRead {
            conn: CONN,
            success: true,
            data: Payload::from_slice(&full).unwrap(),
        }),
    );
    let index = s.peers().first_ready().unwrap();
    assert_eq!(s.peers().get(index).unwrap().mac, IOS_MAC);
    assert_eq!(p.calls.last(), Some(&Call::Disconnect(CONN)));

    s.handle(&mut p, disconnected());
    assert_eq!(s.state(), ScanState::Connecting);
    assert_eq!(p.calls.last(), Some(&Call::Connect(IOS_MAC)));
    assert_eq!(p.count(&Call::Connect(IOS_MAC)), 2);
    assert!(!p.armed(TimerId::ScanConnect));

    s.handle(&mut p, connected());
    assert_eq!(
        p.calls.last(),
        Some(&Call::DiscoverService(encode_embedded_uuid(&PEER)))
    );
}
