//! Connection scheduler: the scan / connect / deliver cycle.
//!
//! ```text
//!        wake (period)            timer, peer seen / record full
//!  Idle ───────────────► Scanning ─────────────────────────────► Connecting
//!   ▲                      │  ▲                                      │
//!   └──── nothing seen ────┘  └──── disconnect / failure ────────────┘
//! ```
//!
//! [`Scanner`] owns every piece of per-node state and reacts to one
//! [`Event`] at a time. It never blocks: requests go out through the
//! [`Platform`] and their outcome comes back as a later event.

use crate::ble::adv_parser::{find_bleam_service_uuid, has_apple_manufacturer_data};
use crate::ble::auth::{AuthChallenge, AuthMode, Command, CryptoSigner, HalfOutcome};
use crate::ble::discovery::{DiscoveryOutcome, FallbackDiscovery};
use crate::ble::peer_cache::{AllowList, DenyList, PeerCache};
use crate::ble::send::{RssiRecord, SendPipeline, SendStatus};
use crate::ble::{
    decode_embedded_uuid, encode_embedded_uuid, AddrKind, Characteristic, ConnHandle, Mac,
    PeerAddress, PeerUuid,
};
use crate::clock::SystemClock;
use crate::config::{NodeConfig, SchedulerConfig, BLEAM_SERVICE_UUID, SALT_LEN};
use crate::error::TransportError;
use crate::health::{HealthError, HealthGeneral, RetainedError};
use crate::platform::{
    AdvReport, DiscoveryEvent, Event, GattEvent, LinkEvent, Platform, ServiceEvent, TimerId,
};

/// Top-level node state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScanState {
    Idle,
    Scanning,
    Connecting,
}

/// Device examined through fallback discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Probe {
    None,
    /// Connecting to (or connected to) this MAC for fallback discovery.
    Probing { mac: Mac, rssi: i8 },
    /// Standard discovery missed the service; probe once after the
    /// current link is gone.
    Pending { mac: Mac, rssi: i8 },
}

enum ConnectAttempt {
    Started,
    /// Address unusable; nothing was touched.
    Skipped,
    /// The radio refused; scanning was restarted.
    Failed,
}

pub struct Scanner {
    cfg: SchedulerConfig,
    node_id: u16,
    signer: CryptoSigner,
    retained: RetainedError,

    state: ScanState,
    clock: SystemClock,
    peers: PeerCache,
    allow: AllowList,
    deny: DenyList,
    probe: Probe,
    discovery: FallbackDiscovery,
    auth: AuthChallenge,
    send: SendPipeline,

    conn: Option<ConnHandle>,
    connecting: bool,
    /// Record being delivered on the current connection.
    target: Option<usize>,
    peer_observed: bool,
    /// Milliseconds since the deny-list was last dropped.
    deny_age_ms: u64,
}

impl Scanner {
    pub fn new(cfg: SchedulerConfig, node: NodeConfig, retained: RetainedError) -> Self {
        Self {
            cfg,
            node_id: node.node_id,
            signer: CryptoSigner::new(node.app_key),
            retained,
            state: ScanState::Idle,
            clock: SystemClock::new(),
            peers: PeerCache::new(),
            allow: AllowList::new(cfg.mac_list_ttl_ms),
            deny: DenyList::new(cfg.mac_list_ttl_ms),
            probe: Probe::None,
            discovery: FallbackDiscovery::new(),
            auth: AuthChallenge::new(),
            send: SendPipeline::new(),
            conn: None,
            connecting: false,
            target: None,
            peer_observed: false,
            deny_age_ms: 0,
        }
    }

    /// First scan right after boot instead of waiting for a period.
    pub fn start<P: Platform>(&mut self, p: &mut P) {
        info!("Scanner started, node id {}", self.node_id);
        self.start_scanning(p);
    }

    pub fn handle<P: Platform>(&mut self, p: &mut P, event: Event) {
        match event {
            Event::Tick => self.on_tick(p),
            Event::Timer(timer) => self.on_timer(p, timer),
            Event::Link(link) => self.on_link(p, link),
            Event::Discovery(discovery) => self.on_discovery(p, discovery),
            Event::Service(service) => self.on_service(p, service),
            Event::Gatt(gatt) => self.on_gatt(p, gatt),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn peers(&self) -> &PeerCache {
        &self.peers
    }

    pub fn clock(&self) -> &SystemClock {
        &self.clock
    }

    pub fn probe(&self) -> Probe {
        self.probe
    }

    pub fn connection(&self) -> Option<ConnHandle> {
        self.conn
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth.mode()
    }

    pub fn queued_rssi(&self) -> usize {
        self.send.queued_rssi()
    }

    /// Queue an extra sample for the BLEAM on the current link. It goes out
    /// after the health records. Returns `false` when no BLEAM session is
    /// open; the sample is then dropped.
    pub fn queue_sample(&mut self, rssi: i8, aoa: u8) -> bool {
        if !self.send.is_attached() {
            return false;
        }
        self.send.queue_rssi(RssiRecord {
            sender_id: self.node_id,
            rssi,
            aoa,
        });
        true
    }

    pub fn is_allowed(&mut self, mac: &Mac, now: u64) -> bool {
        self.allow.contains(mac, now)
    }

    pub fn is_denied(&mut self, mac: &Mac, now: u64) -> bool {
        self.deny.contains(mac, now)
    }

    // ═══════════════════════════════════════════════════════════════
    // Duty cycle
    // ═══════════════════════════════════════════════════════════════

    fn on_tick<P: Platform>(&mut self, p: &mut P) {
        let wake = self.clock.tick();

        self.deny_age_ms += 1_000;
        if self.deny_age_ms >= self.cfg.mac_list_ttl_ms {
            self.deny_age_ms = 0;
            self.deny.clear();
            self.allow.sweep(p.now_ms());
        }

        if wake && self.state == ScanState::Idle {
            debug!("Wake at {} s", self.clock.time());
            self.start_scanning(p);
        }
    }

    fn start_scanning<P: Platform>(&mut self, p: &mut P) {
        let now = p.now_ms();
        self.allow.sweep(now);
        self.deny.sweep(now);
        self.peer_observed = false;

        if let Err(e) = p.start_scan() {
            warn!("Scan start failed: {}", e);
            self.go_idle(p);
            return;
        }
        self.state = ScanState::Scanning;
        p.start_timer(TimerId::EcoWindow, self.cfg.eco_scan_ms);
        p.start_timer(TimerId::ScanConnect, self.cfg.scan_connect_ms);
        debug!("Scanning");
    }

    fn go_idle<P: Platform>(&mut self, p: &mut P) {
        p.stop_timer(TimerId::EcoWindow);
        p.stop_timer(TimerId::ScanConnect);
        p.stop_scan();
        self.peers.clear_all();
        self.state = ScanState::Idle;
        self.clock.mark_stale();
        debug!("Idle");
    }

    fn on_timer<P: Platform>(&mut self, p: &mut P, timer: TimerId) {
        match timer {
            TimerId::EcoWindow => {
                if self.state == ScanState::Scanning && !self.peer_observed {
                    debug!("No BLEAM nearby");
                    self.go_idle(p);
                }
            }
            TimerId::ScanConnect => {
                if self.state != ScanState::Scanning {
                    return;
                }
                if !self.peer_observed {
                    debug!("No BLEAM nearby");
                    self.go_idle(p);
                    return;
                }
                info!("Scan window over, {} peers", self.peers.active_count());
                while let Some(index) = self.peers.first_active() {
                    match self.connect_record(p, index) {
                        ConnectAttempt::Started | ConnectAttempt::Failed => return,
                        ConnectAttempt::Skipped => {}
                    }
                }
                // Everything seen was unusable; try another window.
                self.start_scanning(p);
            }
            TimerId::Inactivity => {
                if self.conn.is_some() {
                    warn!("BLEAM went quiet");
                    self.drop_target();
                    self.auth.reset();
                    self.disconnect(p);
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Advertisements
    // ═══════════════════════════════════════════════════════════════

    fn on_advertisement<P: Platform>(&mut self, p: &mut P, report: AdvReport) {
        let now = p.now_ms();

        if let Some(full) = find_bleam_service_uuid(&report.data) {
            let uuid = decode_embedded_uuid(&full);
            self.observe(p, &uuid, &report.mac, report.rssi, now);
            return;
        }

        if !has_apple_manufacturer_data(&report.data) {
            return;
        }
        if let Some(uuid) = self.allow.lookup(&report.mac, now, None) {
            trace!("Known iOS BLEAM");
            self.observe(p, &uuid, &report.mac, report.rssi, now);
            return;
        }
        if self.deny.contains(&report.mac, now) || self.probe != Probe::None || self.link_busy() {
            return;
        }

        info!("Probing unknown iOS device");
        self.probe = Probe::Probing {
            mac: report.mac,
            rssi: report.rssi,
        };
        if !matches!(self.connect_to(p, report.mac), ConnectAttempt::Started) {
            self.probe = Probe::None;
        }
    }

    /// Book-keeping for a confirmed BLEAM sighting.
    fn observe<P: Platform>(&mut self, p: &mut P, uuid: &PeerUuid, mac: &Mac, rssi: i8, now: u64) {
        self.peer_observed = true;
        p.stop_timer(TimerId::EcoWindow);

        if self.allow.insert(mac, *uuid, now).is_err() {
            debug!("Allow-list full");
        }
        let Some(index) = self.peers.record_candidate(uuid, mac, now) else {
            return;
        };
        if self.peers.append_sample(index, rssi, 0) && self.state == ScanState::Scanning {
            info!("Peer {} has a full message", index);
            if let ConnectAttempt::Skipped = self.connect_record(p, index) {
                self.peers.clear(index);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Connections
    // ═══════════════════════════════════════════════════════════════

    fn link_busy(&self) -> bool {
        self.connecting || self.conn.is_some()
    }

    fn connect_record<P: Platform>(&mut self, p: &mut P, index: usize) -> ConnectAttempt {
        if self.link_busy() {
            debug!("Connection already pending");
            return ConnectAttempt::Started;
        }
        let Some(mac) = self.peers.get(index).filter(|r| r.active).map(|r| r.mac) else {
            return ConnectAttempt::Skipped;
        };
        self.target = Some(index);
        let attempt = self.connect_to(p, mac);
        if !matches!(attempt, ConnectAttempt::Started) {
            self.target = None;
            self.peers.clear(index);
        }
        attempt
    }

    fn connect_to<P: Platform>(&mut self, p: &mut P, mac: Mac) -> ConnectAttempt {
        let Some(kind) = AddrKind::from_mac(&mac) else {
            warn!("Reserved address type, skipping");
            return ConnectAttempt::Skipped;
        };

        p.stop_timer(TimerId::EcoWindow);
        p.stop_timer(TimerId::ScanConnect);
        p.stop_scan();

        match p.connect(PeerAddress { kind, mac }) {
            Ok(()) => {
                self.connecting = true;
                self.state = ScanState::Connecting;
                debug!("Connecting");
                ConnectAttempt::Started
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.start_scanning(p);
                ConnectAttempt::Failed
            }
        }
    }

    fn disconnect<P: Platform>(&mut self, p: &mut P) {
        p.stop_timer(TimerId::Inactivity);
        self.send.detach();
        if let Some(conn) = self.conn {
            if let Err(e) = p.disconnect(conn) {
                warn!("Disconnect failed: {}", e);
            }
        }
    }

    /// Forget the record delivered on this connection.
    fn drop_target(&mut self) {
        if let Some(index) = self.target.take() {
            self.peers.clear(index);
        }
    }

    fn on_link<P: Platform>(&mut self, p: &mut P, event: LinkEvent) {
        match event {
            LinkEvent::Advertisement(report) => {
                if self.state == ScanState::Scanning {
                    self.on_advertisement(p, report);
                }
            }
            LinkEvent::Connected { conn } => self.on_connected(p, conn),
            LinkEvent::Disconnected { conn, reason } => {
                if self.conn != Some(conn) {
                    return;
                }
                info!("Disconnected, reason {=u8:#x}", reason);
                self.on_disconnected(p);
            }
            LinkEvent::ConnectTimeout => {
                if !self.connecting {
                    return;
                }
                warn!("Connect timed out");
                self.connecting = false;
                self.drop_target();
                self.probe = Probe::None;
                self.start_scanning(p);
            }
            LinkEvent::GattTimeout { conn } => {
                if self.conn == Some(conn) {
                    warn!("GATT timeout");
                    self.disconnect(p);
                }
            }
        }
    }

    fn on_connected<P: Platform>(&mut self, p: &mut P, conn: ConnHandle) {
        self.connecting = false;
        self.conn = Some(conn);
        self.state = ScanState::Connecting;

        if let Probe::Probing { .. } = self.probe {
            let outcome = self.discovery.start(p, conn, BLEAM_SERVICE_UUID);
            self.on_fallback_outcome(p, outcome);
            return;
        }

        let Some(uuid) = self
            .target
            .and_then(|i| self.peers.get(i))
            .filter(|r| r.active)
            .map(|r| r.uuid)
        else {
            warn!("Connected without a target");
            self.disconnect(p);
            return;
        };
        info!("Connected, discovering BLEAM service");
        if let Err(e) = p.discover_service(conn, &encode_embedded_uuid(&uuid)) {
            self.transport_failure(p, e);
        }
    }

    fn on_disconnected<P: Platform>(&mut self, p: &mut P) {
        self.conn = None;
        self.connecting = false;
        p.stop_timer(TimerId::Inactivity);
        self.discovery.cancel();
        self.auth.reset();
        self.send.detach();
        self.drop_target();

        let now = p.now_ms();
        self.allow.sweep(now);
        self.deny.sweep(now);

        match self.probe {
            Probe::Pending { mac, rssi } => {
                info!("Retrying with fallback discovery");
                self.probe = Probe::Probing { mac, rssi };
                match self.connect_to(p, mac) {
                    ConnectAttempt::Started => {}
                    ConnectAttempt::Skipped => {
                        self.probe = Probe::None;
                        self.start_scanning(p);
                    }
                    ConnectAttempt::Failed => self.probe = Probe::None,
                }
            }
            Probe::Probing { .. } | Probe::None => {
                self.probe = Probe::None;
                // A probe can complete a record while no scan is running.
                if let Some(index) = self.peers.first_ready() {
                    info!("Peer {} has a full message", index);
                    match self.connect_record(p, index) {
                        ConnectAttempt::Started | ConnectAttempt::Failed => return,
                        ConnectAttempt::Skipped => {}
                    }
                }
                self.start_scanning(p);
            }
        }
    }

    fn transport_failure<P: Platform>(&mut self, p: &mut P, e: TransportError) {
        warn!("Transport error: {}", e);
        self.disconnect(p);
    }

    fn protocol_violation<P: Platform>(&mut self, p: &mut P) {
        warn!("Protocol violation, dropping BLEAM");
        self.drop_target();
        self.auth.reset();
        self.disconnect(p);
    }

    // ═══════════════════════════════════════════════════════════════
    // Discovery
    // ═══════════════════════════════════════════════════════════════

    fn on_discovery<P: Platform>(&mut self, p: &mut P, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Complete { conn } if self.conn == Some(conn) => {
                debug!("BLEAM service found, waiting for salt");
                self.send.attach(conn);
                p.start_timer(TimerId::Inactivity, self.cfg.inactivity_ms);
                if let Err(e) = p.enable_notifications(conn, Characteristic::Challenge) {
                    self.transport_failure(p, e);
                }
            }
            DiscoveryEvent::ServiceNotFound { conn } if self.conn == Some(conn) => {
                info!("Service hidden, will probe");
                if let Some(record) = self.target.and_then(|i| self.peers.get(i)) {
                    self.probe = Probe::Pending {
                        mac: record.mac,
                        rssi: record.last_sample().map_or(i8::MIN, |s| s.rssi),
                    };
                }
                self.drop_target();
                self.disconnect(p);
            }
            DiscoveryEvent::Failed { conn } if self.conn == Some(conn) => {
                warn!("Service discovery failed");
                self.drop_target();
                self.disconnect(p);
            }
            _ => {}
        }
    }

    fn on_gatt<P: Platform>(&mut self, p: &mut P, event: GattEvent) {
        let outcome = match event {
            GattEvent::PrimaryServices {
                conn,
                success,
                services,
            } => self.discovery.on_services(p, conn, success, &services),
            GattEvent::HandleRead {
                conn,
                success,
                data,
            } => self.discovery.on_read(p, conn, success, &data),
        };
        self.on_fallback_outcome(p, outcome);
    }

    fn on_fallback_outcome<P: Platform>(&mut self, p: &mut P, outcome: DiscoveryOutcome) {
        let Probe::Probing { mac, rssi } = self.probe else {
            return;
        };
        match outcome {
            DiscoveryOutcome::Pending => return,
            DiscoveryOutcome::Complete(full) => {
                let uuid = decode_embedded_uuid(&full);
                let now = p.now_ms();
                self.observe(p, &uuid, &mac, rssi, now);
            }
            DiscoveryOutcome::NotFound | DiscoveryOutcome::Error => {
                info!("Not a BLEAM");
                if self.deny.insert(&mac, (), p.now_ms()).is_err() {
                    debug!("Deny-list full");
                }
            }
        }
        self.probe = Probe::None;
        self.disconnect(p);
    }

    // ═══════════════════════════════════════════════════════════════
    // Authentication and delivery
    // ═══════════════════════════════════════════════════════════════

    fn on_service<P: Platform>(&mut self, p: &mut P, event: ServiceEvent) {
        match event {
            ServiceEvent::Notification {
                conn,
                characteristic: Characteristic::Challenge,
                data,
            } if self.conn == Some(conn) => self.on_command(p, &data),
            ServiceEvent::ReadResponse {
                conn,
                characteristic: Characteristic::Time,
                data,
            } if self.conn == Some(conn) => {
                if let Some(ms) = data.get(..4) {
                    self.clock
                        .sync_from_millis(u32::from_le_bytes([ms[0], ms[1], ms[2], ms[3]]));
                }
                self.disconnect(p);
            }
            ServiceEvent::WriteComplete { conn } if self.conn == Some(conn) => {
                let status = self.send.on_write_complete(p);
                self.on_send_status(p, status);
            }
            _ => {}
        }
    }

    fn on_command<P: Platform>(&mut self, p: &mut P, data: &[u8]) {
        let Some((&first, body)) = data.split_first() else {
            self.protocol_violation(p);
            return;
        };
        let Ok(cmd) = Command::try_from(first) else {
            self.protocol_violation(p);
            return;
        };
        debug!("Command {}", cmd);

        if matches!(cmd, Command::Salt | Command::Dfu | Command::Reboot | Command::Unconfig)
            && self.send.is_busy()
        {
            // Only one write may be outstanding.
            self.protocol_violation(p);
            return;
        }

        match cmd {
            Command::Salt => {
                p.stop_timer(TimerId::Inactivity);
                let Some(bytes) = body.get(..SALT_LEN) else {
                    self.protocol_violation(p);
                    return;
                };
                let mut salt = [0u8; SALT_LEN];
                salt.copy_from_slice(bytes);
                match self.signer.sign(p, &salt) {
                    Ok(digest) => {
                        self.auth.begin_upload();
                        let status = self.send.send_signature(p, &digest);
                        self.on_send_status(p, status);
                    }
                    Err(e) => {
                        error!("Signing failed: {}", e);
                        self.disconnect(p);
                    }
                }
            }
            Command::Dfu | Command::Reboot | Command::Unconfig => {
                let Some(mode) = AuthMode::for_remote(cmd) else {
                    return;
                };
                match self.signer.challenge(p) {
                    Ok((salt, expected)) => {
                        self.auth.begin_remote(mode, expected);
                        p.start_timer(TimerId::Inactivity, self.cfg.inactivity_ms);
                        let status = self.send.send_signature(p, &salt);
                        self.on_send_status(p, status);
                    }
                    Err(e) => {
                        error!("Challenge failed: {}", e);
                        self.disconnect(p);
                    }
                }
            }
            Command::Sign1 | Command::Sign2 => match self.auth.accept_half(cmd, body) {
                HalfOutcome::Pending => {
                    p.start_timer(TimerId::Inactivity, self.cfg.inactivity_ms);
                }
                HalfOutcome::Verified(mode) => {
                    p.stop_timer(TimerId::Inactivity);
                    self.perform(p, mode);
                }
                HalfOutcome::Rejected => self.protocol_violation(p),
            },
        }
    }

    fn perform<P: Platform>(&mut self, p: &mut P, mode: AuthMode) {
        match mode {
            AuthMode::Dfu => {
                info!("Entering bootloader");
                p.enter_dfu();
            }
            AuthMode::Reboot => {
                info!("Rebooting on request");
                p.reset();
            }
            AuthMode::Unconfig => {
                info!("Unconfiguring on request");
                p.unconfigure();
            }
            AuthMode::Rssi | AuthMode::None => return,
        }
        self.disconnect(p);
    }

    fn on_send_status<P: Platform>(&mut self, p: &mut P, status: Result<SendStatus, TransportError>) {
        match status {
            Ok(SendStatus::SignatureSent) => self.on_signature_sent(p),
            Ok(SendStatus::Done) => self.on_send_done(p),
            Ok(SendStatus::InFlight | SendStatus::Idle) => {}
            Err(e) => self.transport_failure(p, e),
        }
    }

    fn on_signature_sent<P: Platform>(&mut self, p: &mut P) {
        if self.auth.mode() != AuthMode::Rssi {
            // Remote operations now wait for the BLEAM's signature.
            return;
        }

        let general = HealthGeneral::new(
            p.battery_level(),
            self.clock.uptime_minutes(),
            self.clock.time(),
            &self.retained,
        );
        self.send
            .queue_health(general, HealthError::from_retained(&self.retained));

        if let Some(record) = self.target.and_then(|i| self.peers.get(i)) {
            for sample in record.samples() {
                self.send.queue_rssi(RssiRecord {
                    sender_id: self.node_id,
                    rssi: sample.rssi,
                    aoa: sample.aoa,
                });
            }
        }
        let status = self.send.kick(p);
        self.on_send_status(p, status);
    }

    fn on_send_done<P: Platform>(&mut self, p: &mut P) {
        info!("Delivery complete");
        if let Some(record) = self.target.and_then(|i| self.peers.get(i)) {
            let (mac, uuid) = (record.mac, record.uuid);
            if self.allow.insert(&mac, uuid, p.now_ms()).is_err() {
                debug!("Allow-list full");
            }
        }
        self.drop_target();
        self.auth.reset();

        let Some(conn) = self.conn else {
            return;
        };
        if self.clock.needs_sync() {
            debug!("Reading BLEAM time");
            if let Err(e) = p.read(conn, Characteristic::Time) {
                self.transport_failure(p, e);
            }
        } else {
            self.disconnect(p);
        }
    }
}
