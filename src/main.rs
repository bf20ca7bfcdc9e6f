//! BLEAM Scanner firmware entry point (nRF52840 + S140).
//!
//! Task layout:
//!
//! ```text
//!  softdevice_task ── raw events ──► radio::on_ble_event ─┐
//!  radio_task ◄── REQUESTS ── main loop ◄── EVENTS ───────┤
//!  ticker_task ── Tick ───────────────────────────────────┘
//!  battery_task (SAADC, once a minute)
//! ```
//!
//! The main loop owns the [`Scanner`] and feeds it one event at a time;
//! its one-shot timers are deadlines the loop sleeps on.

#![no_std]
#![no_main]

mod node;
mod power;
mod radio;
mod storage;

use blesc::config::{NodeConfig, APP_KEY_LEN};
use blesc::platform::{CryptoProvider, Event};
use blesc::{Error, Scanner, SchedulerConfig};
use defmt::{error, info, unwrap, warn};
use embassy_executor::Spawner;
use embassy_futures::select::{select, Either};
use embassy_nrf::interrupt::Priority;
use embassy_time::{Duration, Ticker, Timer};
use nrf_softdevice::{raw, Flash, Softdevice};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use crate::node::FirmwarePlatform;
use crate::radio::EVENTS;
use crate::storage::ConfigStore;

/// Vendor UUID bases the SoftDevice can hold at once.
const VS_UUID_COUNT: u8 = 8;

static SCANNER: StaticCell<Scanner> = StaticCell::new();

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run_with_callback(radio::on_ble_event).await
}

#[embassy_executor::task]
async fn radio_task(sd: &'static Softdevice) -> ! {
    radio::driver_task(sd).await
}

#[embassy_executor::task]
async fn ticker_task() -> ! {
    let mut ticker = Ticker::every(Duration::from_secs(1));
    loop {
        ticker.next().await;
        EVENTS.send(Event::Tick).await;
    }
}

fn softdevice_config() -> nrf_softdevice::Config {
    nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_RC as u8,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_500_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: 1,
            event_length: 24,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t { att_mtu: 23 }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: 0,
            central_role_count: 1,
            central_sec_count: 0,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        common_vs_uuid: Some(raw::ble_common_cfg_vs_uuid_t {
            vs_uuid_count: VS_UUID_COUNT,
        }),
        ..Default::default()
    }
}

/// Identity baked in at build time (`BLESC_NODE_ID`, `BLESC_APP_KEY` as
/// 32 hex digits) for nodes flashed on the bench.
fn factory_config() -> Option<NodeConfig> {
    let node_id = option_env!("BLESC_NODE_ID")?.parse().ok()?;
    let hex = option_env!("BLESC_APP_KEY")?.as_bytes();
    if hex.len() != APP_KEY_LEN * 2 {
        return None;
    }
    let mut app_key = [0u8; APP_KEY_LEN];
    for (byte, pair) in app_key.iter_mut().zip(hex.chunks_exact(2)) {
        let digits = core::str::from_utf8(pair).ok()?;
        *byte = u8::from_str_radix(digits, 16).ok()?;
    }
    Some(NodeConfig::new(node_id, app_key))
}

async fn load_identity(store: &mut ConfigStore<Flash>) -> Result<NodeConfig, Error> {
    if let Some(cfg) = store.load().await? {
        return Ok(cfg);
    }
    let cfg = factory_config().ok_or(Error::NotConfigured)?;
    store.save(&cfg).await?;
    Ok(cfg)
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("BLEAM scanner starting");

    // Interrupt priorities 0, 1 and 4 are reserved by the SoftDevice.
    let mut config = embassy_nrf::config::Config::default();
    config.gpiote_interrupt_priority = Priority::P2;
    config.time_interrupt_priority = Priority::P2;
    let p = embassy_nrf::init(config);

    let sd = Softdevice::enable(&softdevice_config());
    unwrap!(spawner.spawn(softdevice_task(sd)));

    let mut platform = FirmwarePlatform::new(sd);
    let mut id = [0u8; 2];
    if platform.random_bytes(&mut id).is_err() {
        warn!("No entropy for the error id");
    }
    let retained = power::boot_error(u16::from_le_bytes(id));

    let mut store = ConfigStore::new(Flash::take(sd));
    let node = match load_identity(&mut store).await {
        Ok(node) => node,
        Err(e) => {
            // Provisioning runs elsewhere; nothing to do until reflashed.
            error!("No usable node config: {}", e);
            loop {
                Timer::after(Duration::from_secs(3600)).await;
            }
        }
    };

    unwrap!(spawner.spawn(power::battery_task(p.SAADC)));
    unwrap!(spawner.spawn(radio_task(sd)));
    unwrap!(spawner.spawn(ticker_task()));

    let scanner = SCANNER.init(Scanner::new(SchedulerConfig::new(), node, retained));
    scanner.start(&mut platform);

    loop {
        let event = match platform.next_deadline() {
            Some((timer, at)) => match select(EVENTS.receive(), Timer::at(at)).await {
                Either::First(event) => event,
                Either::Second(()) => {
                    platform.expire(timer);
                    Event::Timer(timer)
                }
            },
            None => EVENTS.receive().await,
        };
        scanner.handle(&mut platform, event);

        if platform.take_unconfigure() {
            if let Err(e) = store.erase().await {
                error!("Unconfigure failed: {}", e);
            }
            power::reset();
        }
    }
}
