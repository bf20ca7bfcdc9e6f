//! Node power: battery measurement, resets and the reset-surviving
//! error record.
//!
//! nRF52840 reset behaviour:
//! - Power-on / pin reset: RAM content is undefined, the retained record
//!   is rebuilt as a hard reset
//! - Soft reset (`SCB::sys_reset`, DFU, fault): RAM survives, the record
//!   read back tells the backend why the node restarted

use core::mem::MaybeUninit;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU8, Ordering};

use blesc::health::{ErrorKind, RetainedError, ERR_FILE_NAME_LEN};
use blesc::power_logic;
use cortex_m_rt::{exception, ExceptionFrame};
use defmt::{info, warn};
use embassy_nrf::interrupt::{self, InterruptExt, Priority};
use embassy_nrf::peripherals::SAADC;
use embassy_nrf::{bind_interrupts, saadc};
use embassy_time::{Duration, Timer};
use nrf_softdevice::raw;

/// How often the battery is sampled.
const BATTERY_PERIOD: Duration = Duration::from_secs(60);

/// GPREGRET value the bootloader treats as "stay in DFU".
const DFU_MAGIC: u32 = 0xB1;

/// Marks the retained record as written by this firmware.
const RETAINED_MAGIC: u32 = 0xB1E5_C0DE;

bind_interrupts!(struct Irqs {
    SAADC => saadc::InterruptHandler;
});

/// Last battery level in tenths of a volt. Zero until the first sample.
static BATTERY_LEVEL: AtomicU8 = AtomicU8::new(0);

pub fn battery_level() -> u8 {
    BATTERY_LEVEL.load(Ordering::Relaxed)
}

/// Sample VDD through the SAADC (gain 1/6, internal reference, 10 bit).
#[embassy_executor::task]
pub async fn battery_task(adc: SAADC) {
    // P0, P1 and P4 belong to the SoftDevice.
    interrupt::SAADC.set_priority(Priority::P3);

    let mut config = saadc::Config::default();
    config.resolution = saadc::Resolution::_10BIT;
    let channel = saadc::ChannelConfig::single_ended(saadc::VddInput);
    let mut adc = saadc::Saadc::new(adc, Irqs, config, [channel]);
    adc.calibrate().await;

    loop {
        let mut buf = [0i16; 1];
        adc.sample(&mut buf).await;
        let level = power_logic::battery_level(buf[0]);
        BATTERY_LEVEL.store(level, Ordering::Relaxed);
        info!("Battery: {} mV", power_logic::adc_to_millivolts(buf[0]));
        Timer::after(BATTERY_PERIOD).await;
    }
}

pub fn reset() -> ! {
    cortex_m::peripheral::SCB::sys_reset()
}

/// Ask the bootloader to stay in DFU mode, then restart.
pub fn enter_dfu() -> ! {
    // SAFETY: plain SVC call into the SoftDevice.
    let ret = unsafe { raw::sd_power_gpregret_set(0, DFU_MAGIC) };
    if ret != raw::NRF_SUCCESS {
        warn!("GPREGRET write failed: {}", ret);
    }
    reset()
}

// ═══════════════════════════════════════════════════════════════════════════
// Retained error record
// ═══════════════════════════════════════════════════════════════════════════

/// Plain-integer image of [`RetainedError`]; any bit pattern is valid,
/// so it can be read from RAM that was never initialised.
#[repr(C)]
struct RetainedImage {
    magic: u32,
    kind: u8,
    random_id: u16,
    err_code: u32,
    line_num: u16,
    file_name: [u8; ERR_FILE_NAME_LEN],
}

#[link_section = ".uninit.blesc"]
static mut RETAINED: MaybeUninit<RetainedImage> = MaybeUninit::uninit();

fn store(err: &RetainedError) {
    let image = RetainedImage {
        magic: RETAINED_MAGIC,
        kind: err.kind as u8,
        random_id: err.random_id,
        err_code: err.err_code,
        line_num: err.line_num,
        file_name: err.file_name,
    };
    // SAFETY: single writer (boot or the fault handler, never both at once).
    unsafe { addr_of_mut!(RETAINED).write(MaybeUninit::new(image)) };
}

fn load() -> Option<RetainedError> {
    // SAFETY: every field is a plain integer, so any RAM content is valid.
    let image = unsafe { addr_of_mut!(RETAINED).read().assume_init() };
    (image.magic == RETAINED_MAGIC).then(|| RetainedError {
        random_id: image.random_id,
        kind: ErrorKind::from_u8(image.kind),
        err_code: image.err_code,
        line_num: image.line_num,
        file_name: image.file_name,
    })
}

/// Work out why we came up, and arm the record for the next reset.
pub fn boot_error(random_id: u16) -> RetainedError {
    let retained = load();
    let err = RetainedError::on_boot(retained, retained.is_some(), random_id);
    info!("Reset cause: {}", err.kind);
    store(&err);
    err
}

/// Faults (including panics, which end in `udf`) are recorded with the
/// faulting PC and the node restarts.
#[exception]
unsafe fn HardFault(ef: &ExceptionFrame) -> ! {
    let random_id = load().map_or(0, |e| e.random_id);
    store(&RetainedError::fault(
        random_id,
        ErrorKind::AppMemAccess,
        ef.pc(),
        file!(),
        line!(),
    ));
    reset()
}
