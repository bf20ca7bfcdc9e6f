//! Battery level conversion for the SAADC reading.
//!
//! The ADC samples VDD through 1/6 gain against the 0.6 V internal
//! reference at 10 bit resolution; a protection diode sits in front of
//! the regulator.

const ADC_REF_MILLIVOLTS: u32 = 600;
const ADC_PRESCALING_COMPENSATION: u32 = 6;
const ADC_RESOLUTION: u32 = 1024;
const DIODE_DROP_MILLIVOLTS: u32 = 270;

/// Convert a raw sample to battery millivolts. Negative samples (noise
/// around ground) read as zero.
pub fn adc_to_millivolts(raw: i16) -> u32 {
    let raw = raw.max(0) as u32;
    (raw * ADC_REF_MILLIVOLTS / ADC_RESOLUTION) * ADC_PRESCALING_COMPENSATION
        + DIODE_DROP_MILLIVOLTS
}

/// Battery level as reported in health records: tenths of a volt.
pub fn battery_level(raw: i16) -> u8 {
    (adc_to_millivolts(raw) / 100).min(u8::MAX as u32) as u8
}
