//! Wall clock and duty-cycle period.
//!
//! The node has no RTC backup; it keeps seconds since midnight from a
//! one-second tick and corrects them from the BLEAM's TIME
//! characteristic after a delivery. Wake-ups happen on multiples of the
//! current period so scanners in one area wake together.

use crate::config::{
    DAYTIME_START, DAY_PERIODS, NIGHTTIME_START, NIGHT_PERIODS, SECS_PER_DAY, TIME_PERIOD_SECS,
};

/// Duty cycle while people are around.
pub const DAY_PERIOD_SECS: u32 = TIME_PERIOD_SECS * DAY_PERIODS;

/// Duty cycle at night.
pub const NIGHT_PERIOD_SECS: u32 = TIME_PERIOD_SECS * NIGHT_PERIODS;

/// Wake period for a given time of day.
pub fn period_for(system_time: u32) -> u32 {
    if (NIGHTTIME_START..DAYTIME_START).contains(&system_time) {
        NIGHT_PERIOD_SECS
    } else {
        DAY_PERIOD_SECS
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SystemClock {
    /// Seconds since midnight.
    time: u32,
    /// Seconds since boot, modulo one minute.
    boot_secs: u32,
    /// Minutes since boot.
    uptime: u32,
    needs_sync: bool,
}

impl SystemClock {
    pub const fn new() -> Self {
        Self {
            time: 0,
            boot_secs: 0,
            uptime: 0,
            needs_sync: true,
        }
    }

    /// Advance one second. Returns `true` when a wake-up is due.
    pub fn tick(&mut self) -> bool {
        let before = period_for(self.time);
        self.time = (self.time + 1) % SECS_PER_DAY;
        if self.time == 0 {
            // Drift accumulated over a day: fetch the time again.
            self.needs_sync = true;
        }
        self.boot_secs += 1;
        if self.boot_secs == 60 {
            self.boot_secs = 0;
            self.uptime = self.uptime.wrapping_add(1);
        }
        let period = period_for(self.time);
        if period != before {
            info!("Duty cycle period now {} s", period);
        }
        self.time % period == 0
    }

    /// Adopt the BLEAM's time (milliseconds since midnight).
    pub fn sync_from_millis(&mut self, millis: u32) {
        self.time = (millis / 1000) % SECS_PER_DAY;
        self.needs_sync = false;
        info!("System time synced to {} s", self.time);
    }

    /// Ask for a resync on the next delivery (the node is about to idle
    /// for a while).
    pub fn mark_stale(&mut self) {
        self.needs_sync = true;
    }

    pub fn needs_sync(&self) -> bool {
        self.needs_sync
    }

    pub fn time(&self) -> u32 {
        self.time
    }

    pub fn uptime_minutes(&self) -> u32 {
        self.uptime
    }

    pub fn period(&self) -> u32 {
        period_for(self.time)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_switches_at_thresholds() {
        assert_eq!(period_for(0), DAY_PERIOD_SECS);
        assert_eq!(period_for(NIGHTTIME_START - 1), DAY_PERIOD_SECS);
        assert_eq!(period_for(NIGHTTIME_START), NIGHT_PERIOD_SECS);
        assert_eq!(period_for(DAYTIME_START - 1), NIGHT_PERIOD_SECS);
        assert_eq!(period_for(DAYTIME_START), DAY_PERIOD_SECS);
    }

    #[test]
    fn wakes_every_day_period() {
        let mut clock = SystemClock::new();
        let wakes = (0..30).filter(|_| clock.tick()).count();
        assert_eq!(wakes, 3);
        assert_eq!(clock.time(), 30);
    }

    #[test]
    fn wakes_less_often_at_night() {
        let mut clock = SystemClock::new();
        clock.sync_from_millis(2 * 3_600 * 1_000);
        let wakes = (0..120).filter(|_| clock.tick()).count();
        assert_eq!(wakes, 2);
    }

    #[test]
    fn wraps_at_midnight_and_counts_uptime() {
        let mut clock = SystemClock::new();
        clock.sync_from_millis((SECS_PER_DAY - 30) * 1_000);
        for _ in 0..60 {
            clock.tick();
        }
        assert_eq!(clock.time(), 30);
        assert_eq!(clock.uptime_minutes(), 1);
        assert!(clock.needs_sync());
    }

    #[test]
    fn sync_clears_stale_flag() {
        let mut clock = SystemClock::new();
        assert!(clock.needs_sync());
        clock.sync_from_millis(1_500);
        assert!(!clock.needs_sync());
        assert_eq!(clock.time(), 1);
        clock.mark_stale();
        assert!(clock.needs_sync());
    }
}
