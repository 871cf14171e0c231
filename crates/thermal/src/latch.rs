//! Debounced, monotonic fault latches.
//!
//! Every fault in the UHC firmware follows the same shape: a condition must
//! hold for some number of consecutive samples before it "latches", and once
//! latched it stays latched until an explicit reset — never cleared by the
//! mere absence of the condition on a later sample. These types capture that
//! shape once so the scanner's open/short debounce and the supervisor's
//! over/under-temperature debounce don't each reinvent it.

/// Counts consecutive hits of a condition and reports when a threshold is
/// crossed. Any miss resets the count to zero immediately (debounce, not
/// hysteresis) — this only governs *when a latch fires*, not the latch's
/// own monotonicity once fired.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsecutiveCounter {
    count: u32,
}

impl ConsecutiveCounter {
    pub const fn new() -> Self {
        Self { count: 0 }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Records one sample. Returns the new running count.
    pub fn sample(&mut self, condition_held: bool) -> u32 {
        if condition_held {
            self.count = self.count.saturating_add(1);
        } else {
            self.count = 0;
        }
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// A one-shot report gate: fires `true` the first time a condition becomes
/// active, then suppresses further firings until `clear` is called.
#[derive(Debug, Clone, Copy, Default)]
pub struct OneShot {
    reported: bool,
}

impl OneShot {
    pub const fn new() -> Self {
        Self { reported: false }
    }

    /// Returns `true` exactly once per latch lifetime: the first call after
    /// construction or after `clear()` where `active` is `true`.
    pub fn fire(&mut self, active: bool) -> bool {
        if !active {
            return false;
        }
        if self.reported {
            false
        } else {
            self.reported = true;
            true
        }
    }

    pub fn clear(&mut self) {
        self.reported = false;
    }

    pub fn has_reported(&self) -> bool {
        self.reported
    }
}

/// Over/under-temperature latch for a single heater, tracking both
/// directions against a setpoint with independent debounce counters, as
/// described for Mode C of the heater supervisor: a sustained excursion of
/// more than `delta_limit` degrees for more than `time_limit_seconds`
/// latches the corresponding fault.
#[derive(Debug, Clone, Copy)]
pub struct HeaterTempLatch {
    delta_limit: i32,
    time_limit_seconds: u32,
    seconds_over: u32,
    seconds_under: u32,
    over_latched: bool,
    under_latched: bool,
    over_oneshot: OneShot,
    under_oneshot: OneShot,
}

/// Result of one `HeaterTempLatch::update` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatchUpdate {
    pub over_temp: bool,
    pub under_temp: bool,
    pub over_newly_latched: bool,
    pub under_newly_latched: bool,
}

impl HeaterTempLatch {
    pub const fn new(delta_limit: i32, time_limit_seconds: u32) -> Self {
        Self {
            delta_limit,
            time_limit_seconds,
            seconds_over: 0,
            seconds_under: 0,
            over_latched: false,
            under_latched: false,
            over_oneshot: OneShot::new(),
            under_oneshot: OneShot::new(),
        }
    }

    pub fn over_latched(&self) -> bool {
        self.over_latched
    }

    pub fn under_latched(&self) -> bool {
        self.under_latched
    }

    /// Advances the latch by one second given the current `current_temp`
    /// and `setpoint`. Debounce counters advance whenever the excursion
    /// holds and reset on any in-tolerance reading; latches, once set, are
    /// untouched by further calls until `reset_over`/`reset_under`.
    pub fn update(&mut self, current_temp: i32, setpoint: i32) -> LatchUpdate {
        let over_condition = current_temp > setpoint + self.delta_limit;
        let under_condition = current_temp < setpoint - self.delta_limit;

        if over_condition {
            self.seconds_over = self.seconds_over.saturating_add(1);
        } else {
            self.seconds_over = 0;
        }
        if under_condition {
            self.seconds_under = self.seconds_under.saturating_add(1);
        } else {
            self.seconds_under = 0;
        }

        let mut over_newly_latched = false;
        let mut under_newly_latched = false;

        if !self.over_latched && self.seconds_over > self.time_limit_seconds {
            self.over_latched = true;
            over_newly_latched = self.over_oneshot.fire(true);
        }
        if !self.under_latched && self.seconds_under > self.time_limit_seconds {
            self.under_latched = true;
            under_newly_latched = self.under_oneshot.fire(true);
        }

        LatchUpdate {
            over_temp: self.over_latched,
            under_temp: self.under_latched,
            over_newly_latched,
            under_newly_latched,
        }
    }

    /// Explicit operator reset, e.g. via `enableDisableHeater(true)`.
    pub fn reset(&mut self) {
        self.seconds_over = 0;
        self.seconds_under = 0;
        self.over_latched = false;
        self.under_latched = false;
        self.over_oneshot.clear();
        self.under_oneshot.clear();
    }
}

/// Single-direction absolute-temperature latch, used for the heatsink and
/// ambient over-temperature trips, which compare against a fixed ceiling
/// rather than a per-heater setpoint.
#[derive(Debug, Clone, Copy)]
pub struct AbsoluteTempLatch {
    max_temp: i32,
    time_limit_seconds: u32,
    seconds_over: u32,
    latched: bool,
    oneshot: OneShot,
}

impl AbsoluteTempLatch {
    pub const fn new(max_temp: i32, time_limit_seconds: u32) -> Self {
        Self {
            max_temp,
            time_limit_seconds,
            seconds_over: 0,
            latched: false,
            oneshot: OneShot::new(),
        }
    }

    pub fn latched(&self) -> bool {
        self.latched
    }

    /// Advances by one sample. Returns `true` exactly on the scan where the
    /// latch newly fires (for one-shot logging).
    pub fn update(&mut self, current_temp: i32) -> bool {
        if current_temp >= self.max_temp {
            self.seconds_over = self.seconds_over.saturating_add(1);
        } else {
            self.seconds_over = 0;
        }

        if !self.latched && self.seconds_over >= self.time_limit_seconds {
            self.latched = true;
            return self.oneshot.fire(true);
        }
        false
    }

    /// Explicit manual reset (e.g. operator re-enable).
    pub fn reset(&mut self) {
        self.seconds_over = 0;
        self.latched = false;
        self.oneshot.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_counter_debounces() {
        let mut c = ConsecutiveCounter::new();
        assert_eq!(c.sample(true), 1);
        assert_eq!(c.sample(true), 2);
        assert_eq!(c.sample(false), 0);
        assert_eq!(c.sample(true), 1);
    }

    #[test]
    fn oneshot_fires_once_then_suppresses() {
        let mut o = OneShot::new();
        assert!(o.fire(true));
        assert!(!o.fire(true));
        o.clear();
        assert!(o.fire(true));
    }

    #[test]
    fn heater_latch_requires_sustained_excursion() {
        let mut latch = HeaterTempLatch::new(11, 900);
        for _ in 0..900 {
            let u = latch.update(200, 170);
            assert!(!u.over_temp);
        }
        let u = latch.update(200, 170);
        assert!(u.over_temp);
        assert!(u.over_newly_latched);
    }

    #[test]
    fn heater_latch_is_monotonic_until_reset() {
        let mut latch = HeaterTempLatch::new(11, 0);
        let u = latch.update(200, 170);
        assert!(u.over_temp);
        // Temperature returns to normal; latch must stay set.
        let u = latch.update(170, 170);
        assert!(u.over_temp);
        latch.reset();
        let u = latch.update(170, 170);
        assert!(!u.over_temp);
    }

    #[test]
    fn absolute_latch_fires_once() {
        let mut latch = AbsoluteTempLatch::new(176, 10);
        for _ in 0..11 {
            latch.update(200);
        }
        assert!(latch.latched());
    }
}
