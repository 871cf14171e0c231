//! State Publisher (spec.md §4.5): assembles the once-per-second CSS and
//! RTD snapshots from shared state and fans them out on the bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bus::messages::{CssMessage, FanSnapshot, HeaterSnapshot, RtdChannelSnapshot, RtdMessage};
use crate::bus::publisher::Publisher;
use crate::constants::REPORT_ERROR_COUNT;
use crate::state::{unix_time_now, SystemState};

const PUBLISH_PERIOD: Duration = Duration::from_secs(1);
const PUBLISH_FLOOR: Duration = Duration::from_millis(10);

pub struct StatePublisher {
    state: Arc<SystemState>,
    css: Publisher,
    rtd: Publisher,
    shutdown: Arc<AtomicBool>,
}

impl StatePublisher {
    pub fn new(state: Arc<SystemState>, css: Publisher, rtd: Publisher, shutdown: Arc<AtomicBool>) -> Self {
        Self { state, css, rtd, shutdown }
    }

    pub fn run(self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.publish_once();
            let elapsed = started.elapsed();
            let sleep_for = PUBLISH_PERIOD.checked_sub(elapsed).unwrap_or(PUBLISH_FLOOR).max(PUBLISH_FLOOR);
            std::thread::sleep(sleep_for);
        }
    }

    /// Builds and publishes one CSS + RTD pair. Exposed for direct testing
    /// against a bound `Publisher` without waiting on the period.
    pub fn publish_once(&self) {
        let sequence = self.state.next_publish_sequence();
        let error_code = self.tick_error_code();
        let guard = self.state.read();

        let eco_setpoint_f = guard.heaters.first().map(|h| h.eco_setpoint_f).unwrap_or(crate::constants::DEFAULT_ECO_MODE_SETPOINT);

        let heaters: Vec<HeaterSnapshot> = guard
            .heaters
            .iter()
            .map(|h| HeaterSnapshot {
                index: h.index,
                location: h.location,
                slot: h.slot,
                enabled: h.enabled,
                physically_on: h.physically_on,
                setpoint_f: h.setpoint_f,
                current_temp_f: h.current_temp_f,
                is_open: guard.channels[h.index].is_open(),
                is_shorted: guard.channels[h.index].is_shorted(),
                over_temp: h.temp_latch.over_latched(),
                under_temp: h.temp_latch.under_latched(),
                start_time: h.start_time,
                end_time: h.end_time,
            })
            .collect();

        let fans: Vec<FanSnapshot> = guard
            .fans
            .iter()
            .map(|f| FanSnapshot { index: f.index, commanded_on: f.commanded_on, latched_fault: f.latched_fault })
            .collect();

        let css = CssMessage {
            sequence,
            timestamp: unix_time_now(),
            uptime_seconds: guard.system.uptime_seconds(),
            heatsink_temp_f: guard.system.heatsink_temp_f,
            ambient_temp_f: guard.system.ambient_temp_f,
            fans,
            line_voltage_rms: guard.system.line_voltage_rms,
            line_current_rms: guard.system.line_current_rms,
            system_status: guard.system.system_status,
            alarm_code: guard.system.alarm_code,
            eco_setpoint_f,
            seconds_since_gui1: guard.system.gui1.seconds_since_contact,
            seconds_since_gui2: guard.system.gui2.seconds_since_contact,
            error_code,
            hardware_revision: guard.system.hardware_revision,
            event_driven_logging: guard.system.event_driven_logging,
            log_period_seconds: guard.system.log_period_seconds,
            nso_mode: guard.system.nso_mode,
            demo_mode: guard.system.demo_mode,
            heaters,
        };

        let channels: Vec<RtdChannelSnapshot> = guard
            .channels
            .iter()
            .map(|c| RtdChannelSnapshot {
                index: c.index,
                raw_counts: c.raw_counts,
                temp_f: c.temp_f,
                is_open: c.is_open(),
                is_shorted: c.is_shorted(),
            })
            .collect();
        let rtd = RtdMessage { sequence, channels };

        drop(guard);
        self.css.publish(&css);
        self.rtd.publish(&rtd);
    }

    /// Returns the error code for this publication and advances its
    /// auto-clear window, dropping the code after `REPORT_ERROR_COUNT`
    /// publications.
    fn tick_error_code(&self) -> Option<&'static str> {
        let mut guard = self.state.write();
        let code = guard.system.last_error_code;
        if code.is_some() {
            guard.system.error_report_count += 1;
            if guard.system.error_report_count >= REPORT_ERROR_COUNT {
                guard.system.last_error_code = None;
                guard.system.error_report_count = 0;
            }
        }
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn publish_once_does_not_panic_with_no_subscribers() {
        let state = Arc::new(SystemState::new("SN".into(), "MODEL".into(), 150, 215, 1));
        let shutdown = Arc::new(AtomicBool::new(false));
        let css = Publisher::bind("CSS", "127.0.0.1:0", shutdown.clone()).unwrap();
        let rtd = Publisher::bind("RTD", "127.0.0.1:0", shutdown.clone()).unwrap();
        let publisher = StatePublisher::new(state, css, rtd, shutdown);
        publisher.publish_once();
    }
}
