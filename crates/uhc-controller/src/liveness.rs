//! Liveness & Power Monitor (spec.md §4.6): GUI heartbeat tracking, fan
//! tach/over-current debounce, and ethernet link polling. Runs on the same
//! once-per-second cadence as the state publisher tick it piggybacks on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::constants::*;
use crate::fault_log::{FaultEvent, FaultLogHandle};
use crate::gpio::{DigitalInput, DigitalOutput};
use crate::state::{AlarmCode, SystemState};

const TICK_PERIOD: Duration = Duration::from_secs(1);
const TICK_FLOOR: Duration = Duration::from_millis(10);

pub struct LivenessMonitor {
    state: Arc<SystemState>,
    fan_tach_inputs: Vec<Box<dyn DigitalInput>>,
    fan_overcurrent_inputs: Vec<Box<dyn DigitalInput>>,
    fan_outputs: Vec<Box<dyn DigitalOutput>>,
    ethernet_link: Box<dyn DigitalInput>,
    fault_log: FaultLogHandle,
    shutdown: Arc<AtomicBool>,
}

impl LivenessMonitor {
    pub fn new(
        state: Arc<SystemState>,
        fan_tach_inputs: Vec<Box<dyn DigitalInput>>,
        fan_overcurrent_inputs: Vec<Box<dyn DigitalInput>>,
        fan_outputs: Vec<Box<dyn DigitalOutput>>,
        ethernet_link: Box<dyn DigitalInput>,
        fault_log: FaultLogHandle,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        assert_eq!(fan_tach_inputs.len(), FAN_COUNT);
        assert_eq!(fan_overcurrent_inputs.len(), FAN_COUNT);
        assert_eq!(fan_outputs.len(), FAN_COUNT);
        Self {
            state,
            fan_tach_inputs,
            fan_overcurrent_inputs,
            fan_outputs,
            ethernet_link,
            fault_log,
            shutdown,
        }
    }

    pub fn run(mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.tick();
            let elapsed = started.elapsed();
            let sleep_for = TICK_PERIOD.checked_sub(elapsed).unwrap_or(TICK_FLOOR).max(TICK_FLOOR);
            std::thread::sleep(sleep_for);
        }
    }

    /// One liveness tick, exposed for direct scenario testing.
    pub fn tick(&mut self) {
        self.check_gui_liveness();
        self.check_fans();
        self.check_ethernet();
    }

    fn check_gui_liveness(&mut self) {
        let mut guard = self.state.write();
        guard.system.gui1.seconds_since_contact += 1;
        guard.system.gui2.seconds_since_contact += 1;

        let gui1_down = guard.system.gui1.seconds_since_contact > GUI_NO_COMMUNICATION_TIME_LIMIT_SECONDS;
        let gui2_down = guard.system.gui2.seconds_since_contact > GUI_NO_COMMUNICATION_TIME_LIMIT_SECONDS;

        if gui1_down && !guard.system.gui1.missing_reported {
            guard.system.gui1.missing_reported = true;
            guard.system.alarm_code = AlarmCode::GuiFailure;
            guard.system.last_error_code = Some(SINGLE_GUI_COMM_LOSS_ERROR);
            guard.system.error_report_count = 0;
            drop(guard);
            warn!(gui = "gui1", "display lost communication");
            self.fault_log.send(FaultEvent::error("GUI1 lost communication".into(), SINGLE_GUI_COMM_LOSS_ERROR));
            guard = self.state.write();
        }
        if gui2_down && !guard.system.gui2.missing_reported {
            guard.system.gui2.missing_reported = true;
            guard.system.alarm_code = AlarmCode::GuiFailure;
            guard.system.last_error_code = Some(SINGLE_GUI_COMM_LOSS_ERROR);
            guard.system.error_report_count = 0;
            drop(guard);
            warn!(gui = "gui2", "display lost communication");
            self.fault_log.send(FaultEvent::error("GUI2 lost communication".into(), SINGLE_GUI_COMM_LOSS_ERROR));
            guard = self.state.write();
        }

        if gui1_down && gui2_down {
            for heater in guard.heaters.iter_mut() {
                heater.disable();
            }
            guard.system.alarm_code = AlarmCode::BothGuisFailure;
            if !guard.system.both_guis_failure_reported {
                guard.system.both_guis_failure_reported = true;
                guard.system.last_error_code = Some(BOTH_GUIS_COMM_LOSS_ERROR_CODE);
                guard.system.error_report_count = 0;
                drop(guard);
                warn!("both displays unreachable, all heaters disabled");
                self.fault_log.send(FaultEvent::error("Both GUIs lost communication".into(), BOTH_GUIS_COMM_LOSS_ERROR_CODE));
            }
        } else {
            guard.system.both_guis_failure_reported = false;
        }
    }

    fn check_fans(&mut self) {
        for index in 0..FAN_COUNT {
            self.check_one_fan(index);
        }
    }

    fn check_one_fan(&mut self, index: usize) {
        let commanded_on = self.state.read().fans[index].commanded_on;

        let tach_ok = self.fan_tach_inputs[index].read().unwrap_or(true);
        if commanded_on && !tach_ok {
            let should_cycle = {
                let mut guard = self.state.write();
                let fan = &mut guard.fans[index];
                fan.consecutive_tach_zero += 1;
                fan.consecutive_tach_zero >= FAN_TACH_CONSECUTIVE_FAILURES
            };
            if should_cycle {
                info!(fan = index, "tach failure threshold reached, cycling fan");
                {
                    let mut guard = self.state.write();
                    guard.system.last_error_code = Some(FAN_FAILURE_ERROR_CODE);
                    guard.system.error_report_count = 0;
                }
                self.fault_log.send(FaultEvent::error(format!("Fan {index} tach failure"), FAN_FAILURE_ERROR_CODE));
                let _ = self.fan_outputs[index].set(false);
                let _ = self.fan_outputs[index].set(true);
                self.state.write().fans[index].consecutive_tach_zero = 0;
            }
        } else {
            self.state.write().fans[index].consecutive_tach_zero = 0;
        }

        let over_current = self.fan_overcurrent_inputs[index].read().unwrap_or(false);
        if over_current {
            let (should_cycle, exhausted) = {
                let mut guard = self.state.write();
                let fan = &mut guard.fans[index];
                fan.over_current_delay += 1;
                let should_cycle = fan.over_current_delay >= FAN_OVERCURRENT_DELAY_COUNT;
                let exhausted = should_cycle && fan.auto_correct_count >= FAN_OVERCURRENT_AUTO_CORRECT_LIMIT;
                (should_cycle, exhausted)
            };
            if should_cycle {
                let mut guard = self.state.write();
                let fan = &mut guard.fans[index];
                if exhausted {
                    fan.latched_fault = true;
                    fan.commanded_on = false;
                    guard.system.last_error_code = Some(FAN_FAILURE_ERROR_CODE);
                    guard.system.error_report_count = 0;
                    drop(guard);
                    warn!(fan = index, "over-current retries exhausted, latching fault");
                    self.fault_log.send(FaultEvent::error(format!("Fan {index} over-current latched"), FAN_FAILURE_ERROR_CODE));
                    let _ = self.fan_outputs[index].set(false);
                } else {
                    fan.auto_correct_count += 1;
                    fan.over_current_delay = 0;
                    guard.system.last_error_code = Some(FAN_FAILURE_ERROR_CODE);
                    guard.system.error_report_count = 0;
                    drop(guard);
                    info!(fan = index, "over-current retry, cycling fan");
                    self.fault_log.send(FaultEvent::error(format!("Fan {index} over-current retry"), FAN_FAILURE_ERROR_CODE));
                    let _ = self.fan_outputs[index].set(false);
                    let _ = self.fan_outputs[index].set(true);
                }
            }
        } else {
            let mut guard = self.state.write();
            guard.fans[index].over_current_delay = 0;
        }
    }

    fn check_ethernet(&mut self) {
        let link_up = self.ethernet_link.read().unwrap_or(true);
        let mut guard = self.state.write();
        let was_up = guard.system.ethernet_up;
        guard.system.ethernet_up = link_up;

        if !link_up {
            guard.system.ethernet_down_seconds += 1;
            let newly_down = guard.system.ethernet_down_seconds > ETHERNET_NO_COMMUNICATION_TIME_LIMIT_SECONDS && !guard.system.ethernet_down_reported;
            if newly_down {
                guard.system.ethernet_down_reported = true;
                for heater in guard.heaters.iter_mut() {
                    heater.disable();
                }
                guard.system.alarm_code = AlarmCode::EthernetDown;
                guard.system.last_error_code = Some(ETHERNET_DOWN_ERROR_CODE);
                guard.system.error_report_count = 0;
                drop(guard);
                warn!("ethernet link down past limit, all heaters disabled");
                self.fault_log.send(FaultEvent::error("Ethernet link down".into(), ETHERNET_DOWN_ERROR_CODE));
            }
        } else {
            guard.system.ethernet_down_seconds = 0;
            if !was_up && guard.system.ethernet_down_reported {
                guard.system.ethernet_down_reported = false;
                drop(guard);
                info!("ethernet link restored (heaters remain as commanded, no auto re-enable)");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault_log::spawn_fault_log_sink;
    use crate::gpio::mock::{MockInput, MockOutput};

    fn fixture(tach_ok: bool, ethernet_up: bool) -> (LivenessMonitor, Arc<SystemState>) {
        let state = Arc::new(SystemState::new("SN".into(), "MODEL".into(), 150, 215, 1));
        let (fault_log, _rx) = spawn_fault_log_sink();
        let shutdown = Arc::new(AtomicBool::new(false));
        let tach_inputs: Vec<Box<dyn DigitalInput>> = (0..FAN_COUNT).map(|_| Box::new(MockInput { value: tach_ok }) as Box<dyn DigitalInput>).collect();
        let oc_inputs: Vec<Box<dyn DigitalInput>> = (0..FAN_COUNT).map(|_| Box::new(MockInput { value: false }) as Box<dyn DigitalInput>).collect();
        let outputs: Vec<Box<dyn DigitalOutput>> = (0..FAN_COUNT).map(|_| Box::new(MockOutput::default()) as Box<dyn DigitalOutput>).collect();
        let ethernet: Box<dyn DigitalInput> = Box::new(MockInput { value: ethernet_up });
        let monitor = LivenessMonitor::new(state.clone(), tach_inputs, oc_inputs, outputs, ethernet, fault_log, shutdown);
        (monitor, state)
    }

    /// S5 -- dual-GUI liveness loss disables all heaters.
    #[test]
    fn both_guis_down_disables_all_heaters() {
        let (mut monitor, state) = fixture(true, true);
        {
            let mut guard = state.write();
            for heater in guard.heaters.iter_mut() {
                heater.enabled = true;
            }
        }
        for _ in 0..=GUI_NO_COMMUNICATION_TIME_LIMIT_SECONDS {
            monitor.tick();
        }
        let guard = state.read();
        assert!(guard.heaters.iter().all(|h| !h.enabled));
        assert_eq!(guard.system.alarm_code, AlarmCode::BothGuisFailure);
    }

    #[test]
    fn gui_contact_resets_liveness_counter() {
        let (mut monitor, state) = fixture(true, true);
        for _ in 0..10 {
            monitor.tick();
        }
        state.write().system.gui1.seconds_since_contact = 0;
        assert_eq!(state.read().system.gui1.seconds_since_contact, 0);
    }

    #[test]
    fn fan_tach_failure_cycles_after_consecutive_threshold() {
        let (mut monitor, state) = fixture(false, true);
        state.write().fans[0].commanded_on = true;
        for _ in 0..FAN_TACH_CONSECUTIVE_FAILURES {
            monitor.tick();
        }
        assert_eq!(state.read().fans[0].consecutive_tach_zero, 0);
    }

    #[test]
    fn ethernet_down_past_limit_disables_heaters_without_auto_recovery() {
        let (mut monitor, state) = fixture(true, false);
        {
            let mut guard = state.write();
            for heater in guard.heaters.iter_mut() {
                heater.enabled = true;
            }
        }
        for _ in 0..=ETHERNET_NO_COMMUNICATION_TIME_LIMIT_SECONDS {
            monitor.tick();
        }
        assert!(state.read().heaters.iter().all(|h| !h.enabled));
        assert_eq!(state.read().system.alarm_code, AlarmCode::EthernetDown);

        // Enabling a heater after the trip does not get auto-restored by
        // link recovery; only an explicit HEATER_ON command would.
        state.write().heaters[0].enabled = true;
        monitor.tick();
        assert!(state.read().heaters[0].enabled);
    }
}
