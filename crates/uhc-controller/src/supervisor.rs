//! Heater Supervisor (spec.md §4.2): the once-per-second selection policy,
//! plus the Mode C over/under-temperature latch that runs right after it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::constants::*;
use crate::fault_log::{FaultEvent, FaultLogHandle};
use crate::gpio::DigitalOutput;
use crate::state::{AlarmCode, Location, SystemState, SystemStatus};

const TICK_PERIOD: Duration = Duration::from_secs(1);
const TICK_FLOOR: Duration = Duration::from_millis(10);
const HOURLY_STATS_TICKS: u64 = 3600;

pub struct Supervisor {
    state: Arc<SystemState>,
    heater_outputs: Vec<Box<dyn DigitalOutput>>,
    fault_log: FaultLogHandle,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(state: Arc<SystemState>, heater_outputs: Vec<Box<dyn DigitalOutput>>, fault_log: FaultLogHandle, shutdown: Arc<AtomicBool>) -> Self {
        assert_eq!(heater_outputs.len(), HEATER_COUNT);
        Self {
            state,
            heater_outputs,
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

    /// One supervisor tick, exposed for direct scenario testing.
    pub fn tick(&mut self) {
        let (max_concurrent, _ranking_skip) = {
            let guard = self.state.read();
            power_budget(guard.system.line_voltage_rms)
        };

        let in_mode_a = {
            let guard = self.state.read();
            !guard.system.startup_complete
        };

        if in_mode_a {
            self.mode_a_tick(max_concurrent);
        } else {
            self.mode_b_tick(max_concurrent);
            self.mode_c_tick();
        }

        self.apply_heater_outputs();
        self.hourly_stats_if_due();

        let mut guard = self.state.write();
        guard.system.supervisor_tick += 1;
    }

    /// Mode A: initial startup. Breaks the budget and re-walks the fixed
    /// preference list every tick until the operator's Startup command has
    /// landed and either every enabled heater is at temperature or the
    /// startup budget has elapsed.
    fn mode_a_tick(&mut self, max_concurrent: usize) {
        let mut guard = self.state.write();

        for heater in guard.heaters.iter_mut() {
            heater.physically_on = false;
        }

        let mut turned_on = 0usize;
        for &idx in startup_preference_order().iter() {
            if turned_on >= max_concurrent {
                break;
            }
            let heater = &mut guard.heaters[idx];
            if heater.enabled && heater.current_temp_f < heater.setpoint_f {
                heater.physically_on = true;
                turned_on += 1;
            }
        }

        if !guard.system.startup_message_received {
            return;
        }

        guard.system.startup_time_seconds += 1;
        let all_at_temperature = guard.heaters.iter().filter(|h| h.enabled).all(|h| h.at_temperature());
        let budget_elapsed = guard.system.startup_time_seconds > MAX_STARTUP_REACH_SETPOINT_TIME_SECONDS;

        if all_at_temperature {
            guard.system.startup_complete = true;
            guard.system.in_initial_startup = false;
            guard.system.system_status = SystemStatus::StartupComplete;
            let elapsed = guard.system.startup_time_seconds;
            drop(guard);
            info!(elapsed, "STARTUP_COMPLETE_T");
            self.fault_log.send(FaultEvent::internal(format!("STARTUP_COMPLETE_T elapsed={elapsed}s")));
        } else if budget_elapsed {
            guard.system.startup_complete = true;
            guard.system.in_initial_startup = false;
            drop(guard);
            info!("STARTUP_TIME_EXCEEDED");
            self.fault_log.send(FaultEvent::internal("STARTUP_TIME_EXCEEDED".into()));
        }
    }

    /// Mode B: steady-state selection by largest positive delta, budget
    /// enforced monotonically (offs applied before ons).
    fn mode_b_tick(&mut self, max_concurrent: usize) {
        let mut guard = self.state.write();

        let mut deltas: Vec<(usize, i64)> = guard
            .heaters
            .iter()
            .map(|h| {
                let delta = if h.enabled { h.delta_temp() as i64 } else { i64::MIN / 2 };
                (h.index, delta)
            })
            .collect();
        // Largest delta (furthest below setpoint) wins the budget first;
        // ties broken by ascending heater index, per the original's
        // left-to-right scan.
        deltas.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut selected = vec![false; HEATER_COUNT];
        let mut picked = 0usize;
        for &(idx, delta) in deltas.iter() {
            if picked >= max_concurrent || delta <= 0 {
                break;
            }
            selected[idx] = true;
            picked += 1;
        }

        for heater in guard.heaters.iter_mut() {
            if heater.physically_on && !selected[heater.index] {
                heater.physically_on = false;
            }
        }
        for heater in guard.heaters.iter_mut() {
            if selected[heater.index] && !heater.physically_on {
                heater.physically_on = true;
            }
        }

        for heater in guard.heaters.iter_mut() {
            heater.was_on_previous_tick = heater.physically_on;
        }
    }

    /// Mode C: per-heater over/under-temperature latching, one slot at a
    /// time, only once startup has completed and no setpoint change is
    /// still settling.
    fn mode_c_tick(&mut self) {
        let mut guard = self.state.write();
        if !guard.system.startup_complete {
            return;
        }

        let mut slots_to_disable = Vec::new();
        for heater in guard.heaters.iter_mut() {
            if heater.setpoint_just_changed {
                if (heater.current_temp_f - heater.setpoint_f).unsigned_abs() as i32 <= SETPOINT_SETTLED_SLACK_DEGREES {
                    heater.setpoint_just_changed = false;
                }
                continue;
            }
            if !heater.enabled {
                continue;
            }
            let update = heater.temp_latch.update(heater.current_temp_f, heater.setpoint_f);
            if update.over_newly_latched || update.under_newly_latched {
                slots_to_disable.push((heater.slot, update.over_newly_latched));
            }
        }

        for (slot, is_over) in slots_to_disable {
            let upper = upper_heater_index(slot);
            let lower = lower_heater_index(slot);
            guard.heaters[upper].disable();
            guard.heaters[lower].disable();
            guard.system.alarm_code = if is_over { AlarmCode::SlotOverTemp } else { AlarmCode::SlotUnderTemp };
            let code = if is_over { SHELF_OVER_TEMP_ERROR_CODE } else { SHELF_UNDER_TEMP_ERROR_CODE };
            guard.system.last_error_code = Some(code);
            guard.system.error_report_count = 0;
            drop(guard);
            let kind = if is_over { "over" } else { "under" };
            self.fault_log.send(FaultEvent::error(format!("Slot {slot} {kind} temperature"), code));
            guard = self.state.write();
        }
    }

    fn apply_heater_outputs(&mut self) {
        let states: Vec<bool> = self.state.read().heaters.iter().map(|h| h.physically_on).collect();
        for (idx, on) in states.into_iter().enumerate() {
            if let Err(e) = self.heater_outputs[idx].set(on) {
                tracing::warn!(heater = idx, error = %e, "failed to write heater GPIO");
            }
        }
    }

    fn hourly_stats_if_due(&mut self) {
        let mut guard = self.state.write();
        let tick = guard.system.supervisor_tick;
        if tick > 0 && tick % HOURLY_STATS_TICKS == 0 {
            let voltage = guard.system.line_voltage_rms;
            for heater in guard.heaters.iter_mut() {
                info!(
                    heater = heater.index,
                    voltage,
                    temp_f = heater.current_temp_f,
                    seconds_on = heater.seconds_on_this_hour,
                    enabled = heater.enabled,
                    over_temp = heater.temp_latch.over_latched(),
                    under_temp = heater.temp_latch.under_latched(),
                    "hourly heater stats"
                );
                heater.seconds_on_this_hour = 0;
            }
        }
        for heater in guard.heaters.iter_mut() {
            if heater.physically_on {
                heater.seconds_on_this_hour += 1;
            }
        }
    }
}

impl Location {
    pub fn is_upper(&self) -> bool {
        matches!(self, Location::Upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault_log::spawn_fault_log_sink;
    use crate::gpio::mock::MockOutput;

    fn fixture() -> (Supervisor, Arc<SystemState>) {
        let state = Arc::new(SystemState::new("SN".into(), "MODEL".into(), 150, 215, 1));
        let (fault_log, _rx) = spawn_fault_log_sink();
        let shutdown = Arc::new(AtomicBool::new(false));
        let outputs: Vec<Box<dyn DigitalOutput>> = (0..HEATER_COUNT).map(|_| Box::new(MockOutput::default()) as Box<dyn DigitalOutput>).collect();
        let supervisor = Supervisor::new(state.clone(), outputs, fault_log, shutdown);
        (supervisor, state)
    }

    /// S1 -- power cap at low line voltage.
    #[test]
    fn power_cap_scales_with_line_voltage() {
        let (mut sup, state) = fixture();
        {
            let mut guard = state.write();
            guard.system.startup_complete = true;
            guard.system.line_voltage_rms = Some(200.0);
            for heater in guard.heaters.iter_mut() {
                heater.enabled = true;
                heater.current_temp_f = 70;
                heater.setpoint_f = 170;
            }
        }
        sup.tick();
        assert_eq!(state.read().heaters.iter().filter(|h| h.physically_on).count(), 10);

        state.write().system.line_voltage_rms = Some(215.0);
        sup.tick();
        assert_eq!(state.read().heaters.iter().filter(|h| h.physically_on).count(), 9);

        state.write().system.line_voltage_rms = Some(230.0);
        sup.tick();
        assert_eq!(state.read().heaters.iter().filter(|h| h.physically_on).count(), 8);
    }

    /// S4 -- startup completes on threshold, not setpoint.
    #[test]
    fn startup_completes_when_all_heaters_at_temperature() {
        let (mut sup, state) = fixture();
        {
            let mut guard = state.write();
            guard.system.startup_message_received = true;
            for heater in guard.heaters.iter_mut() {
                heater.enabled = true;
                heater.setpoint_f = 170;
                heater.current_temp_f = if heater.location == Location::Upper { 160 } else { 170 };
            }
        }
        sup.tick();
        let guard = state.read();
        assert!(guard.system.startup_complete);
        assert!(!guard.system.in_initial_startup);
        assert_eq!(guard.system.system_status, SystemStatus::StartupComplete);
    }

    #[test]
    fn mode_b_turns_off_before_turning_on() {
        let (mut sup, state) = fixture();
        {
            let mut guard = state.write();
            guard.system.startup_complete = true;
            guard.system.line_voltage_rms = Some(208.0);
            for heater in guard.heaters.iter_mut() {
                heater.enabled = true;
                heater.setpoint_f = 170;
                heater.current_temp_f = 170;
            }
            // Heater 0 needs no heat and was on; heater 1 needs heat.
            guard.heaters[0].physically_on = true;
            guard.heaters[0].current_temp_f = 170;
            guard.heaters[1].current_temp_f = 100;
        }
        sup.tick();
        let guard = state.read();
        assert!(!guard.heaters[0].physically_on);
        assert!(guard.heaters[1].physically_on);
    }
}
