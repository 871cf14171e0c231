//! Command & State Reconciler (spec.md §4.4): applies commands from either
//! display unit to the shared state and returns a result code.
//!
//! The dispatch shape (one match arm per command, each a small handler
//! method) follows the teacher's `GCodeDispatcher::dispatch`.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::bus::messages::{Command, CommandEnvelope, FanSelector, GuiId, ResultCode};
use crate::constants::*;
use crate::fault_log::{FaultEvent, FaultLogHandle};
use crate::state::{clamp_setpoint, unix_time_now, Fan, SystemState, SystemStatus};

/// Clears a GUI's missing-communication counter on any message received
/// from it -- command, heartbeat, or time sync all count as contact.
pub fn touch_gui_liveness(state: &SystemState, gui: GuiId) {
    let mut guard = state.write();
    let liveness = match gui {
        GuiId::Gui1 => &mut guard.system.gui1,
        GuiId::Gui2 => &mut guard.system.gui2,
    };
    liveness.seconds_since_contact = 0;
    liveness.missing_reported = false;
}

pub struct Reconciler {
    state: Arc<SystemState>,
    fault_log: FaultLogHandle,
    soft_shutdown_path: PathBuf,
}

impl Reconciler {
    pub fn new(state: Arc<SystemState>, fault_log: FaultLogHandle, config_dir: PathBuf) -> Self {
        let soft_shutdown_path = config_dir.join("softShutdown");
        Self { state, fault_log, soft_shutdown_path }
    }

    /// Applies one command, updating the originating GUI's liveness
    /// counters and emitting a command event to the fault log, then
    /// returns the result code to publish on the response topic.
    pub fn handle(&self, envelope: &CommandEnvelope) -> ResultCode {
        touch_gui_liveness(&self.state, envelope.gui);
        self.state.write().system.last_command_received = Some(unix_time_now());

        let in_cleaning_mode = self.state.read().system.in_cleaning_mode;
        let result = if in_cleaning_mode && Self::rejected_in_cleaning_mode(&envelope.command) {
            ResultCode::Failure
        } else {
            self.dispatch(&envelope.command)
        };

        self.fault_log.send(FaultEvent::command(format!("{:?} -> {:?}", envelope.command, result)));
        result
    }

    fn rejected_in_cleaning_mode(command: &Command) -> bool {
        matches!(
            command,
            Command::Startup
                | Command::HeaterOn { .. }
                | Command::UpdateSlotTempSetpoint { .. }
                | Command::SetHeaterTempSetpoint { .. }
                | Command::SetEcoModeTemp { .. }
                | Command::EcoModeOn { .. }
        )
    }

    fn dispatch(&self, command: &Command) -> ResultCode {
        match command {
            Command::EstablishLink => ResultCode::LinkEstablished,
            Command::Startup => self.handle_startup(),
            Command::ShutdownRequested => self.handle_shutdown_requested(),
            Command::EmergencyStop => self.handle_emergency_stop(),
            Command::Idle => self.handle_idle(),
            Command::HeaterOn { heater } => self.handle_heater_on(*heater),
            Command::HeaterOff { heater } => self.handle_heater_off(*heater),
            Command::UpdateSlotTempSetpoint { slot, temp_f } => self.handle_update_slot_setpoint(*slot, *temp_f),
            Command::SetHeaterTempSetpoint { slot, upper_f, lower_f } => self.handle_set_heater_setpoint(*slot, *upper_f, *lower_f),
            Command::SetEcoModeTemp { temp_f } => self.handle_set_eco_mode_temp(*temp_f),
            Command::EcoModeOn { slot } => self.handle_eco_mode_on(*slot),
            Command::EcoModeOff { slot } => self.handle_eco_mode_off(*slot),
            Command::FanOn { fan } => self.handle_fan(*fan, true),
            Command::FanOff { fan } => self.handle_fan(*fan, false),
            Command::CleaningModeOn => self.handle_cleaning_mode_on(),
            Command::CleaningModeOff => self.handle_cleaning_mode_off(),
            Command::NsoModeOn => {
                self.state.write().system.nso_mode = true;
                ResultCode::Ok
            }
            Command::DemoModeOn => {
                self.state.write().system.demo_mode = true;
                ResultCode::Ok
            }
            Command::DemoModeOff => {
                self.state.write().system.demo_mode = false;
                ResultCode::Ok
            }
            Command::ConfigureLogging { event_driven, period_seconds } => {
                let mut guard = self.state.write();
                guard.system.event_driven_logging = *event_driven;
                guard.system.log_period_seconds = if *period_seconds == 0 { 1 } else { *period_seconds };
                ResultCode::Ok
            }
        }
    }

    fn handle_startup(&self) -> ResultCode {
        let mut guard = self.state.write();
        guard.system.startup_message_received = true;
        guard.system.system_status = SystemStatus::Startup;
        for heater in guard.heaters.iter_mut() {
            heater.enabled = true;
        }
        ResultCode::Ok
    }

    fn handle_shutdown_requested(&self) -> ResultCode {
        let mut guard = self.state.write();
        for heater in guard.heaters.iter_mut() {
            heater.disable();
        }
        guard.system.shutdown_requested = true;
        drop(guard);
        info!(path = %self.soft_shutdown_path.display(), "SHUTDOWN_REQUESTED: touching shutdown sentinel");
        let _ = std::fs::write(&self.soft_shutdown_path, b"1");
        ResultCode::Ok
    }

    fn handle_emergency_stop(&self) -> ResultCode {
        let mut guard = self.state.write();
        for heater in guard.heaters.iter_mut() {
            heater.disable();
        }
        ResultCode::Ok
    }

    fn handle_idle(&self) -> ResultCode {
        self.state.write().system.system_status = SystemStatus::Normal;
        ResultCode::Ok
    }

    fn handle_heater_on(&self, heater_idx: usize) -> ResultCode {
        let mut guard = self.state.write();
        let Some(heater) = guard.heaters.get_mut(heater_idx) else {
            return ResultCode::BadParameter;
        };
        heater.enabled = true;
        heater.start_time = Some(unix_time_now());
        heater.end_time = None;
        ResultCode::Ok
    }

    fn handle_heater_off(&self, heater_idx: usize) -> ResultCode {
        let mut guard = self.state.write();
        let Some(heater) = guard.heaters.get_mut(heater_idx) else {
            return ResultCode::BadParameter;
        };
        heater.disable();
        heater.end_time = Some(unix_time_now());
        heater.start_time = None;
        ResultCode::Ok
    }

    fn handle_update_slot_setpoint(&self, slot: usize, temp_f: i32) -> ResultCode {
        let mut guard = self.state.write();
        let (low, high) = (guard.system.setpoint_low_limit, guard.system.setpoint_high_limit);
        let Some(clamped) = clamp_setpoint(temp_f, low, high) else {
            return ResultCode::BadParameter;
        };
        if slot < 1 || slot > SLOT_COUNT {
            return ResultCode::BadParameter;
        }
        guard.heaters[upper_heater_index(slot)].setpoint_f = clamped;
        guard.heaters[lower_heater_index(slot)].setpoint_f = clamped;
        guard.heaters[upper_heater_index(slot)].setpoint_just_changed = true;
        guard.heaters[lower_heater_index(slot)].setpoint_just_changed = true;
        ResultCode::Ok
    }

    fn handle_set_heater_setpoint(&self, slot: usize, upper_f: i32, lower_f: i32) -> ResultCode {
        let mut guard = self.state.write();
        let (low, high) = (guard.system.setpoint_low_limit, guard.system.setpoint_high_limit);
        let (Some(upper_clamped), Some(lower_clamped)) = (clamp_setpoint(upper_f, low, high), clamp_setpoint(lower_f, low, high)) else {
            return ResultCode::BadParameter;
        };
        if slot < 1 || slot > SLOT_COUNT {
            return ResultCode::BadParameter;
        }
        let upper = upper_heater_index(slot);
        let lower = lower_heater_index(slot);
        guard.heaters[upper].setpoint_f = upper_clamped;
        guard.heaters[upper].setpoint_just_changed = true;
        guard.heaters[lower].setpoint_f = lower_clamped;
        guard.heaters[lower].setpoint_just_changed = true;
        ResultCode::Ok
    }

    fn handle_set_eco_mode_temp(&self, temp_f: i32) -> ResultCode {
        let mut guard = self.state.write();
        for heater in guard.heaters.iter_mut() {
            let clamp_high = heater.setpoint_f;
            heater.eco_setpoint_f = if temp_f >= FIRST_TEMPERATURE_ENTRY as i32 && temp_f <= clamp_high {
                temp_f
            } else {
                DEFAULT_ECO_MODE_SETPOINT
            };
        }
        ResultCode::Ok
    }

    fn handle_eco_mode_on(&self, slot: usize) -> ResultCode {
        if slot < 1 || slot > SLOT_COUNT {
            return ResultCode::BadParameter;
        }
        let mut guard = self.state.write();
        for idx in [upper_heater_index(slot), lower_heater_index(slot)] {
            let heater = &mut guard.heaters[idx];
            if heater.eco_active {
                continue;
            }
            heater.saved_setpoint_f = heater.setpoint_f;
            heater.setpoint_f = heater.eco_setpoint_f;
            heater.eco_active = true;
            heater.setpoint_just_changed = true;
        }
        ResultCode::Ok
    }

    fn handle_eco_mode_off(&self, slot: usize) -> ResultCode {
        if slot < 1 || slot > SLOT_COUNT {
            return ResultCode::BadParameter;
        }
        let mut guard = self.state.write();
        for idx in [upper_heater_index(slot), lower_heater_index(slot)] {
            let heater = &mut guard.heaters[idx];
            if !heater.eco_active {
                continue;
            }
            heater.setpoint_f = heater.saved_setpoint_f;
            heater.eco_active = false;
            heater.setpoint_just_changed = true;
        }
        ResultCode::Ok
    }

    fn handle_fan(&self, selector: FanSelector, on: bool) -> ResultCode {
        let mut guard = self.state.write();
        for fan in Self::selected_fans(&mut guard.fans, selector) {
            fan.commanded_on = on;
            fan.consecutive_tach_zero = 0;
            fan.over_current_delay = 0;
            fan.auto_correct_count = 0;
        }
        ResultCode::Ok
    }

    fn selected_fans(fans: &mut [Fan], selector: FanSelector) -> Vec<&mut Fan> {
        fans.iter_mut()
            .filter(|f| matches!((selector, f.index), (FanSelector::Fan1, 0) | (FanSelector::Fan2, 1) | (FanSelector::Both, _)))
            .collect()
    }

    fn handle_cleaning_mode_on(&self) -> ResultCode {
        let mut guard = self.state.write();
        for heater in guard.heaters.iter_mut() {
            heater.saved_setpoint_f = heater.setpoint_f;
            heater.setpoint_f = heater.cleaning_setpoint_f.min(MAX_CLEANING_MODE_SETPOINT);
            heater.setpoint_just_changed = true;
        }
        guard.system.in_cleaning_mode = true;
        ResultCode::Ok
    }

    fn handle_cleaning_mode_off(&self) -> ResultCode {
        let mut guard = self.state.write();
        for heater in guard.heaters.iter_mut() {
            heater.setpoint_f = heater.saved_setpoint_f;
            heater.setpoint_just_changed = true;
        }
        guard.system.in_cleaning_mode = false;
        ResultCode::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::messages::Command;
    use crate::fault_log::spawn_fault_log_sink;

    fn fixture() -> (Reconciler, Arc<SystemState>) {
        let state = Arc::new(SystemState::new("SN".into(), "MODEL".into(), 150, 215, 1));
        let (fault_log, _rx) = spawn_fault_log_sink();
        (Reconciler::new(state.clone(), fault_log, std::env::temp_dir()), state)
    }

    fn envelope(command: Command) -> CommandEnvelope {
        CommandEnvelope { gui: GuiId::Gui1, sequence: 1, command }
    }

    /// S3 -- cleaning mode blocks setpoint change.
    #[test]
    fn cleaning_mode_rejects_slot_setpoint_change() {
        let (r, state) = fixture();
        for h in state.write().heaters.iter_mut() {
            h.setpoint_f = DEFAULT_SETPOINT;
        }
        assert_eq!(r.handle(&envelope(Command::CleaningModeOn)), ResultCode::Ok);
        let result = r.handle(&envelope(Command::UpdateSlotTempSetpoint { slot: 3, temp_f: 180 }));
        assert_eq!(result, ResultCode::Failure);

        let guard = state.read();
        assert_eq!(guard.heaters[4].setpoint_f, DEFAULT_CLEANING_MODE_SETPOINT);
        assert_eq!(guard.heaters[5].setpoint_f, DEFAULT_CLEANING_MODE_SETPOINT);
        assert_eq!(guard.heaters[4].saved_setpoint_f, DEFAULT_SETPOINT);
    }

    /// Repeated CLEANING_MODE_ON while already in cleaning mode is not a
    /// rejection -- the authoritative command table lists no rejection for it.
    #[test]
    fn repeated_cleaning_mode_on_is_not_rejected() {
        let (r, _state) = fixture();
        assert_eq!(r.handle(&envelope(Command::CleaningModeOn)), ResultCode::Ok);
        assert_eq!(r.handle(&envelope(Command::CleaningModeOn)), ResultCode::Ok);
    }

    /// S6 -- setpoint clamp rejection.
    #[test]
    fn setpoint_clamp_rejects_out_of_range() {
        let (r, state) = fixture();
        let rejected = r.handle(&envelope(Command::UpdateSlotTempSetpoint { slot: 1, temp_f: 220 }));
        assert_eq!(rejected, ResultCode::BadParameter);
        assert_eq!(state.read().heaters[0].setpoint_f, DEFAULT_SETPOINT);

        let accepted = r.handle(&envelope(Command::UpdateSlotTempSetpoint { slot: 1, temp_f: 200 }));
        assert_eq!(accepted, ResultCode::Ok);
        assert_eq!(state.read().heaters[0].setpoint_f, 200);
    }

    #[test]
    fn heater_off_is_idempotent() {
        let (r, state) = fixture();
        assert_eq!(state.read().heaters[0].enabled, false);
        let first = r.handle(&envelope(Command::HeaterOff { heater: 0 }));
        let second = r.handle(&envelope(Command::HeaterOff { heater: 0 }));
        assert_eq!(first, ResultCode::Ok);
        assert_eq!(second, ResultCode::Ok);
    }

    #[test]
    fn eco_mode_on_is_idempotent_and_preserves_saved_setpoint() {
        let (r, state) = fixture();
        state.write().heaters[0].setpoint_f = 180;
        assert_eq!(r.handle(&envelope(Command::EcoModeOn { slot: 1 })), ResultCode::Ok);
        let saved_after_first = state.read().heaters[0].saved_setpoint_f;
        assert_eq!(r.handle(&envelope(Command::EcoModeOn { slot: 1 })), ResultCode::Ok);
        assert_eq!(state.read().heaters[0].saved_setpoint_f, saved_after_first);
    }
}
