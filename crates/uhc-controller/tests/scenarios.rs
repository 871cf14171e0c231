//! Cross-module scenario tests (spec.md §8): these drive two or more
//! subsystems together against mock hardware -- the scanner feeding the
//! supervisor, the reconciler feeding the supervisor, the liveness monitor
//! feeding the scanner's own state -- rather than exercising one component
//! in isolation the way each module's own `#[cfg(test)]` block does.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use uhc_controller::bus::messages::{Command, CommandEnvelope, FirmwareUpdateMessage, FirmwareUpdateResult, GuiId, ResultCode};
use uhc_controller::constants::*;
use uhc_controller::fault_log::spawn_fault_log_sink;
use uhc_controller::gpio::mock::{MockInput, MockMuxAdcBus, MockOutput, MockPowerMeter};
use uhc_controller::gpio::{DigitalInput, DigitalOutput};
use uhc_controller::liveness::LivenessMonitor;
use uhc_controller::reconciler::Reconciler;
use uhc_controller::scanner::Scanner;
use uhc_controller::state::{AlarmCode, SystemState};
use uhc_controller::supervisor::Supervisor;

fn fresh_state() -> Arc<SystemState> {
    Arc::new(SystemState::new("SN-TEST".into(), "UHC6".into(), 150, 215, 1))
}

fn heater_outputs() -> Vec<Box<dyn DigitalOutput>> {
    (0..HEATER_COUNT).map(|_| Box::new(MockOutput::default()) as Box<dyn DigitalOutput>).collect()
}

/// S1 -- power cap at low line voltage, driven through a full scanner scan
/// (which populates `line_voltage_rms`) and then a supervisor tick, rather
/// than setting the voltage field directly.
#[test]
fn s1_power_cap_follows_scanned_line_voltage() {
    let state = fresh_state();
    let shutdown = Arc::new(AtomicBool::new(false));
    let (fault_log, _rx) = spawn_fault_log_sink();

    let mut scanner = Scanner::new(state.clone(), Box::new(MockMuxAdcBus::default()), Box::new(MockPowerMeter { voltage: 200.0, current: 10.0 }), fault_log.clone(), shutdown.clone());
    let mut supervisor = Supervisor::new(state.clone(), heater_outputs(), fault_log, shutdown);

    {
        let mut guard = state.write();
        guard.system.startup_complete = true;
        for heater in guard.heaters.iter_mut() {
            heater.enabled = true;
            heater.current_temp_f = 70;
            heater.setpoint_f = 170;
        }
    }

    scanner.scan_pass();
    supervisor.tick();
    assert_eq!(state.read().heaters.iter().filter(|h| h.physically_on).count(), 10);
}

/// S2 -- a heatsink sensor reading injected through the scanner's own mux
/// classification path (not a direct field write) latches over-temp and
/// disables every heater; a subsequent supervisor tick confirms none come
/// back on.
#[test]
fn s2_heatsink_trip_shuts_everything_down_end_to_end() {
    let state = fresh_state();
    let shutdown = Arc::new(AtomicBool::new(false));
    let (fault_log, rx) = spawn_fault_log_sink();

    {
        let mut guard = state.write();
        for heater in guard.heaters.iter_mut() {
            heater.enabled = true;
            heater.current_temp_f = 170;
            heater.setpoint_f = 170;
        }
        guard.system.startup_complete = true;
    }

    let mid_counts = state.read().channels[0].calibration.rows().iter().find(|r| r.deg_f == 70).unwrap().counts;
    let hot_counts = state.read().channels[0].calibration.rows().iter().find(|r| r.deg_f == 200).unwrap().counts;
    let passes = HEATSINK_OVERTEMP_TIME_LIMIT_SECONDS as usize + 1;

    // scan_pass() walks every channel in order; bus 0 serves six heaters
    // (indices 0,2,4,6,8,10) then the heatsink, bus 1 serves the other six
    // heaters then ambient. Queue a harmless mid-range reading for every
    // channel but the heatsink so only it trips.
    let mut mux = MockMuxAdcBus::default();
    for _ in 0..passes {
        for _ in 0..6 {
            mux.queued_counts[0].push_back(mid_counts);
        }
        mux.queued_counts[0].push_back(hot_counts);
        for _ in 0..7 {
            mux.queued_counts[1].push_back(mid_counts);
        }
    }

    let mut scanner = Scanner::new(state.clone(), Box::new(mux), Box::new(MockPowerMeter { voltage: 208.0, current: 10.0 }), fault_log.clone(), shutdown.clone());
    for _ in 0..passes {
        scanner.scan_pass();
    }

    let guard = state.read();
    assert_eq!(guard.system.alarm_code, AlarmCode::HeatsinkOverTemp);
    assert!(guard.heaters.iter().all(|h| !h.enabled && !h.physically_on));
    drop(guard);

    let mut supervisor = Supervisor::new(state.clone(), heater_outputs(), fault_log, shutdown);
    supervisor.tick();
    assert!(state.read().heaters.iter().all(|h| !h.physically_on));

    assert!(rx.try_iter().any(|e| matches!(e, uhc_controller::fault_log::FaultEvent::Error { code, .. } if code == HEATSINK_OVER_TEMP_ERROR_CODE)));
    assert_eq!(state.read().system.last_error_code, Some(HEATSINK_OVER_TEMP_ERROR_CODE));
}

/// S3 -- cleaning mode, driven through the reconciler's full command path
/// (not calling the rejection helper directly).
#[test]
fn s3_cleaning_mode_blocks_setpoint_change_end_to_end() {
    let state = fresh_state();
    let (fault_log, rx) = spawn_fault_log_sink();
    let reconciler = Reconciler::new(state.clone(), fault_log, std::env::temp_dir());

    for h in state.write().heaters.iter_mut() {
        h.setpoint_f = DEFAULT_SETPOINT;
    }

    let on = reconciler.handle(&CommandEnvelope { gui: GuiId::Gui1, sequence: 1, command: Command::CleaningModeOn });
    assert_eq!(on, ResultCode::Ok);

    let rejected = reconciler.handle(&CommandEnvelope {
        gui: GuiId::Gui1,
        sequence: 2,
        command: Command::UpdateSlotTempSetpoint { slot: 3, temp_f: 180 },
    });
    assert_eq!(rejected, ResultCode::Failure);

    let guard = state.read();
    assert_eq!(guard.heaters[4].setpoint_f, DEFAULT_CLEANING_MODE_SETPOINT);
    assert_eq!(guard.heaters[5].setpoint_f, DEFAULT_CLEANING_MODE_SETPOINT);
    assert_eq!(guard.heaters[4].saved_setpoint_f, DEFAULT_SETPOINT);
    drop(guard);

    assert!(rx.try_iter().any(|e| matches!(e, uhc_controller::fault_log::FaultEvent::Command { description } if description.contains("Failure"))));
}

/// S4 -- startup completes on threshold, then a Mode B tick afterward
/// confirms the supervisor has switched out of Mode A (no further
/// unconditional re-walk of the preference order).
#[test]
fn s4_startup_completes_then_enters_steady_state() {
    let state = fresh_state();
    let shutdown = Arc::new(AtomicBool::new(false));
    let (fault_log, _rx) = spawn_fault_log_sink();
    let mut supervisor = Supervisor::new(state.clone(), heater_outputs(), fault_log, shutdown);

    {
        let mut guard = state.write();
        guard.system.startup_message_received = true;
        for heater in guard.heaters.iter_mut() {
            heater.enabled = true;
            heater.setpoint_f = 170;
            heater.current_temp_f = 170;
        }
    }

    supervisor.tick();
    {
        let guard = state.read();
        assert!(guard.system.startup_complete);
        assert_eq!(guard.system.system_status, uhc_controller::state::SystemStatus::StartupComplete);
    }

    // Now everyone is at setpoint; a Mode B tick should turn nothing on.
    supervisor.tick();
    assert_eq!(state.read().heaters.iter().filter(|h| h.physically_on).count(), 0);
}

/// S5 -- dual-GUI liveness loss, then confirm the reconciler can still
/// recover a GUI's liveness on its next command (no lingering fatal state
/// blocks future contact).
#[test]
fn s5_dual_gui_loss_then_recovers_on_contact() {
    let state = fresh_state();
    let shutdown = Arc::new(AtomicBool::new(false));
    let (fault_log, rx) = spawn_fault_log_sink();

    {
        let mut guard = state.write();
        for heater in guard.heaters.iter_mut() {
            heater.enabled = true;
        }
    }

    let tach: Vec<Box<dyn DigitalInput>> = (0..FAN_COUNT).map(|_| Box::new(MockInput { value: true }) as Box<dyn DigitalInput>).collect();
    let oc: Vec<Box<dyn DigitalInput>> = (0..FAN_COUNT).map(|_| Box::new(MockInput { value: false }) as Box<dyn DigitalInput>).collect();
    let outputs: Vec<Box<dyn DigitalOutput>> = (0..FAN_COUNT).map(|_| Box::new(MockOutput::default()) as Box<dyn DigitalOutput>).collect();
    let ethernet: Box<dyn DigitalInput> = Box::new(MockInput { value: true });
    let mut monitor = LivenessMonitor::new(state.clone(), tach, oc, outputs, ethernet, fault_log.clone(), shutdown);

    for _ in 0..=GUI_NO_COMMUNICATION_TIME_LIMIT_SECONDS {
        monitor.tick();
    }
    assert!(state.read().heaters.iter().all(|h| !h.enabled));
    assert_eq!(state.read().system.alarm_code, AlarmCode::BothGuisFailure);

    let events: Vec<_> = rx.try_iter().collect();
    let error_codes: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            uhc_controller::fault_log::FaultEvent::Error { code, .. } => Some(*code),
            _ => None,
        })
        .collect();
    assert_eq!(error_codes.iter().filter(|c| **c == SINGLE_GUI_COMM_LOSS_ERROR).count(), 2, "expected one one-shot event per GUI, got {error_codes:?}");
    assert_eq!(error_codes.iter().filter(|c| **c == BOTH_GUIS_COMM_LOSS_ERROR_CODE).count(), 1, "expected exactly one combined dual-loss alarm, got {error_codes:?}");
    let both_pos = error_codes.iter().position(|c| *c == BOTH_GUIS_COMM_LOSS_ERROR_CODE).unwrap();
    assert_eq!(both_pos, 2, "dual-loss alarm must fire after both individual one-shot events: {error_codes:?}");

    let reconciler = Reconciler::new(state.clone(), fault_log, std::env::temp_dir());
    reconciler.handle(&CommandEnvelope { gui: GuiId::Gui1, sequence: 1, command: Command::EstablishLink });
    assert_eq!(state.read().system.gui1.seconds_since_contact, 0);
}

/// S6 -- setpoint clamp rejection, driven through the full reconciler path.
#[test]
fn s6_setpoint_clamp_rejection_end_to_end() {
    let state = fresh_state();
    let (fault_log, _rx) = spawn_fault_log_sink();
    let reconciler = Reconciler::new(state.clone(), fault_log, std::env::temp_dir());

    let rejected = reconciler.handle(&CommandEnvelope {
        gui: GuiId::Gui1,
        sequence: 1,
        command: Command::UpdateSlotTempSetpoint { slot: 1, temp_f: 220 },
    });
    assert_eq!(rejected, ResultCode::BadParameter);
    assert_eq!(state.read().heaters[0].setpoint_f, DEFAULT_SETPOINT);

    let accepted = reconciler.handle(&CommandEnvelope {
        gui: GuiId::Gui1,
        sequence: 2,
        command: Command::UpdateSlotTempSetpoint { slot: 1, temp_f: 200 },
    });
    assert_eq!(accepted, ResultCode::Ok);
    assert_eq!(state.read().heaters[0].setpoint_f, 200);
}

/// Invariant 1: physically-on count never exceeds the voltage-derived cap,
/// across a sweep of voltages in one continuous run (not just three
/// isolated snapshots).
#[test]
fn invariant_physically_on_never_exceeds_power_budget() {
    let state = fresh_state();
    let shutdown = Arc::new(AtomicBool::new(false));
    let (fault_log, _rx) = spawn_fault_log_sink();
    let mut supervisor = Supervisor::new(state.clone(), heater_outputs(), fault_log, shutdown);

    {
        let mut guard = state.write();
        guard.system.startup_complete = true;
        for heater in guard.heaters.iter_mut() {
            heater.enabled = true;
            heater.current_temp_f = 70;
            heater.setpoint_f = 170;
        }
    }

    for voltage in [195.0, 205.0, 215.0, 225.0, 235.0] {
        state.write().system.line_voltage_rms = Some(voltage);
        supervisor.tick();
        let (max_concurrent, _) = power_budget(Some(voltage));
        let on_count = state.read().heaters.iter().filter(|h| h.physically_on).count();
        assert!(on_count <= max_concurrent, "voltage {voltage}: {on_count} on exceeds budget {max_concurrent}");
    }
}

/// Invariant 2: a disabled heater is never physically on, even immediately
/// after a command disables it mid-cycle.
#[test]
fn invariant_disabled_heater_never_physically_on() {
    let state = fresh_state();
    let shutdown = Arc::new(AtomicBool::new(false));
    let (fault_log, _rx) = spawn_fault_log_sink();
    let mut supervisor = Supervisor::new(state.clone(), heater_outputs(), fault_log.clone(), shutdown);

    {
        let mut guard = state.write();
        guard.system.startup_complete = true;
        for heater in guard.heaters.iter_mut() {
            heater.enabled = true;
            heater.current_temp_f = 70;
            heater.setpoint_f = 170;
        }
    }
    supervisor.tick();
    assert!(state.read().heaters.iter().any(|h| h.physically_on));

    let reconciler = Reconciler::new(state.clone(), fault_log, std::env::temp_dir());
    reconciler.handle(&CommandEnvelope { gui: GuiId::Gui1, sequence: 1, command: Command::HeaterOff { heater: 0 } });
    assert!(!state.read().heaters[0].physically_on);

    supervisor.tick();
    assert!(!state.read().heaters[0].physically_on);
}

/// Invariant 7: idempotence of Heater_Off and Eco_Mode_On.
#[test]
fn invariant_idempotent_commands() {
    let state = fresh_state();
    let (fault_log, _rx) = spawn_fault_log_sink();
    let reconciler = Reconciler::new(state.clone(), fault_log, std::env::temp_dir());

    let first = reconciler.handle(&CommandEnvelope { gui: GuiId::Gui1, sequence: 1, command: Command::HeaterOff { heater: 2 } });
    let second = reconciler.handle(&CommandEnvelope { gui: GuiId::Gui1, sequence: 2, command: Command::HeaterOff { heater: 2 } });
    assert_eq!(first, ResultCode::Ok);
    assert_eq!(second, ResultCode::Ok);

    state.write().heaters[0].setpoint_f = 180;
    reconciler.handle(&CommandEnvelope { gui: GuiId::Gui1, sequence: 3, command: Command::EcoModeOn { slot: 1 } });
    let saved_after_first = state.read().heaters[0].saved_setpoint_f;
    reconciler.handle(&CommandEnvelope { gui: GuiId::Gui1, sequence: 4, command: Command::EcoModeOn { slot: 1 } });
    assert_eq!(state.read().heaters[0].saved_setpoint_f, saved_after_first);
}

/// Invariant 8: round-trip serialization for a representative sample of
/// outbound and inbound message shapes.
#[test]
fn invariant_message_round_trips() {
    let cmd = Command::SetHeaterTempSetpoint { slot: 4, upper_f: 190, lower_f: 160 };
    let encoded = serde_json::to_string(&cmd).unwrap();
    let decoded: Command = serde_json::from_str(&encoded).unwrap();
    assert!(matches!(decoded, Command::SetHeaterTempSetpoint { slot: 4, upper_f: 190, lower_f: 160 }));

    let fw = FirmwareUpdateMessage { sequence: 9, image_url: "https://example.test/fw.bin".into() };
    let encoded = serde_json::to_string(&fw).unwrap();
    let decoded: FirmwareUpdateMessage = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded.sequence, fw.sequence);
    assert_eq!(decoded.image_url, fw.image_url);

    let result = FirmwareUpdateResult::Rejected;
    let encoded = serde_json::to_string(&result).unwrap();
    let decoded: FirmwareUpdateResult = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, result);
}
