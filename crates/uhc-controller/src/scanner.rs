//! Sensor Scanner (spec.md §4.1) plus the heatsink/ambient arm of Thermal
//! Protection (§4.3), which the original runs inline in the same task
//! because both consume the same per-channel reading.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thermal::{AbsoluteTempLatch, Classification};
use tracing::{debug, info, warn};

use crate::constants::*;
use crate::fault_log::{FaultEvent, FaultLogHandle};
use crate::gpio::{MuxAdcBus, PowerMeter};
use crate::state::{AlarmCode, SystemState};

/// Sets the next error code the state publisher will report and restarts its
/// `REPORT_ERROR_COUNT`-publication auto-clear window.
fn report_error(guard: &mut crate::state::Inner, code: &'static str) {
    guard.system.last_error_code = Some(code);
    guard.system.error_report_count = 0;
}

const SCAN_PERIOD: Duration = Duration::from_secs(1);
const SCAN_FLOOR: Duration = Duration::from_millis(10);

/// Packs a channel's routing into the two PGA117 commands a single 4-byte
/// transaction carries: the active mux routes the channel at its
/// configured gain, the other mux parks on channel 0 (GND) at unity gain.
fn pack_mux_commands(mux_chip: u8, mux_input: u8, gain: u8) -> (u16, u16) {
    // PGA117 command word: channel select in the low nibble, gain code
    // shifted into bits 4..7, per the original's rtdmux.cpp packing.
    let active = ((gain as u16) << 4) | (mux_input as u16 & 0x0f);
    let parked = 0u16;
    if mux_chip == 0 {
        (active, parked)
    } else {
        (parked, active)
    }
}

pub struct Scanner {
    state: Arc<SystemState>,
    mux_bus: Box<dyn MuxAdcBus>,
    power_meter: Box<dyn PowerMeter>,
    fault_log: FaultLogHandle,
    shutdown: Arc<AtomicBool>,
    heatsink_latch: AbsoluteTempLatch,
    ambient_latch: AbsoluteTempLatch,
}

impl Scanner {
    pub fn new(state: Arc<SystemState>, mux_bus: Box<dyn MuxAdcBus>, power_meter: Box<dyn PowerMeter>, fault_log: FaultLogHandle, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            state,
            mux_bus,
            power_meter,
            fault_log,
            shutdown,
            heatsink_latch: AbsoluteTempLatch::new(HEATSINK_MAX_TEMP_F, HEATSINK_OVERTEMP_TIME_LIMIT_SECONDS),
            ambient_latch: AbsoluteTempLatch::new(AMBIENT_MAX_TEMP_F, AMBIENT_OVERTEMP_TIME_LIMIT_SECONDS),
        }
    }

    pub fn run(mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.scan_pass();
            let elapsed = started.elapsed();
            let sleep_for = SCAN_PERIOD.checked_sub(elapsed).unwrap_or(SCAN_FLOOR).max(SCAN_FLOOR);
            std::thread::sleep(sleep_for);
        }
    }

    /// One full 14-channel sweep plus the power-meter poll. Exposed for
    /// tests to drive directly against mock hardware.
    pub fn scan_pass(&mut self) {
        for channel in 0..SENSOR_CHANNEL_COUNT {
            self.scan_one_channel(channel);
        }
        self.poll_power_meter();
    }

    fn scan_one_channel(&mut self, channel_index: usize) {
        let (ain_bus, mux_chip, mux_input, gain, calibration_clone) = {
            let guard = self.state.read();
            let ch = &guard.channels[channel_index];
            (ch.ain_bus, ch.mux_chip, ch.mux_input, ch.gain, ch.calibration.clone())
        };

        let (cmd1, cmd2) = pack_mux_commands(mux_chip, mux_input, gain);
        if let Err(e) = self.mux_bus.program(cmd1, cmd2) {
            warn!(channel = channel_index, error = %e, "mux program failed");
            return;
        }

        let mut raw = match self.mux_bus.read_counts(ain_bus) {
            Ok(v) => v,
            Err(e) => {
                warn!(channel = channel_index, error = %e, "adc read failed");
                return;
            }
        };

        // A reading in the outer band is a candidate fault; re-read a few
        // times with the same programming before committing to it, to rule
        // out a transient glitch.
        let mut classification = calibration_clone.classify(raw);
        if !matches!(classification, Classification::InRange(_)) {
            for _ in 0..MAX_READ_RTD_RETRY_COUNT {
                match self.mux_bus.read_counts(ain_bus) {
                    Ok(v) => raw = v,
                    Err(e) => {
                        warn!(channel = channel_index, error = %e, "adc retry read failed");
                        break;
                    }
                }
                classification = calibration_clone.classify(raw);
            }
        }

        let (open_newly, short_newly) = {
            let mut guard = self.state.write();
            guard.channels[channel_index].apply_classification(raw, classification)
        };

        if open_newly {
            self.handle_fault(channel_index, "open");
        }
        if short_newly {
            self.handle_fault(channel_index, "short");
        }

        if channel_index == HEATSINK_CHANNEL {
            let heatsink_temp = self.state.read().channels[HEATSINK_CHANNEL].temp_f;
            self.check_heatsink(heatsink_temp);
        } else if channel_index == AMBIENT_CHANNEL {
            self.check_ambient();
        }
    }

    fn handle_fault(&self, channel_index: usize, kind: &'static str) {
        let probe_code = if kind == "open" { TEMP_PROBE_OPEN_ERROR_CODE } else { TEMP_PROBE_CLOSED_ERROR_CODE };
        match channel_index {
            HEATSINK_CHANNEL => {
                warn!(channel = channel_index, kind, "heatsink sensor fault, disabling all heaters");
                let mut guard = self.state.write();
                for heater in guard.heaters.iter_mut() {
                    heater.disable();
                }
                guard.system.alarm_code = AlarmCode::HardwareFailure;
                guard.system.system_status = crate::state::SystemStatus::Error;
                report_error(&mut guard, HEATSINK_OVER_TEMP_ERROR_CODE);
                drop(guard);
                self.fault_log.send(FaultEvent::error(format!("Heat sink sensor {kind}"), HEATSINK_OVER_TEMP_ERROR_CODE));
            }
            AMBIENT_CHANNEL => {
                debug!(channel = channel_index, kind, "ambient sensor fault (warn only)");
                let mut guard = self.state.write();
                report_error(&mut guard, probe_code);
                drop(guard);
                self.fault_log.send(FaultEvent::error(format!("Ambient sensor {kind}"), probe_code));
            }
            heater_index => {
                warn!(channel = heater_index, kind, "heater sensor fault, disabling heater");
                let mut guard = self.state.write();
                guard.heaters[heater_index].disable();
                report_error(&mut guard, probe_code);
                drop(guard);
                self.fault_log.send(FaultEvent::error(format!("Heater {heater_index} sensor {kind}"), probe_code));
            }
        }
    }

    fn check_heatsink(&mut self, temp_f: i32) {
        let newly_latched = self.heatsink_latch.update(temp_f);
        let mut guard = self.state.write();
        guard.system.heatsink_temp_f = temp_f;
        guard.system.heatsink_over_temp_latched = self.heatsink_latch.latched();
        if newly_latched {
            for heater in guard.heaters.iter_mut() {
                heater.disable();
            }
            guard.system.alarm_code = AlarmCode::HeatsinkOverTemp;
            guard.system.system_status = crate::state::SystemStatus::Error;
            report_error(&mut guard, HEATSINK_OVER_TEMP_ERROR_CODE);
            drop(guard);
            info!(temp_f, "heatsink over-temp latched, all heaters disabled");
            self.fault_log.send(FaultEvent::error("Heat sink over temperature".into(), HEATSINK_OVER_TEMP_ERROR_CODE));
        }
    }

    fn check_ambient(&mut self) {
        let (hardware_revision, heatsink_temp) = {
            let guard = self.state.read();
            (guard.system.hardware_revision, guard.system.heatsink_temp_f)
        };

        let mut guard = self.state.write();
        let ambient_temp = if hardware_revision >= 1 {
            guard.channels[AMBIENT_CHANNEL].temp_f
        } else {
            heatsink_temp
        };
        guard.system.ambient_temp_f = ambient_temp;
        drop(guard);

        if hardware_revision < 1 {
            return;
        }

        let newly_latched = self.ambient_latch.update(ambient_temp);
        let mut guard = self.state.write();
        guard.system.ambient_over_temp_latched = self.ambient_latch.latched();
        drop(guard);
        if newly_latched {
            info!(ambient_temp, "ambient over-temp latched (warn only)");
            let mut guard = self.state.write();
            guard.system.alarm_code = AlarmCode::AmbientOverTemp;
            report_error(&mut guard, AMBIENT_OVER_TEMP_ERROR_CODE);
            drop(guard);
            self.fault_log.send(FaultEvent::error("Ambient over temperature".into(), AMBIENT_OVER_TEMP_ERROR_CODE));
        }
    }

    fn poll_power_meter(&mut self) {
        let voltage = Self::retry_read(POWER_METER_MAX_READS, || self.power_meter.read_rms_voltage());
        let current = Self::retry_read(POWER_METER_MAX_READS, || self.power_meter.read_rms_current());

        let mut guard = self.state.write();
        guard.system.line_voltage_rms = voltage;
        guard.system.line_current_rms = current;
        guard.system.power_monitor_bad = voltage.is_none() && current.is_none();
        if guard.system.power_monitor_bad {
            guard.system.alarm_code = AlarmCode::HardwareFailure;
        }
    }

    fn retry_read(max_reads: u32, mut read: impl FnMut() -> Result<f32, crate::error::UhcError>) -> Option<f32> {
        for _ in 0..max_reads {
            match read() {
                Ok(v) if v != 0.0 => return Some(v),
                _ => continue,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault_log::spawn_fault_log_sink;
    use crate::gpio::mock::{MockMuxAdcBus, MockPowerMeter};
    use crate::state::SystemState;

    fn fixture() -> (Scanner, Arc<SystemState>) {
        let state = Arc::new(SystemState::new("SN".into(), "MODEL".into(), 150, 215, 1));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (fault_log, _rx) = spawn_fault_log_sink();
        let mux_bus = Box::new(MockMuxAdcBus::default());
        let power_meter = Box::new(MockPowerMeter { voltage: 208.0, current: 12.0 });
        let scanner = Scanner::new(state.clone(), mux_bus, power_meter, fault_log, shutdown);
        (scanner, state)
    }

    #[test]
    fn power_meter_populates_voltage_and_current() {
        let (mut scanner, state) = fixture();
        scanner.poll_power_meter();
        let guard = state.read();
        assert_eq!(guard.system.line_voltage_rms, Some(208.0));
        assert_eq!(guard.system.line_current_rms, Some(12.0));
        assert!(!guard.system.power_monitor_bad);
    }

    #[test]
    fn heatsink_overtemp_disables_all_heaters() {
        let (mut scanner, state) = fixture();
        {
            let mut guard = state.write();
            for heater in guard.heaters.iter_mut() {
                heater.enabled = true;
            }
        }
        for _ in 0..=HEATSINK_OVERTEMP_TIME_LIMIT_SECONDS {
            scanner.check_heatsink(200);
        }
        let guard = state.read();
        assert!(guard.heaters.iter().all(|h| !h.enabled));
        assert!(guard.system.heatsink_over_temp_latched);
    }
}
