//! Compiled-in constants recovered from the original firmware's header.
//!
//! These are the numbers a field tech would otherwise have to read out of
//! `frontier_uhc.h`; collecting them here means every tunable has exactly one
//! definition instead of being re-typed at each call site.

pub const HEATER_COUNT: usize = 12;
pub const SLOT_COUNT: usize = 6;
pub const FAN_COUNT: usize = 2;
/// Sensor channels: 12 heaters + heatsink + ambient/board.
pub const SENSOR_CHANNEL_COUNT: usize = 14;
pub const HEATSINK_CHANNEL: usize = 12;
pub const AMBIENT_CHANNEL: usize = 13;

pub const MAX_CONSECUTIVE_SECONDS_ERROR: u32 = 3;
pub const MAX_READ_RTD_RETRY_COUNT: u32 = 4;
pub const POWER_METER_MAX_READS: u32 = 5;

pub const DEFAULT_SETPOINT_LOW_LIMIT: i32 = 150;
pub const DEFAULT_SETPOINT_HIGH_LIMIT: i32 = 215;
pub const DEFAULT_SETPOINT: i32 = 165;
pub const DEFAULT_ECO_MODE_SETPOINT: i32 = 100;
pub const DEFAULT_CLEANING_MODE_SETPOINT: i32 = 120;
pub const MAX_CLEANING_MODE_SETPOINT: i32 = 125;

pub const OVERTEMP_DELTA_LIMIT_DEGREES: i32 = 11;
pub const UNDERTEMP_DELTA_LIMIT_DEGREES: i32 = 11;
pub const OVERTEMP_DELTA_LIMIT_SECONDS: u32 = 900;
pub const UNDERTEMP_DELTA_LIMIT_SECONDS: u32 = 900;
/// Slack within which the `setpoint_just_changed` guard clears.
pub const SETPOINT_SETTLED_SLACK_DEGREES: i32 = 5;

pub const MAX_STARTUP_REACH_SETPOINT_TIME_SECONDS: u32 = 3000;
/// Upper heaters are "at temperature" this many degrees below setpoint;
/// lowers must reach setpoint exactly.
pub const STARTUP_TEMP_DELTA_FOR_COMPLETE: i32 = 10;

pub const HEATSINK_MAX_TEMP_F: i32 = 176;
pub const HEATSINK_OVERTEMP_TIME_LIMIT_SECONDS: u32 = 900;
pub const AMBIENT_MAX_TEMP_F: i32 = 158;
pub const AMBIENT_OVERTEMP_TIME_LIMIT_SECONDS: u32 = 900;

pub const GUI_NO_COMMUNICATION_TIME_LIMIT_SECONDS: u32 = 180;
pub const ETHERNET_NO_COMMUNICATION_TIME_LIMIT_SECONDS: u32 = 180;
pub const REPORT_ERROR_COUNT: u32 = 3;

pub const FIRST_TEMPERATURE_ENTRY: u16 = 32;
pub const LAST_TEMPERATURE_ENTRY: u16 = 350;
pub const TEMP_TABLE_NUM_ENTRIES: usize = 319;

pub const SPI_TRANSACTION_BYTE_COUNT: usize = 4;

pub const FAN_TACH_CONSECUTIVE_FAILURES: u32 = 5;
pub const FAN_OVERCURRENT_DELAY_COUNT: u32 = 5;
pub const FAN_OVERCURRENT_AUTO_CORRECT_LIMIT: u32 = 3;

pub const EESLOGINTERVAL_SEC: u64 = 3;
pub const LOGEVENT_TIMEOUT_MS: u64 = 100;
pub const FAULT_LOG_QUEUE_CAPACITY: usize = 16;
pub const RECENT_ERRORS_LINE_COUNT: usize = 25;

pub const DEFAULT_SERIAL_NUMBER: &str = "UNKNOWN-SN";
pub const DEFAULT_MODEL_NUMBER: &str = "UNKNOWN-MODEL";

/// Error-code tags published on the fault log and in `CssMessage::error_code`,
/// copied verbatim from the original firmware's header.
pub const HEATSINK_OVER_TEMP_ERROR_CODE: &str = "E-4B";
pub const AMBIENT_OVER_TEMP_ERROR_CODE: &str = "E-4A";
pub const SHELF_OVER_TEMP_ERROR_CODE: &str = "E-5";
pub const SHELF_UNDER_TEMP_ERROR_CODE: &str = "E-216";
pub const TEMP_PROBE_OPEN_ERROR_CODE: &str = "E-6A";
pub const TEMP_PROBE_CLOSED_ERROR_CODE: &str = "E-6B";
pub const BOTH_GUIS_COMM_LOSS_ERROR_CODE: &str = "E-220";
pub const SINGLE_GUI_COMM_LOSS_ERROR: &str = "E-60A";
pub const ETHERNET_DOWN_ERROR_CODE: &str = "E-220A";
pub const FAN_FAILURE_ERROR_CODE: &str = "E-210";

/// Heater index of the upper heater for a one-based shelf number. Upper is
/// the even index of the pair.
pub const fn upper_heater_index(shelf: usize) -> usize {
    (shelf - 1) * 2
}

/// Heater index of the lower heater for a one-based shelf number. Lower is
/// the odd index of the pair.
pub const fn lower_heater_index(shelf: usize) -> usize {
    (shelf - 1) * 2 + 1
}

/// Fixed startup preference order from the original firmware: all six lower
/// heaters in shelf order, then the six upper heaters in shelf order
/// {6,1,5,2,3,4} -- a hand-tuned warm-up sequence, not derivable from any
/// other rule.
pub fn startup_preference_order() -> [usize; HEATER_COUNT] {
    const UPPER_SHELF_ORDER: [usize; 6] = [6, 1, 5, 2, 3, 4];
    let mut order = [0usize; HEATER_COUNT];
    for shelf in 1..=6 {
        order[shelf - 1] = lower_heater_index(shelf);
    }
    for (i, shelf) in UPPER_SHELF_ORDER.into_iter().enumerate() {
        order[6 + i] = upper_heater_index(shelf);
    }
    order
}

/// Power budget derived from measured line voltage, per the once-per-tick
/// computation at the top of the supervisor loop.
pub fn power_budget(line_voltage_rms: Option<f32>) -> (usize, usize) {
    match line_voltage_rms {
        Some(v) if v <= 201.0 => (10, 2),
        Some(v) if v <= 221.0 => (9, 3),
        _ => (8, 4),
    }
}
