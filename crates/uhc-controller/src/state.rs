//! The cabinet's dynamic state: heaters, sensor channels, fans, and the
//! system-wide fields, collected into one `SystemState` shared across every
//! worker thread.
//!
//! The original firmware spreads this over a large set of process-wide
//! globals; per the design note this carries forward, it is collected here
//! into one value behind a single `parking_lot::RwLock`, mirroring the
//! teacher's single `Mutex<PrinterState>`. A single lock is simpler to
//! reason about than one mutex per entity and is safe here because no
//! worker holds the lock across a blocking call -- every critical section
//! is a snapshot read or an in-memory mutation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use thermal::{CalibrationTable, Classification, ConsecutiveCounter, HeaterTempLatch};

use crate::constants::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Location {
    Upper,
    Lower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SystemStatus {
    Unknown,
    Normal,
    Error,
    Startup,
    StartupComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AlarmCode {
    None,
    HeatsinkOverTemp,
    AmbientOverTemp,
    SlotOverTemp,
    SlotUnderTemp,
    GuiFailure,
    BothGuisFailure,
    SdCardMissing,
    HardwareFailure,
    EthernetDown,
}

/// A single heater, one of 12.
#[derive(Debug, Clone)]
pub struct Heater {
    pub index: usize,
    pub location: Location,
    pub slot: usize,

    pub setpoint_f: i32,
    pub saved_setpoint_f: i32,
    pub eco_setpoint_f: i32,
    pub cleaning_setpoint_f: i32,

    pub current_temp_f: i32,

    pub enabled: bool,
    pub physically_on: bool,
    pub was_on_previous_tick: bool,
    pub eco_active: bool,
    pub setpoint_just_changed: bool,

    pub temp_latch: HeaterTempLatch,

    pub seconds_on_this_hour: u32,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

impl Heater {
    fn new(index: usize) -> Self {
        let slot = index / 2 + 1;
        let location = if index % 2 == 0 { Location::Upper } else { Location::Lower };
        Self {
            index,
            location,
            slot,
            setpoint_f: DEFAULT_SETPOINT,
            saved_setpoint_f: DEFAULT_SETPOINT,
            eco_setpoint_f: DEFAULT_ECO_MODE_SETPOINT,
            cleaning_setpoint_f: DEFAULT_CLEANING_MODE_SETPOINT,
            current_temp_f: 0,
            enabled: false,
            physically_on: false,
            was_on_previous_tick: false,
            eco_active: false,
            setpoint_just_changed: false,
            temp_latch: HeaterTempLatch::new(OVERTEMP_DELTA_LIMIT_DEGREES, OVERTEMP_DELTA_LIMIT_SECONDS),
            seconds_on_this_hour: 0,
            start_time: None,
            end_time: None,
        }
    }

    pub fn delta_temp(&self) -> i32 {
        self.setpoint_f - self.current_temp_f
    }

    /// "At temperature" per Mode A: upper heaters tolerate `setpoint - 10`,
    /// lowers must reach setpoint exactly.
    pub fn at_temperature(&self) -> bool {
        match self.location {
            Location::Upper => self.current_temp_f >= self.setpoint_f - STARTUP_TEMP_DELTA_FOR_COMPLETE,
            Location::Lower => self.current_temp_f >= self.setpoint_f,
        }
    }

    pub fn turn_off(&mut self) {
        self.physically_on = false;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.physically_on = false;
    }
}

/// Clamps `value` into `[low, high]`, returning `None` if it was already
/// outside and should be rejected rather than silently clamped (the
/// reconciler uses `None` to mean `BAD_PARAMETER`).
pub fn clamp_setpoint(value: i32, low: i32, high: i32) -> Option<i32> {
    if value < low || value > high {
        None
    } else {
        Some(value)
    }
}

/// Debounced sensor fault bit: unlike the heater temperature latches, this
/// clears immediately once a sample comes back in-range -- only the
/// consequence (disabling the owning heater) is monotonic.
#[derive(Debug, Clone, Default)]
pub struct SensorFault {
    counter: ConsecutiveCounter,
    active: bool,
    reported: bool,
}

impl SensorFault {
    /// Feeds one sample. Returns `true` exactly on the scan where the fault
    /// newly becomes active.
    fn sample(&mut self, condition_held: bool) -> bool {
        if !condition_held {
            self.counter.reset();
            self.active = false;
            self.reported = false;
            return false;
        }
        let count = self.counter.sample(true);
        if count >= MAX_CONSECUTIVE_SECONDS_ERROR && !self.active {
            self.active = true;
            return true;
        }
        false
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// One of the 14 thermistor channels: 12 heaters, the heatsink, and ambient.
pub struct SensorChannel {
    pub index: usize,
    pub ain_bus: u8,
    pub mux_chip: u8,
    pub mux_input: u8,
    pub gain: u8,

    pub raw_counts: u16,
    pub temp_f: i32,

    pub open_fault: SensorFault,
    pub short_fault: SensorFault,

    pub calibration: CalibrationTable,
}

impl SensorChannel {
    fn new(index: usize, ain_bus: u8, mux_chip: u8, mux_input: u8, gain: u8) -> Self {
        Self {
            index,
            ain_bus,
            mux_chip,
            mux_input,
            gain,
            raw_counts: 0,
            temp_f: thermal::thermistor::OUT_OF_RANGE_SENTINEL,
            open_fault: SensorFault::default(),
            short_fault: SensorFault::default(),
            calibration: CalibrationTable::default_ramp(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open_fault.is_active()
    }

    pub fn is_shorted(&self) -> bool {
        self.short_fault.is_active()
    }

    /// Applies one classified reading, updating fault debounce and, for
    /// in-range readings, `temp_f`. Returns `(open_newly_latched,
    /// short_newly_latched)`.
    pub fn apply_classification(&mut self, raw_counts: u16, classification: Classification) -> (bool, bool) {
        self.raw_counts = raw_counts;
        let open_newly = self.open_fault.sample(matches!(classification, Classification::CandidateOpen));
        let short_newly = self.short_fault.sample(matches!(classification, Classification::CandidateShort));
        if let Classification::InRange(t) = classification {
            self.temp_f = t;
        }
        (open_newly, short_newly)
    }
}

#[derive(Debug, Clone)]
pub struct Fan {
    pub index: usize,
    pub commanded_on: bool,
    pub last_tach_bit: bool,
    pub consecutive_tach_zero: u32,
    pub over_current_bit: bool,
    pub over_current_delay: u32,
    pub auto_correct_count: u32,
    pub latched_fault: bool,
}

impl Fan {
    fn new(index: usize) -> Self {
        Self {
            index,
            commanded_on: false,
            last_tach_bit: true,
            consecutive_tach_zero: 0,
            over_current_bit: false,
            over_current_delay: 0,
            auto_correct_count: 0,
            latched_fault: false,
        }
    }
}

/// GUI liveness tracking for one of the two display units.
#[derive(Debug, Clone, Default)]
pub struct GuiLiveness {
    pub seconds_since_contact: u32,
    pub missing_reported: bool,
    pub sequence_number: u32,
}

/// System-wide fields not owned by any single heater, channel, or fan.
pub struct System {
    pub system_status: SystemStatus,
    pub alarm_code: AlarmCode,

    pub in_cleaning_mode: bool,
    pub nso_mode: bool,
    pub demo_mode: bool,
    pub in_initial_startup: bool,
    pub startup_complete: bool,
    pub startup_message_received: bool,
    pub startup_time_seconds: u32,
    pub last_command_received: Option<i64>,

    pub gui1: GuiLiveness,
    pub gui2: GuiLiveness,

    pub line_voltage_rms: Option<f32>,
    pub line_current_rms: Option<f32>,
    pub power_monitor_bad: bool,

    pub heatsink_temp_f: i32,
    pub ambient_temp_f: i32,
    pub heatsink_over_temp_latched: bool,
    pub ambient_over_temp_latched: bool,
    pub heatsink_over_temp_seconds: u32,
    pub ambient_over_temp_seconds: u32,

    pub shutdown_requested: bool,
    pub ethernet_up: bool,
    pub ethernet_down_seconds: u32,
    pub ethernet_down_reported: bool,
    pub both_guis_failure_reported: bool,
    pub sd_card_present: bool,

    pub error_report_count: u32,
    pub last_error_code: Option<&'static str>,

    pub hardware_revision: u8,
    pub serial_number: String,
    pub model_number: String,
    pub setpoint_low_limit: i32,
    pub setpoint_high_limit: i32,

    pub event_driven_logging: bool,
    pub log_period_seconds: u32,

    pub startup_instant: SystemTime,
    pub supervisor_tick: u64,
}

impl System {
    fn new(serial_number: String, model_number: String, setpoint_low_limit: i32, setpoint_high_limit: i32, hardware_revision: u8) -> Self {
        Self {
            system_status: SystemStatus::Unknown,
            alarm_code: AlarmCode::None,
            in_cleaning_mode: false,
            nso_mode: false,
            demo_mode: false,
            in_initial_startup: true,
            startup_complete: false,
            startup_message_received: false,
            startup_time_seconds: 0,
            last_command_received: None,
            gui1: GuiLiveness::default(),
            gui2: GuiLiveness::default(),
            line_voltage_rms: None,
            line_current_rms: None,
            power_monitor_bad: false,
            heatsink_temp_f: 0,
            ambient_temp_f: 0,
            heatsink_over_temp_latched: false,
            ambient_over_temp_latched: false,
            heatsink_over_temp_seconds: 0,
            ambient_over_temp_seconds: 0,
            shutdown_requested: false,
            ethernet_up: true,
            ethernet_down_seconds: 0,
            ethernet_down_reported: false,
            both_guis_failure_reported: false,
            sd_card_present: true,
            error_report_count: 0,
            last_error_code: None,
            hardware_revision,
            serial_number,
            model_number,
            setpoint_low_limit,
            setpoint_high_limit,
            event_driven_logging: false,
            log_period_seconds: 1,
            startup_instant: SystemTime::now(),
            supervisor_tick: 0,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        SystemTime::now().duration_since(self.startup_instant).map(|d| d.as_secs()).unwrap_or(0)
    }
}

/// Everything behind the lock.
pub struct Inner {
    pub heaters: Vec<Heater>,
    pub channels: Vec<SensorChannel>,
    pub fans: Vec<Fan>,
    pub system: System,
}

/// The process-wide shared state, handed to every worker as an `Arc` clone.
pub struct SystemState {
    inner: RwLock<Inner>,
    /// Monotonic bus sequence number, separate from the lock so publishers
    /// never need a write lock just to bump a counter.
    publish_sequence: AtomicU32,
}

impl SystemState {
    pub fn new(serial_number: String, model_number: String, setpoint_low_limit: i32, setpoint_high_limit: i32, hardware_revision: u8) -> Self {
        let heaters = (0..HEATER_COUNT).map(Heater::new).collect();
        let mut channels = Vec::with_capacity(SENSOR_CHANNEL_COUNT);
        for i in 0..HEATER_COUNT {
            channels.push(SensorChannel::new(i, (i % 2) as u8, (i / 7) as u8, (i % 7) as u8, 1));
        }
        channels.push(SensorChannel::new(HEATSINK_CHANNEL, 0, 1, 7, 1));
        channels.push(SensorChannel::new(AMBIENT_CHANNEL, 1, 1, 8, 1));
        let fans = (0..FAN_COUNT).map(Fan::new).collect();
        let system = System::new(serial_number, model_number, setpoint_low_limit, setpoint_high_limit, hardware_revision);
        Self {
            inner: RwLock::new(Inner { heaters, channels, fans, system }),
            publish_sequence: AtomicU32::new(0),
        }
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, Inner> {
        self.inner.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Inner> {
        self.inner.write()
    }

    pub fn next_publish_sequence(&self) -> u32 {
        self.publish_sequence.fetch_add(1, Ordering::Relaxed)
    }
}

/// Seconds since the Unix epoch, used for advisory heater start/end times
/// and the last-command timestamp.
pub fn unix_time_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
