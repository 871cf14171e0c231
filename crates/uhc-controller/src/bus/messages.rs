//! Wire message shapes for every topic on the bus. Field names are stable
//! per the external interface contract; the wire *encoding* (JSON, see
//! `codec`) is our choice, not the original's.

use serde::{Deserialize, Serialize};

use crate::state::{AlarmCode, Location, SystemStatus};

pub const TOPIC_CSS: &str = "CSS";
pub const TOPIC_RTD: &str = "RTD";
pub const TOPIC_CMD: &str = "CMD";
pub const TOPIC_RSP: &str = "RSP";
pub const TOPIC_HB: &str = "HB";
pub const TOPIC_TIME: &str = "TIME";
pub const TOPIC_FWUP: &str = "FWUP";
pub const TOPIC_FWRS: &str = "FWRS";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaterSnapshot {
    pub index: usize,
    pub location: Location,
    pub slot: usize,
    pub enabled: bool,
    pub physically_on: bool,
    pub setpoint_f: i32,
    pub current_temp_f: i32,
    pub is_open: bool,
    pub is_shorted: bool,
    pub over_temp: bool,
    pub under_temp: bool,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanSnapshot {
    pub index: usize,
    pub commanded_on: bool,
    pub latched_fault: bool,
}

/// Current System State -- the once-per-second snapshot. Field set mirrors
/// spec.md's §4.5 enumeration exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CssMessage {
    pub sequence: u32,
    pub timestamp: i64,
    pub uptime_seconds: u64,
    pub heatsink_temp_f: i32,
    pub ambient_temp_f: i32,
    pub fans: Vec<FanSnapshot>,
    pub line_voltage_rms: Option<f32>,
    pub line_current_rms: Option<f32>,
    pub system_status: SystemStatus,
    pub alarm_code: AlarmCode,
    pub eco_setpoint_f: i32,
    pub seconds_since_gui1: u32,
    pub seconds_since_gui2: u32,
    pub error_code: Option<&'static str>,
    pub hardware_revision: u8,
    pub event_driven_logging: bool,
    pub log_period_seconds: u32,
    pub nso_mode: bool,
    pub demo_mode: bool,
    pub heaters: Vec<HeaterSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtdChannelSnapshot {
    pub index: usize,
    pub raw_counts: u16,
    pub temp_f: i32,
    pub is_open: bool,
    pub is_shorted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtdMessage {
    pub sequence: u32,
    pub channels: Vec<RtdChannelSnapshot>,
}

/// One originating display unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuiId {
    Gui1,
    Gui2,
}

/// The exhaustive command set from spec.md §4.4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    EstablishLink,
    Startup,
    ShutdownRequested,
    EmergencyStop,
    Idle,
    HeaterOn { heater: usize },
    HeaterOff { heater: usize },
    UpdateSlotTempSetpoint { slot: usize, temp_f: i32 },
    SetHeaterTempSetpoint { slot: usize, upper_f: i32, lower_f: i32 },
    SetEcoModeTemp { temp_f: i32 },
    EcoModeOn { slot: usize },
    EcoModeOff { slot: usize },
    FanOn { fan: FanSelector },
    FanOff { fan: FanSelector },
    CleaningModeOn,
    CleaningModeOff,
    NsoModeOn,
    DemoModeOn,
    DemoModeOff,
    ConfigureLogging { event_driven: bool, period_seconds: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanSelector {
    Fan1,
    Fan2,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub gui: GuiId,
    pub sequence: u32,
    pub command: Command,
}

/// The reconciler's result taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Ok,
    BadParameter,
    Failure,
    ShutdownPending,
    LinkEstablished,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub gui: GuiId,
    pub sequence: u32,
    pub result: ResultCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub gui: GuiId,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSyncMessage {
    pub gui: GuiId,
    pub epoch_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareUpdateMessage {
    pub sequence: u32,
    pub image_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirmwareUpdateResult {
    Accepted,
    Rejected,
    Applied,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareUpdateResponse {
    pub sequence: u32,
    pub result: FirmwareUpdateResult,
}
