//! CLI parsing and the on-disk configuration files read once at startup.
//!
//! Follows the teacher's `config.rs` shape -- a `Cli` parsed by `clap` plus a
//! loader that turns plain files on disk into a typed struct -- adapted from
//! an INI parser to the original firmware's one-value-per-file convention.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;

use crate::constants::{
    DEFAULT_MODEL_NUMBER, DEFAULT_SERIAL_NUMBER, DEFAULT_SETPOINT_HIGH_LIMIT, DEFAULT_SETPOINT_LOW_LIMIT, SENSOR_CHANNEL_COUNT,
};
use thermal::CalibrationTable;

/// `uhc-controller <controllerIP> <gui1IP> <gui2IP>`, matching the original
/// firmware's invocation.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// IP address the controller binds its publishing sockets to.
    pub controller_ip: String,
    /// IP address of display unit 1.
    pub gui1_ip: String,
    /// IP address of display unit 2.
    pub gui2_ip: String,

    /// Directory holding the on-disk config/calibration files, defaults to
    /// `/etc`.
    #[arg(long, default_value = "/etc")]
    pub config_dir: PathBuf,

    /// Directory the fault-log CSV and recent-errors files are written to.
    #[arg(long, default_value = "/var/log/uhc")]
    pub log_dir: PathBuf,

    /// Run against in-memory mock GPIO/ADC/SPI instead of real hardware.
    #[arg(long)]
    pub mock_hw: bool,
}

/// Startup configuration assembled from the CLI and the `/etc` files.
#[derive(Debug, Clone)]
pub struct BootConfig {
    pub controller_ip: String,
    pub gui1_ip: String,
    pub gui2_ip: String,
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
    pub mock_hw: bool,

    pub serial_number: String,
    pub model_number: String,
    pub setpoint_low_limit: i32,
    pub setpoint_high_limit: i32,
}

impl BootConfig {
    pub fn load(cli: &Cli) -> Result<Self> {
        let serial_number = read_text_file_or(&cli.config_dir.join("serialNumber.txt"), DEFAULT_SERIAL_NUMBER);
        let model_number = read_text_file_or(&cli.config_dir.join("modelNumber.txt"), DEFAULT_MODEL_NUMBER);
        let setpoint_low_limit = read_int_file_or(&cli.config_dir.join("setpointLowLimit.txt"), DEFAULT_SETPOINT_LOW_LIMIT);
        let setpoint_high_limit = read_int_file_or(&cli.config_dir.join("setpointHighLimit.txt"), DEFAULT_SETPOINT_HIGH_LIMIT);

        fs::create_dir_all(&cli.log_dir).with_context(|| format!("creating log directory {:?}", cli.log_dir))?;

        Ok(Self {
            controller_ip: cli.controller_ip.clone(),
            gui1_ip: cli.gui1_ip.clone(),
            gui2_ip: cli.gui2_ip.clone(),
            config_dir: cli.config_dir.clone(),
            log_dir: cli.log_dir.clone(),
            mock_hw: cli.mock_hw,
            serial_number,
            model_number,
            setpoint_low_limit,
            setpoint_high_limit,
        })
    }
}

fn read_text_file_or(path: &Path, default: &str) -> String {
    match fs::read_to_string(path) {
        Ok(s) => s.trim().to_string(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, default, "falling back to compiled-in default");
            default.to_string()
        }
    }
}

fn read_int_file_or(path: &Path, default: i32) -> i32 {
    match fs::read_to_string(path).ok().and_then(|s| s.trim().parse::<i32>().ok()) {
        Some(v) => v,
        None => {
            warn!(path = %path.display(), default, "falling back to compiled-in default");
            default
        }
    }
}

/// Loads the 14 per-channel calibration tables via their indirection files
/// (`tempCalibrationTableFilename_RTD<n>.txt`, each holding the real path to
/// the actual table). Any failure at any stage substitutes the compiled-in
/// default ramp for that channel and logs a warning -- never aborts startup.
pub fn load_calibration_tables(config_dir: &Path) -> [CalibrationTable; SENSOR_CHANNEL_COUNT] {
    std::array::from_fn(|channel| load_one_calibration_table(config_dir, channel))
}

fn load_one_calibration_table(config_dir: &Path, channel: usize) -> CalibrationTable {
    let indirection_path = config_dir.join(format!("tempCalibrationTableFilename_RTD{channel}.txt"));
    let target = match fs::read_to_string(&indirection_path) {
        Ok(s) => PathBuf::from(s.trim()),
        Err(e) => {
            warn!(channel, path = %indirection_path.display(), error = %e, "missing calibration indirection file, using default table");
            return CalibrationTable::default_ramp();
        }
    };

    let text = match fs::read_to_string(&target) {
        Ok(t) => t,
        Err(e) => {
            warn!(channel, path = %target.display(), error = %e, "missing calibration table file, using default table");
            return CalibrationTable::default_ramp();
        }
    };

    match CalibrationTable::parse(&text) {
        Ok(table) => table,
        Err(e) => {
            warn!(channel, path = %target.display(), error = %e, "invalid calibration table, using default table");
            CalibrationTable::default_ramp()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let sn = read_text_file_or(&dir.path().join("serialNumber.txt"), DEFAULT_SERIAL_NUMBER);
        assert_eq!(sn, DEFAULT_SERIAL_NUMBER);
    }

    #[test]
    fn present_int_file_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("setpointLowLimit.txt");
        let mut f = fs::File::create(&path).unwrap();
        write!(f, "140\n").unwrap();
        assert_eq!(read_int_file_or(&path, DEFAULT_SETPOINT_LOW_LIMIT), 140);
    }

    #[test]
    fn calibration_falls_back_without_indirection_file() {
        let dir = tempfile::tempdir().unwrap();
        let table = load_one_calibration_table(dir.path(), 0);
        assert_eq!(table.rows().len(), thermal::thermistor::TABLE_ROWS);
    }
}
