//! Hardware abstraction: GPIO, the mux/ADC SPI bus, and the power meter.
//!
//! Real implementations read and write the sysfs trees the original firmware
//! used directly (`/sys/class/gpio/...`, `/sys/bus/iio/...`); the mock
//! implementations back both the test suite and the `--mock-hw` CLI flag,
//! grounded in the teacher's `run_mock_mcu`.

use std::fs;
use std::io;
use std::path::PathBuf;

use crate::constants::SPI_TRANSACTION_BYTE_COUNT;
use crate::error::UhcError;

/// A single digital output line (heater enable relays, fans, the 220 VAC
/// relay).
pub trait DigitalOutput: Send {
    fn set(&mut self, on: bool) -> Result<(), UhcError>;
}

/// A single digital input line (fan tach, fan over-current, board-id bits,
/// the line-voltage-sag warning bit).
pub trait DigitalInput: Send {
    fn read(&mut self) -> Result<bool, UhcError>;
}

/// The shared 4-byte mux/ADC transaction bus. One shared-bus write programs
/// both PGA117 muxes; the caller reads back raw ADC counts afterwards from
/// whichever bus (`ain_bus`) the channel is wired to.
pub trait MuxAdcBus: Send {
    /// Programs both muxes for one channel read. `mux1_command` and
    /// `mux2_command` are the two 16-bit PGA117 commands packed into the
    /// fixed 4-byte transaction.
    fn program(&mut self, mux1_command: u16, mux2_command: u16) -> Result<(), UhcError>;

    /// Reads raw counts from the given ADC bus (0 or 1) after the settle
    /// delay has elapsed.
    fn read_counts(&mut self, ain_bus: u8) -> Result<u16, UhcError>;
}

/// The power meter IC, polled once per scan pass for RMS voltage/current.
pub trait PowerMeter: Send {
    fn read_rms_voltage(&mut self) -> Result<f32, UhcError>;
    fn read_rms_current(&mut self) -> Result<f32, UhcError>;
}

/// Sysfs GPIO output. Writes `"0"`/`"1"` to `<path>/value`.
pub struct SysfsOutput {
    value_path: PathBuf,
}

impl SysfsOutput {
    pub fn new(gpio_path: impl Into<PathBuf>) -> Self {
        let mut value_path = gpio_path.into();
        value_path.push("value");
        Self { value_path }
    }
}

impl DigitalOutput for SysfsOutput {
    fn set(&mut self, on: bool) -> Result<(), UhcError> {
        fs::write(&self.value_path, if on { b"1" as &[u8] } else { b"0" }).map_err(|source| UhcError::Gpio {
            path: self.value_path.display().to_string(),
            source,
        })
    }
}

/// Sysfs GPIO input. Reads and trims `<path>/value`.
pub struct SysfsInput {
    value_path: PathBuf,
}

impl SysfsInput {
    pub fn new(gpio_path: impl Into<PathBuf>) -> Self {
        let mut value_path = gpio_path.into();
        value_path.push("value");
        Self { value_path }
    }
}

impl DigitalInput for SysfsInput {
    fn read(&mut self) -> Result<bool, UhcError> {
        let contents = fs::read_to_string(&self.value_path).map_err(|source| UhcError::Gpio {
            path: self.value_path.display().to_string(),
            source,
        })?;
        Ok(contents.trim() == "1")
    }
}

/// Real SPI-backed mux/ADC bus. The 4-byte transaction format mirrors the
/// original's PGA117 command packing: two 16-bit mux commands back to back.
pub struct SpiMuxAdcBus {
    spi_path: PathBuf,
    adc_paths: [PathBuf; 2],
}

impl SpiMuxAdcBus {
    pub fn new(spi_path: impl Into<PathBuf>, adc0_path: impl Into<PathBuf>, adc1_path: impl Into<PathBuf>) -> Self {
        Self {
            spi_path: spi_path.into(),
            adc_paths: [adc0_path.into(), adc1_path.into()],
        }
    }
}

impl MuxAdcBus for SpiMuxAdcBus {
    fn program(&mut self, mux1_command: u16, mux2_command: u16) -> Result<(), UhcError> {
        let mut transaction = [0u8; SPI_TRANSACTION_BYTE_COUNT];
        transaction[0..2].copy_from_slice(&mux1_command.to_be_bytes());
        transaction[2..4].copy_from_slice(&mux2_command.to_be_bytes());
        fs::write(&self.spi_path, transaction).map_err(|source| UhcError::Gpio {
            path: self.spi_path.display().to_string(),
            source,
        })?;
        std::thread::sleep(std::time::Duration::from_micros(10));
        Ok(())
    }

    fn read_counts(&mut self, ain_bus: u8) -> Result<u16, UhcError> {
        let path = &self.adc_paths[ain_bus as usize & 1];
        let contents = fs::read_to_string(path).map_err(|source| UhcError::Gpio {
            path: path.display().to_string(),
            source,
        })?;
        contents.trim().parse::<u16>().map_err(|_| UhcError::Gpio {
            path: path.display().to_string(),
            source: io::Error::new(io::ErrorKind::InvalidData, "non-numeric ADC reading"),
        })
    }
}

/// Real power-meter IC reader, backed by two iio sysfs scalar files.
pub struct SysfsPowerMeter {
    voltage_path: PathBuf,
    current_path: PathBuf,
}

impl SysfsPowerMeter {
    pub fn new(voltage_path: impl Into<PathBuf>, current_path: impl Into<PathBuf>) -> Self {
        Self {
            voltage_path: voltage_path.into(),
            current_path: current_path.into(),
        }
    }

    fn read_scalar(path: &PathBuf) -> Result<f32, UhcError> {
        let contents = fs::read_to_string(path).map_err(|source| UhcError::Gpio {
            path: path.display().to_string(),
            source,
        })?;
        contents.trim().parse::<f32>().map_err(|_| UhcError::Gpio {
            path: path.display().to_string(),
            source: io::Error::new(io::ErrorKind::InvalidData, "non-numeric power meter reading"),
        })
    }
}

impl PowerMeter for SysfsPowerMeter {
    fn read_rms_voltage(&mut self) -> Result<f32, UhcError> {
        Self::read_scalar(&self.voltage_path)
    }

    fn read_rms_current(&mut self) -> Result<f32, UhcError> {
        Self::read_scalar(&self.current_path)
    }
}

/// Reads the three board-ID GPIO bits and returns the hardware revision
/// they encode.
pub fn read_hardware_revision(bits: &mut [Box<dyn DigitalInput>; 3]) -> Result<u8, UhcError> {
    let mut revision = 0u8;
    for (i, bit) in bits.iter_mut().enumerate() {
        if bit.read()? {
            revision |= 1 << i;
        }
    }
    Ok(revision)
}

pub mod mock {
    //! In-memory stand-ins for bench testing and `--mock-hw`, grounded in
    //! the teacher's `run_mock_mcu`.
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub struct MockOutput {
        pub state: bool,
    }

    impl DigitalOutput for MockOutput {
        fn set(&mut self, on: bool) -> Result<(), UhcError> {
            self.state = on;
            Ok(())
        }
    }

    pub struct MockInput {
        pub value: bool,
    }

    impl DigitalInput for MockInput {
        fn read(&mut self) -> Result<bool, UhcError> {
            Ok(self.value)
        }
    }

    /// A scripted mux/ADC bus: the test harness pushes the counts it wants
    /// the next `read_counts` call to return, per ADC bus.
    #[derive(Default)]
    pub struct MockMuxAdcBus {
        pub queued_counts: [VecDeque<u16>; 2],
        pub last_program: Option<(u16, u16)>,
    }

    impl MuxAdcBus for MockMuxAdcBus {
        fn program(&mut self, mux1_command: u16, mux2_command: u16) -> Result<(), UhcError> {
            self.last_program = Some((mux1_command, mux2_command));
            Ok(())
        }

        fn read_counts(&mut self, ain_bus: u8) -> Result<u16, UhcError> {
            Ok(self.queued_counts[ain_bus as usize & 1].pop_front().unwrap_or(2048))
        }
    }

    pub struct MockPowerMeter {
        pub voltage: f32,
        pub current: f32,
    }

    impl PowerMeter for MockPowerMeter {
        fn read_rms_voltage(&mut self) -> Result<f32, UhcError> {
            Ok(self.voltage)
        }

        fn read_rms_current(&mut self) -> Result<f32, UhcError> {
            Ok(self.current)
        }
    }
}
