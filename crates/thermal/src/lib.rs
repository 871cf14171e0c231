//! Calibration and safety primitives shared by the sensor scanner and the
//! heater supervisor.
//!
//! This crate is deliberately free of any I/O: it knows how to turn raw ADC
//! counts into a temperature and how to decide whether a temperature trace
//! has been out of bounds for too long, but it never touches a file, a SPI
//! bus, or a clock. Callers supply "now" as a plain integer count of elapsed
//! scans so the state machines here stay trivially testable.

pub mod latch;
pub mod thermistor;

pub use latch::{AbsoluteTempLatch, ConsecutiveCounter, HeaterTempLatch};
pub use thermistor::{CalibrationTable, Classification, TableError};
