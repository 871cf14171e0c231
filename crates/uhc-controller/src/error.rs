//! Typed errors for the controller library surface. `main` and the thread
//! entry points wrap these with `anyhow::Context` rather than matching on
//! them, following the teacher's `klipper-proto`/`klipper-host` split.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UhcError {
    #[error("calibration table for channel {channel}: {source}")]
    Calibration {
        channel: usize,
        #[source]
        source: thermal::TableError,
    },

    #[error("config file {path}: {reason}")]
    Config { path: String, reason: String },

    #[error("gpio {path}: {source}")]
    Gpio {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bus codec: {0}")]
    Codec(String),

    #[error("bus io: {0}")]
    BusIo(#[from] std::io::Error),

    #[error("command payload malformed: {0}")]
    MalformedCommand(#[from] serde_json::Error),
}
