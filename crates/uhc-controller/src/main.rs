//! Controller firmware entry point: parses the CLI, loads configuration,
//! builds shared state, and spawns one thread per responsibility, following
//! the teacher's component-spawning shape in `klipper-host/src/main.rs` --
//! adapted from tokio tasks to OS threads per the concurrency model this
//! firmware uses (spec.md §5: self-correcting 1 Hz loops, no async runtime).

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

use uhc_controller::{bus, config, constants, fault_log, gpio, liveness, reconciler, scanner, state, state_publisher, supervisor};

use bus::messages::{CommandEnvelope, FirmwareUpdateMessage, FirmwareUpdateResponse, FirmwareUpdateResult, GuiId, HeartbeatMessage, ResponseMessage, TimeSyncMessage};
use bus::publisher::Publisher;
use bus::subscriber::run_subscriber;
use config::{load_calibration_tables, BootConfig, Cli};
use constants::{FAN_COUNT, HEATER_COUNT};
use fault_log::{spawn_fault_log_channel, FaultLogConsumer};
use gpio::mock::{MockInput, MockMuxAdcBus, MockOutput, MockPowerMeter};
use gpio::{DigitalInput, DigitalOutput, MuxAdcBus, PowerMeter, SpiMuxAdcBus, SysfsInput, SysfsOutput, SysfsPowerMeter};
use liveness::LivenessMonitor;
use reconciler::{touch_gui_liveness, Reconciler};
use scanner::Scanner;
use state::SystemState;
use state_publisher::StatePublisher;
use supervisor::Supervisor;

const JOIN_DEADLINE: Duration = Duration::from_secs(3);

fn main() -> Result<()> {
    let filter_handle = init_logging();

    let cli = Cli::parse();
    let config = BootConfig::load(&cli).context("loading boot configuration")?;

    info!(controller_ip = %config.controller_ip, gui1 = %config.gui1_ip, gui2 = %config.gui2_ip, mock_hw = config.mock_hw, "starting uhc-controller");

    let shutdown = Arc::new(AtomicBool::new(false));
    register_signal_handlers(shutdown.clone())?;
    let sentinel_poller = spawn_debug_sentinel_poller(filter_handle, shutdown.clone());

    let hardware_revision = determine_hardware_revision(&config)?;
    let calibration_tables = load_calibration_tables(&cli.config_dir);

    let state = Arc::new(SystemState::new(
        config.serial_number.clone(),
        config.model_number.clone(),
        config.setpoint_low_limit,
        config.setpoint_high_limit,
        hardware_revision,
    ));
    {
        let mut guard = state.write();
        for (channel, table) in guard.channels.iter_mut().zip(calibration_tables.into_iter()) {
            channel.calibration = table;
        }
    }

    let (fault_log, fault_log_rx) = spawn_fault_log_channel();

    let mut handles = Vec::new();
    handles.push(sentinel_poller);

    handles.push(
        std::thread::Builder::new()
            .name("fault-log".into())
            .spawn({
                let consumer = FaultLogConsumer::new(fault_log_rx, config.log_dir.clone(), config.model_number.clone(), env!("CARGO_PKG_VERSION").to_string());
                move || consumer.run()
            })
            .context("spawning fault log consumer thread")?,
    );

    handles.push(
        std::thread::Builder::new()
            .name("scanner".into())
            .spawn({
                let scanner = Scanner::new(state.clone(), build_mux_bus(&config), build_power_meter(&config), fault_log.clone(), shutdown.clone());
                move || scanner.run()
            })
            .context("spawning scanner thread")?,
    );

    handles.push(
        std::thread::Builder::new()
            .name("supervisor".into())
            .spawn({
                let supervisor = Supervisor::new(state.clone(), build_heater_outputs(&config), fault_log.clone(), shutdown.clone());
                move || supervisor.run()
            })
            .context("spawning supervisor thread")?,
    );

    handles.push(
        std::thread::Builder::new()
            .name("liveness".into())
            .spawn({
                let monitor = LivenessMonitor::new(
                    state.clone(),
                    build_fan_tach_inputs(&config),
                    build_fan_overcurrent_inputs(&config),
                    build_fan_outputs(&config),
                    build_ethernet_link_input(&config),
                    fault_log.clone(),
                    shutdown.clone(),
                );
                move || monitor.run()
            })
            .context("spawning liveness thread")?,
    );

    let css_publisher = Publisher::bind(bus::messages::TOPIC_CSS, &format!("{}:{}", config.controller_ip, bus::PORT_CSS), shutdown.clone())
        .with_context(|| format!("binding CSS publisher on {}", config.controller_ip))?;
    let rtd_publisher = Publisher::bind(bus::messages::TOPIC_RTD, &format!("{}:{}", config.controller_ip, bus::PORT_RTD), shutdown.clone())
        .with_context(|| format!("binding RTD publisher on {}", config.controller_ip))?;
    handles.push(
        std::thread::Builder::new()
            .name("state-publisher".into())
            .spawn({
                let publisher = StatePublisher::new(state.clone(), css_publisher, rtd_publisher, shutdown.clone());
                move || publisher.run()
            })
            .context("spawning state publisher thread")?,
    );

    for (gui, gui_ip, rsp_port, cmd_port, hb_port, time_port) in [
        (GuiId::Gui1, config.gui1_ip.clone(), bus::PORT_RSP_GUI1, bus::PORT_CMD_GUI1, bus::PORT_HB_GUI1, bus::PORT_TIME_GUI1),
        (GuiId::Gui2, config.gui2_ip.clone(), bus::PORT_RSP_GUI2, bus::PORT_CMD_GUI2, bus::PORT_HB_GUI2, bus::PORT_TIME_GUI2),
    ] {
        let rsp_publisher = Publisher::bind(bus::messages::TOPIC_RSP, &format!("{}:{rsp_port}", config.controller_ip), shutdown.clone())
            .with_context(|| format!("binding RSP publisher for {gui:?}"))?;
        handles.extend(spawn_command_listener(gui, gui_ip.clone(), cmd_port, rsp_publisher, state.clone(), fault_log.clone(), shutdown.clone(), config.config_dir.clone())?);
        handles.extend(spawn_heartbeat_listener(gui, gui_ip.clone(), hb_port, state.clone(), shutdown.clone())?);
        handles.extend(spawn_time_sync_listener(gui, gui_ip.clone(), time_port, state.clone(), shutdown.clone())?);
    }

    let fwrs_publisher = Publisher::bind(bus::messages::TOPIC_FWRS, &format!("{}:{}", config.controller_ip, bus::PORT_FWRS), shutdown.clone())
        .context("binding FWRS publisher")?;
    handles.extend(spawn_firmware_update_listener(config.gui1_ip.clone(), bus::PORT_FWUP_GUI1, fwrs_publisher, shutdown.clone())?);

    wait_for_shutdown(shutdown.clone());
    fault_log.stop();
    join_with_deadline(handles);
    force_off_everything(&config);

    info!("shutdown complete");
    Ok(())
}

fn determine_hardware_revision(config: &BootConfig) -> Result<u8> {
    if config.mock_hw {
        return Ok(1);
    }
    let mut bits: [Box<dyn DigitalInput>; 3] = [
        Box::new(SysfsInput::new("/sys/class/gpio/board_id0")),
        Box::new(SysfsInput::new("/sys/class/gpio/board_id1")),
        Box::new(SysfsInput::new("/sys/class/gpio/board_id2")),
    ];
    gpio::read_hardware_revision(&mut bits).context("reading hardware revision bits")
}

fn build_mux_bus(config: &BootConfig) -> Box<dyn MuxAdcBus> {
    if config.mock_hw {
        Box::new(MockMuxAdcBus::default())
    } else {
        Box::new(SpiMuxAdcBus::new("/dev/spidev0.0", "/sys/bus/iio/devices/iio:device0/in_voltage0_raw", "/sys/bus/iio/devices/iio:device0/in_voltage1_raw"))
    }
}

fn build_power_meter(config: &BootConfig) -> Box<dyn PowerMeter> {
    if config.mock_hw {
        Box::new(MockPowerMeter { voltage: 208.0, current: 10.0 })
    } else {
        Box::new(SysfsPowerMeter::new(
            "/sys/bus/iio/devices/iio:device1/in_voltage_rms",
            "/sys/bus/iio/devices/iio:device1/in_current_rms",
        ))
    }
}

fn build_heater_outputs(config: &BootConfig) -> Vec<Box<dyn DigitalOutput>> {
    (0..HEATER_COUNT)
        .map(|i| -> Box<dyn DigitalOutput> {
            if config.mock_hw {
                Box::new(MockOutput::default())
            } else {
                Box::new(SysfsOutput::new(format!("/sys/class/gpio/heater{i}")))
            }
        })
        .collect()
}

fn build_fan_outputs(config: &BootConfig) -> Vec<Box<dyn DigitalOutput>> {
    (0..FAN_COUNT)
        .map(|i| -> Box<dyn DigitalOutput> {
            if config.mock_hw {
                Box::new(MockOutput::default())
            } else {
                Box::new(SysfsOutput::new(format!("/sys/class/gpio/fan{i}")))
            }
        })
        .collect()
}

fn build_fan_tach_inputs(config: &BootConfig) -> Vec<Box<dyn DigitalInput>> {
    (0..FAN_COUNT)
        .map(|i| -> Box<dyn DigitalInput> {
            if config.mock_hw {
                Box::new(MockInput { value: true })
            } else {
                Box::new(SysfsInput::new(format!("/sys/class/gpio/fan{i}_tach")))
            }
        })
        .collect()
}

fn build_fan_overcurrent_inputs(config: &BootConfig) -> Vec<Box<dyn DigitalInput>> {
    (0..FAN_COUNT)
        .map(|i| -> Box<dyn DigitalInput> {
            if config.mock_hw {
                Box::new(MockInput { value: false })
            } else {
                Box::new(SysfsInput::new(format!("/sys/class/gpio/fan{i}_overcurrent")))
            }
        })
        .collect()
}

fn build_ethernet_link_input(config: &BootConfig) -> Box<dyn DigitalInput> {
    if config.mock_hw {
        Box::new(MockInput { value: true })
    } else {
        Box::new(SysfsInput::new("/sys/class/net/eth0/carrier"))
    }
}

/// Listens for commands from one display unit, reconciles each against
/// shared state, and publishes the result back on that GUI's response
/// topic.
fn spawn_command_listener(
    gui: GuiId,
    gui_ip: String,
    cmd_port: u16,
    rsp_publisher: Publisher,
    state: Arc<SystemState>,
    fault_log: fault_log::FaultLogHandle,
    shutdown: Arc<AtomicBool>,
    config_dir: std::path::PathBuf,
) -> Result<Vec<std::thread::JoinHandle<()>>> {
    let (tx, rx) = crossbeam_channel::unbounded::<CommandEnvelope>();
    let sub_handle = std::thread::Builder::new()
        .name(format!("cmd-sub-{gui:?}"))
        .spawn({
            let shutdown = shutdown.clone();
            move || run_subscriber("CMD", format!("{gui_ip}:{cmd_port}"), tx, shutdown)
        })
        .context("spawning CMD subscriber thread")?;

    let reconcile_handle = std::thread::Builder::new()
        .name(format!("cmd-reconcile-{gui:?}"))
        .spawn(move || {
            let reconciler = Reconciler::new(state, fault_log, config_dir);
            while !shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(envelope) => {
                        let sequence = envelope.sequence;
                        let result = reconciler.handle(&envelope);
                        rsp_publisher.publish(&ResponseMessage { gui, sequence, result });
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .context("spawning command reconciler thread")?;

    Ok(vec![sub_handle, reconcile_handle])
}

fn spawn_heartbeat_listener(gui: GuiId, gui_ip: String, hb_port: u16, state: Arc<SystemState>, shutdown: Arc<AtomicBool>) -> Result<Vec<std::thread::JoinHandle<()>>> {
    let (tx, rx) = crossbeam_channel::unbounded::<HeartbeatMessage>();
    let sub_handle = std::thread::Builder::new()
        .name(format!("hb-sub-{gui:?}"))
        .spawn({
            let shutdown = shutdown.clone();
            move || run_subscriber("HB", format!("{gui_ip}:{hb_port}"), tx, shutdown)
        })
        .context("spawning HB subscriber thread")?;

    let touch_handle = std::thread::Builder::new()
        .name(format!("hb-touch-{gui:?}"))
        .spawn(move || {
            while !shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(_heartbeat) => touch_gui_liveness(&state, gui),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .context("spawning heartbeat touch thread")?;

    Ok(vec![sub_handle, touch_handle])
}

fn spawn_time_sync_listener(gui: GuiId, gui_ip: String, time_port: u16, state: Arc<SystemState>, shutdown: Arc<AtomicBool>) -> Result<Vec<std::thread::JoinHandle<()>>> {
    let (tx, rx) = crossbeam_channel::unbounded::<TimeSyncMessage>();
    let sub_handle = std::thread::Builder::new()
        .name(format!("time-sub-{gui:?}"))
        .spawn({
            let shutdown = shutdown.clone();
            move || run_subscriber("TIME", format!("{gui_ip}:{time_port}"), tx, shutdown)
        })
        .context("spawning TIME subscriber thread")?;

    let touch_handle = std::thread::Builder::new()
        .name(format!("time-touch-{gui:?}"))
        .spawn(move || {
            while !shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(_sync) => touch_gui_liveness(&state, gui),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .context("spawning time sync touch thread")?;

    Ok(vec![sub_handle, touch_handle])
}

/// Firmware package installation is an external collaborator (out of
/// scope); this listener only acknowledges the request on the wire so a
/// GUI never blocks waiting on a reply.
fn spawn_firmware_update_listener(gui1_ip: String, fwup_port: u16, fwrs_publisher: Publisher, shutdown: Arc<AtomicBool>) -> Result<Vec<std::thread::JoinHandle<()>>> {
    let (tx, rx) = crossbeam_channel::unbounded::<FirmwareUpdateMessage>();
    let sub_handle = std::thread::Builder::new()
        .name("fwup-sub".into())
        .spawn({
            let shutdown = shutdown.clone();
            move || run_subscriber("FWUP", format!("{gui1_ip}:{fwup_port}"), tx, shutdown)
        })
        .context("spawning FWUP subscriber thread")?;

    let reject_handle = std::thread::Builder::new()
        .name("fwup-reject".into())
        .spawn(move || {
            while !shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(msg) => {
                        warn!(sequence = msg.sequence, image_url = %msg.image_url, "firmware update requested, installer is out of scope, rejecting");
                        fwrs_publisher.publish(&FirmwareUpdateResponse { sequence: msg.sequence, result: FirmwareUpdateResult::Rejected });
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .context("spawning firmware update responder thread")?;

    Ok(vec![sub_handle, reject_handle])
}

/// Installs the global `tracing` subscriber behind a reloadable
/// `EnvFilter`, so the debug sentinel poller can flip filter directives at
/// runtime without a restart.
fn init_logging() -> reload::Handle<EnvFilter, tracing_subscriber::Registry> {
    let base_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(base_filter);
    tracing_subscriber::registry().with(filter_layer).with(tracing_subscriber::fmt::layer()).init();
    handle
}

/// Debug sentinel files, the idiomatic equivalent of the original's
/// `/tmp/debug*` file-presence checks: touching one raises that module's
/// log level to debug until the file is removed again.
const DEBUG_SENTINELS: &[(&str, &str)] = &[
    ("/tmp/debug", "debug"),
    ("/tmp/debugHeaters", "uhc_controller::supervisor=debug,info"),
    ("/tmp/debugCSS", "uhc_controller::state_publisher=debug,info"),
];

fn spawn_debug_sentinel_poller(handle: reload::Handle<EnvFilter, tracing_subscriber::Registry>, shutdown: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("debug-sentinel-poller".into())
        .spawn(move || {
            let mut active_directive: Option<&'static str> = None;
            while !shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                let wanted = DEBUG_SENTINELS.iter().find(|(path, _)| std::path::Path::new(path).exists()).map(|(_, directive)| *directive);
                if wanted != active_directive {
                    let directive = wanted.unwrap_or("info");
                    if handle.reload(EnvFilter::new(directive)).is_ok() {
                        info!(directive, "debug sentinel changed, reloaded log filter");
                        active_directive = wanted;
                    }
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        })
        .expect("spawn debug sentinel poller thread")
}

fn register_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone()).context("registering SIGTERM handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone()).context("registering SIGINT handler")?;
    Ok(())
}

fn wait_for_shutdown(shutdown: Arc<AtomicBool>) {
    while !shutdown.load(std::sync::atomic::Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
    info!("shutdown signal received, draining workers");
}

/// Gives every worker up to `JOIN_DEADLINE` to notice the shutdown flag and
/// exit cleanly; anything still running past that is abandoned, per
/// spec.md §5's 3-second join deadline.
fn join_with_deadline(handles: Vec<std::thread::JoinHandle<()>>) {
    let deadline = Instant::now() + JOIN_DEADLINE;
    let mut remaining = handles;
    while Instant::now() < deadline && !remaining.is_empty() {
        remaining.retain(|h| !h.is_finished());
        if !remaining.is_empty() {
            std::thread::sleep(Duration::from_millis(50));
        }
    }
    if !remaining.is_empty() {
        warn!(stuck = remaining.len(), "join deadline exceeded, abandoning remaining worker threads");
    }
}

/// Last-resort safety net run after the join deadline: commands every
/// heater and fan off directly, independent of whatever state the worker
/// threads left behind.
fn force_off_everything(config: &BootConfig) {
    for mut output in build_heater_outputs(config) {
        let _ = output.set(false);
    }
    for mut output in build_fan_outputs(config) {
        let _ = output.set(false);
    }
}
