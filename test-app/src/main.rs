// dxlbus test application -- CLI tool for exercising a motor bus against
// real hardware or a mock transport.
//
// Usage:
//   dxlbus-test-app --port /dev/ttyUSB0 discover
//   dxlbus-test-app --port /dev/ttyUSB0 --ids 1,2 torque set 1
//   dxlbus-test-app --port /dev/ttyUSB0 --ids 1,2 position set 1024 3072
//   dxlbus-test-app --port /dev/ttyUSB0 --ids 3 --model XL320 ram get PresentTemperature
//   dxlbus-test-app --config-dir ./config eeprom dump
//   dxlbus-test-app --mock discover
//   dxlbus-test-app models

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use dxlbus::dynamixel::instructions::cmd_broadcast_ping;
use dxlbus::dynamixel::packet::{INST_STATUS, encode_packet};
use dxlbus::dynamixel::{BusBuilder, BusConfig, MotorController, model_tag_for_number};
use dxlbus::transport::SerialTransport;
use dxlbus::{Area, MotorId, ProtocolVersion};
use dxlbus_test_harness::MockTransport;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// dxlbus test application -- drives motors from the command line.
#[derive(Parser)]
#[command(name = "dxlbus-test-app", version, about)]
struct Cli {
    /// Serial port path (e.g. /dev/ttyUSB0, COM3).
    /// Required unless --mock or --config-dir supplies one.
    #[arg(long)]
    port: Option<String>,

    /// Baud rate (default: 57600, or the configured value).
    #[arg(long)]
    baud: Option<u32>,

    /// Protocol version. Only 2.0 is supported.
    #[arg(long)]
    protocol: Option<ProtocolVersion>,

    /// Directory holding comm.csv and optionally motors.csv.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Target motor IDs, comma separated. Defaults to every known motor,
    /// discovering first if none are configured.
    #[arg(long, value_delimiter = ',')]
    ids: Vec<MotorId>,

    /// Register the --ids motors as this model instead of discovering.
    #[arg(long, requires = "ids")]
    model: Option<String>,

    /// Use a mock transport instead of a real serial port. The mock
    /// answers discovery with a single X-series motor at ID 1.
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the bus and list every motor that answers.
    Discover,

    /// List model tags with a register map.
    Models,

    /// Torque enable.
    Torque {
        #[command(subcommand)]
        action: TorqueAction,
    },

    /// Present and goal position.
    Position {
        #[command(subcommand)]
        action: PositionAction,
    },

    /// Goal velocity.
    Velocity {
        #[command(subcommand)]
        action: VelocityAction,
    },

    /// EEPROM registers (persistent configuration).
    Eeprom {
        #[command(subcommand)]
        action: RegisterAction,
    },

    /// RAM registers (runtime state).
    Ram {
        #[command(subcommand)]
        action: RegisterAction,
    },
}

#[derive(Subcommand)]
enum TorqueAction {
    /// Read torque enable state.
    Get,
    /// Set torque enable. One value per motor, or one value for all.
    Set {
        #[arg(required = true)]
        values: Vec<String>,
    },
}

#[derive(Subcommand)]
enum PositionAction {
    /// Read present position.
    Get,
    /// Write goal position. One value per motor, or one value for all.
    Set {
        #[arg(required = true, allow_hyphen_values = true)]
        values: Vec<String>,
    },
}

#[derive(Subcommand)]
enum VelocityAction {
    /// Write goal velocity. Negative values reverse direction.
    Set {
        #[arg(required = true, allow_hyphen_values = true)]
        values: Vec<String>,
    },
}

#[derive(Subcommand)]
enum RegisterAction {
    /// Read one register by name (e.g. ReturnDelayTime).
    Get { field: String },
    /// Write one register. One value per motor, or one value for all.
    Set {
        field: String,
        #[arg(required = true, allow_hyphen_values = true)]
        values: Vec<String>,
    },
    /// Read every register of the area.
    Dump,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Repeat a single value across every target motor.
fn expand_values(values: &[String], count: usize) -> Vec<String> {
    match values {
        [single] => vec![single.clone(); count],
        _ => values.to_vec(),
    }
}

/// Transport for --mock: answers one broadcast ping as an XL430-W250 at ID 1.
fn mock_transport() -> MockTransport {
    let mock = MockTransport::new();
    let reply = encode_packet(1, INST_STATUS, &[0x00, 0x24, 0x04, 0x26]);
    mock.expect(&cmd_broadcast_ping(), &reply);
    mock
}

async fn create_controller(cli: &Cli) -> Result<MotorController> {
    let mut builder = match &cli.config_dir {
        Some(dir) => {
            let config = BusConfig::load(dir)
                .with_context(|| format!("failed to load configuration from {}", dir.display()))?;
            BusBuilder::from_config(&config)
        }
        None => BusBuilder::new(),
    };

    if let Some(port) = &cli.port {
        builder = builder.serial_port(port);
    }
    if let Some(baud) = cli.baud {
        builder = builder.baud_rate(baud);
    }
    if let Some(protocol) = cli.protocol {
        builder = builder.protocol(protocol);
    }
    if let Some(model) = &cli.model {
        for id in &cli.ids {
            builder = builder.motor(*id, model);
        }
    }

    if cli.mock {
        if cli.port.is_none() && cli.config_dir.is_none() {
            builder = builder.serial_port("mock");
        }
        let controller = builder
            .build_with_transport(Box::new(mock_transport()))
            .await
            .context("failed to open bus with mock transport")?;
        println!("Connected (mock transport)");
        Ok(controller)
    } else {
        if cli.port.is_none() && cli.config_dir.is_none() {
            bail!("--port is required when not using --mock or --config-dir");
        }
        let controller = builder
            .build_with_transport(Box::new(SerialTransport::new()))
            .await
            .context("failed to open serial bus")?;
        if let Some(baud) = controller.bus().baud_rate() {
            println!("Connected at {baud} baud");
        }
        Ok(controller)
    }
}

/// Motors a command applies to: --ids if given, otherwise every known
/// motor, discovering first when the directory is empty.
async fn target_ids(controller: &MotorController, cli: &Cli) -> Result<Vec<MotorId>> {
    if !cli.ids.is_empty() {
        return Ok(cli.ids.clone());
    }
    let known = controller.motor_ids().await;
    if !known.is_empty() {
        return Ok(known);
    }
    debug!("no motors configured, discovering");
    let report = controller.discover_motors().await?;
    if report.found.is_empty() {
        bail!("no motors found on the bus");
    }
    Ok(report.found)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_models() -> Result<()> {
    println!("Supported models:");
    for model in dxlbus::supported_models() {
        println!("  {model}");
    }
    Ok(())
}

async fn cmd_discover(controller: &MotorController) -> Result<()> {
    let report = controller.discover_motors().await?;

    if report.found.is_empty() && report.skipped.is_empty() {
        println!("No motors answered.");
        return Ok(());
    }

    println!("{:<4}  {:<12}  {:>6}  {:>8}", "ID", "Model", "Number", "Firmware");
    println!("{}", "-".repeat(36));
    for motor in controller.motors().await {
        let (number, firmware) = match motor.info() {
            Some(info) => (info.model_number.to_string(), info.firmware.to_string()),
            None => ("-".into(), "-".into()),
        };
        println!(
            "{:<4}  {:<12}  {:>6}  {:>8}",
            motor.id(),
            motor.model(),
            number,
            firmware
        );
    }
    for skipped in &report.skipped {
        let family = model_tag_for_number(skipped.model_number).unwrap_or("unknown");
        println!(
            "{:<4}  {:<12}  {:>6}  skipped: {}",
            skipped.id, family, skipped.model_number, skipped.reason
        );
    }
    println!();
    println!("{} motor(s) found", report.found.len());
    Ok(())
}

async fn cmd_torque(controller: &MotorController, ids: &[MotorId], action: &TorqueAction) -> Result<()> {
    match action {
        TorqueAction::Get => {
            for (id, enabled) in controller.read_torque(ids).await? {
                println!("{id}: torque {}", if enabled { "on" } else { "off" });
            }
        }
        TorqueAction::Set { values } => {
            let values = expand_values(values, ids.len());
            for (id, value) in controller.write_torque(ids, &values).await? {
                println!("{id}: torque set to {value}");
            }
        }
    }
    Ok(())
}

async fn cmd_position(
    controller: &MotorController,
    ids: &[MotorId],
    action: &PositionAction,
) -> Result<()> {
    match action {
        PositionAction::Get => {
            for (id, position) in controller.read_position(ids).await? {
                println!("{id}: {position}");
            }
        }
        PositionAction::Set { values } => {
            let values = expand_values(values, ids.len());
            for (id, value) in controller.write_goal_position(ids, &values).await? {
                println!("{id}: goal position {}", value.to_signed());
            }
        }
    }
    Ok(())
}

async fn cmd_velocity(
    controller: &MotorController,
    ids: &[MotorId],
    action: &VelocityAction,
) -> Result<()> {
    let VelocityAction::Set { values } = action;
    let values = expand_values(values, ids.len());
    for (id, value) in controller.write_goal_velocity(ids, &values).await? {
        println!("{id}: goal velocity {}", value.to_signed());
    }
    Ok(())
}

async fn cmd_registers(
    controller: &MotorController,
    ids: &[MotorId],
    area: Area,
    action: &RegisterAction,
) -> Result<()> {
    match action {
        RegisterAction::Get { field } => {
            let values = match area {
                Area::Eeprom => controller.read_eeprom(ids, field).await?,
                Area::Ram => controller.read_ram(ids, field).await?,
            };
            for (id, value) in values {
                println!("{id}: {field} = {value}");
            }
        }
        RegisterAction::Set { field, values } => {
            let values = expand_values(values, ids.len());
            let written = match area {
                Area::Eeprom => controller.write_eeprom(ids, field, &values).await?,
                Area::Ram => controller.write_ram(ids, field, &values).await?,
            };
            for (id, value) in written {
                println!("{id}: {field} set to {value}");
            }
        }
        RegisterAction::Dump => {
            for (id, readings) in controller.snapshot(ids, area).await? {
                println!("Motor {id} ({area})");
                println!("  {:<22}  {:>4}  {:>5}  {:<3}  {:>11}", "Register", "Addr", "Bytes", "Acc", "Value");
                for reading in readings {
                    println!(
                        "  {:<22}  {:>4}  {:>5}  {:<3}  {:>11}",
                        reading.name,
                        reading.descriptor.address,
                        reading.descriptor.width.bytes(),
                        reading.descriptor.access,
                        reading.value
                    );
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // The `models` command does not require a bus connection.
    if matches!(&cli.command, Command::Models) {
        return cmd_models();
    }

    let controller = create_controller(&cli).await?;

    let result = match &cli.command {
        Command::Discover => cmd_discover(&controller).await,
        Command::Models => unreachable!("models handled above"),
        command => {
            let ids = target_ids(&controller, &cli).await?;
            match command {
                Command::Torque { action } => cmd_torque(&controller, &ids, action).await,
                Command::Position { action } => cmd_position(&controller, &ids, action).await,
                Command::Velocity { action } => cmd_velocity(&controller, &ids, action).await,
                Command::Eeprom { action } => {
                    cmd_registers(&controller, &ids, Area::Eeprom, action).await
                }
                Command::Ram { action } => cmd_registers(&controller, &ids, Area::Ram, action).await,
                Command::Discover | Command::Models => unreachable!("handled above"),
            }
        }
    };

    controller.bus().close().await.ok();
    result
}
