//! `matisse` command-line controller
//!
//! Drives a Matisse ring laser over its serial command link, or an in-process
//! simulator with `--simulate`.
//!
//! # Usage
//!
//! ```bash
//! matisse status --json
//! matisse lock --timeout 60
//! matisse set-wavelength 780.245
//! matisse tune 812.0 --yes
//! matisse --simulate stabilize
//! ```
//!
//! Long-running commands (`lock`, `stabilize`) run until they finish or
//! Ctrl+C is pressed; either way the controller shuts down cleanly, leaving
//! every control loop disabled.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use logging::{LoggingConfig, OutputFormat};
use matisse_control::{LockOutcome, Matisse};
use matisse_core::{ControlLoop, Motor, Piezo, ScanKind, Settings, Transport};
use matisse_driver_mock::SimulatedMatisse;
use matisse_driver_serial::SerialTransport;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser)]
#[command(name = "matisse")]
#[command(about = "Lock acquisition and stabilization control for Matisse lasers", long_about = None)]
struct Cli {
    /// Configuration file (TOML). `MATISSE_*` environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial port, overriding the configuration
    #[arg(long, global = true)]
    port: Option<String>,

    /// Talk to the built-in simulator instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Pretty, global = true)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML
    Config,

    /// Show wavelength, actuator positions, loop state and lock status
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run a lock attempt until it ends or Ctrl+C is pressed
    Lock {
        /// Seconds to wait for the first lock (defaults to the configuration)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Stop lock correction and disable every control loop
    Stop,

    /// Switch one control loop
    Loop {
        /// Loop to switch
        #[arg(value_enum)]
        which: LoopArg,
        /// New state
        #[arg(value_enum)]
        state: Switch,
    },

    /// Keep the laser locked until Ctrl+C is pressed
    Stabilize,

    /// Set the target wavelength
    SetWavelength {
        /// Wavelength in nm
        wavelength: f64,
        /// Skip the confirmation prompt for large changes
        #[arg(long)]
        yes: bool,
    },

    /// Move the birefringent filter to an approximate wavelength
    SetBifiWavelength {
        /// Wavelength in nm
        wavelength: f64,
    },

    /// Move a stepper motor to an absolute position
    SetMotor {
        /// Motor to move
        #[arg(value_enum)]
        motor: MotorArg,
        /// Absolute position in steps
        position: i64,
    },

    /// Move a piezo actuator
    SetPiezo {
        /// Piezo to move
        #[arg(value_enum)]
        piezo: PiezoArg,
        /// New position
        #[arg(allow_negative_numbers = true)]
        position: f64,
    },

    /// Run one coarse tuning sweep
    Scan {
        /// Sweep to run
        #[arg(value_enum)]
        kind: ScanArg,
    },

    /// Set the wavelength, run both sweeps and lock
    Tune {
        /// Wavelength in nm
        wavelength: f64,
        /// Do not start a lock attempt afterwards
        #[arg(long)]
        no_lock: bool,
        /// Skip the confirmation prompt for large changes
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LoopArg {
    SlowPiezo,
    ThinEtalon,
    PiezoEtalon,
    FastPiezo,
}

impl From<LoopArg> for ControlLoop {
    fn from(arg: LoopArg) -> Self {
        match arg {
            LoopArg::SlowPiezo => ControlLoop::SlowPiezo,
            LoopArg::ThinEtalon => ControlLoop::ThinEtalon,
            LoopArg::PiezoEtalon => ControlLoop::PiezoEtalon,
            LoopArg::FastPiezo => ControlLoop::FastPiezo,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MotorArg {
    Bifi,
    ThinEtalon,
}

impl From<MotorArg> for Motor {
    fn from(arg: MotorArg) -> Self {
        match arg {
            MotorArg::Bifi => Motor::BirefringentFilter,
            MotorArg::ThinEtalon => Motor::ThinEtalon,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PiezoArg {
    PiezoEtalon,
    SlowPiezo,
    RefCell,
}

impl From<PiezoArg> for Piezo {
    fn from(arg: PiezoArg) -> Self {
        match arg {
            PiezoArg::PiezoEtalon => Piezo::PiezoEtalon,
            PiezoArg::SlowPiezo => Piezo::SlowPiezo,
            PiezoArg::RefCell => Piezo::RefCell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScanArg {
    Bifi,
    ThinEtalon,
}

impl From<ScanArg> for ScanKind {
    fn from(arg: ScanArg) -> Self {
        match arg {
            ScanArg::Bifi => ScanKind::BirefringentFilter,
            ScanArg::ThinEtalon => ScanKind::ThinEtalon,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(port) = &cli.port {
        settings.connection.port = port.clone();
    }
    let logging =
        LoggingConfig::from_settings(&settings, cli.log_format).map_err(anyhow::Error::msg)?;
    logging::init(&logging).map_err(anyhow::Error::msg)?;

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&settings)?);
        return Ok(());
    }

    let transport = open_transport(&settings, cli.simulate).await?;
    let matisse = Matisse::connect(transport, settings).await?;

    // One-shot commands leave the loops as they are; commands that supervise
    // the lock hand the laser back with every loop disabled.
    let supervises_lock = matches!(
        cli.command,
        Commands::Lock { .. } | Commands::Stabilize | Commands::Tune { .. }
    );
    let result = run(&matisse, cli.command).await;
    let shutdown = if supervises_lock {
        matisse.shutdown().await
    } else {
        matisse.stop_operations().await;
        Ok(())
    };
    result?;
    shutdown?;
    Ok(())
}

async fn open_transport(settings: &Settings, simulate: bool) -> Result<Box<dyn Transport>> {
    if simulate {
        info!("Using simulated Matisse");
        let sim = SimulatedMatisse::new().with_noise(0.002, 0x5eed);
        sim.lock_when_engaged(Duration::from_secs(3));
        return Ok(sim.transport());
    }
    let connection = &settings.connection;
    let transport =
        SerialTransport::open(&connection.port, connection.baud_rate, connection.timeout)
            .await
            .with_context(|| format!("Can't reach Matisse on {}", connection.port))?;
    Ok(Box::new(transport))
}

async fn run(matisse: &Matisse, command: Commands) -> Result<()> {
    match command {
        Commands::Config => {}
        Commands::Status { json } => print_status(matisse, json).await?,
        Commands::Lock { timeout } => lock(matisse, timeout.map(Duration::from_secs)).await?,
        Commands::Stop => {
            let outcome = matisse.stop_laser_lock_correction().await?;
            println!("Control loops stopped ({})", describe(outcome));
        }
        Commands::Loop { which, state } => {
            matisse
                .set_loop(which.into(), state == Switch::On)
                .await?;
        }
        Commands::Stabilize => {
            matisse.stabilize_on();
            println!("Automatic stabilization on; press Ctrl+C to stop.");
            tokio::signal::ctrl_c().await?;
            println!("\nShutdown signal received, cleaning up...");
        }
        Commands::SetWavelength { wavelength, yes } => {
            if confirm_wavelength(matisse, wavelength, yes).await? {
                matisse.set_wavelength(wavelength).await?;
            }
        }
        Commands::SetBifiWavelength { wavelength } => {
            matisse.set_bifi_wavelength(wavelength).await?;
        }
        Commands::SetMotor { motor, position } => {
            matisse.set_motor_position(motor.into(), position).await?;
        }
        Commands::SetPiezo { piezo, position } => {
            matisse.set_piezo_position(piezo.into(), position).await?;
        }
        Commands::Scan { kind } => {
            let report = matisse.start_scan(kind.into())?.wait().await?;
            println!(
                "{}: {} -> {} ({} samples)",
                report.kind, report.start_position, report.chosen_position, report.samples
            );
        }
        Commands::Tune {
            wavelength,
            no_lock,
            yes,
        } => {
            if confirm_wavelength(matisse, wavelength, yes).await? {
                let report = matisse.tune_to_wavelength(wavelength, !no_lock).await?;
                println!(
                    "BiFi at {}, thin etalon at {}",
                    report.bifi.chosen_position, report.thin_etalon.chosen_position
                );
                if let Some(handle) = report.lock {
                    wait_for_lock(matisse, handle).await?;
                }
            }
        }
    }
    Ok(())
}

async fn print_status(matisse: &Matisse, json: bool) -> Result<()> {
    let status = matisse.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("BiFi wavelength:  {:.3} nm", status.bifi_wavelength_nm);
    match status.target_wavelength_nm {
        Some(target) => println!("Target:           {:.3} nm", target),
        None => println!("Target:           (not set)"),
    }
    println!("BiFi motor:       {}", status.bifi_motor);
    println!("Thin etalon:      {}", status.thin_etalon_motor);
    println!("Piezo etalon:     {:.4}", status.piezo_etalon);
    println!("Slow piezo:       {:.4}", status.slow_piezo);
    println!("Reference cell:   {:.4}", status.refcell);
    println!("Locked:           {}", status.locked);
    let at_limit = status.limits.at_limit();
    if !at_limit.is_empty() {
        let names: Vec<String> = at_limit.iter().map(ToString::to_string).collect();
        println!("At limit:         {}", names.join(", "));
    }
    for control_loop in ControlLoop::ALL {
        let state = if status.loops.get(control_loop) { "on" } else { "off" };
        println!("{:<18}{}", format!("{} loop:", control_loop), state);
    }
    Ok(())
}

async fn lock(matisse: &Matisse, timeout: Option<Duration>) -> Result<()> {
    let handle = matisse.start_laser_lock_correction(timeout)?;
    wait_for_lock(matisse, handle).await
}

async fn wait_for_lock(matisse: &Matisse, handle: matisse_control::LockHandle) -> Result<()> {
    println!("Lock attempt running; press Ctrl+C to stop.");
    let stopper = handle.stopper();
    tokio::select! {
        outcome = handle.wait() => {
            let outcome = outcome?;
            println!("Lock attempt ended: {}", describe(Some(outcome)));
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            println!("\nShutdown signal received, cleaning up...");
            stopper.stop();
            let outcome = matisse.stop_laser_lock_correction().await?;
            println!("Lock attempt ended: {}", describe(outcome));
        }
    }
    Ok(())
}

async fn confirm_wavelength(matisse: &Matisse, wavelength: f64, yes: bool) -> Result<bool> {
    if yes || !matisse.needs_confirmation(wavelength).await? {
        return Ok(true);
    }
    let threshold = matisse.settings().wavelength.confirm_threshold_nm;
    println!(
        "The requested wavelength differs from the current one by at least {} nm.",
        threshold
    );
    println!("Change wavelength to {} nm? [y/N]", wavelength);

    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await?;
    if is_affirmative(&answer) {
        Ok(true)
    } else {
        println!("Wavelength left unchanged.");
        Ok(false)
    }
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn describe(outcome: Option<LockOutcome>) -> String {
    match outcome {
        None => "no attempt was running".to_string(),
        Some(LockOutcome::Locked { corrections }) => {
            format!("locked ({} automatic corrections)", corrections)
        }
        Some(LockOutcome::TimedOut) => "timed out; control loops left on".to_string(),
        Some(LockOutcome::LimitBeforeLock) => {
            "an actuator hit its limit before locking; control loops stopped".to_string()
        }
        Some(LockOutcome::Cancelled) => "cancelled".to_string(),
        Some(LockOutcome::LimitAfterLockLost) => {
            "lock lost with an actuator at its limit; control loops stopped".to_string()
        }
    }
}
