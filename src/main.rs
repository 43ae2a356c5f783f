//! # spim_daq CLI
//!
//! - `compile` - compile acquisition parameters and print the logic program
//!   and scan settings as JSON
//! - `simulate` - run a full acquisition against the simulated rig
//! - `config` - print the effective configuration (file plus `SPIM_` overrides)

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use spim_daq::config::RigConfig;
use spim_daq::core::AcquisitionParameters;
use spim_daq::hardware::mock::{FaultPlan, SimulatedCamera, SimulatedRig};
use spim_daq::timing::{LogicProgram, ScanParameters, TimingProgramCompiler};
use spim_daq::{logging, AcquisitionError, AcquisitionSupervisor};

/// Light-sheet acquisition engine
#[derive(Parser, Debug)]
#[command(
    name = "spim_daq",
    author,
    version,
    about = "Hardware-synchronized light-sheet acquisition engine"
)]
struct Cli {
    /// Rig configuration file (TOML)
    #[arg(short, long, default_value = "config/rig.toml", global = true)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile parameters and print the timing program as JSON
    Compile(ScanArgs),

    /// Run an acquisition against the simulated rig
    Simulate(SimulateArgs),

    /// Print the effective configuration as TOML
    Config,
}

/// Acquisition parameters shared by both commands
#[derive(Args, Debug, Clone)]
struct ScanArgs {
    /// Z-slices per volume
    #[arg(long, default_value = "10")]
    slices: u32,

    /// Slice spacing in microns
    #[arg(long, default_value = "1.0")]
    step: f64,

    /// Laser pulse width in milliseconds
    #[arg(long, default_value = "10.0")]
    pulse: f64,

    /// Camera exposure in milliseconds
    #[arg(long, default_value = "10.0")]
    exposure: f64,

    /// Volumes to acquire
    #[arg(long, default_value = "1")]
    timepoints: u32,

    /// Interval between volume starts in seconds
    #[arg(long, default_value = "0.0")]
    interval: f64,

    /// Piezo centre position in microns
    #[arg(long, default_value = "0.0")]
    center: f64,

    /// Camera overlap mode
    #[arg(long)]
    overlap: bool,
}

impl ScanArgs {
    fn parameters(&self) -> AcquisitionParameters {
        AcquisitionParameters {
            num_slices: self.slices,
            step_size_um: self.step,
            laser_pulse_ms: self.pulse,
            camera_exposure_ms: self.exposure,
            num_timepoints: self.timepoints,
            timepoint_interval_s: self.interval,
            piezo_center_um: self.center,
            overlap_mode: self.overlap,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct SimulateArgs {
    #[command(flatten)]
    scan: ScanArgs,

    /// Simulated frame period in milliseconds
    #[arg(long, default_value = "5")]
    frame_period_ms: u64,

    /// Simulated sensor width in pixels
    #[arg(long, default_value = "64")]
    width: u32,

    /// Simulated sensor height in pixels
    #[arg(long, default_value = "64")]
    height: u32,

    /// Stop the camera sequence after this many frames
    #[arg(long)]
    stop_after: Option<u32>,

    /// Stall the camera after this many frames
    #[arg(long)]
    stall_after: Option<u32>,

    /// Cancel the run after this many frames
    #[arg(long)]
    cancel_after: Option<u32>,
}

#[derive(Serialize)]
struct CompiledOutput {
    program: LogicProgram,
    scan: ScanParameters,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = RigConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.application.log_level);
    logging::init(level, cli.json || config.application.json_logs)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        rig = %config.application.name,
        "spim_daq starting"
    );

    match cli.command {
        Commands::Compile(args) => compile(&config, &args),
        Commands::Simulate(args) => simulate(&config, &args).await,
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn compile(config: &RigConfig, args: &ScanArgs) -> Result<()> {
    let compiler = TimingProgramCompiler::new(config.logic.clone(), config.scan.clone());
    let (program, scan) = compiler.compile(&args.parameters(), &config.calibration)?;
    let output = serde_json::to_string_pretty(&CompiledOutput { program, scan })?;
    println!("{}", output);
    Ok(())
}

async fn simulate(config: &RigConfig, args: &SimulateArgs) -> Result<()> {
    let camera = SimulatedCamera::new(
        args.width,
        args.height,
        Duration::from_millis(args.frame_period_ms),
    )
    .with_faults(FaultPlan {
        stop_after: args.stop_after,
        stall_after: args.stall_after,
        fail_pop_at: None,
    });
    let rig = Arc::new(SimulatedRig::new(config.devices.clone(), camera));
    let supervisor = AcquisitionSupervisor::new(rig.handle(), config);

    let mut handle = supervisor.run(args.scan.parameters()).await?;
    let expected = handle.images_expected();
    info!(session = %handle.session_id(), expected, "Simulated acquisition started");

    while let Some(frame) = handle.next_frame().await {
        debug!(
            index = frame.frame_index,
            timepoint = frame.event.timepoint,
            z = frame.event.z_index,
            channel = frame.event.channel,
            "Frame received"
        );
        let received = frame.frame_index + 1;
        info!(received, expected, "Progress");
        if args.cancel_after == Some(received) {
            handle.cancel();
        }
    }

    match handle.wait().await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(AcquisitionError::Cancelled { collected, expected }) => {
            warn!(collected, expected, "Acquisition cancelled");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
