//! migslice CLI
//!
//! Inspect, allocate and exercise MIG partitions on a single device.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use migslice_core::{BackendKind, Config, LoggingConfig, Strategy, WaitMode};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// migslice - hand out isolated slices of a MIG-capable GPU
#[derive(Parser, Debug)]
#[command(name = "migslice")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Native backend
    #[arg(long, value_enum, global = true)]
    backend: Option<BackendArg>,

    /// Device index
    #[arg(long, global = true)]
    device: Option<u32>,

    /// Device family profile table (a100, a30)
    #[arg(long, global = true)]
    family: Option<String>,

    /// Allocation strategy
    #[arg(long, value_enum, global = true)]
    strategy: Option<StrategyArg>,

    /// Behaviour when the device is full
    #[arg(long, value_enum, global = true)]
    wait: Option<WaitArg>,

    /// Upper bound on a blocking wait in milliseconds
    #[arg(long, global = true)]
    wait_timeout_ms: Option<u64>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the slice-count to profile-id table
    Profiles,

    /// Show how many partitions of each size the device can still host
    Capacity,

    /// Allocate partitions, print their CUDA_VISIBLE_DEVICES values, then free them
    Allocate {
        /// Partition sizes in slices
        #[arg(required = true)]
        sizes: Vec<u32>,

        /// Seconds to hold the partitions before freeing them
        #[arg(long, default_value_t = 0)]
        hold_secs: u64,
    },

    /// Try every allocation order of every size combination summing to a total
    Sweep {
        /// Total slices per combination
        #[arg(long)]
        total: u32,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    Simulated,
    Nvml,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Simulated => BackendKind::Simulated,
            BackendArg::Nvml => BackendKind::Nvml,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StrategyArg {
    Isolated,
    Shared,
}

impl From<StrategyArg> for Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Isolated => Strategy::Isolated,
            StrategyArg::Shared => Strategy::Shared,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum WaitArg {
    FailFast,
    Blocking,
}

impl From<WaitArg> for WaitMode {
    fn from(arg: WaitArg) -> Self {
        match arg {
            WaitArg::FailFast => WaitMode::FailFast,
            WaitArg::Blocking => WaitMode::Blocking,
        }
    }
}

impl Cli {
    /// Configuration file (or defaults) with command-line overrides applied
    fn resolve_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(backend) = self.backend {
            config.backend.kind = backend.into();
        }
        if let Some(device) = self.device {
            config.device.index = device;
        }
        if let Some(family) = &self.family {
            config.device.family = family.clone();
            config.device.profile = None;
        }
        if let Some(strategy) = self.strategy {
            config.allocator.strategy = strategy.into();
        }
        if let Some(wait) = self.wait {
            config.allocator.wait = wait.into();
        }
        if self.wait_timeout_ms.is_some() {
            config.allocator.wait_timeout_ms = self.wait_timeout_ms;
        }

        Ok(config)
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;
    init_logging(&config.logging, cli.verbose);

    let session = commands::Session::open(&config)?;

    match cli.command {
        Commands::Profiles => commands::profiles(&session, cli.json)?,
        Commands::Capacity => commands::capacity(&session, cli.json)?,
        Commands::Allocate { sizes, hold_secs } => {
            commands::allocate(&session, &sizes, hold_secs, cli.json)?
        }
        Commands::Sweep { total } => commands::sweep(&session, total, cli.json)?,
    }

    Ok(())
}
