// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "tof-capture")]
#[command(about = "Capture and board tools for time-of-flight depth cameras")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    /// Config file (default: ~/.config/tof-capture/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Devices as `capture;control`, overriding the config file
    #[arg(long, global = true)]
    driver_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the supported frame types
    FrameTypes,

    /// Capture frames and write them as little-endian 16-bit samples
    Capture {
        /// Frame type ("depth_ir" or "raw")
        #[arg(short, long, default_value = "depth_ir")]
        frame_type: String,

        /// Number of frames to capture
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,

        /// Output file (default: frames_TIMESTAMP.bin)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Use the simulated device instead of hardware
        #[arg(long = "virtual")]
        virtual_device: bool,
    },

    /// Program the AFE with a firmware file
    Program {
        /// Firmware file
        firmware: PathBuf,
    },

    /// Read AFE registers (hex addresses)
    ReadRegisters {
        #[arg(required = true)]
        addresses: Vec<String>,
    },

    /// Write AFE registers given as ADDR=VALUE (hex)
    WriteRegisters {
        #[arg(required = true)]
        writes: Vec<String>,
    },

    /// Read bytes from the calibration EEPROM
    EepromRead {
        /// Start address (decimal or 0x hex)
        address: String,
        /// Number of bytes
        length: usize,
    },

    /// Write hex bytes to the calibration EEPROM
    EepromWrite {
        /// Start address (decimal or 0x hex)
        address: String,
        /// Bytes as a hex string, e.g. "deadbeef"
        data: String,
    },

    /// Read the AFE and laser temperatures
    Temperature,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set RUST_LOG to control the log level, e.g. RUST_LOG=tof_capture=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let config = cli::load_config(cli.config.as_deref(), cli.driver_path.as_deref())?;

    match cli.command {
        Commands::FrameTypes => cli::list_frame_types(),
        Commands::Capture {
            frame_type,
            count,
            output,
            virtual_device,
        } => cli::capture(&config, &frame_type, count, output, virtual_device),
        Commands::Program { firmware } => cli::program(&config, &firmware),
        Commands::ReadRegisters { addresses } => cli::read_registers(&config, &addresses),
        Commands::WriteRegisters { writes } => cli::write_registers(&config, &writes),
        Commands::EepromRead { address, length } => cli::eeprom_read(&config, &address, length),
        Commands::EepromWrite { address, data } => cli::eeprom_write(&config, &address, &data),
        Commands::Temperature => cli::temperature(&config),
    }
}
