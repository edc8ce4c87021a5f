//! candiag - command-line tool for CAN diagnostics and flash programming
//!
//! Inspects firmware images, converts trouble codes, lists the OBD-II PID
//! table and runs diagnostic sessions against the built-in simulated ECU.

mod commands;
mod config;
mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "candiag")]
#[command(author, version, about = "CAN diagnostics and flash programming")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CANDIAG_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a firmware image (Intel HEX, S-Record or binary) and list its blocks
    Inspect {
        /// Firmware file path; the format follows the extension
        file: PathBuf,
    },

    /// Convert trouble codes
    Dtc {
        #[command(subcommand)]
        action: DtcAction,
    },

    /// List the OBD-II mode 01 PID table
    Pids {
        /// Only PIDs with a physical unit
        #[arg(long)]
        units: bool,
    },

    /// Run a full diagnostic and flash session against the simulated ECU
    Demo {
        /// Firmware image to program instead of the built-in pattern
        #[arg(long)]
        image: Option<PathBuf>,

        /// Clear trouble codes after reading them
        #[arg(long)]
        clear_dtcs: bool,
    },

    /// Poll live OBD-II values from the simulated ECU
    Monitor {
        /// PIDs in hex, e.g. 0C 0D
        #[arg(required = true, value_parser = parse_pid)]
        pids: Vec<u8>,

        /// Polls per second
        #[arg(long, default_value = "1")]
        rate: u32,

        /// Stop after this many batches
        #[arg(long)]
        count: Option<usize>,
    },
}

#[derive(Subcommand)]
enum DtcAction {
    /// Raw two-byte values (hex or decimal) to codes
    Decode {
        #[arg(required = true)]
        values: Vec<String>,
    },
    /// Codes such as P0171 to raw values
    Encode {
        #[arg(required = true)]
        codes: Vec<String>,
    },
}

fn parse_pid(value: &str) -> Result<u8, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u8::from_str_radix(digits, 16).map_err(|e| format!("invalid PID '{}': {}", value, e))
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("candiag=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("candiag=info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    let ctx = OutputContext::new(cli.output, cli.no_color, cli.quiet);

    let result = match &cli.command {
        Commands::Inspect { file } => commands::inspect(file, &ctx),

        Commands::Dtc { action } => match action {
            DtcAction::Decode { values } => commands::dtc_decode(values, &ctx),
            DtcAction::Encode { codes } => commands::dtc_encode(codes, &ctx),
        },

        Commands::Pids { units } => {
            commands::pids(*units, &ctx);
            Ok(())
        }

        Commands::Demo { image, clear_dtcs } => {
            let config = config::load(cli.config.as_deref())?;
            commands::demo(&config, image.as_deref(), *clear_dtcs, &ctx)
                .await
                .context("Demo session failed")
        }

        Commands::Monitor { pids, rate, count } => {
            let config = config::load(cli.config.as_deref())?;
            commands::monitor(&config, pids.clone(), *rate, *count, &ctx).await
        }
    };

    if let Err(e) = result {
        ctx.error(&format!("Error: {:#}", e));
        std::process::exit(1);
    }
    Ok(())
}
