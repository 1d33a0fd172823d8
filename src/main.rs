use std::process::exit;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use mcp39f501::logging::{init_rust_logging, init_rust_logging_with, resolve_level};
use mcp39f501::{DioConfig, EventFlags, LinkConfig, Mcp39f501};

#[derive(Parser, Debug)]
#[command(name = "mcp39f501", about = "Query an MCP39F501 power monitor over a serial port")]
struct Args {
    /// Serial port path (e.g., /dev/ttyUSB0)
    port: String,
    /// UART baud rate
    #[arg(long, default_value_t = mcp39f501::transport::DEFAULT_BAUD_RATE)]
    baud: u32,
    /// Log level (off, error, warn, info, debug, trace); defaults to MCP39F501_LOG/RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the firmware version
    Version,
    /// Read and print the measurement block
    Refresh {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Read a 16-bit register
    Get {
        #[arg(value_parser = parse_u16)]
        addr: u16,
    },
    /// Write a 16-bit register
    Set {
        #[arg(value_parser = parse_u16)]
        addr: u16,
        #[arg(value_parser = parse_u16)]
        value: u16,
    },
    /// Print event flags, enables and masks
    Events,
    /// Clear latched events
    ClearEvents {
        #[arg(value_parser = parse_u16)]
        mask: u16,
    },
    /// Configure the DIO pins (3-bit mode per pin)
    Dio {
        dio0: u8,
        dio1: u8,
        dio2: u8,
        dio3: u8,
    },
    /// Save registers to flash
    Save,
}

/// Decimal or `0x`-prefixed hex.
fn parse_u16(s: &str) -> std::result::Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse::<u16>(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    match args.log_level.as_deref() {
        Some(name) => {
            let level: LevelFilter = resolve_level(Some(name));
            init_rust_logging_with(level);
        }
        None => init_rust_logging(),
    }

    let config = LinkConfig {
        baud_rate: args.baud,
        ..LinkConfig::default()
    };
    let mut meter = Mcp39f501::open(&args.port, &config)
        .with_context(|| format!("Failed to initialise MCP39F501 on {}", args.port))?;

    match args.command {
        Command::Version => println!("{}", meter.version()),
        Command::Refresh { json } => {
            let t = meter.refresh_telemetry().context("telemetry refresh failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&t)?);
            } else {
                println!("Current RMS:        {}", t.current_rms);
                println!("Voltage RMS:        {}", t.voltage_rms);
                println!("Active power:       {}", t.active_power);
                println!("Reactive power:     {}", t.reactive_power);
                println!("Apparent power:     {}", t.apparent_power);
                println!(
                    "Power factor:       {} ({:.3})",
                    t.power_factor,
                    t.power_factor_ratio()
                );
                println!("Line frequency:     {}", t.line_frequency);
                println!("Thermistor voltage: {}", t.thermistor_voltage);
                println!("Events:             {}", t.event_flags);
                println!("System status:      {:#018b}", t.system_status);
                let inputs: Vec<u8> = (0..4).map(|p| meter.read_bit_flag(p) as u8).collect();
                println!("Digital inputs:     {:?}", inputs);
            }
        }
        Command::Get { addr } => {
            let value = meter
                .get_register16(addr)
                .with_context(|| format!("read of {addr:#06X} failed"))?;
            println!("{addr:#06X} = {value:#06X} ({value})");
        }
        Command::Set { addr, value } => {
            meter
                .set_register16(addr, value)
                .with_context(|| format!("write of {addr:#06X} failed"))?;
            println!("{addr:#06X} <- {value:#06X}");
        }
        Command::Events => {
            println!("Flags:    {}", meter.read_events()?);
            println!("Enabled:  {}", meter.get_enable_events()?);
            println!("Critical: {}", meter.get_critical_mask()?);
            println!("Standard: {}", meter.get_standard_mask()?);
        }
        Command::ClearEvents { mask } => {
            meter.clear_events(EventFlags::from_bits(mask))?;
            println!("Cleared {}", EventFlags::from_bits(mask));
        }
        Command::Dio {
            dio0,
            dio1,
            dio2,
            dio3,
        } => {
            let dio = DioConfig::new(dio0, dio1, dio2, dio3);
            meter.set_dio_config(dio)?;
            println!("DIO register <- {:#06X}", dio.to_register());
        }
        Command::Save => {
            meter.save_to_nonvolatile()?;
            println!("Saved.");
        }
    }
    Ok(())
}
