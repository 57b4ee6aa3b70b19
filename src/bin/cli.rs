//! TinyBMS Link CLI
//!
//! Command-line access to the register API: read/write registers, watch
//! live telemetry, restart the device, inspect the catalog. `--emulator`
//! substitutes the in-process BMS for the serial port, which is handy for
//! trying the tool without hardware.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use tinybms_link::core::registers;
use tinybms_link::core::transport::emulator::EmulatorLink;
use tinybms_link::core::transport::serial::{list_ports, SerialLink};
use tinybms_link::{
    BmsClient, BmsTransport, LinkConfig, LinkEvent, PollerConfig, Poller, RestartOption,
    SerialSettings,
};

/// Restart option names
#[derive(Debug, Clone, Copy, ValueEnum)]
enum RestartKind {
    /// Reboot the BMS
    Reboot,
    /// Clear the event log
    ClearEvents,
    /// Clear the statistics counters
    ClearStats,
}

impl From<RestartKind> for RestartOption {
    fn from(kind: RestartKind) -> Self {
        match kind {
            RestartKind::Reboot => RestartOption::Reboot,
            RestartKind::ClearEvents => RestartOption::ClearEvents,
            RestartKind::ClearStats => RestartOption::ClearStats,
        }
    }
}

/// TinyBMS Link CLI
#[derive(Parser, Debug)]
#[command(name = "tinybms-cli", version, about = "TinyBMS register access over serial")]
struct Cli {
    /// Serial port name
    #[arg(short, long, default_value = "/dev/ttyUSB0", env = "TINYBMS_PORT")]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200", env = "TINYBMS_BAUD")]
    baud: u32,

    /// Response timeout in milliseconds
    #[arg(long, default_value = "500")]
    timeout_ms: u64,

    /// Talk to the in-process emulator instead of a serial port
    #[arg(long)]
    emulator: bool,

    /// Verbose output (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts,

    /// List the register catalog
    Registers,

    /// Read a register by key or hex address
    Read {
        /// Register key (e.g. pack_voltage_v) or address (e.g. 0x012C)
        register: String,

        /// Print the raw wire words instead of the engineering value
        #[arg(long)]
        raw: bool,
    },

    /// Write an engineering-unit value to a register
    Write {
        /// Register key or hex address
        register: String,

        /// Value in engineering units
        value: f64,
    },

    /// Poll live telemetry and print readings as they arrive
    Monitor {
        /// Poll interval in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Register keys to poll (defaults to the standard telemetry set)
        #[arg(long)]
        registers: Vec<String>,
    },

    /// Restart or clear the device
    Restart {
        /// What to restart or clear
        #[arg(long, value_enum, default_value_t = RestartKind::Reboot)]
        option: RestartKind,
    },

    /// Show link statistics after a probe
    Status,
}

fn resolve_key(register: &str) -> anyhow::Result<&'static str> {
    if let Some(descriptor) = registers::by_key(register) {
        return Ok(descriptor.key);
    }
    let address = parse_address(register)?;
    registers::by_address(address)
        .map(|descriptor| descriptor.key)
        .with_context(|| format!("register {register} is not in the catalog"))
}

fn parse_address(register: &str) -> anyhow::Result<u16> {
    let text = register.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(text, 16).with_context(|| format!("'{register}' is not a hex address"))
}

async fn connect(cli: &Cli) -> anyhow::Result<BmsClient> {
    let transport: Box<dyn BmsTransport> = if cli.emulator {
        Box::new(EmulatorLink::with_jitter(true))
    } else {
        Box::new(SerialLink::new(SerialSettings::new(&cli.port, cli.baud))?)
    };

    let config = LinkConfig {
        timeout_ms: cli.timeout_ms,
        ..LinkConfig::default()
    };

    BmsClient::connect(transport, config)
        .await
        .context("connecting to the BMS failed")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("tinybms_link={default_level}"))),
        )
        .init();

    match &cli.command {
        Commands::ListPorts => {
            let ports = list_ports()?;
            if ports.is_empty() {
                println!("no serial ports found");
            }
            for port in ports {
                println!("{}", port.port_name);
            }
        }

        Commands::Registers => {
            for descriptor in registers::all() {
                println!(
                    "{:#06x}  {:<32} {:<8} {:>5}  {}",
                    descriptor.address,
                    descriptor.key,
                    descriptor.group.name(),
                    match descriptor.access {
                        registers::Access::ReadOnly => "r",
                        registers::Access::ReadWrite => "rw",
                    },
                    descriptor.label,
                );
            }
        }

        Commands::Read { register, raw } => {
            let key = resolve_key(register)?;
            let client = connect(&cli).await?;
            let reading = client.read_key(key).await?;
            if *raw {
                let words: Vec<String> =
                    reading.raw.iter().map(|w| format!("{w:#06x}")).collect();
                println!("{} = {}", reading.key, words.join(" "));
            } else {
                println!("{} = {}{}", reading.key, reading.value, suffix(reading.unit));
            }
            client.close().await?;
        }

        Commands::Write { register, value } => {
            let key = resolve_key(register)?;
            let client = connect(&cli).await?;
            let outcome = client.write_key(key, *value).await?;
            match outcome.verified() {
                Some(true) => println!("{key} = {value} (verified)"),
                Some(false) => println!(
                    "{key} = {value} (acknowledged, but read-back returned {:#06x})",
                    outcome.readback.unwrap_or_default()
                ),
                None => println!("{key} = {value} (acknowledged)"),
            }
            client.close().await?;
        }

        Commands::Monitor {
            interval_ms,
            registers: keys,
        } => {
            let client = connect(&cli).await?;
            let mut events = client.subscribe();

            let mut config = PollerConfig {
                interval_ms: *interval_ms,
                ..PollerConfig::default()
            };
            if !keys.is_empty() {
                config.registers = keys.clone();
            }
            let poller = Poller::start(client.clone(), config);

            println!("monitoring; press Ctrl-C to stop");
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(LinkEvent::Reading(reading)) => {
                            println!(
                                "{:<32} {:>12.3}{}",
                                reading.key,
                                reading.value,
                                suffix(reading.unit)
                            );
                        }
                        Ok(LinkEvent::Connectivity(false)) => {
                            eprintln!("connection lost");
                            break;
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }

            poller.stop();
            let stats = client.stats();
            eprintln!(
                "reads ok/failed: {}/{}  crc errors: {}  timeouts: {}",
                stats.reads_ok, stats.reads_failed, stats.crc_errors, stats.timeouts
            );
            let _ = client.close().await;
        }

        Commands::Restart { option } => {
            let client = connect(&cli).await?;
            client.restart((*option).into()).await?;
            println!("restart acknowledged");
            let _ = client.close().await;
        }

        Commands::Status => {
            let client = connect(&cli).await?;
            println!("link: {}", client.connection_info().await);

            let volts = client.pack_voltage().await?;
            let amps = client.pack_current().await?;
            let soc = client.state_of_charge().await?;
            let status = client.online_status().await?;
            println!("pack: {volts:.2} V  {amps:.2} A  SOC {soc:.1}%  status {status:#04x}");

            let stats = client.stats();
            println!(
                "reads ok/failed: {}/{}  writes ok/failed: {}/{}  crc errors: {}  timeouts: {}",
                stats.reads_ok,
                stats.reads_failed,
                stats.writes_ok,
                stats.writes_failed,
                stats.crc_errors,
                stats.timeouts
            );
            client.close().await?;
        }
    }

    Ok(())
}

fn suffix(unit: &str) -> String {
    if unit.is_empty() {
        String::new()
    } else {
        format!(" {unit}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x012C").unwrap(), 0x012C);
        assert_eq!(parse_address("12c").unwrap(), 0x012C);
        assert!(parse_address("pack").is_err());
    }

    #[test]
    fn test_resolve_key() {
        assert_eq!(resolve_key("pack_voltage_v").unwrap(), "pack_voltage_v");
        assert_eq!(resolve_key("0x012C").unwrap(), "fully_charged_voltage_mv");
        assert!(resolve_key("0xBEEF").is_err());
    }
}
