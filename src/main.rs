//! Binary entrypoint for the smsgate CLI.
//!
//! Commands:
//! - `start [--port <path>]` - run the gateway: startup snapshot, inbox monitor, status events
//! - `init` - write a starter `config.toml`
//! - `status` - print the persisted counters and configured modem
//! - `probe --port <path> [-b <baud>] [--timeout <s>]` - read identity, signal and storage once
//! - `send --number <n> --text <t> [--unicode | --no-unicode]` - send one message and exit
//! - `reset-counters` - zero the persistent send counters
//!
//! See the library crate docs for module-level details: `smsgate::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info};
use std::sync::Arc;

use smsgate::config::Config;
use smsgate::counters::CounterStore;
use smsgate::publisher::UsageReport;

#[derive(Parser)]
#[command(name = "smsgate")]
#[command(about = "A serialized SMS gateway for GSM modems")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Modem serial port (e.g., /dev/ttyUSB0); overrides the config
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Show persisted counters and configuration summary
    Status,
    /// Query the modem once and print what it reports
    Probe {
        /// Modem serial port
        #[arg(short, long)]
        port: String,
        /// Baud rate
        #[arg(short = 'b', long, default_value_t = 115200)]
        baud: u32,
        /// Seconds allowed per query
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
    /// Send one SMS and exit
    Send {
        /// Destination number (international form, e.g. +420777123456)
        #[arg(short, long)]
        number: String,
        /// Message text
        #[arg(short, long)]
        text: String,
        /// Force UCS2 encoding
        #[arg(long, conflicts_with = "no_unicode")]
        unicode: bool,
        /// Force GSM-7 encoding
        #[arg(long)]
        no_unicode: bool,
    },
    /// Reset the sent-message counters to zero
    ResetCounters,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init writes the config; everything else reads it first so logging can use it
    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok().map(Config::normalized),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start { port } => {
            let mut config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?.normalized(),
            };
            if let Some(port) = port {
                config.modem.port = port;
            }
            info!("Starting smsgate v{}", env!("CARGO_PKG_VERSION"));
            run_gateway(config).await?;
        }
        Commands::Init => {
            info!("Initializing new smsgate configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?.normalized(),
            };
            let store = CounterStore::open(&config.counters.file, config.counters.cost_per_message)?;
            let usage = UsageReport::new(
                store.current(),
                config.counters.cost_per_message,
                &config.counters.currency,
            );
            let payload = serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "modem_port": config.modem.port,
                "baud_rate": config.modem.baud_rate,
                "smsc_number": config.modem.smsc_number,
                "monitor_enabled": config.monitor.enabled,
                "monitor_interval_seconds": config.monitor.interval_seconds,
                "auto_delete_read_sms": config.monitor.auto_delete_read_sms,
                "counter_file": store.path().display().to_string(),
                "counters": usage,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Probe {
            port,
            baud,
            timeout,
        } => {
            #[cfg(not(feature = "serial"))]
            {
                let _ = (port, baud, timeout);
                error!("probe requires the 'serial' feature");
                std::process::exit(2);
            }
            #[cfg(feature = "serial")]
            {
                let ok = probe(&port, baud, timeout).await?;
                std::process::exit(if ok { 0 } else { 1 });
            }
        }
        Commands::Send {
            number,
            text,
            unicode,
            no_unicode,
        } => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?.normalized(),
            };
            let unicode = match (unicode, no_unicode) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            #[cfg(not(feature = "serial"))]
            {
                let _ = (config, number, text, unicode);
                error!("send requires the 'serial' feature");
                std::process::exit(2);
            }
            #[cfg(feature = "serial")]
            {
                use smsgate::bridge::SmsBridge;
                use smsgate::modem::serial::SerialModem;
                use smsgate::publisher::LogPublisher;

                let modem = SerialModem::new(&config.modem.port, config.modem.baud_rate);
                let mut bridge = SmsBridge::build(modem, &config, Arc::new(LogPublisher))?;
                let outcome = bridge.send(&number, &text, unicode).await;
                bridge.shutdown().await;
                match outcome {
                    Ok(handle) => println!("{}", serde_json::to_string_pretty(&handle)?),
                    Err(e) => {
                        error!("Send failed: {}", e);
                        std::process::exit(1);
                    }
                }
            }
        }
        Commands::ResetCounters => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?.normalized(),
            };
            let store = Arc::new(CounterStore::open(
                &config.counters.file,
                config.counters.cost_per_message,
            )?);
            let record = tokio::task::spawn_blocking(move || store.reset()).await??;
            let usage = UsageReport::new(record, config.counters.cost_per_message, &config.counters.currency);
            info!("Counters reset");
            println!("{}", serde_json::to_string_pretty(&usage)?);
        }
    }

    Ok(())
}

#[cfg(feature = "serial")]
async fn run_gateway(config: Config) -> Result<()> {
    use smsgate::bridge::SmsBridge;
    use smsgate::modem::serial::SerialModem;
    use smsgate::publisher::LogPublisher;

    let modem = SerialModem::new(&config.modem.port, config.modem.baud_rate);
    let mut bridge = SmsBridge::build(modem, &config, Arc::new(LogPublisher))?;
    let report = bridge.startup().await;
    if report.identity.is_none() {
        log::warn!(
            "Modem on {} did not answer at startup; continuing and retrying on each operation",
            config.modem.port
        );
    }
    bridge.start_monitor();
    info!("Gateway running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    bridge.shutdown().await;
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn run_gateway(_config: Config) -> Result<()> {
    error!("start requires the 'serial' feature");
    std::process::exit(2);
}

/// Returns whether every query succeeded.
#[cfg(feature = "serial")]
async fn probe(port: &str, baud: u32, timeout: u64) -> Result<bool> {
    use smsgate::modem::serial::SerialModem;
    use smsgate::modem::Modem;
    use std::time::Duration;

    info!("Probing modem on {} @ {} baud", port, baud);
    let port = port.to_string();
    let budget = Duration::from_secs(timeout.max(1));
    let payload = tokio::task::spawn_blocking(move || {
        let mut modem = SerialModem::new(&port, baud);
        let identity = modem.query_identity(budget);
        let status = modem.query_status(budget);
        let capacity = modem.query_capacity(budget);
        let ok = identity.is_ok() && status.is_ok() && capacity.is_ok();
        let describe = |e: &smsgate::error::GatewayError| e.to_string();
        let payload = serde_json::json!({
            "status": if ok { "ok" } else { "incomplete" },
            "port": port,
            "identity": identity.as_ref().ok(),
            "identity_error": identity.as_ref().err().map(describe),
            "signal": status.as_ref().ok().map(|s| &s.signal),
            "network": status.as_ref().ok().map(|s| &s.network),
            "status_error": status.as_ref().err().map(describe),
            "capacity": capacity.as_ref().ok(),
            "capacity_error": capacity.as_ref().err().map(describe),
            "timeout_seconds": budget.as_secs(),
        });
        (ok, payload)
    })
    .await?;
    println!("{}", payload.1);
    Ok(payload.0)
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins over the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));

        // Under a service manager stdout is not a TTY; the file is enough then
        let is_tty = atty::is(atty::Stream::Stdout);

        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
