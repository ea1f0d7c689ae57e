//! Flow sensor command line tool
//!
//! Opens the sensor cable, reads the product name, initialises the flow meter and
//! records volume while printing the flow rate once per second.
//!
//! Usage:
//!   flowlink [OPTIONS] [PORT]
//!
//! Options:
//!   --port PORT        Serial port (default: the attached sensor cable)
//!   --baud RATE        Baud rate (default: 115200)
//!   --config FILE      JSON configuration file
//!   --samples N        Number of measurements to take (default: 10)
//!   --interval MS      Measurement interval of the sensor in ms (default: 20)
//!   --list             List available serial ports and exit
//!
//! Log verbosity follows `RUST_LOG` (default: info).

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowlink_core::device::DEFAULT_MEASUREMENT_INTERVAL_MS;
use flowlink_core::prelude::*;
use flowlink_core::protocol::{find_sensor_cable, list_ports};

const DEFAULT_SAMPLES: usize = 10;
const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Options {
    port: Option<String>,
    baud: Option<u32>,
    config: Option<String>,
    samples: usize,
    interval_ms: u16,
    list: bool,
    help: bool,
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut options = Options {
        port: None,
        baud: None,
        config: None,
        samples: DEFAULT_SAMPLES,
        interval_ms: DEFAULT_MEASUREMENT_INTERVAL_MS,
        list: false,
        help: false,
    };

    let mut args = args.iter();
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .cloned()
                .with_context(|| format!("{name} needs a value"))
        };
        match arg.as_str() {
            "--port" | "-p" => options.port = Some(value("--port")?),
            "--baud" | "-b" => {
                options.baud = Some(value("--baud")?.parse().context("invalid baud rate")?)
            }
            "--config" | "-c" => options.config = Some(value("--config")?),
            "--samples" | "-n" => {
                options.samples = value("--samples")?
                    .parse()
                    .context("invalid sample count")?
            }
            "--interval" | "-i" => {
                options.interval_ms = value("--interval")?
                    .parse()
                    .context("invalid interval")?
            }
            "--list" | "-l" => options.list = true,
            "--help" | "-h" => options.help = true,
            other if other.starts_with('-') => bail!("unknown option {other}"),
            other => options.port = Some(other.to_string()),
        }
    }
    Ok(options)
}

fn print_help() {
    println!("flowlink {}", flowlink_core::VERSION);
    println!();
    println!("Usage: flowlink [OPTIONS] [PORT]");
    println!();
    println!("Options:");
    println!("  -p, --port PORT      Serial port (default: attached sensor cable)");
    println!("  -b, --baud RATE      Baud rate (default: 115200)");
    println!("  -c, --config FILE    JSON configuration file");
    println!("  -n, --samples N      Number of measurements (default: {DEFAULT_SAMPLES})");
    println!("  -i, --interval MS    Sensor measurement interval (default: {DEFAULT_MEASUREMENT_INTERVAL_MS})");
    println!("  -l, --list           List serial ports (* marks sensor cables) and exit");
    println!("  -h, --help           Show this help");
}

fn print_ports() {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let marker = if port.is_sensor_cable() { "*" } else { " " };
        match port.usb {
            Some(id) => println!(
                "{marker} {} [{:04x}:{:04x}] {}",
                port.name,
                id.vid,
                id.pid,
                port.product.as_deref().unwrap_or("")
            ),
            None => println!("{marker} {}", port.name),
        }
    }
}

fn load_config(options: &Options) -> Result<FlowlinkConfig> {
    let mut config = match &options.config {
        Some(path) => FlowlinkConfig::from_file(path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => FlowlinkConfig::default(),
    };

    if let Some(port) = &options.port {
        config.serial.path = port.clone();
    }
    if let Some(baud) = options.baud {
        config.serial.baud_rate = baud;
    }
    if config.serial.path.is_empty() {
        let port = match find_sensor_cable() {
            Some(cable) => cable,
            None => {
                let port = list_ports()
                    .into_iter()
                    .next()
                    .context("no serial port given and none found")?;
                tracing::warn!(
                    path = %port.name,
                    "no sensor cable recognised, using first serial port"
                );
                port
            }
        };
        config.serial.path = port.name;
    }
    Ok(config)
}

async fn record<P: Port>(meter: &FlowMeter<RetryConnection<P>>, options: &Options) -> Result<()> {
    let product_name = meter.product_name().await.context("read product name")?;
    info!(%product_name, "product name");

    meter.init().await.context("initialise flow meter")?;
    meter
        .start_recording_volume(options.interval_ms)
        .await
        .context("start recording")?;

    for _ in 0..options.samples {
        let flow_rate = meter.current_flow_rate().await?;
        println!("{flow_rate:.3} ml/min");
        tokio::time::sleep(SAMPLE_PERIOD).await;
    }

    let volume = meter
        .stop_recording_volume(options.interval_ms)
        .await
        .context("stop recording")?;
    println!("Total volume: {volume:.3} ml");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = parse_args(&args)?;
    if options.help {
        print_help();
        return Ok(());
    }
    if options.list {
        print_ports();
        return Ok(());
    }

    let config = load_config(&options)?;
    info!(path = %config.serial.path, baud = config.serial.baud_rate, "connect to device");

    let port = StreamPort::new(SerialLink::new(config.serial.clone()), config.port.clone());
    let connection = RetryConnection::new(port, config.retry.clone());
    connection
        .open()
        .await
        .with_context(|| format!("failed to open {}", config.serial.path))?;

    let meter = FlowMeter::new(connection);
    let result = record(&meter, &options).await;

    if let Err(e) = meter.device().exchange().close().await {
        tracing::warn!(error = %e, "failed to close port");
    }
    result
}
