//! Command-line front end: identify instruments, run a scope capture, list
//! serial ports and check configuration files.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_measure::adapters::available_serial_ports;
use rust_measure::config::Settings;
use rust_measure::instrument::{Chan, Connection, Coupling, SampleMode, Scope, Slope};
use rust_measure::instruments::{self, tps2000, Tps2000};
use rust_measure::logging;
use std::path::PathBuf;
use tracing::info;

/// Bench instrument automation
#[derive(Parser, Debug)]
#[command(name = "rust_measure", version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overriding the configuration (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the *IDN? reply of the instrument at ADDRESS
    Idn {
        /// Serial port (COM3, /dev/ttyUSB0) or host:port
        address: String,
        /// Serial baud rate
        #[arg(short, long, default_value_t = 9600)]
        baud: u32,
    },

    /// Capture one sweep from a scope and print it as JSON rows
    Capture {
        /// TPS2000 serial port or host:port; empty searches the serial ports
        #[arg(default_value = "")]
        address: String,
        /// Use the scope with this id from the configuration file instead
        #[arg(short, long, conflicts_with = "address")]
        instrument: Option<String>,
        /// Channels to enable, comma separated
        #[arg(long, value_delimiter = ',', default_value = "1")]
        channels: Vec<usize>,
        /// Samples per channel
        #[arg(long, default_value_t = tps2000::MAX_SAMPLES)]
        samples: usize,
        /// Seconds between samples
        #[arg(long, default_value_t = 4e-6)]
        interval: f64,
        /// Full vertical span per channel, volts
        #[arg(long, default_value_t = 10.0)]
        range: f64,
    },

    /// List serial ports
    Ports,

    /// Load, validate and print a configuration file
    Config {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match (&cli.command, &cli.config) {
        (Commands::Config { .. }, _) => Settings::default(),
        (_, path) => Settings::load(path.as_deref()).context("loading configuration")?,
    };
    logging::init(cli.log_level.as_deref().unwrap_or(&settings.log_level));

    match cli.command {
        Commands::Idn { address, baud } => {
            let options = Tps2000::default_options().with_baud_rate(baud);
            let mut conn = Connection::open(&address, options)
                .await
                .with_context(|| format!("opening {}", address))?;
            let idn = conn.query_idn().await;
            conn.close().await;
            println!("{}", idn?);
        }

        Commands::Capture {
            address,
            instrument,
            channels,
            samples,
            interval,
            range,
        } => {
            let poll = settings.capture.poll_settings();
            let scope: Box<dyn Scope> = match instrument {
                Some(id) => {
                    let config = settings
                        .instrument(&id)
                        .with_context(|| format!("no instrument '{}' in the configuration", id))?;
                    instruments::open_scope(config, poll, None).await?
                }
                None => Box::new(Tps2000::open(&address).await?.with_poll_settings(poll)),
            };
            let result = capture(scope.as_ref(), &channels, samples, interval, range).await;
            scope.close().await?;
            let capture = result?;
            info!(
                "{} channel(s), {} samples",
                capture.channels.len(),
                capture.sample_count()
            );
            println!("{}", serde_json::to_string(&capture.to_rows())?);
        }

        Commands::Ports => {
            for port in available_serial_ports()? {
                let note = if port.bluetooth { " (bluetooth)" } else { "" };
                println!("{}\t{}{}", port.name, port.description, note);
            }
        }

        Commands::Config { file } => {
            let settings = Settings::from_path(&file)?;
            println!("{}", toml::to_string_pretty(&settings)?);
        }
    }
    Ok(())
}

async fn capture(
    scope: &dyn Scope,
    channels: &[usize],
    samples: usize,
    interval: f64,
    range: f64,
) -> Result<rust_measure::data::Capture> {
    for n in 1..=scope.channel_count() {
        let chan = Chan::from_number(n).context("channel number")?;
        if channels.contains(&n) {
            scope.setup_channel(chan, range, 0.0, Coupling::Dc).await?;
        } else {
            scope.disable_channel(chan).await?;
        }
    }
    scope
        .setup_time(interval, 0.0, SampleMode::Sample, samples)
        .await?;
    let trigger = Chan::from_number(channels.first().copied().unwrap_or(1))
        .context("trigger channel")?;
    scope
        .setup_trigger(trigger, Coupling::Dc, Slope::Rising, 0.0, true, 0.0)
        .await?;
    Ok(scope.get_samples().await?)
}
