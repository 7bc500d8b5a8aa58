//! Runs a handful of emulated calculators from the command line.
//!
//! Each device is driven by its own scheduler thread.  The engine is
//! the demonstration engine in [`demo`], so this is mainly useful for
//! watching the scheduler work (try `RUST_LOG=scheduler=debug`).
use std::thread::sleep;
use std::time::Duration;

use clap::Parser;
use tracing::{event, span, Level};
use tracing_subscriber::prelude::*;

use base::prelude::*;
use scheduler::{Command, DeviceInfo, Registry, RegistryConfig, Slot};

mod demo;
mod report;

use demo::DemoEngine;
use report::{Format, StatusBoard};

const ABOUT: &str = "Run several emulated graphing calculators side by side";

#[derive(Parser, Debug)]
#[clap(version, about = ABOUT, long_about = None)]
struct Cli {
    /// Number of devices to run
    #[clap(long, default_value_t = 2)]
    devices: usize,

    /// Emulation speed: 25, 50, 100, 200, 400 (percent) or max
    #[clap(long, default_value_t = Speed::Normal)]
    speed: Speed,

    /// How long to let the devices run, in seconds
    #[clap(long, default_value_t = 1.0)]
    seconds: f64,

    /// Hardware profile of each device
    #[clap(long, default_value = "ti83p")]
    model: String,

    /// Text to type on every device's keypad (for example "1+2\n")
    #[clap(long = "type")]
    text: Option<String>,

    /// Connect every device to the link hub, and pause and resume
    /// them together half way through the run
    #[clap(long)]
    link: bool,

    /// How to print the final state of each device
    #[clap(long, value_enum, default_value_t = Format::Text)]
    format: Format,
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    // See
    // https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html
    // for instructions on how to select which trace messages get
    // printed.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    let filter_layer = match tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
    {
        Err(e) => {
            return Err(Box::new(e));
        }
        Ok(layer) => layer,
    };
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
    Ok(())
}

fn start_devices(
    registry: &Registry,
    cli: &Cli,
    board: &StatusBoard,
) -> Result<Vec<Slot>, Box<dyn std::error::Error>> {
    let mut slots = Vec::with_capacity(cli.devices);
    for n in 0..cli.devices {
        let engine = DemoEngine::new(&cli.model).map_err(|e| {
            format!(
                "{e} (known models: {})",
                demo::profile_names().join(", ")
            )
        })?;
        let slot = registry.add_device(DeviceInfo::new(&format!("calc{n}"), &cli.model))?;
        registry.start_device(slot, engine, Some(Box::new(board.clone())))?;
        registry.enqueue(slot, Command::SetSpeed(cli.speed))?;
        registry.enqueue(slot, Command::TurnOn)?;
        if cli.link {
            registry.enqueue(slot, Command::ConnectLink)?;
        }
        if let Some(text) = cli.text.as_deref() {
            registry.enqueue(slot, Command::type_text(text)?)?;
        }
        slots.push(slot);
    }
    Ok(slots)
}

fn run_devices(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if !cli.seconds.is_finite() || cli.seconds < 0.0 {
        return Err(format!("--seconds={} is not a usable duration", cli.seconds).into());
    }
    let run_for = Duration::from_secs_f64(cli.seconds);

    let config = RegistryConfig {
        max_slots: cli.devices.max(RegistryConfig::default().max_slots),
    };
    let registry = Registry::new(config);
    let board = StatusBoard::new();

    let run_span = span!(Level::INFO, "run", devices = cli.devices, speed = %cli.speed);
    let _enter = run_span.enter();

    let slots = match start_devices(&registry, cli, &board) {
        Ok(slots) => slots,
        Err(e) => {
            registry.shutdown_all();
            return Err(e);
        }
    };
    event!(Level::INFO, "started {} devices", slots.len());

    if cli.link {
        sleep(run_for / 2);
        let paused = registry.pause_all_linked();
        event!(Level::INFO, "paused {} linked devices", paused);
        sleep(Duration::from_millis(50));
        let resumed = registry.resume_all_linked();
        event!(Level::INFO, "resumed {} linked devices", resumed);
        sleep(run_for / 2);
    } else {
        sleep(run_for);
    }

    // Commands are handled in order, so these are all dealt with
    // before the devices close.
    for slot in slots.iter().copied() {
        registry.enqueue(slot, Command::Stop)?;
        registry.enqueue(slot, Command::GetLastAnswer)?;
        registry.enqueue(slot, Command::RequestState)?;
    }
    registry.shutdown_all();
    for slot in slots {
        registry.delete_device(slot)?;
    }

    report::print(cli.format, &board.snapshot())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
    match run_devices(&cli) {
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
        Ok(()) => {
            std::process::exit(0);
        }
    }
}
