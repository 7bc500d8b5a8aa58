use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use clap::ValueEnum;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};
use tracing::{event, Level};

use scheduler::{DeviceStatus, DeviceView, Engine, EngineError, Slot, StateListener};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Json,
}

/// Keeps the most recent status reported by each device.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    latest: Arc<Mutex<BTreeMap<Slot, DeviceStatus>>>,
}

impl StatusBoard {
    pub fn new() -> StatusBoard {
        StatusBoard::default()
    }

    pub fn snapshot(&self) -> Vec<DeviceStatus> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl<E: Engine> StateListener<E> for StatusBoard {
    fn device_state(&mut self, view: &DeviceView<'_, E>) {
        let status = view.status();
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(status.slot, status);
    }

    fn engine_failed(&mut self, slot: Slot, error: &EngineError) {
        event!(Level::ERROR, "device in slot {} failed: {}", slot, error);
    }
}

fn get_colour_choice() -> ColorChoice {
    if atty::is(atty::Stream::Stdout) {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    }
}

pub fn write_text<W: WriteColor>(out: &mut W, statuses: &[DeviceStatus]) -> io::Result<()> {
    for status in statuses {
        let mut state_colour = ColorSpec::new();
        let label = if status.running {
            state_colour.set_fg(Some(Color::Green)).set_bold(true);
            "running"
        } else {
            state_colour.set_fg(Some(Color::Yellow));
            "stopped"
        };
        write!(out, "slot {:>2}: ", status.slot)?;
        out.set_color(&state_colour)?;
        write!(out, "{label:<8}")?;
        out.reset()?;
        write!(
            out,
            " speed {:>4}  pc {}  {:>12} T-states  {:>9.3}s emulated",
            status.speed,
            status.program_counter,
            status.tstates,
            status.elapsed.as_secs_f64()
        )?;
        if let Some(answer) = status.last_answer.as_deref() {
            write!(out, "  Ans=")?;
            out.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)))?;
            write!(out, "{answer}")?;
            out.reset()?;
        }
        if status.keys_pending > 0 {
            write!(out, "  ({} keys still to type)", status.keys_pending)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

pub fn print(format: Format, statuses: &[DeviceStatus]) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        Format::Text => {
            let mut stream = StandardStream::stdout(get_colour_choice());
            write_text(&mut stream, statuses)?;
            stream.flush()?;
        }
        Format::Json => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            serde_json::to_writer_pretty(&mut handle, statuses)?;
            writeln!(handle)?;
        }
    }
    Ok(())
}

#[cfg(test)]
fn sample_status() -> DeviceStatus {
    use base::prelude::*;
    use scheduler::RunMode;
    use std::time::Duration;

    DeviceStatus {
        slot: Slot::new(1),
        mode: RunMode::Idle,
        running: false,
        speed: "100%".to_string(),
        tstates: 6_000_000,
        elapsed: Duration::from_secs(1),
        program_counter: Address::new(0x9D95),
        keypad_state: KeypadState::Normal,
        keys_pending: 0,
        last_answer: Some("42".to_string()),
    }
}

#[test]
fn test_text_report() {
    let mut buf = termcolor::Buffer::no_color();
    write_text(&mut buf, &[sample_status()]).unwrap();
    let text = String::from_utf8(buf.into_inner()).unwrap();
    assert_eq!(
        text,
        "slot  1: stopped  speed 100%  pc $9D95       6000000 T-states      1.000s emulated  Ans=42\n"
    );
}

#[test]
fn test_json_report() {
    let value = serde_json::to_value([sample_status()]).unwrap();
    assert_eq!(value[0]["slot"], 1);
    assert_eq!(value[0]["mode"], "Idle");
    assert_eq!(value[0]["program_counter"], 0x9D95);
    assert_eq!(value[0]["last_answer"], "42");
}
