//! Observing a device.
//!
//! A [`StateListener`] is called on the scheduler thread whenever the
//! device's run state changes and whenever someone queues a
//! [`Command::RequestState`](crate::Command::RequestState).  While the
//! call lasts the listener has exclusive access to the engine (the
//! device is not running), so it can gather a consistent picture of
//! registers, memory and so on.  It must not block.
use std::time::Duration;

use serde::Serialize;

use base::prelude::*;

use super::engine::{Engine, EngineError};
use super::registry::Slot;
use super::scheduler::{RunMode, RunState};

/// What a listener can see of a device.
#[derive(Debug)]
pub struct DeviceView<'a, E> {
    pub slot: Slot,
    pub engine: &'a E,
    pub mode: RunMode,
    pub state: RunState,
    pub last_answer: Option<&'a str>,
    pub keys_pending: usize,
}

/// An owned summary of a device, suitable for serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub slot: Slot,
    pub mode: RunMode,
    pub running: bool,
    pub speed: String,
    pub tstates: u64,
    pub elapsed: Duration,
    pub program_counter: Address,
    pub keypad_state: KeypadState,
    pub keys_pending: usize,
    pub last_answer: Option<String>,
}

impl<E: Engine> DeviceView<'_, E> {
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            slot: self.slot,
            mode: self.mode,
            running: self.state.running,
            speed: if self.state.max_speed {
                Speed::Max.to_string()
            } else {
                format!("{}%", self.state.speed_percent)
            },
            tstates: self.engine.tstates(),
            elapsed: self.engine.elapsed(),
            program_counter: self.engine.program_counter(),
            keypad_state: self.engine.keypad_state(),
            keys_pending: self.keys_pending,
            last_answer: self.last_answer.map(str::to_string),
        }
    }
}

pub trait StateListener<E>: Send {
    fn device_state(&mut self, view: &DeviceView<'_, E>);

    /// The engine reported an error.  The device has been stopped.
    fn engine_failed(&mut self, _slot: Slot, _error: &EngineError) {}
}

impl<E, F> StateListener<E> for F
where
    F: FnMut(&DeviceView<'_, E>) + Send,
{
    fn device_state(&mut self, view: &DeviceView<'_, E>) {
        self(view)
    }
}
