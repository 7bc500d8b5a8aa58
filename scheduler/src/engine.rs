//! The interface between the scheduler and the emulation engine.
//!
//! The engine is the thing which actually emulates the calculator's
//! CPU and peripherals.  The scheduler owns exactly one engine and is
//! the only code which ever calls it, so implementations need no
//! internal locking.
//!
//! Time is measured in two ways.  T-states are CPU clock cycles; the
//! run primitives are given their budget in T-states.  Emulated
//! elapsed time (a [`Duration`]) is what the throttle compares with
//! the wall clock.
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use base::prelude::*;

use super::command::KeyLocation;

/// Why a run primitive returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The T-state (or step) budget was used up.
    BudgetExhausted,
    /// The run-to-address target was reached, or (for run-to-return)
    /// a return instruction was executed.
    TargetReached,
    /// A breakpoint fired.  The engine has already cleared its
    /// running flag.
    BreakpointHit(Address),
}

/// Errors reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No ROM image has been loaded, so there is nothing to run.
    NoRom,
    /// The engine could not find the named hardware profile.
    UnknownProfile(String),
    /// The CPU attempted something the engine cannot emulate.
    Unsupported(String),
    /// Any other engine-specific failure.
    Other(String),
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            EngineError::NoRom => f.write_str("no ROM image is loaded"),
            EngineError::UnknownProfile(name) => write!(f, "unknown hardware profile '{name}'"),
            EngineError::Unsupported(what) => write!(f, "unsupported operation: {what}"),
            EngineError::Other(msg) => f.write_str(msg),
        }
    }
}

impl Error for EngineError {}

pub trait Engine {
    /// Run for (about) `tstates` clock cycles.  Does nothing unless
    /// the engine's running flag is set.
    fn run_for_time_slice(&mut self, tstates: u64) -> Result<RunOutcome, EngineError>;

    /// Execute exactly `steps` instructions, stopping early on a
    /// breakpoint.  Runs whether or not the running flag is set.
    fn run_fixed_steps(&mut self, steps: u32) -> Result<RunOutcome, EngineError>;

    /// Run for at most `tstates` clock cycles, stopping before the
    /// instruction at `target` is executed.
    fn run_to_address(&mut self, tstates: u64, target: Address)
        -> Result<RunOutcome, EngineError>;

    /// Run for at most `tstates` clock cycles, stopping just after a
    /// return instruction is executed.
    fn run_to_return(&mut self, tstates: u64) -> Result<RunOutcome, EngineError>;

    fn reset(&mut self) -> Result<(), EngineError>;

    /// Simulates pressing the ON key on a calculator which is off.
    fn power_on(&mut self) -> Result<(), EngineError>;

    /// True when a ROM is loaded and the device can execute.
    fn is_active(&self) -> bool;

    fn is_running(&self) -> bool;
    fn set_running(&mut self, running: bool);

    fn speed(&self) -> Speed;
    fn set_speed(&mut self, speed: Speed);

    /// Emulated time elapsed since the engine was created.
    fn elapsed(&self) -> Duration;

    /// Clock cycles executed since the engine was created.
    fn tstates(&self) -> u64;

    /// CPU clock frequency.
    fn frequency_hz(&self) -> u32;

    /// The number of T-states the keypad matrix scan needs to
    /// reliably see a key press followed by a release.
    fn key_scan_period(&self) -> u64 {
        u64::from(self.frequency_hz())
    }

    fn program_counter(&self) -> Address;

    /// If the instruction at the program counter is a subroutine
    /// call, returns the address of the instruction after it.
    fn call_return_address(&self) -> Option<Address>;

    fn breakpoints_at(&self, address: Address) -> BreakpointKinds;
    fn set_breakpoint(&mut self, address: Address, kind: BreakpointKinds);
    fn clear_breakpoint(&mut self, address: Address, kind: BreakpointKinds);

    fn keypad_press(&mut self, key: KeyCode);
    fn keypad_release(&mut self, key: KeyCode);

    /// Map a host keyboard key to the calculator keypad and press it.
    fn keyboard_key_down(&mut self, virtual_key: u32, location: KeyLocation);
    fn keyboard_key_up(&mut self, virtual_key: u32, location: KeyLocation);

    fn keypad_state(&self) -> KeypadState {
        KeypadState::Normal
    }

    /// The calculator's `Ans` variable, formatted as text.
    fn last_answer(&self) -> Option<String>;

    fn set_profile(&mut self, name: &str) -> Result<(), EngineError>;

    /// Ask the LCD emulation to push its current contents to whoever
    /// is displaying them.
    fn update_display(&mut self);
}
