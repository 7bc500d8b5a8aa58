//! The per-device scheduler.
//!
//! Each emulated device is driven by one [`DeviceScheduler`] running
//! on its own thread.  The scheduler owns the engine outright; other
//! threads influence the device only by queueing [`Command`]s.  This
//! is what allows the engine to run without any locking, and it
//! means that observers (debuggers, user interfaces) never see the
//! device in a half-updated state.
//!
//! ## The tick
//!
//! The scheduler loop performs one tick after another until it
//! receives [`Command::Close`].  A tick does four things, in order:
//!
//! 1. Advance the emulation.  Exactly one of the following applies,
//!    checked in this order:
//!    * the device is running: run for one time quantum;
//!    * single steps are pending: execute them;
//!    * a run-to-address target is set: run towards it for one
//!      quantum;
//!    * a run-to-return is pending: run for one quantum or until a
//!      return instruction;
//!    * otherwise the device is idle: wait for [`IDLE_INTERVAL`] (or
//!      until a command arrives).
//! 2. Service the key-input queue (see [`KeyInput`]).
//! 3. Take at most one command off the queue and apply it.
//! 4. Wait, if emulated time has got ahead of the wall clock.
use std::fmt::{self, Debug, Formatter};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{event, span, Level};

use base::prelude::*;

use super::clock::{SystemWallClock, WallClock};
use super::command::Command;
use super::engine::{Engine, EngineError, RunOutcome};
use super::host::DeviceHost;
use super::keys::{KeyEvent, KeyInput};
use super::listener::{DeviceView, StateListener};
use super::queue::{CommandReceiver, CommandSender, QueueClosed};
use super::registry::Slot;
use super::throttle::{tick_quantum, Throttle};

/// How long an idle device waits between looking for commands.
pub const IDLE_INTERVAL: Duration = Duration::from_millis(10);

/// What governs the device's next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunMode {
    Idle,
    Running,
    SteppingFixed(u32),
    RunningToAddress(Address),
    RunningToReturn,
    Closed,
}

/// The run-mode fields, as a value (for observers and for
/// comparing the effect of command sequences).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub running: bool,
    pub remaining_steps: u32,
    pub run_to_address: Option<Address>,
    pub run_to_return: bool,
    pub speed_percent: u32,
    pub max_speed: bool,
}

/// The engine primitive which a tick invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    TimeSlice { tstates: u64 },
    FixedSteps { steps: u32 },
    ToAddress { tstates: u64, target: Address },
    ToReturn { tstates: u64 },
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue(Driver),
    Closed,
}

pub struct DeviceScheduler<E: Engine, C: WallClock = SystemWallClock> {
    slot: Slot,
    engine: E,
    clock: C,
    commands: CommandReceiver,
    listener: Option<Box<dyn StateListener<E>>>,
    host: Option<Weak<dyn DeviceHost>>,

    remaining_steps: u32,
    run_to_address: Option<Address>,
    run_to_return: bool,
    speed_percent: u32,
    max_speed: bool,
    throttle: Throttle,

    keys: KeyInput,
    keypad_state: Option<KeypadState>,
    last_answer: Option<String>,
    /// The running flag as observers last heard about it.
    reported_running: bool,
    closed: bool,
}

impl<E: Engine, C: WallClock> Debug for DeviceScheduler<E, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("DeviceScheduler")
            .field("slot", &self.slot)
            .field("mode", &self.mode())
            .field("state", &self.run_state())
            .field("keys", &self.keys)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<E: Engine> DeviceScheduler<E, SystemWallClock> {
    pub fn new(slot: Slot, engine: E, commands: CommandReceiver) -> Self {
        DeviceScheduler::with_clock(slot, engine, commands, SystemWallClock::new())
    }
}

impl<E: Engine, C: WallClock> DeviceScheduler<E, C> {
    pub fn with_clock(slot: Slot, engine: E, commands: CommandReceiver, clock: C) -> Self {
        let speed = engine.speed();
        let reported_running = engine.is_running();
        // The display won't necessarily update by itself for a
        // while, so ask for an initial refresh.
        commands.push_internal(Command::UpdateDisplay);
        DeviceScheduler {
            slot,
            engine,
            clock,
            commands,
            listener: None,
            host: None,
            remaining_steps: 0,
            run_to_address: None,
            run_to_return: false,
            speed_percent: speed.percent().unwrap_or(100),
            max_speed: speed.is_max(),
            throttle: Throttle::new(),
            keys: KeyInput::new(),
            keypad_state: None,
            last_answer: None,
            reported_running,
            closed: false,
        }
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Box<dyn StateListener<E>>) -> Self {
        self.listener = Some(listener);
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: Weak<dyn DeviceHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn sender(&self) -> CommandSender {
        self.commands.sender()
    }

    pub fn last_answer(&self) -> Option<&str> {
        self.last_answer.as_deref()
    }

    pub fn clear_last_answer(&mut self) {
        self.last_answer = None;
    }

    pub fn keys_pending(&self) -> usize {
        self.keys.pending()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn run_state(&self) -> RunState {
        RunState {
            running: self.engine.is_running(),
            remaining_steps: self.remaining_steps,
            run_to_address: self.run_to_address,
            run_to_return: self.run_to_return,
            speed_percent: self.speed_percent,
            max_speed: self.max_speed,
        }
    }

    /// Works out which of the run modes will govern the next tick.
    /// Several of the underlying fields may be set at once; the
    /// priority order here decides between them.
    pub fn mode(&self) -> RunMode {
        if self.closed {
            RunMode::Closed
        } else if self.engine.is_active() && self.engine.is_running() {
            RunMode::Running
        } else if self.remaining_steps != 0 {
            RunMode::SteppingFixed(self.remaining_steps)
        } else if let Some(target) = self.run_to_address {
            RunMode::RunningToAddress(target)
        } else if self.run_to_return {
            RunMode::RunningToReturn
        } else {
            RunMode::Idle
        }
    }

    /// Runs ticks until the device is closed, then hands back the
    /// engine.
    pub fn run(mut self) -> E {
        event!(Level::INFO, "device scheduler for slot {} starting", self.slot);
        while let TickOutcome::Continue(_) = self.tick() {}
        event!(
            Level::INFO,
            "device scheduler for slot {} terminating",
            self.slot
        );
        self.engine
    }

    /// Performs one iteration of the scheduler loop.
    pub fn tick(&mut self) -> TickOutcome {
        if self.closed {
            return TickOutcome::Closed;
        }
        let tick_span = span!(Level::TRACE, "tick", slot = %self.slot);
        let _enter = tick_span.enter();

        let (driver, finished) = self.advance();
        let running = self.engine.is_running();
        if finished || running != self.reported_running {
            // Let observers know without making them poll.
            self.reported_running = running;
            self.commands.push_internal(Command::RequestState);
        }

        self.service_keys();

        if let Some(cmd) = self.commands.try_dequeue() {
            self.apply(cmd);
            if self.closed {
                return TickOutcome::Closed;
            }
        }

        self.pace();
        TickOutcome::Continue(driver)
    }

    fn quantum(&self) -> u64 {
        tick_quantum(self.speed_percent, self.engine.frequency_hz())
    }

    /// Invokes the engine primitive for the current run mode.
    /// Returns the primitive used and whether a debugging run
    /// (steps, run-to-address, run-to-return) came to an end.
    fn advance(&mut self) -> (Driver, bool) {
        let (driver, result) = match self.mode() {
            RunMode::Running => {
                self.check_keypad_state();
                let tstates = self.quantum();
                (
                    Driver::TimeSlice { tstates },
                    self.engine.run_for_time_slice(tstates),
                )
            }
            RunMode::SteppingFixed(steps) => {
                self.remaining_steps = 0;
                (
                    Driver::FixedSteps { steps },
                    self.engine.run_fixed_steps(steps),
                )
            }
            RunMode::RunningToAddress(target) => {
                let tstates = self.quantum();
                (
                    Driver::ToAddress { tstates, target },
                    self.engine.run_to_address(tstates, target),
                )
            }
            RunMode::RunningToReturn => {
                let tstates = self.quantum();
                (
                    Driver::ToReturn { tstates },
                    self.engine.run_to_return(tstates),
                )
            }
            RunMode::Idle | RunMode::Closed => {
                self.clock.wait(IDLE_INTERVAL, &self.commands);
                return (Driver::Idle, false);
            }
        };

        let debugging = !matches!(driver, Driver::TimeSlice { .. });
        match result {
            Ok(RunOutcome::BudgetExhausted) => (driver, matches!(driver, Driver::FixedSteps { .. })),
            Ok(RunOutcome::TargetReached) => {
                event!(Level::DEBUG, "{:?} reached its target", driver);
                self.clear_debug_drivers();
                (driver, debugging)
            }
            Ok(RunOutcome::BreakpointHit(address)) => {
                event!(
                    Level::INFO,
                    "slot {}: breakpoint hit at {}",
                    self.slot,
                    address
                );
                self.engine.set_running(false);
                self.clear_debug_drivers();
                (driver, debugging)
            }
            Err(e) => {
                self.on_engine_failure(e);
                (driver, debugging)
            }
        }
    }

    fn clear_debug_drivers(&mut self) {
        self.remaining_steps = 0;
        self.run_to_address = None;
        self.run_to_return = false;
    }

    /// One device's failure must not take down the others, so we stop
    /// the device and carry on.
    fn on_engine_failure(&mut self, e: EngineError) {
        event!(
            Level::ERROR,
            "slot {}: emulation stopped: {}",
            self.slot,
            e
        );
        self.engine.set_running(false);
        self.clear_debug_drivers();
        if let Some(listener) = self.listener.as_mut() {
            listener.engine_failed(self.slot, &e);
        }
    }

    fn check_keypad_state(&mut self) {
        let current = self.engine.keypad_state();
        if self.keypad_state != Some(current) {
            self.keypad_state = Some(current);
            self.call_host(|host, slot| host.repaint(slot));
        }
    }

    fn service_keys(&mut self) {
        let now = self.engine.tstates();
        match self.keys.service(now, self.engine.key_scan_period()) {
            Some(KeyEvent::Press(key)) => {
                event!(Level::TRACE, "typing: press {}", key);
                self.engine.keypad_press(key);
            }
            Some(KeyEvent::Release(key)) => {
                event!(Level::TRACE, "typing: release {}", key);
                self.engine.keypad_release(key);
            }
            None => (),
        }
    }

    fn pace(&mut self) {
        let wall = self.clock.now();
        let emulated = self.engine.elapsed();
        if let Some(wait) = self
            .throttle
            .pace(wall, emulated, self.speed_percent, self.max_speed)
        {
            self.clock.wait(wait, &self.commands);
        }
    }

    /// Starts pacing afresh from the current moment.
    fn reanchor(&mut self) {
        self.throttle.reset();
    }

    fn call_host<F>(&self, f: F)
    where
        F: FnOnce(&dyn DeviceHost, Slot),
    {
        match self.host.as_ref().and_then(Weak::upgrade) {
            Some(host) => f(host.as_ref(), self.slot),
            None => {
                event!(
                    Level::DEBUG,
                    "slot {} has no host, ignoring host request",
                    self.slot
                );
            }
        }
    }

    fn notify_listener(&mut self) {
        let mode = self.mode();
        let state = self.run_state();
        if let Some(listener) = self.listener.as_mut() {
            let view = DeviceView {
                slot: self.slot,
                engine: &self.engine,
                mode,
                state,
                last_answer: self.last_answer.as_deref(),
                keys_pending: self.keys.pending(),
            };
            listener.device_state(&view);
        }
    }

    fn fetch_last_answer(&mut self) -> Option<String> {
        self.last_answer = self.engine.last_answer();
        self.last_answer.clone().filter(|s| !s.is_empty())
    }

    /// Applies a command to the run-mode state.  Commands which only
    /// make sense while the device is stopped (the stepping
    /// commands) are ignored while it is running.
    fn apply(&mut self, cmd: Command) {
        event!(Level::DEBUG, "slot {}: applying {}", self.slot, cmd);
        let running = self.engine.is_running();
        match cmd {
            Command::Reset => {
                self.engine.set_running(false);
                self.clear_debug_drivers();
                self.reanchor();
                if let Err(e) = self.engine.reset() {
                    self.on_engine_failure(e);
                    return;
                }
                if running {
                    self.engine.set_running(true);
                    if let Err(e) = self.engine.power_on() {
                        self.on_engine_failure(e);
                    }
                }
            }
            Command::TurnOn => {
                self.engine.set_running(true);
                self.clear_debug_drivers();
                self.reanchor();
                if let Err(e) = self.engine.power_on() {
                    self.on_engine_failure(e);
                }
            }
            Command::Run => {
                self.engine.set_running(true);
                self.clear_debug_drivers();
                self.reanchor();
            }
            Command::Stop => {
                self.engine.set_running(false);
                self.clear_debug_drivers();
            }
            Command::Step if !running => {
                self.clear_debug_drivers();
                self.remaining_steps = 1;
            }
            Command::StepN(n) if !running => {
                self.clear_debug_drivers();
                self.remaining_steps = n.get();
            }
            Command::StepUntilPc(target) if !running => {
                // Always a replacement, never a second target.
                self.clear_debug_drivers();
                self.run_to_address = Some(target);
                self.reanchor();
            }
            Command::StepOver if !running => {
                self.clear_debug_drivers();
                match self.engine.call_return_address() {
                    Some(after_call) => {
                        self.run_to_address = Some(after_call);
                        self.reanchor();
                    }
                    None => {
                        self.remaining_steps = 1;
                    }
                }
            }
            Command::Step | Command::StepN(_) | Command::StepUntilPc(_) | Command::StepOver => {
                event!(
                    Level::DEBUG,
                    "slot {}: ignoring {} because the device is running",
                    self.slot,
                    cmd
                );
            }
            Command::StepOut => {
                self.clear_debug_drivers();
                self.run_to_return = true;
                self.reanchor();
            }
            Command::SetSpeed(speed) => {
                self.engine.set_speed(speed);
                match speed.percent() {
                    Some(percent) => {
                        self.speed_percent = percent;
                        self.max_speed = false;
                    }
                    None => {
                        self.max_speed = true;
                    }
                }
                self.reanchor();
            }
            Command::SetProfile(name) => match self.engine.set_profile(&name) {
                Ok(()) => self.call_host(|host, slot| host.repaint(slot)),
                Err(e) => {
                    event!(
                        Level::WARN,
                        "slot {}: failed to select profile: {}",
                        self.slot,
                        e
                    );
                }
            },
            Command::ToggleBreakpoint { address, kinds } => {
                let current = self.engine.breakpoints_at(address);
                for kind in kinds.iter() {
                    if current.contains(kind) {
                        self.engine.clear_breakpoint(address, kind);
                    } else {
                        self.engine.set_breakpoint(address, kind);
                    }
                }
            }
            Command::KeyDown(key) => self.engine.keypad_press(key),
            Command::KeyUp(key) => self.engine.keypad_release(key),
            Command::KeyboardKeyDown {
                virtual_key,
                location,
            } => self.engine.keyboard_key_down(virtual_key, location),
            Command::KeyboardKeyUp {
                virtual_key,
                location,
            } => self.engine.keyboard_key_up(virtual_key, location),
            Command::RequestState => self.notify_listener(),
            Command::UpdateDisplay => self.engine.update_display(),
            Command::ConnectLink => self.call_host(|host, slot| host.connect_link(slot)),
            Command::DisconnectLink => self.call_host(|host, slot| host.disconnect_link(slot)),
            Command::GetLastAnswer => {
                self.fetch_last_answer();
            }
            Command::CopyLastAnswer => {
                if let Some(text) = self.fetch_last_answer() {
                    self.call_host(|host, _| host.set_clipboard_text(&text));
                }
            }
            Command::CopyTextTo(sink) => {
                if let Some(text) = self.fetch_last_answer() {
                    sink.0.deliver(&text);
                }
            }
            Command::Paste => {
                let mut text: Option<String> = None;
                self.call_host(|host, _| text = host.clipboard_text());
                match text {
                    Some(text) => {
                        let queued = self.keys.queue_text(&text);
                        event!(Level::DEBUG, "slot {}: pasting {} keys", self.slot, queued);
                    }
                    None => {
                        event!(Level::WARN, "slot {}: clipboard has no text", self.slot);
                    }
                }
            }
            Command::TypeText(text) => {
                self.keys.queue_text(&text);
            }
            Command::Debug => self.call_host(|host, slot| host.show_debugger(slot)),
            Command::Close => {
                self.closed = true;
            }
        }
    }

    /// Starts the scheduler on a thread of its own.
    ///
    /// # Errors
    ///
    /// Fails only if the operating system cannot create a thread.
    pub fn spawn(self) -> std::io::Result<SchedulerHandle>
    where
        E: Send + 'static,
        C: Send + 'static,
    {
        let slot = self.slot;
        let sender = self.sender();
        let thread = thread::Builder::new()
            .name(format!("device-{slot}"))
            .spawn(move || {
                self.run();
            })?;
        Ok(SchedulerHandle {
            slot,
            sender,
            thread,
        })
    }
}

/// Signals that a scheduler thread panicked rather than exiting
/// normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerPanicked(pub Slot);

impl fmt::Display for SchedulerPanicked {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "the scheduler thread for slot {} panicked", self.0)
    }
}

impl std::error::Error for SchedulerPanicked {}

/// A running scheduler thread.
#[derive(Debug)]
pub struct SchedulerHandle {
    slot: Slot,
    sender: CommandSender,
    thread: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn sender(&self) -> &CommandSender {
        &self.sender
    }

    pub fn enqueue(&self, cmd: Command) -> Result<(), QueueClosed> {
        self.sender.enqueue(cmd)
    }

    /// True once the scheduler loop has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the thread to exit without asking it to.
    pub fn join(self) -> Result<(), SchedulerPanicked> {
        let slot = self.slot;
        self.thread.join().map_err(|_| SchedulerPanicked(slot))
    }

    /// Asks the scheduler to close and waits for it to do so.  The
    /// request goes through the command queue like any other, so
    /// commands queued before it are still processed.
    pub fn shutdown(self) -> Result<(), SchedulerPanicked> {
        if self.sender.enqueue(Command::Close).is_err() {
            event!(
                Level::DEBUG,
                "slot {} was already closing",
                self.slot
            );
        }
        self.join()
    }
}

#[cfg(test)]
mod tests;
