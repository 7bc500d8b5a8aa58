//! This crate runs emulated calculators.  Each device gets a
//! scheduler thread which drives its emulation engine, paces it
//! against the wall clock and applies the commands queued for it.
#![crate_name = "scheduler"]

mod clock;
mod command;
mod engine;
mod host;
mod keys;
mod listener;
mod queue;
mod registry;
mod scheduler;
mod throttle;

pub use clock::{ManualClock, SystemWallClock, WallClock};
pub use command::{Command, CommandError, KeyLocation, SinkRef, StepCount, TextSink};
pub use engine::{Engine, EngineError, RunOutcome};
pub use host::{Clipboard, Debugger, DeviceHost, DeviceUi, MemoryClipboard};
pub use keys::{KeyEvent, KeyInput};
pub use listener::{DeviceStatus, DeviceView, StateListener};
pub use queue::{command_queue, CommandReceiver, CommandSender, QueueClosed};
pub use registry::{
    DeviceInfo, Registry, RegistryConfig, RegistryError, Slot, SLOT_BLOCK,
};
pub use scheduler::{
    DeviceScheduler, Driver, RunMode, RunState, SchedulerHandle, SchedulerPanicked, TickOutcome,
    IDLE_INTERVAL,
};
pub use throttle::{quantum, tick_quantum, Throttle, FPS, FRAME_SUBDIVISIONS};
