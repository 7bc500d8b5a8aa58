//! Requests which can be made of a device.
//!
//! Any thread may build a [`Command`] and enqueue it for a device;
//! only the device's own scheduler thread ever acts on it.  Commands
//! whose payload has invariants (a positive step count, an address
//! which fits in 16 bits) are built with the validating constructors
//! here, so an invalid command never reaches a queue.
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::num::NonZeroU32;
use std::sync::Arc;

use base::prelude::*;

/// Something which can receive text from a device, for example an
/// entry field in a host's user interface.  The scheduler calls
/// [`TextSink::deliver`] synchronously on its own thread; marshalling
/// the text onto a UI thread is the sink's job.
pub trait TextSink: Send + Sync {
    fn deliver(&self, text: &str);
}

/// A shared reference to a [`TextSink`].
#[derive(Clone)]
pub struct SinkRef(pub Arc<dyn TextSink>);

impl Debug for SinkRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str("SinkRef(..)")
    }
}

/// A number of instructions to single-step.  Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepCount(NonZeroU32);

impl StepCount {
    pub const ONE: StepCount = StepCount(NonZeroU32::MIN);

    pub fn get(&self) -> u32 {
        self.0.get()
    }
}

impl TryFrom<u32> for StepCount {
    type Error = CommandError;

    fn try_from(n: u32) -> Result<StepCount, CommandError> {
        NonZeroU32::new(n)
            .map(StepCount)
            .ok_or(CommandError::ZeroStepCount)
    }
}

/// Host keyboard key location (for keys such as Shift or Enter
/// which appear more than once on a PC keyboard).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyLocation {
    Standard,
    Left,
    Right,
    Numpad,
}

#[derive(Debug, Clone)]
pub enum Command {
    /// Reset the CPU and peripherals.  A device which was running
    /// is powered on again afterwards.
    Reset,
    /// Start running and power the device on.
    TurnOn,
    Run,
    Stop,
    /// Execute one instruction (ignored while running).
    Step,
    /// Execute several instructions (ignored while running).
    StepN(StepCount),
    /// Run until the program counter reaches an address (ignored
    /// while running).
    StepUntilPc(Address),
    /// Step, but execute a subroutine call as a unit.
    StepOver,
    /// Run until the current subroutine returns.
    StepOut,
    SetSpeed(Speed),
    /// Select a hardware profile (keypad layout, skin and so on) by name.
    SetProfile(String),
    ToggleBreakpoint {
        address: Address,
        kinds: BreakpointKinds,
    },
    /// Press a key in the calculator's keypad matrix.
    KeyDown(KeyCode),
    KeyUp(KeyCode),
    /// A key was pressed on the host's keyboard; the engine decides
    /// which calculator key (if any) that corresponds to.
    KeyboardKeyDown {
        virtual_key: u32,
        location: KeyLocation,
    },
    KeyboardKeyUp {
        virtual_key: u32,
        location: KeyLocation,
    },
    /// Give the state listener a look at the device.
    RequestState,
    UpdateDisplay,
    /// Join the link hub, so that this device is cabled to the other
    /// members.
    ConnectLink,
    DisconnectLink,
    /// Fetch the value of the calculator's `Ans` variable.
    GetLastAnswer,
    /// Fetch `Ans` and put it on the host clipboard.
    CopyLastAnswer,
    /// Fetch `Ans` and hand it to a sink.
    CopyTextTo(SinkRef),
    /// Type the host clipboard's text on the keypad.
    Paste,
    /// Type some text on the keypad.
    TypeText(String),
    /// Show the debugger for this device.
    Debug,
    /// Stop the scheduler.  Nothing queued after this is processed.
    Close,
}

/// Describes why a [`Command`] could not be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    ZeroStepCount,
    NegativeAddress(i64),
    NoBreakpointKind,
    NothingToType,
}

impl Display for CommandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            CommandError::ZeroStepCount => f.write_str("step count must be positive"),
            CommandError::NegativeAddress(n) => write!(f, "address {n} is negative"),
            CommandError::NoBreakpointKind => {
                f.write_str("breakpoint toggle must name at least one kind")
            }
            CommandError::NothingToType => {
                f.write_str("text contains no characters which can be typed on the keypad")
            }
        }
    }
}

impl Error for CommandError {}

impl From<NegativeAddress> for CommandError {
    fn from(e: NegativeAddress) -> CommandError {
        CommandError::NegativeAddress(e.0)
    }
}

impl Command {
    pub fn step_n(n: u32) -> Result<Command, CommandError> {
        Ok(Command::StepN(StepCount::try_from(n)?))
    }

    /// Run-to-address targets are masked to 16 bits (a debugger may
    /// hand us a paged address).
    pub fn step_until_pc(target: i64) -> Result<Command, CommandError> {
        Ok(Command::StepUntilPc(Address::try_from(target)?))
    }

    pub fn toggle_breakpoint(address: u32, kind_bits: u8) -> Result<Command, CommandError> {
        let kinds = BreakpointKinds::from_bits_truncate(kind_bits);
        if kinds.is_empty() {
            return Err(CommandError::NoBreakpointKind);
        }
        Ok(Command::ToggleBreakpoint {
            address: Address::from_masked(address),
            kinds,
        })
    }

    pub fn key_down(group: u8, bit: u8) -> Result<Command, KeyCodeError> {
        Ok(Command::KeyDown(KeyCode::try_from((group, bit))?))
    }

    pub fn key_up(group: u8, bit: u8) -> Result<Command, KeyCodeError> {
        Ok(Command::KeyUp(KeyCode::try_from((group, bit))?))
    }

    pub fn type_text(text: &str) -> Result<Command, CommandError> {
        if text.chars().any(|ch| KeyCode::for_char(ch).is_some()) {
            Ok(Command::TypeText(text.to_string()))
        } else {
            Err(CommandError::NothingToType)
        }
    }

    pub fn copy_text_to(sink: Arc<dyn TextSink>) -> Command {
        Command::CopyTextTo(SinkRef(sink))
    }

    /// A short name for the kind of command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Reset => "Reset",
            Command::TurnOn => "TurnOn",
            Command::Run => "Run",
            Command::Stop => "Stop",
            Command::Step => "Step",
            Command::StepN(_) => "StepN",
            Command::StepUntilPc(_) => "StepUntilPc",
            Command::StepOver => "StepOver",
            Command::StepOut => "StepOut",
            Command::SetSpeed(_) => "SetSpeed",
            Command::SetProfile(_) => "SetProfile",
            Command::ToggleBreakpoint { .. } => "ToggleBreakpoint",
            Command::KeyDown(_) => "KeyDown",
            Command::KeyUp(_) => "KeyUp",
            Command::KeyboardKeyDown { .. } => "KeyboardKeyDown",
            Command::KeyboardKeyUp { .. } => "KeyboardKeyUp",
            Command::RequestState => "RequestState",
            Command::UpdateDisplay => "UpdateDisplay",
            Command::ConnectLink => "ConnectLink",
            Command::DisconnectLink => "DisconnectLink",
            Command::GetLastAnswer => "GetLastAnswer",
            Command::CopyLastAnswer => "CopyLastAnswer",
            Command::CopyTextTo(_) => "CopyTextTo",
            Command::Paste => "Paste",
            Command::TypeText(_) => "TypeText",
            Command::Debug => "Debug",
            Command::Close => "Close",
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Command::StepN(n) => write!(f, "StepN({})", n.get()),
            Command::StepUntilPc(a) => write!(f, "StepUntilPc({a})"),
            Command::SetSpeed(s) => write!(f, "SetSpeed({s})"),
            Command::ToggleBreakpoint { address, kinds } => {
                write!(f, "ToggleBreakpoint({address}, {kinds:?})")
            }
            Command::KeyDown(k) => write!(f, "KeyDown({k})"),
            Command::KeyUp(k) => write!(f, "KeyUp({k})"),
            other => f.write_str(other.name()),
        }
    }
}

#[test]
fn test_step_n_rejects_zero() {
    assert_eq!(
        Command::step_n(0).unwrap_err(),
        CommandError::ZeroStepCount
    );
    match Command::step_n(3) {
        Ok(Command::StepN(n)) => assert_eq!(n.get(), 3),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_step_until_pc_validation() {
    assert_eq!(
        Command::step_until_pc(-2).unwrap_err(),
        CommandError::NegativeAddress(-2)
    );
    match Command::step_until_pc(0x4_9D95) {
        Ok(Command::StepUntilPc(a)) => assert_eq!(a, Address::new(0x9D95)),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_toggle_breakpoint_masks_address() {
    match Command::toggle_breakpoint(0x1_8000, 0b101) {
        Ok(Command::ToggleBreakpoint { address, kinds }) => {
            assert_eq!(address, Address::new(0x8000));
            assert_eq!(kinds, BreakpointKinds::NORMAL | BreakpointKinds::MEM_WRITE);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        Command::toggle_breakpoint(0x8000, 0).unwrap_err(),
        CommandError::NoBreakpointKind
    );
}

#[test]
fn test_key_commands_validate_position() {
    assert!(Command::key_down(6, 5).is_ok());
    assert!(Command::key_up(9, 0).is_err());
}

#[test]
fn test_type_text_needs_typeable_character() {
    assert!(Command::type_text("1+1\n").is_ok());
    assert_eq!(
        Command::type_text("@#\t").unwrap_err(),
        CommandError::NothingToType
    );
}

#[test]
fn test_display() {
    assert_eq!(Command::step_n(4).unwrap().to_string(), "StepN(4)");
    assert_eq!(Command::Close.to_string(), "Close");
    assert_eq!(
        Command::SetSpeed(Speed::Double).to_string(),
        "SetSpeed(200%)"
    );
}
