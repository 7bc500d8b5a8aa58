//! A stand-in emulation engine.
//!
//! This does not emulate a real CPU.  It executes a stream of
//! imaginary 4-T-state instructions, one per address, so that the
//! scheduler has something to drive.  Every address which is a
//! multiple of 16 holds a 3-byte "call" instruction and every address
//! ending in `0x3F` holds a "return".
//!
//! The keypad is wired to a tiny adding machine: digit and `+` keys
//! build up an entry line, ENTER adds up the terms and stores the
//! result as the last answer, CLEAR empties the line.
use std::collections::HashMap;
use std::time::Duration;

use tracing::{event, Level};

use base::prelude::*;
use scheduler::{Engine, EngineError, KeyLocation, RunOutcome};

const TSTATES_PER_INSTRUCTION: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Profile {
    name: &'static str,
    frequency_hz: u32,
}

const PROFILES: [Profile; 3] = [
    Profile {
        name: "ti83p",
        frequency_hz: 6_000_000,
    },
    Profile {
        name: "ti84p",
        frequency_hz: 15_000_000,
    },
    Profile {
        name: "ti84pse",
        frequency_hz: 15_000_000,
    },
];

fn find_profile(name: &str) -> Option<Profile> {
    PROFILES
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .copied()
}

pub fn profile_names() -> Vec<&'static str> {
    PROFILES.iter().map(|p| p.name).collect()
}

#[derive(Debug)]
pub struct DemoEngine {
    profile: Profile,
    active: bool,
    running: bool,
    speed: Speed,
    tstates: u64,
    elapsed: Duration,
    pc: Address,
    breakpoints: HashMap<Address, BreakpointKinds>,
    entry: String,
    answer: Option<String>,
    keypad_state: KeypadState,
}

impl DemoEngine {
    pub fn new(profile: &str) -> Result<DemoEngine, EngineError> {
        let profile =
            find_profile(profile).ok_or_else(|| EngineError::UnknownProfile(profile.to_string()))?;
        Ok(DemoEngine {
            profile,
            active: false,
            running: false,
            speed: Speed::Normal,
            tstates: 0,
            elapsed: Duration::ZERO,
            pc: Address::ZERO,
            breakpoints: HashMap::new(),
            entry: String::new(),
            answer: None,
            keypad_state: KeypadState::Normal,
        })
    }

    fn charge(&mut self, tstates: u64) {
        self.tstates = self.tstates.saturating_add(tstates);
        let nanos: u128 =
            u128::from(tstates) * 1_000_000_000 / u128::from(self.profile.frequency_hz);
        self.elapsed += Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
    }

    fn is_return(address: Address) -> bool {
        u16::from(address) & 0x3F == 0x3F
    }

    /// Executes one instruction.  Returns the address of an execution
    /// breakpoint if the next instruction has one.
    fn step(&mut self) -> Option<Address> {
        let length = if u16::from(self.pc) % 16 == 0 { 3 } else { 1 };
        self.charge(TSTATES_PER_INSTRUCTION);
        for _ in 0..length {
            self.pc = self.pc.successor();
        }
        let kinds = self.breakpoints_at(self.pc);
        kinds.contains(BreakpointKinds::NORMAL).then_some(self.pc)
    }

    fn run_until<F>(&mut self, budget: u64, mut done: F) -> Result<RunOutcome, EngineError>
    where
        F: FnMut(&DemoEngine, Address) -> bool,
    {
        if !self.active {
            return Err(EngineError::Other("the device is switched off".to_string()));
        }
        let mut remaining = budget;
        while remaining >= TSTATES_PER_INSTRUCTION {
            let before = self.pc;
            let hit = self.step();
            remaining -= TSTATES_PER_INSTRUCTION;
            if done(self, before) {
                return Ok(RunOutcome::TargetReached);
            }
            if let Some(address) = hit {
                self.running = false;
                return Ok(RunOutcome::BreakpointHit(address));
            }
        }
        Ok(RunOutcome::BudgetExhausted)
    }

    fn evaluate(&mut self) {
        let result = add_up(&self.entry);
        event!(Level::DEBUG, "{} = {:?}", self.entry, result);
        self.answer = Some(match result {
            Some(n) => n.to_string(),
            None => "ERR:SYNTAX".to_string(),
        });
        self.entry.clear();
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }
}

/// Adds up the `+`-separated terms of `line`.
pub fn add_up(line: &str) -> Option<u64> {
    if line.is_empty() {
        return Some(0);
    }
    line.split('+')
        .map(|term| term.parse::<u64>().ok())
        .try_fold(0u64, |sum, term| sum.checked_add(term?))
}

fn key_char(key: KeyCode) -> Option<char> {
    let ch = match key {
        KeyCode::ZERO => '0',
        KeyCode::ONE => '1',
        KeyCode::TWO => '2',
        KeyCode::THREE => '3',
        KeyCode::FOUR => '4',
        KeyCode::FIVE => '5',
        KeyCode::SIX => '6',
        KeyCode::SEVEN => '7',
        KeyCode::EIGHT => '8',
        KeyCode::NINE => '9',
        KeyCode::PLUS => '+',
        _ => {
            return None;
        }
    };
    Some(ch)
}

impl Engine for DemoEngine {
    fn run_for_time_slice(&mut self, tstates: u64) -> Result<RunOutcome, EngineError> {
        if !self.running {
            return Ok(RunOutcome::BudgetExhausted);
        }
        self.run_until(tstates, |_, _| false)
    }

    fn run_fixed_steps(&mut self, steps: u32) -> Result<RunOutcome, EngineError> {
        self.run_until(u64::from(steps) * TSTATES_PER_INSTRUCTION, |_, _| false)
    }

    fn run_to_address(&mut self, tstates: u64, target: Address) -> Result<RunOutcome, EngineError> {
        self.run_until(tstates, |engine, _| engine.pc == target)
    }

    fn run_to_return(&mut self, tstates: u64) -> Result<RunOutcome, EngineError> {
        self.run_until(tstates, |_, executed| DemoEngine::is_return(executed))
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        self.pc = Address::ZERO;
        self.entry.clear();
        self.keypad_state = KeypadState::Normal;
        Ok(())
    }

    fn power_on(&mut self) -> Result<(), EngineError> {
        self.active = true;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    fn speed(&self) -> Speed {
        self.speed
    }

    fn set_speed(&mut self, speed: Speed) {
        self.speed = speed;
    }

    fn elapsed(&self) -> Duration {
        self.elapsed
    }

    fn tstates(&self) -> u64 {
        self.tstates
    }

    fn frequency_hz(&self) -> u32 {
        self.profile.frequency_hz
    }

    /// The keypad is scanned every 10ms.
    fn key_scan_period(&self) -> u64 {
        u64::from(self.profile.frequency_hz / 100)
    }

    fn program_counter(&self) -> Address {
        self.pc
    }

    fn call_return_address(&self) -> Option<Address> {
        if u16::from(self.pc) % 16 == 0 {
            Some(Address::new(u16::from(self.pc).wrapping_add(3)))
        } else {
            None
        }
    }

    fn breakpoints_at(&self, address: Address) -> BreakpointKinds {
        self.breakpoints
            .get(&address)
            .copied()
            .unwrap_or(BreakpointKinds::NONE)
    }

    fn set_breakpoint(&mut self, address: Address, kind: BreakpointKinds) {
        let kinds = self.breakpoints.entry(address).or_default();
        *kinds = *kinds | kind;
    }

    fn clear_breakpoint(&mut self, address: Address, kind: BreakpointKinds) {
        if let Some(kinds) = self.breakpoints.get_mut(&address) {
            *kinds = BreakpointKinds::from_bits_truncate(kinds.bits() & !kind.bits());
            if kinds.is_empty() {
                self.breakpoints.remove(&address);
            }
        }
    }

    fn keypad_press(&mut self, key: KeyCode) {
        match key {
            KeyCode::ENTER => self.evaluate(),
            KeyCode::CLEAR => self.entry.clear(),
            KeyCode::SECOND => self.keypad_state = KeypadState::Second,
            KeyCode::ALPHA => self.keypad_state = KeypadState::Alpha,
            key => match key_char(key) {
                Some(ch) => {
                    self.entry.push(ch);
                    self.keypad_state = KeypadState::Normal;
                }
                None => event!(Level::DEBUG, "key {} does nothing here", key),
            },
        }
    }

    fn keypad_release(&mut self, _key: KeyCode) {}

    /// Host keys `0`-`9`, `+` and Enter type the matching calculator
    /// key.
    fn keyboard_key_down(&mut self, virtual_key: u32, location: KeyLocation) {
        let key = char::from_u32(virtual_key).and_then(|ch| match ch {
            '\r' => Some(KeyCode::ENTER),
            ch => key_char_for_host(ch),
        });
        match key {
            Some(key) => self.keypad_press(key),
            None => event!(
                Level::DEBUG,
                "host key {:#x} ({:?}) is not mapped",
                virtual_key,
                location
            ),
        }
    }

    fn keyboard_key_up(&mut self, _virtual_key: u32, _location: KeyLocation) {}

    fn keypad_state(&self) -> KeypadState {
        self.keypad_state
    }

    fn last_answer(&self) -> Option<String> {
        self.answer.clone()
    }

    fn set_profile(&mut self, name: &str) -> Result<(), EngineError> {
        self.profile =
            find_profile(name).ok_or_else(|| EngineError::UnknownProfile(name.to_string()))?;
        Ok(())
    }

    fn update_display(&mut self) {
        // There is no screen; the entry line stands in for one.
        event!(Level::TRACE, "display: {:?}", self.entry());
    }
}

fn key_char_for_host(ch: char) -> Option<KeyCode> {
    if ch.is_ascii_digit() || ch == '+' {
        KeyCode::for_char(ch)
    } else {
        None
    }
}

#[test]
fn test_add_up() {
    assert_eq!(add_up("1+2+39"), Some(42));
    assert_eq!(add_up("7"), Some(7));
    assert_eq!(add_up(""), Some(0));
    assert_eq!(add_up("1++2"), None);
    assert_eq!(add_up("18446744073709551615+1"), None);
}

#[test]
fn test_typing_a_sum() {
    let mut engine = DemoEngine::new("ti83p").unwrap();
    for ch in "12+30\n".chars() {
        engine.keypad_press(KeyCode::for_char(ch).unwrap());
    }
    assert_eq!(engine.last_answer().as_deref(), Some("42"));
    assert_eq!(engine.entry(), "");
}

#[test]
fn test_switched_off_engine_refuses_to_run() {
    let mut engine = DemoEngine::new("ti83p").unwrap();
    assert!(engine.run_fixed_steps(1).is_err());
    engine.power_on().unwrap();
    assert_eq!(engine.run_fixed_steps(2), Ok(RunOutcome::BudgetExhausted));
    // Address 0 holds a call, so two steps take us to 4.
    assert_eq!(engine.program_counter(), Address::new(4));
    assert_eq!(engine.tstates(), 8);
}

#[test]
fn test_run_to_address_and_breakpoints() {
    let mut engine = DemoEngine::new("ti84p").unwrap();
    engine.power_on().unwrap();
    assert_eq!(
        engine.run_to_address(1000, Address::new(0x20)),
        Ok(RunOutcome::TargetReached)
    );
    assert_eq!(engine.program_counter(), Address::new(0x20));
    engine.set_breakpoint(Address::new(0x25), BreakpointKinds::NORMAL);
    engine.set_running(true);
    assert_eq!(
        engine.run_for_time_slice(1000),
        Ok(RunOutcome::BreakpointHit(Address::new(0x25)))
    );
    assert!(!engine.is_running());
}

#[test]
fn test_run_to_return() {
    let mut engine = DemoEngine::new("ti83p").unwrap();
    engine.power_on().unwrap();
    assert_eq!(engine.run_to_return(10_000), Ok(RunOutcome::TargetReached));
    assert_eq!(engine.program_counter(), Address::new(0x40));
}

#[test]
fn test_profiles() {
    let mut engine = DemoEngine::new("TI84p").unwrap();
    assert_eq!(engine.frequency_hz(), 15_000_000);
    assert_eq!(
        engine.set_profile("ti99"),
        Err(EngineError::UnknownProfile("ti99".to_string()))
    );
    engine.set_profile("ti83p").unwrap();
    assert_eq!(engine.frequency_hz(), 6_000_000);
    assert!(DemoEngine::new("nonesuch").is_err());
}
