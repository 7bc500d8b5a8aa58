use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use base::prelude::*;

use super::super::clock::{ManualClock, WallClock};
use super::super::command::{Command, KeyLocation, StepCount, TextSink};
use super::super::engine::{Engine, EngineError, RunOutcome};
use super::super::host::{Clipboard, DeviceHost, MemoryClipboard};
use super::super::keys::KeyEvent;
use super::super::listener::{DeviceView, StateListener};
use super::super::queue::{command_queue, CommandSender, QueueClosed};
use super::super::registry::Slot;
use super::super::throttle::tick_quantum;
use super::{DeviceScheduler, Driver, RunMode, TickOutcome, IDLE_INTERVAL};

const FREQUENCY: u32 = 6_000_000;
const SCAN_PERIOD: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    TimeSlice(u64),
    FixedSteps(u32),
    ToAddress(u64, Address),
    ToReturn(u64),
    Reset,
    PowerOn,
    UpdateDisplay,
    Keyboard(bool, u32),
}

/// An engine which does no emulation, only records what it was asked
/// to do.
#[derive(Debug)]
struct FakeEngine {
    running: bool,
    active: bool,
    speed: Speed,
    tstates: u64,
    pc: Address,
    calls: Vec<Call>,
    keys: Vec<(u64, KeyEvent)>,
    breakpoints: HashMap<Address, BreakpointKinds>,
    /// Run-to-address and run-to-return finish after this many calls.
    target_after: u32,
    target_calls: u32,
    call_return: Option<Address>,
    answer: Option<String>,
    profile: String,
    fail_next_run: Option<EngineError>,
}

impl FakeEngine {
    fn new() -> FakeEngine {
        FakeEngine {
            running: false,
            active: true,
            speed: Speed::Normal,
            tstates: 0,
            pc: Address::ZERO,
            calls: Vec::new(),
            keys: Vec::new(),
            breakpoints: HashMap::new(),
            target_after: 2,
            target_calls: 0,
            call_return: None,
            answer: None,
            profile: "ti83p".to_string(),
            fail_next_run: None,
        }
    }

    fn run_primitive_calls(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Call::TimeSlice(_) | Call::FixedSteps(_) | Call::ToAddress(..) | Call::ToReturn(_)
                )
            })
            .count()
    }

    fn take_failure(&mut self) -> Result<(), EngineError> {
        match self.fail_next_run.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn towards_target(&mut self, tstates: u64) -> RunOutcome {
        self.tstates += tstates;
        self.target_calls += 1;
        if self.target_calls >= self.target_after {
            self.target_calls = 0;
            RunOutcome::TargetReached
        } else {
            RunOutcome::BudgetExhausted
        }
    }
}

impl Engine for FakeEngine {
    fn run_for_time_slice(&mut self, tstates: u64) -> Result<RunOutcome, EngineError> {
        self.calls.push(Call::TimeSlice(tstates));
        self.take_failure()?;
        self.tstates += tstates;
        Ok(RunOutcome::BudgetExhausted)
    }

    fn run_fixed_steps(&mut self, steps: u32) -> Result<RunOutcome, EngineError> {
        self.calls.push(Call::FixedSteps(steps));
        self.take_failure()?;
        self.tstates += 4 * u64::from(steps);
        Ok(RunOutcome::BudgetExhausted)
    }

    fn run_to_address(&mut self, tstates: u64, target: Address) -> Result<RunOutcome, EngineError> {
        self.calls.push(Call::ToAddress(tstates, target));
        self.take_failure()?;
        if let Some(kinds) = self.breakpoints.get(&target) {
            if kinds.contains(BreakpointKinds::NORMAL) {
                self.running = false;
                return Ok(RunOutcome::BreakpointHit(target));
            }
        }
        let outcome = self.towards_target(tstates);
        if outcome == RunOutcome::TargetReached {
            self.pc = target;
        }
        Ok(outcome)
    }

    fn run_to_return(&mut self, tstates: u64) -> Result<RunOutcome, EngineError> {
        self.calls.push(Call::ToReturn(tstates));
        self.take_failure()?;
        Ok(self.towards_target(tstates))
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        self.calls.push(Call::Reset);
        self.pc = Address::ZERO;
        Ok(())
    }

    fn power_on(&mut self) -> Result<(), EngineError> {
        self.calls.push(Call::PowerOn);
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
        Duration::from_nanos(self.tstates * 1_000_000_000 / u64::from(FREQUENCY))
    }

    fn tstates(&self) -> u64 {
        self.tstates
    }

    fn frequency_hz(&self) -> u32 {
        FREQUENCY
    }

    fn key_scan_period(&self) -> u64 {
        SCAN_PERIOD
    }

    fn program_counter(&self) -> Address {
        self.pc
    }

    fn call_return_address(&self) -> Option<Address> {
        self.call_return
    }

    fn breakpoints_at(&self, address: Address) -> BreakpointKinds {
        self.breakpoints
            .get(&address)
            .copied()
            .unwrap_or(BreakpointKinds::NONE)
    }

    fn set_breakpoint(&mut self, address: Address, kind: BreakpointKinds) {
        let entry = self.breakpoints.entry(address).or_default();
        *entry = *entry | kind;
    }

    fn clear_breakpoint(&mut self, address: Address, kind: BreakpointKinds) {
        if let Some(entry) = self.breakpoints.get_mut(&address) {
            *entry = BreakpointKinds::from_bits_truncate(entry.bits() & !kind.bits());
            if entry.is_empty() {
                self.breakpoints.remove(&address);
            }
        }
    }

    fn keypad_press(&mut self, key: KeyCode) {
        self.keys.push((self.tstates, KeyEvent::Press(key)));
    }

    fn keypad_release(&mut self, key: KeyCode) {
        self.keys.push((self.tstates, KeyEvent::Release(key)));
    }

    fn keyboard_key_down(&mut self, virtual_key: u32, _location: KeyLocation) {
        self.calls.push(Call::Keyboard(true, virtual_key));
    }

    fn keyboard_key_up(&mut self, virtual_key: u32, _location: KeyLocation) {
        self.calls.push(Call::Keyboard(false, virtual_key));
    }

    fn last_answer(&self) -> Option<String> {
        self.answer.clone()
    }

    fn set_profile(&mut self, name: &str) -> Result<(), EngineError> {
        match name {
            "ti83p" | "ti84p" => {
                self.profile = name.to_string();
                Ok(())
            }
            _ => Err(EngineError::UnknownProfile(name.to_string())),
        }
    }

    fn update_display(&mut self) {
        self.calls.push(Call::UpdateDisplay);
    }
}

type Sched = DeviceScheduler<FakeEngine, ManualClock>;

fn setup(engine: FakeEngine) -> (Sched, CommandSender, ManualClock) {
    let (tx, rx) = command_queue();
    let clock = ManualClock::new();
    let sched = DeviceScheduler::with_clock(Slot::new(0), engine, rx, clock.clone());
    (sched, tx, clock)
}

/// Ticks until the queue is empty (and so every command sent so far
/// has been applied).
fn settle(sched: &mut Sched) {
    for _ in 0..1000 {
        if !sched.commands.has_pending() {
            return;
        }
        if sched.tick() == TickOutcome::Closed {
            return;
        }
    }
    panic!("command queue never drained");
}

fn tick_n(sched: &mut Sched, n: usize) -> Vec<Driver> {
    (0..n)
        .map(|_| match sched.tick() {
            TickOutcome::Continue(driver) => driver,
            TickOutcome::Closed => panic!("scheduler closed unexpectedly"),
        })
        .collect()
}

#[derive(Debug, Default)]
struct Observations {
    modes: Vec<RunMode>,
    failures: Vec<EngineError>,
}

#[derive(Debug, Clone, Default)]
struct RecordingListener {
    seen: Arc<Mutex<Observations>>,
}

impl RecordingListener {
    fn modes(&self) -> Vec<RunMode> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .modes
            .clone()
    }

    fn failures(&self) -> Vec<EngineError> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failures
            .clone()
    }
}

impl StateListener<FakeEngine> for RecordingListener {
    fn device_state(&mut self, view: &DeviceView<'_, FakeEngine>) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .modes
            .push(view.mode);
    }

    fn engine_failed(&mut self, _slot: Slot, error: &EngineError) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failures
            .push(error.clone());
    }
}

#[derive(Debug, Default)]
struct TestHost {
    clipboard: MemoryClipboard,
    repaints: Mutex<u32>,
    debugger_shown: Mutex<u32>,
    linked: Mutex<Option<bool>>,
}

impl DeviceHost for TestHost {
    fn repaint(&self, _slot: Slot) {
        *self.repaints.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn show_debugger(&self, _slot: Slot) {
        *self
            .debugger_shown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn connect_link(&self, _slot: Slot) {
        *self.linked.lock().unwrap_or_else(PoisonError::into_inner) = Some(true);
    }

    fn disconnect_link(&self, _slot: Slot) {
        *self.linked.lock().unwrap_or_else(PoisonError::into_inner) = Some(false);
    }

    fn clipboard_text(&self) -> Option<String> {
        self.clipboard.text()
    }

    fn set_clipboard_text(&self, text: &str) {
        self.clipboard.set_text(text);
    }
}

#[derive(Default)]
struct CollectingSink {
    received: Mutex<Vec<String>>,
}

impl TextSink for CollectingSink {
    fn deliver(&self, text: &str) {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.to_string());
    }
}

#[test]
fn test_display_is_refreshed_at_startup() {
    let (mut sched, _tx, _clock) = setup(FakeEngine::new());
    assert_eq!(tick_n(&mut sched, 1), vec![Driver::Idle]);
    assert_eq!(sched.engine().calls, vec![Call::UpdateDisplay]);
}

#[test]
fn test_idle_device_waits_for_idle_interval() {
    let (mut sched, _tx, clock) = setup(FakeEngine::new());
    settle(&mut sched);
    tick_n(&mut sched, 3);
    assert_eq!(
        clock.waits(),
        vec![IDLE_INTERVAL, IDLE_INTERVAL, IDLE_INTERVAL]
    );
    assert_eq!(sched.engine().run_primitive_calls(), 0);
}

#[test]
fn test_single_step() {
    let (mut sched, tx, _clock) = setup(FakeEngine::new());
    tx.enqueue(Command::Step).unwrap();
    settle(&mut sched);
    assert_eq!(sched.mode(), RunMode::SteppingFixed(1));
    assert_eq!(tick_n(&mut sched, 1), vec![Driver::FixedSteps { steps: 1 }]);
    assert_eq!(sched.mode(), RunMode::Idle);
    assert_eq!(tick_n(&mut sched, 1), vec![Driver::Idle]);
}

#[test]
fn test_step_n_is_ignored_while_running() {
    let (mut sched, tx, _clock) = setup(FakeEngine::new());
    tx.enqueue(Command::Run).unwrap();
    settle(&mut sched);
    assert_eq!(sched.mode(), RunMode::Running);
    tx.enqueue(Command::step_n(5).unwrap()).unwrap();
    settle(&mut sched);
    assert_eq!(sched.run_state().remaining_steps, 0);
    assert_eq!(sched.mode(), RunMode::Running);
    assert!(!sched
        .engine()
        .calls
        .iter()
        .any(|c| matches!(c, Call::FixedSteps(_))));
}

#[test]
fn test_step_n_runs_all_steps_in_one_tick() {
    let (mut sched, tx, _clock) = setup(FakeEngine::new());
    tx.enqueue(Command::StepN(StepCount::try_from(7).unwrap()))
        .unwrap();
    settle(&mut sched);
    assert_eq!(tick_n(&mut sched, 2), vec![Driver::FixedSteps { steps: 7 }, Driver::Idle]);
}

#[test]
fn test_close_discards_later_commands() {
    let (sched, tx, _clock) = setup(FakeEngine::new());
    tx.enqueue(Command::Step).unwrap();
    tx.enqueue(Command::Step).unwrap();
    tx.enqueue(Command::Close).unwrap();
    assert_eq!(tx.enqueue(Command::Step), Err(QueueClosed("Step")));
    let engine = sched.run();
    assert_eq!(
        engine.calls,
        vec![
            Call::UpdateDisplay,
            Call::FixedSteps(1),
            Call::FixedSteps(1)
        ]
    );
}

#[test]
fn test_tick_after_close_does_nothing() {
    let (mut sched, tx, _clock) = setup(FakeEngine::new());
    tx.enqueue(Command::Close).unwrap();
    settle(&mut sched);
    assert!(sched.is_closed());
    assert_eq!(sched.mode(), RunMode::Closed);
    assert_eq!(sched.tick(), TickOutcome::Closed);
}

#[test]
fn test_reset_keeps_a_running_device_running() {
    let (mut sched, tx, _clock) = setup(FakeEngine::new());
    tx.enqueue(Command::Run).unwrap();
    tx.enqueue(Command::Reset).unwrap();
    settle(&mut sched);
    assert!(sched.engine().is_running());
    let calls = &sched.engine().calls;
    let reset = calls.iter().position(|c| *c == Call::Reset).unwrap();
    assert_eq!(calls.get(reset + 1), Some(&Call::PowerOn));
}

#[test]
fn test_reset_leaves_a_stopped_device_stopped() {
    let (mut sched, tx, _clock) = setup(FakeEngine::new());
    tx.enqueue(Command::Reset).unwrap();
    settle(&mut sched);
    assert!(!sched.engine().is_running());
    assert!(sched.engine().calls.contains(&Call::Reset));
    assert!(!sched.engine().calls.contains(&Call::PowerOn));
}

#[test]
fn test_turn_on_powers_on_and_runs() {
    let mut engine = FakeEngine::new();
    engine.active = false;
    let (mut sched, tx, _clock) = setup(engine);
    // An inactive device doesn't run even with the running flag set.
    sched.engine.set_running(true);
    settle(&mut sched);
    assert_eq!(sched.mode(), RunMode::Idle);
    tx.enqueue(Command::TurnOn).unwrap();
    settle(&mut sched);
    assert_eq!(sched.mode(), RunMode::Running);
    assert!(sched.engine().calls.contains(&Call::PowerOn));
}

#[test]
fn test_step_until_pc_replaces_the_target() {
    let mut engine = FakeEngine::new();
    engine.target_after = 1000;
    let (mut sched, tx, _clock) = setup(engine);
    tx.enqueue(Command::step_until_pc(0x100).unwrap()).unwrap();
    settle(&mut sched);
    let q = tick_quantum(100, FREQUENCY);
    tx.enqueue(Command::step_until_pc(0x200).unwrap()).unwrap();
    assert_eq!(
        tick_n(&mut sched, 2),
        vec![
            Driver::ToAddress {
                tstates: q,
                target: Address::new(0x100)
            },
            Driver::ToAddress {
                tstates: q,
                target: Address::new(0x200)
            },
        ]
    );
    assert_eq!(sched.run_state().run_to_address, Some(Address::new(0x200)));
}

#[test]
fn test_step_until_pc_finishes_at_target() {
    let listener = RecordingListener::default();
    let (sched, tx, _clock) = setup(FakeEngine::new());
    let mut sched = sched.with_listener(Box::new(listener.clone()));
    tx.enqueue(Command::step_until_pc(0x4000).unwrap()).unwrap();
    settle(&mut sched);
    tick_n(&mut sched, 4);
    assert_eq!(sched.mode(), RunMode::Idle);
    assert_eq!(sched.engine().program_counter(), Address::new(0x4000));
    // Observers hear about the end of the run without asking.
    assert_eq!(listener.modes(), vec![RunMode::Idle]);
}

#[test]
fn test_step_until_pc_stops_at_breakpoint() {
    let (mut sched, tx, _clock) = setup(FakeEngine::new());
    tx.enqueue(Command::toggle_breakpoint(0x4000, 1).unwrap())
        .unwrap();
    tx.enqueue(Command::step_until_pc(0x4000).unwrap()).unwrap();
    settle(&mut sched);
    tick_n(&mut sched, 1);
    assert_eq!(sched.mode(), RunMode::Idle);
    assert_eq!(sched.run_state().run_to_address, None);
}

#[test]
fn test_step_over_a_call_runs_to_return_address() {
    let mut engine = FakeEngine::new();
    engine.call_return = Some(Address::new(0x9D98));
    let (mut sched, tx, _clock) = setup(engine);
    tx.enqueue(Command::StepOver).unwrap();
    settle(&mut sched);
    assert_eq!(sched.mode(), RunMode::RunningToAddress(Address::new(0x9D98)));
}

#[test]
fn test_step_over_other_instruction_is_a_single_step() {
    let (mut sched, tx, _clock) = setup(FakeEngine::new());
    tx.enqueue(Command::StepOver).unwrap();
    settle(&mut sched);
    assert_eq!(sched.mode(), RunMode::SteppingFixed(1));
}

#[test]
fn test_step_out_runs_until_return() {
    let (mut sched, tx, _clock) = setup(FakeEngine::new());
    tx.enqueue(Command::StepOut).unwrap();
    settle(&mut sched);
    assert_eq!(sched.mode(), RunMode::RunningToReturn);
    let q = tick_quantum(100, FREQUENCY);
    assert_eq!(
        tick_n(&mut sched, 3),
        vec![
            Driver::ToReturn { tstates: q },
            Driver::ToReturn { tstates: q },
            Driver::Idle
        ]
    );
}

#[test]
fn test_stop_cancels_debug_runs() {
    let mut engine = FakeEngine::new();
    engine.target_after = 1000;
    let (mut sched, tx, _clock) = setup(engine);
    tx.enqueue(Command::StepOut).unwrap();
    tx.enqueue(Command::Stop).unwrap();
    settle(&mut sched);
    assert_eq!(sched.mode(), RunMode::Idle);
}

#[test]
fn test_toggle_breakpoint_flips_each_kind() {
    let (mut sched, tx, _clock) = setup(FakeEngine::new());
    let both = BreakpointKinds::NORMAL.bits() | BreakpointKinds::MEM_READ.bits();
    tx.enqueue(Command::toggle_breakpoint(0x8000, both).unwrap())
        .unwrap();
    settle(&mut sched);
    assert_eq!(
        sched.engine().breakpoints_at(Address::new(0x8000)),
        BreakpointKinds::NORMAL | BreakpointKinds::MEM_READ
    );
    tx.enqueue(Command::toggle_breakpoint(0x8000, BreakpointKinds::NORMAL.bits()).unwrap())
        .unwrap();
    settle(&mut sched);
    assert_eq!(
        sched.engine().breakpoints_at(Address::new(0x8000)),
        BreakpointKinds::MEM_READ
    );
}

#[test]
fn test_engine_failure_stops_the_device() {
    let listener = RecordingListener::default();
    let (sched, tx, _clock) = setup(FakeEngine::new());
    let mut sched = sched.with_listener(Box::new(listener.clone()));
    tx.enqueue(Command::Run).unwrap();
    settle(&mut sched);
    sched.engine.fail_next_run = Some(EngineError::NoRom);
    tick_n(&mut sched, 2);
    assert!(!sched.engine().is_running());
    assert_eq!(sched.mode(), RunMode::Idle);
    assert_eq!(listener.failures(), vec![EngineError::NoRom]);
    // The scheduler is still alive and accepting commands.
    tx.enqueue(Command::Step).unwrap();
    settle(&mut sched);
    assert_eq!(tick_n(&mut sched, 1), vec![Driver::FixedSteps { steps: 1 }]);
}

#[test]
fn test_request_state_reaches_listener() {
    let listener = RecordingListener::default();
    let (sched, tx, _clock) = setup(FakeEngine::new());
    let mut sched = sched.with_listener(Box::new(listener.clone()));
    tx.enqueue(Command::RequestState).unwrap();
    settle(&mut sched);
    assert_eq!(listener.modes(), vec![RunMode::Idle]);
}

#[test]
fn test_running_changes_are_reported() {
    let listener = RecordingListener::default();
    let (sched, tx, _clock) = setup(FakeEngine::new());
    let mut sched = sched.with_listener(Box::new(listener.clone()));
    tx.enqueue(Command::Run).unwrap();
    settle(&mut sched);
    tick_n(&mut sched, 2);
    tx.enqueue(Command::Stop).unwrap();
    settle(&mut sched);
    tick_n(&mut sched, 2);
    assert_eq!(listener.modes(), vec![RunMode::Running, RunMode::Idle]);
}

#[test]
fn test_throttle_keeps_emulated_time_in_step() {
    let (mut sched, tx, clock) = setup(FakeEngine::new());
    tx.enqueue(Command::Run).unwrap();
    settle(&mut sched);
    let start_wall = clock.now();
    let start_emulated = sched.engine().elapsed();
    tick_n(&mut sched, 1000);
    let wall = clock.now() - start_wall;
    let emulated = sched.engine().elapsed() - start_emulated;
    let q = tick_quantum(100, FREQUENCY);
    let quantum_time = Duration::from_nanos(q * 1_000_000_000 / u64::from(FREQUENCY));
    let drift = if wall > emulated {
        wall - emulated
    } else {
        emulated - wall
    };
    assert!(drift <= quantum_time, "drift was {drift:?}");
    assert!(clock.total_waited() > Duration::ZERO);
}

#[test]
fn test_half_speed_takes_twice_as_long() {
    let (mut sched, tx, clock) = setup(FakeEngine::new());
    tx.enqueue(Command::SetSpeed(Speed::Half)).unwrap();
    tx.enqueue(Command::Run).unwrap();
    settle(&mut sched);
    let start_wall = clock.now();
    let start_emulated = sched.engine().elapsed();
    tick_n(&mut sched, 500);
    let wall = clock.now() - start_wall;
    let emulated = sched.engine().elapsed() - start_emulated;
    let slack = Duration::from_millis(1);
    assert!(wall + slack >= emulated * 2, "{wall:?} vs {emulated:?}");
    assert!(wall <= emulated * 2 + slack, "{wall:?} vs {emulated:?}");
}

#[test]
fn test_max_speed_never_waits() {
    let (mut sched, tx, clock) = setup(FakeEngine::new());
    tx.enqueue(Command::SetSpeed(Speed::Max)).unwrap();
    tx.enqueue(Command::Run).unwrap();
    settle(&mut sched);
    tick_n(&mut sched, 200);
    assert!(clock.waits().is_empty(), "waited {:?}", clock.waits());
    assert!(sched.run_state().max_speed);
    assert_eq!(sched.engine().speed(), Speed::Max);
}

#[test]
fn test_typed_keys_follow_scan_timing() {
    let (mut sched, tx, _clock) = setup(FakeEngine::new());
    tx.enqueue(Command::Run).unwrap();
    tx.enqueue(Command::type_text("12").unwrap()).unwrap();
    settle(&mut sched);
    assert_eq!(sched.keys_pending(), 2);
    tick_n(&mut sched, 100);
    assert_eq!(sched.keys_pending(), 0);
    let keys = &sched.engine().keys;
    let events: Vec<KeyEvent> = keys.iter().map(|(_, e)| *e).collect();
    assert_eq!(
        events,
        vec![
            KeyEvent::Press(KeyCode::ONE),
            KeyEvent::Release(KeyCode::ONE),
            KeyEvent::Press(KeyCode::TWO),
            KeyEvent::Release(KeyCode::TWO),
        ]
    );
    let at: Vec<u64> = keys.iter().map(|(t, _)| *t).collect();
    assert!(at[1] > at[0] + SCAN_PERIOD / 2);
    assert!(at[2] > at[1] + SCAN_PERIOD);
    assert!(at[3] > at[2] + SCAN_PERIOD / 2);
}

#[test]
fn test_direct_key_commands() {
    let (mut sched, tx, _clock) = setup(FakeEngine::new());
    tx.enqueue(Command::key_down(5, 0).unwrap()).unwrap();
    tx.enqueue(Command::key_up(5, 0).unwrap()).unwrap();
    tx.enqueue(Command::KeyboardKeyDown {
        virtual_key: 13,
        location: KeyLocation::Numpad,
    })
    .unwrap();
    tx.enqueue(Command::KeyboardKeyUp {
        virtual_key: 13,
        location: KeyLocation::Numpad,
    })
    .unwrap();
    settle(&mut sched);
    assert_eq!(
        sched.engine().keys,
        vec![
            (0, KeyEvent::Press(KeyCode::ON)),
            (0, KeyEvent::Release(KeyCode::ON))
        ]
    );
    assert!(sched.engine().calls.contains(&Call::Keyboard(true, 13)));
    assert!(sched.engine().calls.contains(&Call::Keyboard(false, 13)));
}

#[test]
fn test_answer_commands() {
    let mut engine = FakeEngine::new();
    engine.answer = Some("42".to_string());
    let host = Arc::new(TestHost::default());
    let weak = Arc::downgrade(&host);
    let (sched, tx, _clock) = setup(engine);
    let mut sched = sched.with_host(weak);
    let sink = Arc::new(CollectingSink::default());

    tx.enqueue(Command::GetLastAnswer).unwrap();
    settle(&mut sched);
    assert_eq!(sched.last_answer(), Some("42"));

    tx.enqueue(Command::CopyLastAnswer).unwrap();
    tx.enqueue(Command::copy_text_to(sink.clone())).unwrap();
    settle(&mut sched);
    assert_eq!(host.clipboard.text().as_deref(), Some("42"));
    assert_eq!(
        *sink.received.lock().unwrap_or_else(PoisonError::into_inner),
        vec!["42".to_string()]
    );
}

#[test]
fn test_empty_answer_is_not_copied() {
    let mut engine = FakeEngine::new();
    engine.answer = Some(String::new());
    let host = Arc::new(TestHost::default());
    host.clipboard.set_text("before");
    let weak = Arc::downgrade(&host);
    let (sched, tx, _clock) = setup(engine);
    let mut sched = sched.with_host(weak);
    tx.enqueue(Command::CopyLastAnswer).unwrap();
    settle(&mut sched);
    assert_eq!(host.clipboard.text().as_deref(), Some("before"));
}

#[test]
fn test_paste_types_clipboard_text() {
    let host = Arc::new(TestHost::default());
    host.clipboard.set_text("3+4\n");
    let weak = Arc::downgrade(&host);
    let (sched, tx, _clock) = setup(FakeEngine::new());
    let mut sched = sched.with_host(weak);
    tx.enqueue(Command::Paste).unwrap();
    settle(&mut sched);
    assert_eq!(sched.keys_pending(), 4);
}

#[test]
fn test_host_requests() {
    let host = Arc::new(TestHost::default());
    let weak = Arc::downgrade(&host);
    let (sched, tx, _clock) = setup(FakeEngine::new());
    let mut sched = sched.with_host(weak);
    tx.enqueue(Command::Debug).unwrap();
    tx.enqueue(Command::ConnectLink).unwrap();
    tx.enqueue(Command::SetProfile("ti84p".to_string())).unwrap();
    tx.enqueue(Command::SetProfile("nonesuch".to_string())).unwrap();
    settle(&mut sched);
    assert_eq!(*host.debugger_shown.lock().unwrap(), 1);
    assert_eq!(*host.linked.lock().unwrap(), Some(true));
    assert_eq!(*host.repaints.lock().unwrap(), 1);
    assert_eq!(sched.engine().profile, "ti84p");

    tx.enqueue(Command::DisconnectLink).unwrap();
    settle(&mut sched);
    assert_eq!(*host.linked.lock().unwrap(), Some(false));
}

#[test]
fn test_host_requests_without_host_are_ignored() {
    let (mut sched, tx, _clock) = setup(FakeEngine::new());
    tx.enqueue(Command::Debug).unwrap();
    tx.enqueue(Command::Paste).unwrap();
    settle(&mut sched);
    assert_eq!(sched.keys_pending(), 0);
}

#[test]
fn test_concurrent_senders_reach_a_deterministic_state() {
    fn speed_commands() -> Vec<Command> {
        [Speed::Quarter, Speed::Max, Speed::Quadruple, Speed::Double]
            .into_iter()
            .map(Command::SetSpeed)
            .collect()
    }
    fn breakpoint_commands() -> Vec<Command> {
        (1..=10u32)
            .map(|a| Command::toggle_breakpoint(a * 0x100, 1).unwrap())
            .collect()
    }
    fn outcome(sched: &Sched) -> (u32, bool, Vec<(Address, BreakpointKinds)>) {
        let mut bps: Vec<(Address, BreakpointKinds)> = sched
            .engine()
            .breakpoints
            .iter()
            .map(|(a, k)| (*a, *k))
            .collect();
        bps.sort_by_key(|(a, _)| *a);
        let state = sched.run_state();
        (state.speed_percent, state.max_speed, bps)
    }

    let (mut sequential, tx, _clock) = setup(FakeEngine::new());
    for cmd in speed_commands().into_iter().chain(breakpoint_commands()) {
        tx.enqueue(cmd).unwrap();
    }
    settle(&mut sequential);

    let (mut concurrent, tx, _clock) = setup(FakeEngine::new());
    let producers: Vec<_> = [speed_commands(), breakpoint_commands()]
        .into_iter()
        .map(|cmds| {
            let tx = tx.clone();
            thread::spawn(move || {
                for cmd in cmds {
                    tx.enqueue(cmd).unwrap();
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }
    settle(&mut concurrent);

    assert_eq!(outcome(&concurrent), outcome(&sequential));
    assert_eq!(outcome(&sequential).0, 200);
    assert_eq!(outcome(&sequential).2.len(), 10);
}

#[cfg(test)]
mod proptests {
    use super::*;
    use test_strategy::proptest;

    fn command_for(n: u8) -> Command {
        match n % 10 {
            0 => Command::Run,
            1 => Command::Stop,
            2 => Command::Step,
            3 => Command::step_n(3).unwrap(),
            4 => Command::step_until_pc(0x100).unwrap(),
            5 => Command::StepOver,
            6 => Command::StepOut,
            7 => Command::SetSpeed(Speed::Max),
            8 => Command::Reset,
            _ => Command::RequestState,
        }
    }

    /// Whatever the commands, each tick uses exactly the engine
    /// primitive which the run mode calls for, and never more than
    /// one.
    #[proptest]
    fn one_driver_per_tick(
        #[strategy(proptest::collection::vec(0u8..10, 0..40))] ops: Vec<u8>,
        #[strategy(0u32..4)] call_return: u32,
    ) {
        let mut engine = FakeEngine::new();
        engine.target_after = 3;
        engine.call_return = (call_return > 1).then_some(Address::new(0x2000));
        let (mut sched, tx, _clock) = setup(engine);
        let mut ops = ops.into_iter();
        for _ in 0..120 {
            if let Some(op) = ops.next() {
                tx.enqueue(command_for(op)).unwrap();
            }
            let mode = sched.mode();
            let before = sched.engine().run_primitive_calls();
            let driver = match sched.tick() {
                TickOutcome::Continue(driver) => driver,
                TickOutcome::Closed => panic!("closed without a Close command"),
            };
            let used = sched.engine().run_primitive_calls() - before;
            match (mode, driver) {
                (RunMode::Idle, Driver::Idle) => assert_eq!(used, 0),
                (RunMode::Running, Driver::TimeSlice { .. })
                | (RunMode::RunningToReturn, Driver::ToReturn { .. }) => assert_eq!(used, 1),
                (RunMode::SteppingFixed(n), Driver::FixedSteps { steps }) => {
                    assert_eq!(n, steps);
                    assert_eq!(used, 1);
                }
                (RunMode::RunningToAddress(a), Driver::ToAddress { target, .. }) => {
                    assert_eq!(a, target);
                    assert_eq!(used, 1);
                }
                (mode, driver) => panic!("mode {mode:?} used driver {driver:?}"),
            }
        }
    }
}
