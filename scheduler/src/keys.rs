//! Typing on the emulated keypad.
//!
//! The calculator finds out about key presses by scanning its keypad
//! matrix periodically.  A key which is pressed and released between
//! two scans is never seen, and two presses of the same key without
//! a long enough gap look like one.  So when text is pasted or typed
//! we feed it in one key at a time: each key is held for half a scan
//! period, and the next key isn't pressed until a whole scan period
//! after the previous release.
//!
//! Timestamps are in emulated T-states, not wall-clock time, so the
//! timing is right whatever speed the device runs at.
use std::collections::VecDeque;

use tracing::{event, Level};

use base::prelude::*;

/// A change to make to the keypad matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    Press(KeyCode),
    Release(KeyCode),
}

#[derive(Debug, Default)]
pub struct KeyInput {
    queue: VecDeque<KeyCode>,
    /// When the head of the queue was pressed, if it is down now.
    last_down: Option<u64>,
    /// When the most recent key was released.
    last_up: Option<u64>,
}

impl KeyInput {
    pub fn new() -> KeyInput {
        KeyInput::default()
    }

    pub fn queue_key(&mut self, key: KeyCode) {
        self.queue.push_back(key);
    }

    /// Queues the key for `ch`.  Returns false (and queues nothing)
    /// if no key types that character.
    pub fn queue_char(&mut self, ch: char) -> bool {
        match KeyCode::for_char(ch) {
            Some(key) => {
                self.queue_key(key);
                true
            }
            None => {
                event!(Level::DEBUG, "no key types {:?}, skipping it", ch);
                false
            }
        }
    }

    /// Queues keys for each typeable character of `text`, returning
    /// how many were queued.
    pub fn queue_text(&mut self, text: &str) -> usize {
        text.chars().filter(|ch| self.queue_char(*ch)).count()
    }

    /// Number of keys still to be pressed or released.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_key_down(&self) -> bool {
        self.last_down.is_some()
    }

    /// Decides what (if anything) should happen to the keypad at
    /// emulated time `now`.  At most one event is produced per call.
    pub fn service(&mut self, now: u64, scan_period: u64) -> Option<KeyEvent> {
        let head = *self.queue.front()?;
        match (self.last_down, self.last_up) {
            (Some(down), _) => {
                if down.saturating_add(scan_period / 2) < now {
                    self.queue.pop_front();
                    self.last_down = None;
                    self.last_up = Some(now);
                    Some(KeyEvent::Release(head))
                } else {
                    None
                }
            }
            (None, Some(up)) => {
                if up.saturating_add(scan_period) < now {
                    self.last_down = Some(now);
                    Some(KeyEvent::Press(head))
                } else {
                    None
                }
            }
            (None, None) => {
                self.last_down = Some(now);
                Some(KeyEvent::Press(head))
            }
        }
    }
}

#[cfg(test)]
fn drive(input: &mut KeyInput, until: u64, step: u64, period: u64) -> Vec<(u64, KeyEvent)> {
    let mut events = Vec::new();
    let mut now = 0;
    while now <= until {
        if let Some(ev) = input.service(now, period) {
            events.push((now, ev));
        }
        now += step;
    }
    events
}

#[test]
fn test_two_keys_are_spaced_by_scan_timing() {
    const PERIOD: u64 = 1000;
    let mut input = KeyInput::new();
    assert_eq!(input.queue_text("12"), 2);
    let events = drive(&mut input, 10 * PERIOD, 7, PERIOD);
    assert_eq!(events.len(), 4, "{events:?}");
    let (t_press1, ev) = events[0];
    assert_eq!(ev, KeyEvent::Press(KeyCode::ONE));
    let (t_release1, ev) = events[1];
    assert_eq!(ev, KeyEvent::Release(KeyCode::ONE));
    let (t_press2, ev) = events[2];
    assert_eq!(ev, KeyEvent::Press(KeyCode::TWO));
    let (t_release2, ev) = events[3];
    assert_eq!(ev, KeyEvent::Release(KeyCode::TWO));

    assert!(t_release1 - t_press1 >= PERIOD / 2);
    assert!(t_press2 - t_release1 >= PERIOD);
    assert!(t_release2 - t_press2 >= PERIOD / 2);
    assert_eq!(input.pending(), 0);
    assert!(!input.is_key_down());
}

#[test]
fn test_untypeable_characters_are_not_queued() {
    let mut input = KeyInput::new();
    assert!(!input.queue_char('@'));
    assert!(!input.queue_char('\0'));
    assert_eq!(input.pending(), 0);
    assert_eq!(input.service(100, 10), None);
}

#[test]
fn test_first_key_is_pressed_immediately() {
    let mut input = KeyInput::new();
    input.queue_key(KeyCode::ENTER);
    assert_eq!(input.service(42, 1000), Some(KeyEvent::Press(KeyCode::ENTER)));
    assert!(input.is_key_down());
    assert_eq!(input.pending(), 1);
}

#[test]
fn test_key_is_not_released_while_time_stands_still() {
    let mut input = KeyInput::new();
    input.queue_key(KeyCode::ENTER);
    input.service(5, 1000);
    for _ in 0..10 {
        assert_eq!(input.service(5, 1000), None);
    }
}

#[test]
fn test_late_key_after_long_gap_is_pressed_at_once() {
    let mut input = KeyInput::new();
    input.queue_key(KeyCode::ONE);
    input.service(0, 100);
    assert_eq!(input.service(51, 100), Some(KeyEvent::Release(KeyCode::ONE)));
    input.queue_key(KeyCode::TWO);
    assert_eq!(input.service(10_000, 100), Some(KeyEvent::Press(KeyCode::TWO)));
}
