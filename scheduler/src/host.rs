//! Things outside the device which the scheduler occasionally needs:
//! the user interface, the debugger, the clipboard and the link hub.
//!
//! The scheduler reaches all of these through [`DeviceHost`].  Every
//! method has a do-nothing default, so a host only implements the
//! parts it has.  All calls are made synchronously on the scheduler
//! thread and must return promptly.
use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

use super::registry::Slot;

pub trait DeviceHost: Send + Sync {
    /// Something about the device's appearance changed (its keypad
    /// mode, or its hardware profile); redraw it.
    fn repaint(&self, _slot: Slot) {}

    /// Show the debugger for `slot`, creating it if need be.
    fn show_debugger(&self, _slot: Slot) {}

    /// Make `slot` a member of the link hub.
    fn connect_link(&self, _slot: Slot) {}

    fn disconnect_link(&self, _slot: Slot) {}

    fn clipboard_text(&self) -> Option<String> {
        None
    }

    fn set_clipboard_text(&self, _text: &str) {}
}

/// A host user interface for one device.
pub trait DeviceUi: Send + Sync {
    fn repaint(&self);
}

/// A debugger window (or other debugging front end) for one device.
pub trait Debugger: Send + Sync {
    fn show(&self);
}

pub trait Clipboard: Send + Sync + Debug {
    fn text(&self) -> Option<String>;
    fn set_text(&self, text: &str);
}

/// A clipboard which is just a string in memory.  Useful for hosts
/// without access to a system clipboard, and for tests.
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    contents: Mutex<Option<String>>,
}

impl MemoryClipboard {
    pub fn new() -> MemoryClipboard {
        MemoryClipboard::default()
    }

    pub fn with_text(text: &str) -> MemoryClipboard {
        MemoryClipboard {
            contents: Mutex::new(Some(text.to_string())),
        }
    }
}

impl Clipboard for MemoryClipboard {
    fn text(&self) -> Option<String> {
        self.contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_text(&self, text: &str) {
        *self.contents.lock().unwrap_or_else(PoisonError::into_inner) = Some(text.to_string());
    }
}

#[test]
fn test_memory_clipboard() {
    let c = MemoryClipboard::new();
    assert_eq!(c.text(), None);
    c.set_text("42");
    assert_eq!(c.text().as_deref(), Some("42"));
    assert_eq!(MemoryClipboard::with_text("x").text().as_deref(), Some("x"));
}
