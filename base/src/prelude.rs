//! The prelude exports the value types which hosts and the scheduler
//! pass back and forth.  Providing this prelude is the main purpose of
//! the base crate.
pub use super::keypad::{KeyCode, KeyCodeError, KEY_GROUPS};
pub use super::speed::{Speed, UnknownSpeed};
pub use super::types::*;
pub use super::key;
