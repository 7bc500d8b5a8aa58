//! The `base` crate defines the calculator-related value types which
//! are useful both to the device scheduler and to whatever hosts it
//! (a GUI, a debugger, a command-line driver).  The idea is that a
//! host can describe keys, addresses and speeds without depending on
//! the scheduler's threading machinery.

mod keypad;
mod speed;
mod types;

pub mod prelude;

pub use keypad::{KeyCode, KeyCodeError, KEY_GROUPS};
pub use speed::{Speed, UnknownSpeed};
pub use types::*;

/// Builds a [`KeyCode`] from literal group and bit numbers.  Out of
/// range values panic (at compile time, when used to form a constant).
#[macro_export]
macro_rules! key {
    ($group:expr, $bit:expr) => {
        $crate::prelude::KeyCode::new::<{ $group }, { $bit }>()
    };
}

#[test]
fn test_key_macro() {
    use prelude::KeyCode;
    let k: KeyCode = key!(1, 0);
    assert_eq!(k, KeyCode::ENTER);
    assert_eq!(k.group(), 1);
    assert_eq!(k.bit(), 0);
}
