//! The calculator keypad matrix.
//!
//! The keypad is scanned as a matrix of up to eight groups (rows),
//! each of up to eight bits (columns).  A host describes a key by its
//! (group, bit) position.  When text is typed or pasted into the
//! calculator we need to know which matrix position produces each
//! character; that's what [`KeyCode::for_char`] is for.
//!
//! The layout is the one shared by the TI-83 Plus and TI-84 Plus
//! families:
//!
//! | group | bit 0 | bit 1 | bit 2 | bit 3 | bit 4 | bit 5 | bit 6 | bit 7 |
//! | ----- | ----- | ----- | ----- | ----- | ----- | ----- | ----- | ----- |
//! | 0     | down  | left  | right | up    |       |       |       |       |
//! | 1     | enter | +     | -     | ×     | ÷     | ^     | clear |       |
//! | 2     | (-)   | 3     | 6     | 9     | )     | tan   | vars  |       |
//! | 3     | .     | 2     | 5     | 8     | (     | cos   | prgm  | stat  |
//! | 4     | 0     | 1     | 4     | 7     | ,     | sin   | apps  | X,T   |
//! | 5     | on    | sto   | ln    | log   | x²    | x⁻¹   | math  | alpha |
//! | 6     | graph | trace | zoom  | window| y=    | 2nd   | mode  | del   |
use std::fmt::{self, Display, Formatter};

use serde::Serialize;

/// Number of groups in the keypad matrix.
pub const KEY_GROUPS: u8 = 8;

/// Number of bits in each keypad group.
const KEY_BITS: u8 = 8;

/// A position in the keypad matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct KeyCode {
    group: u8,
    bit: u8,
}

/// Signals that a (group, bit) pair lies outside the keypad matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCodeError {
    pub group: u8,
    pub bit: u8,
}

impl Display for KeyCodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "key position group {} bit {} is outside the {}x{} keypad matrix",
            self.group, self.bit, KEY_GROUPS, KEY_BITS
        )
    }
}

impl std::error::Error for KeyCodeError {}

impl KeyCode {
    pub const DOWN: KeyCode = KeyCode::new::<0, 0>();
    pub const LEFT: KeyCode = KeyCode::new::<0, 1>();
    pub const RIGHT: KeyCode = KeyCode::new::<0, 2>();
    pub const UP: KeyCode = KeyCode::new::<0, 3>();
    pub const ENTER: KeyCode = KeyCode::new::<1, 0>();
    pub const PLUS: KeyCode = KeyCode::new::<1, 1>();
    pub const MINUS: KeyCode = KeyCode::new::<1, 2>();
    pub const MULTIPLY: KeyCode = KeyCode::new::<1, 3>();
    pub const DIVIDE: KeyCode = KeyCode::new::<1, 4>();
    pub const POWER: KeyCode = KeyCode::new::<1, 5>();
    pub const CLEAR: KeyCode = KeyCode::new::<1, 6>();
    pub const NEGATE: KeyCode = KeyCode::new::<2, 0>();
    pub const THREE: KeyCode = KeyCode::new::<2, 1>();
    pub const SIX: KeyCode = KeyCode::new::<2, 2>();
    pub const NINE: KeyCode = KeyCode::new::<2, 3>();
    pub const RIGHT_PAREN: KeyCode = KeyCode::new::<2, 4>();
    pub const TAN: KeyCode = KeyCode::new::<2, 5>();
    pub const VARS: KeyCode = KeyCode::new::<2, 6>();
    pub const DECIMAL_POINT: KeyCode = KeyCode::new::<3, 0>();
    pub const TWO: KeyCode = KeyCode::new::<3, 1>();
    pub const FIVE: KeyCode = KeyCode::new::<3, 2>();
    pub const EIGHT: KeyCode = KeyCode::new::<3, 3>();
    pub const LEFT_PAREN: KeyCode = KeyCode::new::<3, 4>();
    pub const COS: KeyCode = KeyCode::new::<3, 5>();
    pub const PRGM: KeyCode = KeyCode::new::<3, 6>();
    pub const STAT: KeyCode = KeyCode::new::<3, 7>();
    pub const ZERO: KeyCode = KeyCode::new::<4, 0>();
    pub const ONE: KeyCode = KeyCode::new::<4, 1>();
    pub const FOUR: KeyCode = KeyCode::new::<4, 2>();
    pub const SEVEN: KeyCode = KeyCode::new::<4, 3>();
    pub const COMMA: KeyCode = KeyCode::new::<4, 4>();
    pub const SIN: KeyCode = KeyCode::new::<4, 5>();
    pub const APPS: KeyCode = KeyCode::new::<4, 6>();
    pub const XTTHETA: KeyCode = KeyCode::new::<4, 7>();
    pub const ON: KeyCode = KeyCode::new::<5, 0>();
    pub const STO: KeyCode = KeyCode::new::<5, 1>();
    pub const LN: KeyCode = KeyCode::new::<5, 2>();
    pub const LOG: KeyCode = KeyCode::new::<5, 3>();
    pub const SQUARE: KeyCode = KeyCode::new::<5, 4>();
    pub const RECIPROCAL: KeyCode = KeyCode::new::<5, 5>();
    pub const MATH: KeyCode = KeyCode::new::<5, 6>();
    pub const ALPHA: KeyCode = KeyCode::new::<5, 7>();
    pub const GRAPH: KeyCode = KeyCode::new::<6, 0>();
    pub const TRACE: KeyCode = KeyCode::new::<6, 1>();
    pub const ZOOM: KeyCode = KeyCode::new::<6, 2>();
    pub const WINDOW: KeyCode = KeyCode::new::<6, 3>();
    pub const Y_EQUALS: KeyCode = KeyCode::new::<6, 4>();
    pub const SECOND: KeyCode = KeyCode::new::<6, 5>();
    pub const MODE: KeyCode = KeyCode::new::<6, 6>();
    pub const DEL: KeyCode = KeyCode::new::<6, 7>();

    pub const fn new<const GROUP: u8, const BIT: u8>() -> KeyCode {
        assert!(GROUP < KEY_GROUPS);
        assert!(BIT < KEY_BITS);
        KeyCode {
            group: GROUP,
            bit: BIT,
        }
    }

    pub fn group(&self) -> u8 {
        self.group
    }

    pub fn bit(&self) -> u8 {
        self.bit
    }

    /// Returns the key which types `ch`, or `None` if there is no
    /// such key.  Letters map to the key carrying that letter's ALPHA
    /// legend (the calculator must already be in alpha mode for the
    /// letter to appear).
    pub fn for_char(ch: char) -> Option<KeyCode> {
        let key = match ch.to_ascii_uppercase() {
            '0' => KeyCode::ZERO,
            '1' => KeyCode::ONE,
            '2' => KeyCode::TWO,
            '3' => KeyCode::THREE,
            '4' => KeyCode::FOUR,
            '5' => KeyCode::FIVE,
            '6' => KeyCode::SIX,
            '7' => KeyCode::SEVEN,
            '8' => KeyCode::EIGHT,
            '9' => KeyCode::NINE,
            '+' => KeyCode::PLUS,
            '-' => KeyCode::MINUS,
            '*' => KeyCode::MULTIPLY,
            '/' => KeyCode::DIVIDE,
            '^' => KeyCode::POWER,
            '(' => KeyCode::LEFT_PAREN,
            ')' => KeyCode::RIGHT_PAREN,
            ',' => KeyCode::COMMA,
            '.' => KeyCode::DECIMAL_POINT,
            '~' => KeyCode::NEGATE,
            '\n' | '\r' => KeyCode::ENTER,
            // Alpha legends.
            'A' => KeyCode::MATH,
            'B' => KeyCode::APPS,
            'C' => KeyCode::PRGM,
            'D' => KeyCode::RECIPROCAL,
            'E' => KeyCode::SIN,
            'F' => KeyCode::COS,
            'G' => KeyCode::TAN,
            'H' => KeyCode::POWER,
            'I' => KeyCode::SQUARE,
            'J' => KeyCode::COMMA,
            'K' => KeyCode::LEFT_PAREN,
            'L' => KeyCode::RIGHT_PAREN,
            'M' => KeyCode::DIVIDE,
            'N' => KeyCode::LOG,
            'O' => KeyCode::SEVEN,
            'P' => KeyCode::EIGHT,
            'Q' => KeyCode::NINE,
            'R' => KeyCode::MULTIPLY,
            'S' => KeyCode::LN,
            'T' => KeyCode::FOUR,
            'U' => KeyCode::FIVE,
            'V' => KeyCode::SIX,
            'W' => KeyCode::MINUS,
            'X' => KeyCode::STO,
            'Y' => KeyCode::ONE,
            'Z' => KeyCode::TWO,
            'θ' => KeyCode::THREE,
            ' ' => KeyCode::ZERO,
            ':' => KeyCode::DECIMAL_POINT,
            '?' => KeyCode::NEGATE,
            '"' => KeyCode::PLUS,
            _ => {
                return None;
            }
        };
        Some(key)
    }
}

impl TryFrom<(u8, u8)> for KeyCode {
    type Error = KeyCodeError;

    fn try_from((group, bit): (u8, u8)) -> Result<KeyCode, KeyCodeError> {
        if group < KEY_GROUPS && bit < KEY_BITS {
            Ok(KeyCode { group, bit })
        } else {
            Err(KeyCodeError { group, bit })
        }
    }
}

impl Display for KeyCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "key {}/{}", self.group, self.bit)
    }
}

#[test]
fn test_digits_map_to_number_keys() {
    assert_eq!(KeyCode::for_char('0'), Some(KeyCode::ZERO));
    assert_eq!(KeyCode::for_char('7'), Some(KeyCode::SEVEN));
    assert_eq!(KeyCode::for_char('\n'), Some(KeyCode::ENTER));
}

#[test]
fn test_letters_are_case_insensitive() {
    assert_eq!(KeyCode::for_char('a'), Some(KeyCode::MATH));
    assert_eq!(KeyCode::for_char('A'), Some(KeyCode::MATH));
    assert_eq!(KeyCode::for_char('x'), Some(KeyCode::STO));
}

#[test]
fn test_untypeable_characters() {
    for ch in ['\0', '\t', '@', '#', '€', '\u{7f}'] {
        assert_eq!(KeyCode::for_char(ch), None, "{ch:?} should have no key");
    }
}

#[test]
fn test_try_from_pair() {
    assert_eq!(KeyCode::try_from((6, 5)), Ok(KeyCode::SECOND));
    assert_eq!(
        KeyCode::try_from((8, 0)),
        Err(KeyCodeError { group: 8, bit: 0 })
    );
    assert!(KeyCode::try_from((0, 8)).is_err());
}
