//! Addresses, breakpoint kinds and keypad modes.
//!
//! The calculators we schedule have a Z80 (or eZ80 in compatibility
//! mode) CPU with a 16-bit logical address space.  Paging (which
//! flash or RAM page is mapped into each 16KiB bank) is the engine's
//! business, so the scheduler only ever deals in logical addresses.
use std::fmt::{self, Debug, Display, Formatter, UpperHex};
use std::ops::{BitAnd, BitOr};

use serde::Serialize;
#[cfg(test)]
use test_strategy::Arbitrary;

/// A 16-bit logical address.
#[cfg_attr(test, derive(Arbitrary))]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct Address(u16);

impl Address {
    pub const ZERO: Address = Address(0);
    pub const MAX: Address = Address(u16::MAX);

    pub const fn new(a: u16) -> Address {
        Address(a)
    }

    /// Form an address from the bottom 16 bits of `value`.  Higher
    /// bits (for example a page number carried along by a debugger
    /// front-end) are discarded.
    pub const fn from_masked(value: u32) -> Address {
        Address((value & 0xFFFF) as u16)
    }

    /// Computes the address following the current address.  This
    /// wraps from 0xFFFF to 0, as the Z80 program counter does.
    #[must_use]
    pub fn successor(&self) -> Address {
        Address(self.0.wrapping_add(1))
    }
}

impl From<u16> for Address {
    fn from(a: u16) -> Address {
        Address(a)
    }
}

impl From<Address> for u16 {
    fn from(addr: Address) -> u16 {
        addr.0
    }
}

impl From<Address> for u32 {
    fn from(addr: Address) -> u32 {
        u32::from(addr.0)
    }
}

/// Signals that a value cannot be used as an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegativeAddress(pub i64);

impl Display for NegativeAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "address {} is negative", self.0)
    }
}

impl std::error::Error for NegativeAddress {}

impl TryFrom<i64> for Address {
    type Error = NegativeAddress;

    /// Negative values are rejected; anything else is masked to 16
    /// bits.
    fn try_from(value: i64) -> Result<Address, NegativeAddress> {
        if value < 0 {
            Err(NegativeAddress(value))
        } else {
            Ok(Address((value & 0xFFFF) as u16))
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "${:04X}", self.0)
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        // Hex is the conventional notation for Z80 addresses.
        write!(f, "Address({:#06X})", self.0)
    }
}

impl UpperHex for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        UpperHex::fmt(&self.0, f)
    }
}

/// A set of breakpoint kinds which may be set on a single address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct BreakpointKinds(u8);

impl BreakpointKinds {
    pub const NONE: BreakpointKinds = BreakpointKinds(0);
    /// Stop before executing the instruction at the address.
    pub const NORMAL: BreakpointKinds = BreakpointKinds(1);
    /// Stop when the address is read as data.
    pub const MEM_READ: BreakpointKinds = BreakpointKinds(2);
    /// Stop when the address is written.
    pub const MEM_WRITE: BreakpointKinds = BreakpointKinds(4);
    pub const ALL: BreakpointKinds = BreakpointKinds(7);

    /// Builds a set from raw kind bits.  Bits which don't correspond
    /// to a breakpoint kind are ignored.
    pub const fn from_bits_truncate(bits: u8) -> BreakpointKinds {
        BreakpointKinds(bits & Self::ALL.0)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn contains(&self, other: BreakpointKinds) -> bool {
        self.0 & other.0 == other.0
    }

    /// The single-kind members of this set, lowest bit first.
    pub fn iter(&self) -> impl Iterator<Item = BreakpointKinds> + '_ {
        [Self::NORMAL, Self::MEM_READ, Self::MEM_WRITE]
            .into_iter()
            .filter(|k| self.contains(*k))
    }
}

impl BitOr for BreakpointKinds {
    type Output = BreakpointKinds;
    fn bitor(self, rhs: BreakpointKinds) -> BreakpointKinds {
        BreakpointKinds(self.0 | rhs.0)
    }
}

impl BitAnd for BreakpointKinds {
    type Output = BreakpointKinds;
    fn bitand(self, rhs: BreakpointKinds) -> BreakpointKinds {
        BreakpointKinds(self.0 & rhs.0)
    }
}

impl Debug for BreakpointKinds {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        let names: Vec<&str> = self
            .iter()
            .map(|k| match k {
                BreakpointKinds::NORMAL => "NORMAL",
                BreakpointKinds::MEM_READ => "MEM_READ",
                _ => "MEM_WRITE",
            })
            .collect();
        write!(f, "BreakpointKinds({})", names.join("|"))
    }
}

/// The modifier state of the calculator keypad, as the operating
/// system on the calculator sees it.  Hosts use this to decide which
/// key legends to show as enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum KeypadState {
    #[default]
    Normal,
    Second,
    Alpha,
    AlphaLower,
    SecondAlpha,
}

#[test]
fn test_address_masking() {
    assert_eq!(Address::from_masked(0x1_2345), Address::new(0x2345));
    assert_eq!(Address::try_from(0x1_0000_i64), Ok(Address::ZERO));
    assert_eq!(Address::try_from(-1_i64), Err(NegativeAddress(-1)));
    assert_eq!(Address::MAX.successor(), Address::ZERO);
    assert_eq!(format!("{}", Address::new(0x9D95)), "$9D95");
}

#[test]
fn test_breakpoint_kinds() {
    let k = BreakpointKinds::from_bits_truncate(0xFF);
    assert_eq!(k, BreakpointKinds::ALL);
    assert!(BreakpointKinds::from_bits_truncate(8).is_empty());
    let rw = BreakpointKinds::MEM_READ | BreakpointKinds::MEM_WRITE;
    assert!(rw.contains(BreakpointKinds::MEM_WRITE));
    assert!(!rw.contains(BreakpointKinds::NORMAL));
    assert_eq!(
        rw.iter().collect::<Vec<_>>(),
        vec![BreakpointKinds::MEM_READ, BreakpointKinds::MEM_WRITE]
    );
    assert_eq!(format!("{rw:?}"), "BreakpointKinds(MEM_READ|MEM_WRITE)");
}

#[cfg(test)]
mod address_proptests {
    use super::Address;
    use test_strategy::proptest;

    #[proptest]
    fn masking_keeps_low_bits(value: u32) {
        let a = Address::from_masked(value);
        assert_eq!(u32::from(a), value & 0xFFFF);
    }

    #[proptest]
    fn successor_is_wrapping_increment(a: Address) {
        assert_eq!(u16::from(a.successor()), u16::from(a).wrapping_add(1));
    }
}
