//! Emulation speed presets.
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::Serialize;
#[cfg(test)]
use test_strategy::Arbitrary;

/// How fast a device runs, relative to the real hardware.
#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Speed {
    Quarter,
    Half,
    #[default]
    Normal,
    Double,
    Quadruple,
    /// As fast as the host can go; no pacing against the wall clock.
    Max,
}

impl Speed {
    pub const ALL: [Speed; 6] = [
        Speed::Quarter,
        Speed::Half,
        Speed::Normal,
        Speed::Double,
        Speed::Quadruple,
        Speed::Max,
    ];

    /// The speed as a percentage of real time, or `None` for
    /// [`Speed::Max`].
    pub const fn percent(&self) -> Option<u32> {
        match self {
            Speed::Quarter => Some(25),
            Speed::Half => Some(50),
            Speed::Normal => Some(100),
            Speed::Double => Some(200),
            Speed::Quadruple => Some(400),
            Speed::Max => None,
        }
    }

    pub const fn is_max(&self) -> bool {
        matches!(self, Speed::Max)
    }

    pub fn from_percent(percent: u32) -> Option<Speed> {
        Speed::ALL
            .into_iter()
            .find(|s| s.percent() == Some(percent))
    }
}

impl Display for Speed {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self.percent() {
            Some(p) => write!(f, "{p}%"),
            None => f.write_str("max"),
        }
    }
}

/// Signals that a string does not name one of the speed presets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSpeed(pub String);

impl Display for UnknownSpeed {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "'{}' is not a speed preset (expected one of 25, 50, 100, 200, 400, max)",
            self.0
        )
    }
}

impl std::error::Error for UnknownSpeed {}

impl FromStr for Speed {
    type Err = UnknownSpeed;

    fn from_str(s: &str) -> Result<Speed, UnknownSpeed> {
        let trimmed = s.trim().trim_end_matches('%');
        if trimmed.eq_ignore_ascii_case("max") {
            return Ok(Speed::Max);
        }
        trimmed
            .parse::<u32>()
            .ok()
            .and_then(Speed::from_percent)
            .ok_or_else(|| UnknownSpeed(s.to_string()))
    }
}

#[test]
fn test_parse_speed() {
    assert_eq!("25".parse::<Speed>(), Ok(Speed::Quarter));
    assert_eq!("400%".parse::<Speed>(), Ok(Speed::Quadruple));
    assert_eq!("MAX".parse::<Speed>(), Ok(Speed::Max));
    assert!("150".parse::<Speed>().is_err());
    assert!("fast".parse::<Speed>().is_err());
}

#[cfg(test)]
mod proptests {
    use super::Speed;
    use test_strategy::proptest;

    #[proptest]
    fn display_parses_back(speed: Speed) {
        let shown = speed.to_string();
        assert_eq!(shown.parse::<Speed>(), Ok(speed));
    }
}
