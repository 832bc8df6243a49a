//! Thermostat presets.

use std::fmt;
use std::str::FromStr;

use crate::error::DeviceError;

/// Named thermostat preset, with the provider's numeric id.
///
/// `None` is the provider's "no active preset" sentinel, not a preset the
/// user can pick a temperature for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemperatureState {
    Comfort,
    Home,
    Sleep,
    Away,
    None,
}

impl TemperatureState {
    pub const ALL: [TemperatureState; 5] = [
        Self::Comfort,
        Self::Home,
        Self::Sleep,
        Self::Away,
        Self::None,
    ];

    pub fn id(self) -> i64 {
        match self {
            Self::Comfort => 0,
            Self::Home => 1,
            Self::Sleep => 2,
            Self::Away => 3,
            Self::None => -1,
        }
    }

    /// Reverse lookup. Ids the provider may add later map to `None` (absent),
    /// not to [`TemperatureState::None`].
    pub fn from_id(id: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.id() == id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Comfort => "comfort",
            Self::Home => "home",
            Self::Sleep => "sleep",
            Self::Away => "away",
            Self::None => "none",
        }
    }

    pub fn is_sentinel(self) -> bool {
        self == Self::None
    }
}

impl fmt::Display for TemperatureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemperatureState {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DeviceError::UnknownPreset(s.to_string()))
    }
}
