//! Acquisition modes and the ordered mode set that defines a cycle.
//!
//! A [`Mode`] is one phase of the multiplexed cycle. Its ordinal is stable and
//! is used both for cycle position and for picking the illumination line. A
//! [`ModeSet`] is an ordered list of distinct modes; its order *is* the cycle
//! order, shared by the waveform compiler and the acquisition loop.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One phase of the multiplexed acquisition cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// No illumination; only the exposure trigger fires (bioluminescence).
    #[serde(alias = "bioluminescence")]
    Unlit,
    /// First excitation source (blue fluorescence).
    #[serde(alias = "blue")]
    ExcitationA,
    /// Second excitation source (green fluorescence).
    #[serde(alias = "green")]
    ExcitationB,
}

impl Mode {
    /// Stable ordinal of the mode.
    pub fn ordinal(self) -> usize {
        match self {
            Mode::Unlit => 0,
            Mode::ExcitationA => 1,
            Mode::ExcitationB => 2,
        }
    }

    /// Whether the mode switches on an illumination source.
    pub fn is_excitation(self) -> bool {
        !matches!(self, Mode::Unlit)
    }

    /// Machine-friendly name, also used in file names.
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Unlit => "unlit",
            Mode::ExcitationA => "excitation_a",
            Mode::ExcitationB => "excitation_b",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while parsing modes or building a [`ModeSet`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModeError {
    /// The name is not a known mode or alias.
    #[error("unknown mode '{0}' (expected unlit, excitation_a, excitation_b, bioluminescence, blue or green)")]
    Unknown(String),
    /// A mode appears twice in the cycle.
    #[error("mode '{0}' listed more than once")]
    Duplicate(Mode),
}

impl FromStr for Mode {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unlit" | "bioluminescence" => Ok(Mode::Unlit),
            "excitation_a" | "blue" => Ok(Mode::ExcitationA),
            "excitation_b" | "green" => Ok(Mode::ExcitationB),
            other => Err(ModeError::Unknown(other.to_string())),
        }
    }
}

/// Ordered sequence of distinct modes. Insertion order defines cycle order.
///
/// A mode set may be empty; starting an acquisition with one is rejected by
/// the sync core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Mode>", into = "Vec<Mode>")]
pub struct ModeSet(Vec<Mode>);

impl ModeSet {
    /// Build a mode set, rejecting duplicates.
    pub fn new(modes: impl IntoIterator<Item = Mode>) -> Result<Self, ModeError> {
        let mut out: Vec<Mode> = Vec::new();
        for mode in modes {
            if out.contains(&mode) {
                return Err(ModeError::Duplicate(mode));
            }
            out.push(mode);
        }
        Ok(Self(out))
    }

    /// Number of modes in the cycle.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no mode is active.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Modes in cycle order.
    pub fn as_slice(&self) -> &[Mode] {
        &self.0
    }

    /// Iterate in cycle order.
    pub fn iter(&self) -> impl Iterator<Item = Mode> + '_ {
        self.0.iter().copied()
    }

    /// Slot index of `mode` within the cycle.
    pub fn position(&self, mode: Mode) -> Option<usize> {
        self.0.iter().position(|m| *m == mode)
    }

    /// Mode owning cycle position `counter mod len`.
    ///
    /// Returns `None` only for an empty set.
    pub fn mode_at(&self, counter: u64) -> Option<Mode> {
        if self.0.is_empty() {
            return None;
        }
        let idx = (counter % self.0.len() as u64) as usize;
        Some(self.0[idx])
    }
}

impl TryFrom<Vec<Mode>> for ModeSet {
    type Error = ModeError;

    fn try_from(modes: Vec<Mode>) -> Result<Self, Self::Error> {
        ModeSet::new(modes)
    }
}

impl From<ModeSet> for Vec<Mode> {
    fn from(set: ModeSet) -> Self {
        set.0
    }
}

impl FromStr for ModeSet {
    type Err = ModeError;

    /// Parse a comma separated list such as `"unlit,blue"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let modes = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Mode::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        ModeSet::new(modes)
    }
}

impl fmt::Display for ModeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|m| m.as_str()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_aliases() {
        assert_eq!("bioluminescence".parse::<Mode>().unwrap(), Mode::Unlit);
        assert_eq!("Blue".parse::<Mode>().unwrap(), Mode::ExcitationA);
        assert_eq!("excitation_b".parse::<Mode>().unwrap(), Mode::ExcitationB);
        assert!(matches!("red".parse::<Mode>(), Err(ModeError::Unknown(_))));
    }

    #[test]
    fn test_mode_serde_aliases() {
        let modes: Vec<Mode> = serde_json::from_str(r#"["green", "unlit"]"#).unwrap();
        assert_eq!(modes, vec![Mode::ExcitationB, Mode::Unlit]);
        assert_eq!(
            serde_json::to_string(&Mode::ExcitationA).unwrap(),
            r#""excitation_a""#
        );
    }

    #[test]
    fn test_mode_set_rejects_duplicates() {
        let err = ModeSet::new([Mode::Unlit, Mode::ExcitationA, Mode::Unlit]).unwrap_err();
        assert_eq!(err, ModeError::Duplicate(Mode::Unlit));

        let parsed: Result<ModeSet, _> = serde_json::from_str(r#"["blue", "blue"]"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_mode_at_follows_insertion_order() {
        let set: ModeSet = "green, unlit, blue".parse().unwrap();
        let assigned: Vec<Mode> = (0..5).filter_map(|c| set.mode_at(c)).collect();
        assert_eq!(
            assigned,
            vec![
                Mode::ExcitationB,
                Mode::Unlit,
                Mode::ExcitationA,
                Mode::ExcitationB,
                Mode::Unlit
            ]
        );
        assert_eq!(set.position(Mode::ExcitationA), Some(2));
        assert_eq!(ModeSet::default().mode_at(3), None);
    }

    #[test]
    fn test_mode_set_display() {
        let set = ModeSet::new([Mode::Unlit, Mode::ExcitationB]).unwrap();
        assert_eq!(set.to_string(), "[unlit, excitation_b]");
    }
}
