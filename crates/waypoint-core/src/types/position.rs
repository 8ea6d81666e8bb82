use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, WaypointError};

/// Global position of a message in the log.
///
/// Totally ordered across every stream in the log. `Position::START` means
/// "before the first message", so subscribing from it delivers the whole log.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Position(u64);

impl Position {
    pub const START: Position = Position(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_start(self) -> bool {
        self.0 == 0
    }

    /// The position directly after this one.
    pub fn next(self) -> Position {
        Position(self.0.saturating_add(1))
    }

    /// The position directly after this one, or `None` at `u64::MAX`
    pub fn checked_next(self) -> Option<Position> {
        self.0.checked_add(1).map(Position)
    }

    /// SQL storage form. SQLite integers are signed.
    pub fn to_sql(self) -> Result<i64> {
        i64::try_from(self.0).map_err(|_| {
            WaypointError::Config(format!("position {} exceeds i64 storage range", self.0))
        })
    }

    pub fn from_sql(value: i64) -> Result<Self> {
        u64::try_from(value)
            .map(Position)
            .map_err(|_| WaypointError::Ledger(format!("negative stored position {}", value)))
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Position(value)
    }
}

impl From<Position> for u64 {
    fn from(position: Position) -> Self {
        position.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
