use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Supported board dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BoardSize {
    Three,
    Four,
    Five,
}

impl BoardSize {
    /// Cells per side.
    pub fn dimension(&self) -> usize {
        match self {
            BoardSize::Three => 3,
            BoardSize::Four => 4,
            BoardSize::Five => 5,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.dimension() * self.dimension()
    }
}

impl From<BoardSize> for u8 {
    fn from(size: BoardSize) -> u8 {
        size.dimension() as u8
    }
}

impl TryFrom<u8> for BoardSize {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(BoardSize::Three),
            4 => Ok(BoardSize::Four),
            5 => Ok(BoardSize::Five),
            other => Err(format!("Invalid board size {}. Valid sizes: 3, 4, 5", other)),
        }
    }
}

impl fmt::Display for BoardSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{0}x{0}", self.dimension())
    }
}

/// A bingo board.
///
/// `completed_line_count` and `full_board` are caches of the line
/// detector's output. They are rebuilt from placement completion after
/// every write that could change a cell and are never trusted when a
/// remote copy arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub size: BoardSize,
    pub completed_line_count: i64,
    pub full_board: bool,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Board {
    pub fn new(name: impl Into<String>, size: BoardSize, owner_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            name: name.into(),
            size,
            completed_line_count: 0,
            full_board: false,
            version: 1,
            updated_at: Utc::now(),
            deleted: false,
            deleted_at: None,
            last_synced_at: None,
        }
    }

    pub(crate) fn content_eq(&self, other: &Board) -> bool {
        self.name == other.name
            && self.size == other.size
            && self.completed_line_count == other.completed_line_count
            && self.full_board == other.full_board
            && self.deleted == other.deleted
    }
}
