//! Error types for drumline

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DrumlineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Pattern not found: {0}")]
    PatternNotFound(usize),
    #[error("Instrument not found: {0}")]
    InstrumentNotFound(u64),
    #[error("Column {column} is beyond the end of the song ({columns} columns)")]
    ColumnOutOfRange { column: i32, columns: usize },
    #[error("Song has no columns")]
    EmptySong,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, DrumlineError>;
