use std::path::PathBuf;

use thiserror::Error;

/// All failure modes surfaced by this crate.
///
/// There is deliberately no `TypeError` arm: `put`/`delete`/`get` take typed
/// `String`/`&str` arguments, so the "key or value is not a string" failure
/// the original engine could raise at runtime is instead a compile error
/// here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("key `{0}` not found")]
    NotFound(String),

    #[error("tried to write key `{current}`, but the previous key in this segment is `{previous}`")]
    UnsortedWrite { previous: String, current: String },

    #[error("corrupt segment at {path}: {reason}")]
    CorruptSegment { path: PathBuf, reason: String },

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
