use thiserror::Error;

/// Errors surfaced by the structural comparison core.
///
/// Validation failures are returned to the caller at the entry point that
/// detected them. During a batch scan the pipeline catches per-candidate
/// errors and drops the candidate instead of aborting (see `search`).
#[derive(Error, Debug)]
pub enum FoldscanError {
    /// Input has the wrong dimensionality (e.g. a flat coordinate array
    /// whose length is not a multiple of 3).
    #[error("shape error: {0}")]
    Shape(String),

    /// Sequence length disagrees with coordinate count, or a declared
    /// residue count disagrees with a buffer size.
    #[error("length mismatch: {0}")]
    LengthMismatch(String),

    /// Input exceeds the configured maximum length.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Corrupt or undersized encoded coordinate block, or a malformed
    /// alignment string.
    #[error("format error: {0}")]
    Format(String),

    /// Empty alignment, or an alignment span that ends before it starts.
    #[error("degenerate alignment: {0}")]
    DegenerateAlignment(String),

    /// LDDT produced no residue with a defined score.
    #[error("undefined score: {0}")]
    UndefinedScore(String),

    /// Operation called in the wrong pipeline state (e.g. `search` before
    /// `load_query`).
    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, FoldscanError>;
