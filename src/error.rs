#[derive(Debug, thiserror::Error)]
pub enum EngramError {
    #[error("title must not be empty")]
    EmptyTitle,

    #[error("query must not be empty")]
    EmptyQuery,

    #[error("content exceeds maximum length")]
    ContentTooLong,

    #[error("invalid memory type: {0}")]
    InvalidType(String),

    #[error("invalid link relation: {0}")]
    InvalidRelation(String),

    #[error("importance out of range: {0} (expected 0.0..=1.0)")]
    InvalidImportance(f64),

    #[error("invalid since expression: {0} (expected <N>h|d|w|m)")]
    InvalidSince(String),

    #[error("vector dimension mismatch: {0} vs {1}")]
    DimensionMismatch(usize, usize),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("embedder not configured (set ENGRAM_EMBED_URL)")]
    EmbedderNotConfigured,

    #[error("embedding backend error: {0}")]
    Embedding(String),

    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngramError {
    /// True for the error kinds a caller supplied bad input for, as opposed
    /// to the system failing underneath them.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::EmptyTitle
                | Self::EmptyQuery
                | Self::ContentTooLong
                | Self::InvalidType(_)
                | Self::InvalidRelation(_)
                | Self::InvalidImportance(_)
                | Self::InvalidSince(_)
                | Self::DimensionMismatch(_, _)
                | Self::Validation(_)
        )
    }
}
