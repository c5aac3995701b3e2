use thiserror::Error;

use crate::types::PageId;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database disk image is malformed (page {page_id}): {reason}")]
    Corrupt { page_id: PageId, reason: String },

    #[error("database is locked")]
    Busy,

    #[error("page cache exhausted: all {capacity} cached pages are pinned or dirty")]
    CacheExhausted { capacity: usize },

    #[error("cursor on tree {root} was invalidated by another cursor's modification")]
    CursorInvalidated { root: PageId },

    #[error("constraint failed: {details}")]
    ConstraintViolation { details: String },

    #[error("syntax error: {details}")]
    SyntaxError { details: String },

    #[error("{details}")]
    SemanticError { details: String },

    #[error("interrupted")]
    Interrupted,

    #[error("datatype mismatch: {details}")]
    TypeMismatch { details: String },

    #[error("string or blob too big: {size} bytes (max {max})")]
    TooBig { size: usize, max: usize },

    #[error("file is not a database: {reason}")]
    NotADatabase { reason: String },

    #[error("database or disk is full")]
    Full,

    #[error("attempt to write a readonly database")]
    ReadOnly,

    #[error("database schema has changed")]
    SchemaChanged,

    #[error("bad parameter or other API misuse: {details}")]
    Misuse { details: String },

    #[error("internal error: {details}")]
    Internal { details: String },
}

impl DatabaseError {
    pub fn corrupt(page_id: PageId, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            page_id,
            reason: reason.into(),
        }
    }

    pub fn semantic(details: impl Into<String>) -> Self {
        Self::SemanticError {
            details: details.into(),
        }
    }

    pub fn misuse(details: impl Into<String>) -> Self {
        Self::Misuse {
            details: details.into(),
        }
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::Internal {
            details: details.into(),
        }
    }

    pub fn constraint(details: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            details: details.into(),
        }
    }

    /// Lock contention is the only condition a caller should simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Tags a context-free corruption error with the page it was read from.
    pub fn at_page(self, page_id: PageId) -> Self {
        match self {
            Self::Corrupt { page_id: 0, reason } => Self::Corrupt { page_id, reason },
            other => other,
        }
    }
}

impl From<sqlparser::parser::ParserError> for DatabaseError {
    fn from(err: sqlparser::parser::ParserError) -> Self {
        let details = match err {
            sqlparser::parser::ParserError::TokenizerError(msg)
            | sqlparser::parser::ParserError::ParserError(msg) => msg,
            sqlparser::parser::ParserError::RecursionLimitExceeded => {
                "recursion limit exceeded".to_string()
            }
        };
        Self::SyntaxError { details }
    }
}

pub type Result<T> = std::result::Result<T, DatabaseError>;
