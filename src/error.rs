//! Typed failures that callers need to tell apart.
//!
//! Everything else travels as `anyhow::Error`; these values can be recovered
//! with `err.downcast_ref::<SyncError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Two files carry the same content hash. Aborts the whole reconcile.
    #[error("duplicate content {hash}: '{first}' and '{second}' have identical bytes")]
    DuplicateContent {
        hash: String,
        first: String,
        second: String,
    },

    #[error("'{path}' is not inside root '{root}'")]
    OutsideRoot { root: String, path: String },

    #[error("{0} is not configured (run `juridoc roots`)")]
    RootNotConfigured(&'static str),
}

/// Failure to read or rewrite a note document.
#[derive(Debug, Error)]
pub enum NoteError {
    #[error("invalid ODT archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("malformed content.xml: {0}")]
    Xml(String),

    #[error("content.xml not found")]
    MissingContent,

    #[error("content.xml exceeds size limit ({0} bytes)")]
    TooLarge(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
