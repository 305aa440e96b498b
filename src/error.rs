//! Custom error types for the dispatch core.
//!
//! This module defines the primary error type, `DispatchError`, for the whole
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to classify the failures that occur while demultiplexing
//! hub traffic, from an unparseable reply line down to a single keyword
//! group that would not convert.
//!
//! The taxonomy deliberately mirrors how failures degrade:
//!
//! - **`Parse`**: the whole line is unusable. The dispatcher logs it and
//!   moves on to the next line; nothing else is affected.
//! - **`Conversion`**: one keyword group on an otherwise good line did not
//!   convert. Only that key variable is marked stale; sibling groups on the
//!   same line still update normally.
//! - **`DuplicateKeyVar` / `DuplicateCmdId`**: construction-time misuse of
//!   the registries, surfaced immediately rather than silently replacing.
//! - **`CommandTimeout`**: the synthetic failure injected into a command
//!   that saw no terminal reply within its deadline.
//!
//! Nothing in this crate is fatal to the process; every failure degrades to
//! "this one value or command is now marked unreliable".

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("malformed reply line: {0}")]
    Parse(String),

    #[error("keyword '{keyword}' failed to convert: {reason}")]
    Conversion { keyword: String, reason: String },

    #[error("key variable {actor}.{keyword} is already registered")]
    DuplicateKeyVar { actor: String, keyword: String },

    #[error("command id {0} is still outstanding for this commander")]
    DuplicateCmdId(u32),

    #[error("command id 0 is reserved for unsolicited broadcasts")]
    ReservedCmdId,

    #[error("command id {0} is not active")]
    UnknownCmd(u32),

    #[error("command timed out after {0:.1} s")]
    CommandTimeout(f64),

    #[error("no command sink configured")]
    NoSink,

    #[error("command sink rejected line: {0}")]
    SinkClosed(String),

    #[error("dispatcher task is not running")]
    ActorGone,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DispatchError::Conversion {
            keyword: "fwStatus".to_string(),
            reason: "expected 4 fields, got 3".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "keyword 'fwStatus' failed to convert: expected 4 fields, got 3"
        );
    }

    #[test]
    fn test_timeout_display() {
        let err = DispatchError::CommandTimeout(2.5);
        assert!(err.to_string().contains("2.5 s"));
    }
}
