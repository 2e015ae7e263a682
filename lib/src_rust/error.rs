use thiserror::Error;

use crate::alloc::AllocationError;

/// Failures that abort a parse. Syntax errors in the input are never
/// reported here; they become `ERROR` and `MISSING` nodes in the tree.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("parsing was cancelled")]
    Cancelled,
    #[error("parsing timed out")]
    TimedOut,
    #[error("no language was assigned to the parser")]
    NoLanguage,
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Language(#[from] LanguageError),
}

/// An error that occurred when trying to assign an incompatible [`Language`]
/// to a parser, or when building language tables.
///
/// [`Language`]: crate::Language
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LanguageError {
    #[error(
        "incompatible language version {version}, expected minimum {}, maximum {}",
        crate::MIN_COMPATIBLE_LANGUAGE_VERSION,
        crate::LANGUAGE_VERSION
    )]
    Version { version: u32 },
    #[error("invalid parse table: {0}")]
    InvalidTable(String),
}

/// An error that occurred in [`Parser::set_included_ranges`].
///
/// [`Parser::set_included_ranges`]: crate::Parser::set_included_ranges
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("included range {0} overlaps or precedes the previous range")]
pub struct IncludedRangesError(pub usize);
