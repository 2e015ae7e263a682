//! An incremental GLR parsing engine driven by Tree-sitter parse tables.
//!
//! A [`Parser`] turns text into a [`Tree`] using the tables of a
//! [`Language`]. After the text is edited, the edits are recorded with
//! [`Tree::edit`] and the old tree is handed to the next parse, which
//! reuses every subtree the edit did not touch.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod alloc;
mod error;
pub mod error_costs;
mod get_changed_ranges;
pub mod language;
pub mod length;
pub mod lexer;
mod node;
mod parser;
pub mod point;
mod reduce_action;
mod reusable_node;
pub mod stack;
pub mod subtree;
mod tree;
mod tree_cursor;
pub mod unicode;

use std::sync::{atomic::AtomicBool, Arc};

pub use streaming_iterator::StreamingIterator;

pub use crate::{
    alloc::{live_subtree_count, AllocationError},
    error::{IncludedRangesError, LanguageError, ParseError},
    language::{
        ExternalScannerDef, FieldId, FieldMapEntry, Language, LanguageBuilder, LexMode,
        ParseAction, StateId, Symbol, SymbolMetadata,
    },
    lexer::{ChunkedInput, ExternalScanner, Input, Lexer},
    node::Node,
    parser::{LogType, Logger, ParseStats, Parser},
    point::{InputEdit, Point, Range},
    tree::Tree,
    tree_cursor::{PreorderNodes, TreeCursor},
    unicode::InputEncoding,
};

/// The latest ABI version of language tables that this crate supports.
pub const LANGUAGE_VERSION: u32 = 15;

/// The earliest ABI version of language tables that this crate supports.
pub const MIN_COMPATIBLE_LANGUAGE_VERSION: u32 = 13;

/// Parse `input` with `language` in one call.
///
/// This is a shorthand for configuring a fresh [`Parser`]; hold on to a
/// parser instead when parsing repeatedly, so that its buffers are reused.
pub fn parse(
    language: &Arc<Language>,
    old_tree: Option<&Tree>,
    input: &mut dyn Input,
    cancellation_flag: Option<Arc<AtomicBool>>,
) -> Result<Tree, ParseError> {
    let mut parser = Parser::new();
    parser.set_language(language.clone())?;
    parser.set_cancellation_flag(cancellation_flag);
    parser.parse_with(input, old_tree)
}

/// Record an edit of the source text in `tree`. See [`Tree::edit`].
pub fn apply_edit(tree: &mut Tree, edit: &InputEdit) {
    tree.edit(edit);
}

/// The ranges whose syntactic structure differs between an edited
/// `old_tree` and the `new_tree` parsed from it.
#[must_use]
pub fn changed_ranges(old_tree: &Tree, new_tree: &Tree) -> Vec<Range> {
    old_tree.changed_ranges(new_tree).collect()
}
