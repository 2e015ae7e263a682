//! The persistent syntax tree representation.
//!
//! A [`Subtree`] is either a small leaf stored inline or a reference-counted
//! heap node. Heap nodes are shared between trees, stack versions and parents
//! through `Arc`; they are never mutated while shared. Every mutation goes
//! through a copy-on-write step first.

use std::{
    cmp::Ordering,
    fmt::Write as _,
    io::{self, Write},
    mem,
    sync::Arc,
};

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::{
    alloc::LiveAllocation,
    error_costs::{
        ERROR_COST_PER_MISSING_TREE, ERROR_COST_PER_RECOVERY, ERROR_COST_PER_SKIPPED_CHAR,
        ERROR_COST_PER_SKIPPED_LINE, ERROR_COST_PER_SKIPPED_TREE,
    },
    language::{
        Language, StateId, Symbol, BUILTIN_SYM_END, BUILTIN_SYM_ERROR, BUILTIN_SYM_ERROR_REPEAT,
    },
    length::Length,
    point::{InputEdit, Point},
};

/// Parse state of nodes whose state is meaningless for reuse, such as those
/// containing errors.
pub const TREE_STATE_NONE: StateId = StateId::MAX;

const MAX_INLINE_TREE_LENGTH: u32 = u8::MAX as u32;
const MAX_TREE_POOL_SIZE: usize = 32;
const POOL_CLASS_COUNT: usize = 16;

/// Serialized external scanner state carried by a token. Short states are
/// stored without a separate allocation.
pub type ExternalScannerState = SmallVec<[u8; 24]>;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SubtreeFlags: u16 {
        const VISIBLE = 1 << 0;
        const NAMED = 1 << 1;
        const EXTRA = 1 << 2;
        const FRAGILE_LEFT = 1 << 3;
        const FRAGILE_RIGHT = 1 << 4;
        const HAS_CHANGES = 1 << 5;
        const HAS_EXTERNAL_TOKENS = 1 << 6;
        const HAS_EXTERNAL_SCANNER_STATE_CHANGE = 1 << 7;
        const DEPENDS_ON_COLUMN = 1 << 8;
        const IS_MISSING = 1 << 9;
        const IS_KEYWORD = 1 << 10;
        /// The leaf's own text, not only its lookahead, overlaps an edit.
        const EDITED = 1 << 11;
    }
}

/// A leaf small enough to be stored by value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SubtreeInlineData {
    symbol: u8,
    flags: SubtreeFlags,
    parse_state: StateId,
    padding_bytes: u8,
    padding_rows: u8,
    padding_columns: u8,
    size_bytes: u8,
    lookahead_bytes: u8,
}

impl SubtreeInlineData {
    const fn can_inline(padding: Length, size: Length, lookahead_bytes: u32) -> bool {
        padding.bytes < MAX_INLINE_TREE_LENGTH
            && padding.extent.row < 16
            && padding.extent.column < MAX_INLINE_TREE_LENGTH
            && size.bytes < MAX_INLINE_TREE_LENGTH
            && size.extent.row == 0
            && size.extent.column < MAX_INLINE_TREE_LENGTH
            && lookahead_bytes < 16
    }

    fn padding(&self) -> Length {
        Length::new(
            u32::from(self.padding_bytes),
            Point::new(u32::from(self.padding_rows), u32::from(self.padding_columns)),
        )
    }

    fn size(&self) -> Length {
        let bytes = u32::from(self.size_bytes);
        Length::new(bytes, Point::new(0, bytes))
    }

    fn set_lengths(&mut self, padding: Length, size: Length) {
        self.padding_bytes = padding.bytes as u8;
        self.padding_rows = padding.extent.row as u8;
        self.padding_columns = padding.extent.column as u8;
        self.size_bytes = size.bytes as u8;
    }
}

#[derive(Clone, Debug, Default)]
pub struct NodeData {
    pub(crate) children: Vec<Subtree>,
    visible_child_count: u32,
    named_child_count: u32,
    visible_descendant_count: u32,
    pub(crate) dynamic_precedence: i32,
    repeat_depth: u32,
    pub(crate) production_id: u16,
    first_leaf_symbol: Symbol,
    first_leaf_parse_state: StateId,
}

#[derive(Clone, Debug)]
pub enum SubtreeContent {
    Leaf {
        external_scanner_state: ExternalScannerState,
    },
    /// A character the lexer could not match.
    Error { lookahead_char: char },
    Node(NodeData),
}

#[derive(Clone, Debug)]
pub struct SubtreeHeapData {
    padding: Length,
    size: Length,
    lookahead_bytes: u32,
    error_cost: u32,
    symbol: Symbol,
    parse_state: StateId,
    flags: SubtreeFlags,
    content: SubtreeContent,
    _allocation: LiveAllocation,
}

impl Drop for SubtreeHeapData {
    // Releasing a deep tree must not recurse once per level.
    fn drop(&mut self) {
        let SubtreeContent::Node(node) = &mut self.content else {
            return;
        };
        let mut work = mem::take(&mut node.children);
        while let Some(child) = work.pop() {
            if let Subtree::Heap(data) = child {
                if let Some(mut data) = Arc::into_inner(data) {
                    if let SubtreeContent::Node(node) = &mut data.content {
                        work.append(&mut node.children);
                    }
                }
            }
        }
    }
}

/// A node of a syntax tree. Cloning retains, dropping releases.
#[derive(Clone, Debug)]
pub enum Subtree {
    Inline(SubtreeInlineData),
    Heap(Arc<SubtreeHeapData>),
}

/// The parameters of a token produced by the lexer.
#[derive(Clone, Copy, Debug, Default)]
pub struct LeafParams {
    pub symbol: Symbol,
    pub padding: Length,
    pub size: Length,
    pub lookahead_bytes: u32,
    pub parse_state: StateId,
    pub has_external_tokens: bool,
    pub depends_on_column: bool,
    pub is_keyword: bool,
}

impl Default for Subtree {
    fn default() -> Self {
        Self::Inline(SubtreeInlineData::default())
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl Subtree {
    pub fn new_leaf(params: LeafParams, language: &Language) -> Self {
        let metadata = language.symbol_metadata(params.symbol);
        let mut flags = SubtreeFlags::empty();
        flags.set(SubtreeFlags::VISIBLE, metadata.visible);
        flags.set(SubtreeFlags::NAMED, metadata.named);
        flags.set(SubtreeFlags::EXTRA, params.symbol == BUILTIN_SYM_END);
        flags.set(SubtreeFlags::IS_KEYWORD, params.is_keyword);

        let is_inline = params.symbol <= Symbol::from(u8::MAX)
            && !params.has_external_tokens
            && !params.depends_on_column
            && SubtreeInlineData::can_inline(params.padding, params.size, params.lookahead_bytes);

        if is_inline {
            let mut data = SubtreeInlineData {
                symbol: params.symbol as u8,
                flags,
                parse_state: params.parse_state,
                lookahead_bytes: params.lookahead_bytes as u8,
                ..SubtreeInlineData::default()
            };
            data.set_lengths(params.padding, params.size);
            Self::Inline(data)
        } else {
            flags.set(SubtreeFlags::HAS_EXTERNAL_TOKENS, params.has_external_tokens);
            flags.set(SubtreeFlags::DEPENDS_ON_COLUMN, params.depends_on_column);
            Self::Heap(Arc::new(SubtreeHeapData {
                padding: params.padding,
                size: params.size,
                lookahead_bytes: params.lookahead_bytes,
                error_cost: 0,
                symbol: params.symbol,
                parse_state: params.parse_state,
                flags,
                content: SubtreeContent::Leaf {
                    external_scanner_state: ExternalScannerState::new(),
                },
                _allocation: LiveAllocation::register(),
            }))
        }
    }

    /// A leaf covering text that no token matched.
    pub fn new_error(
        lookahead_char: char,
        padding: Length,
        size: Length,
        lookahead_bytes: u32,
        parse_state: StateId,
        language: &Language,
    ) -> Self {
        let metadata = language.symbol_metadata(BUILTIN_SYM_ERROR);
        let mut flags = SubtreeFlags::FRAGILE_LEFT | SubtreeFlags::FRAGILE_RIGHT;
        flags.set(SubtreeFlags::VISIBLE, metadata.visible);
        flags.set(SubtreeFlags::NAMED, metadata.named);
        Self::Heap(Arc::new(SubtreeHeapData {
            padding,
            size,
            lookahead_bytes,
            error_cost: 0,
            symbol: BUILTIN_SYM_ERROR,
            parse_state,
            flags,
            content: SubtreeContent::Error { lookahead_char },
            _allocation: LiveAllocation::register(),
        }))
    }

    /// A zero-width token inserted by error recovery.
    pub fn new_missing_leaf(
        symbol: Symbol,
        padding: Length,
        lookahead_bytes: u32,
        language: &Language,
    ) -> Self {
        let mut result = Self::new_leaf(
            LeafParams {
                symbol,
                padding,
                lookahead_bytes,
                ..LeafParams::default()
            },
            language,
        );
        result.update_flags(|flags| flags.insert(SubtreeFlags::IS_MISSING));
        result
    }

    /// An internal node owning `children`. Its lengths, error cost and child
    /// counts are derived from the children.
    pub fn new_node(
        symbol: Symbol,
        children: Vec<Subtree>,
        production_id: u16,
        language: &Language,
    ) -> Self {
        let metadata = language.symbol_metadata(symbol);
        let fragile = symbol == BUILTIN_SYM_ERROR || symbol == BUILTIN_SYM_ERROR_REPEAT;
        let mut flags = SubtreeFlags::empty();
        flags.set(SubtreeFlags::VISIBLE, metadata.visible);
        flags.set(SubtreeFlags::NAMED, metadata.named);
        flags.set(SubtreeFlags::FRAGILE_LEFT, fragile);
        flags.set(SubtreeFlags::FRAGILE_RIGHT, fragile);
        let mut data = SubtreeHeapData {
            padding: Length::ZERO,
            size: Length::ZERO,
            lookahead_bytes: 0,
            error_cost: 0,
            symbol,
            parse_state: 0,
            flags,
            content: SubtreeContent::Node(NodeData {
                children,
                production_id,
                ..NodeData::default()
            }),
            _allocation: LiveAllocation::register(),
        };
        data.summarize_children(language);
        Self::Heap(Arc::new(data))
    }

    pub fn new_error_node(children: Vec<Subtree>, extra: bool, language: &Language) -> Self {
        let mut result = Self::new_node(BUILTIN_SYM_ERROR, children, 0, language);
        result.set_extra(extra);
        result
    }
}

// ---------------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------------

impl Subtree {
    #[inline]
    fn flags(&self) -> SubtreeFlags {
        match self {
            Self::Inline(data) => data.flags,
            Self::Heap(data) => data.flags,
        }
    }

    #[inline]
    fn node(&self) -> Option<&NodeData> {
        match self {
            Self::Heap(data) => match &data.content {
                SubtreeContent::Node(node) => Some(node),
                _ => None,
            },
            Self::Inline(_) => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn symbol(&self) -> Symbol {
        match self {
            Self::Inline(data) => Symbol::from(data.symbol),
            Self::Heap(data) => data.symbol,
        }
    }

    #[inline]
    #[must_use]
    pub fn visible(&self) -> bool {
        self.flags().contains(SubtreeFlags::VISIBLE)
    }

    #[inline]
    #[must_use]
    pub fn named(&self) -> bool {
        self.flags().contains(SubtreeFlags::NAMED)
    }

    #[inline]
    #[must_use]
    pub fn extra(&self) -> bool {
        self.flags().contains(SubtreeFlags::EXTRA)
    }

    #[inline]
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.flags().contains(SubtreeFlags::HAS_CHANGES)
    }

    #[inline]
    #[must_use]
    pub fn is_edited(&self) -> bool {
        self.flags().contains(SubtreeFlags::EDITED)
    }

    #[inline]
    #[must_use]
    pub fn is_missing(&self) -> bool {
        self.flags().contains(SubtreeFlags::IS_MISSING)
    }

    #[inline]
    #[must_use]
    pub fn is_keyword(&self) -> bool {
        self.flags().contains(SubtreeFlags::IS_KEYWORD)
    }

    #[inline]
    #[must_use]
    pub fn fragile_left(&self) -> bool {
        self.flags().contains(SubtreeFlags::FRAGILE_LEFT)
    }

    #[inline]
    #[must_use]
    pub fn fragile_right(&self) -> bool {
        self.flags().contains(SubtreeFlags::FRAGILE_RIGHT)
    }

    #[inline]
    #[must_use]
    pub fn is_fragile(&self) -> bool {
        self.flags()
            .intersects(SubtreeFlags::FRAGILE_LEFT | SubtreeFlags::FRAGILE_RIGHT)
    }

    #[inline]
    #[must_use]
    pub fn has_external_tokens(&self) -> bool {
        self.flags().contains(SubtreeFlags::HAS_EXTERNAL_TOKENS)
    }

    #[inline]
    #[must_use]
    pub fn has_external_scanner_state_change(&self) -> bool {
        self.flags()
            .contains(SubtreeFlags::HAS_EXTERNAL_SCANNER_STATE_CHANGE)
    }

    #[inline]
    #[must_use]
    pub fn depends_on_column(&self) -> bool {
        self.flags().contains(SubtreeFlags::DEPENDS_ON_COLUMN)
    }

    #[inline]
    #[must_use]
    pub fn parse_state(&self) -> StateId {
        match self {
            Self::Inline(data) => data.parse_state,
            Self::Heap(data) => data.parse_state,
        }
    }

    #[inline]
    #[must_use]
    pub fn lookahead_bytes(&self) -> u32 {
        match self {
            Self::Inline(data) => u32::from(data.lookahead_bytes),
            Self::Heap(data) => data.lookahead_bytes,
        }
    }

    #[inline]
    #[must_use]
    pub fn padding(&self) -> Length {
        match self {
            Self::Inline(data) => data.padding(),
            Self::Heap(data) => data.padding,
        }
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> Length {
        match self {
            Self::Inline(data) => data.size(),
            Self::Heap(data) => data.size,
        }
    }

    #[inline]
    #[must_use]
    pub fn total_size(&self) -> Length {
        self.padding() + self.size()
    }

    #[inline]
    #[must_use]
    pub fn total_bytes(&self) -> u32 {
        self.total_size().bytes
    }

    #[inline]
    #[must_use]
    pub fn children(&self) -> &[Subtree] {
        self.node().map_or(&[], |node| node.children.as_slice())
    }

    #[inline]
    #[must_use]
    pub fn child_count(&self) -> u32 {
        self.children().len() as u32
    }

    #[inline]
    #[must_use]
    pub fn repeat_depth(&self) -> u32 {
        self.node().map_or(0, |node| node.repeat_depth)
    }

    #[inline]
    #[must_use]
    pub fn visible_child_count(&self) -> u32 {
        self.node().map_or(0, |node| node.visible_child_count)
    }

    #[inline]
    #[must_use]
    pub fn named_child_count(&self) -> u32 {
        self.node().map_or(0, |node| node.named_child_count)
    }

    #[inline]
    #[must_use]
    pub fn visible_descendant_count(&self) -> u32 {
        self.node().map_or(0, |node| node.visible_descendant_count)
    }

    #[inline]
    #[must_use]
    pub fn dynamic_precedence(&self) -> i32 {
        self.node().map_or(0, |node| node.dynamic_precedence)
    }

    #[inline]
    #[must_use]
    pub fn production_id(&self) -> u16 {
        self.node().map_or(0, |node| node.production_id)
    }

    #[inline]
    #[must_use]
    pub fn error_cost(&self) -> u32 {
        if self.is_missing() {
            ERROR_COST_PER_MISSING_TREE + ERROR_COST_PER_RECOVERY
        } else {
            match self {
                Self::Inline(_) => 0,
                Self::Heap(data) => data.error_cost,
            }
        }
    }

    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.symbol() == BUILTIN_SYM_ERROR
    }

    #[inline]
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.symbol() == BUILTIN_SYM_END
    }

    /// True if this subtree is an error, a missing token, or contains one.
    #[inline]
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.is_error() || self.is_missing() || self.error_cost() > 0
    }

    #[inline]
    #[must_use]
    pub fn leaf_symbol(&self) -> Symbol {
        self.node()
            .filter(|node| !node.children.is_empty())
            .map_or_else(|| self.symbol(), |node| node.first_leaf_symbol)
    }

    #[inline]
    #[must_use]
    pub fn leaf_parse_state(&self) -> StateId {
        self.node()
            .filter(|node| !node.children.is_empty())
            .map_or_else(|| self.parse_state(), |node| node.first_leaf_parse_state)
    }

    #[must_use]
    pub fn lookahead_char(&self) -> Option<char> {
        match self {
            Self::Heap(data) => match data.content {
                SubtreeContent::Error { lookahead_char } => Some(lookahead_char),
                _ => None,
            },
            Self::Inline(_) => None,
        }
    }

    /// The serialized scanner state stored on an external token.
    #[must_use]
    pub fn external_scanner_state(&self) -> &[u8] {
        match self {
            Self::Heap(data) if data.flags.contains(SubtreeFlags::HAS_EXTERNAL_TOKENS) => {
                match &data.content {
                    SubtreeContent::Leaf {
                        external_scanner_state,
                    } => external_scanner_state,
                    _ => &[],
                }
            }
            _ => &[],
        }
    }

    /// The rightmost token in this subtree that was produced by an external
    /// scanner.
    #[must_use]
    pub fn last_external_token(&self) -> Option<&Subtree> {
        if !self.has_external_tokens() {
            return None;
        }
        let mut tree = self;
        while tree.child_count() > 0 {
            match tree
                .children()
                .iter()
                .rev()
                .find(|child| child.has_external_tokens())
            {
                Some(child) => tree = child,
                None => break,
            }
        }
        Some(tree)
    }

    /// Whether two subtrees are the same node, not merely equal ones.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Heap(a), Self::Heap(b)) => Arc::ptr_eq(a, b),
            (Self::Inline(a), Self::Inline(b)) => a == b,
            _ => false,
        }
    }

    /// A stable address for heap nodes, usable as an identity.
    #[must_use]
    pub fn id(&self) -> usize {
        match self {
            Self::Heap(data) => Arc::as_ptr(data) as usize,
            Self::Inline(_) => std::ptr::from_ref(self) as usize,
        }
    }

    fn is_uniquely_owned(&self) -> bool {
        match self {
            Self::Heap(data) => Arc::strong_count(data) == 1,
            Self::Inline(_) => true,
        }
    }
}

/// Compare the serialized scanner states of two optional external tokens.
#[must_use]
pub fn external_scanner_state_eq(a: Option<&Subtree>, b: Option<&Subtree>) -> bool {
    let state_a = a.map_or(&[][..], Subtree::external_scanner_state);
    let state_b = b.map_or(&[][..], Subtree::external_scanner_state);
    state_a == state_b
}

// ---------------------------------------------------------------------------
// Mutation (copy-on-write)
// ---------------------------------------------------------------------------

impl Subtree {
    /// Get mutable access to the heap data, copying it if it is shared and
    /// moving an inline leaf onto the heap.
    pub(crate) fn heap_mut(&mut self) -> &mut SubtreeHeapData {
        if let Self::Inline(data) = *self {
            *self = Self::Heap(Arc::new(SubtreeHeapData {
                padding: data.padding(),
                size: data.size(),
                lookahead_bytes: u32::from(data.lookahead_bytes),
                error_cost: 0,
                symbol: Symbol::from(data.symbol),
                parse_state: data.parse_state,
                flags: data.flags,
                content: SubtreeContent::Leaf {
                    external_scanner_state: ExternalScannerState::new(),
                },
                _allocation: LiveAllocation::register(),
            }));
        }
        match self {
            Self::Heap(data) => Arc::make_mut(data),
            Self::Inline(_) => unreachable!("inline subtree was just moved to the heap"),
        }
    }

    fn update_flags(&mut self, update: impl FnOnce(&mut SubtreeFlags)) {
        match self {
            Self::Inline(data) => update(&mut data.flags),
            Self::Heap(data) => update(&mut Arc::make_mut(data).flags),
        }
    }

    pub fn set_extra(&mut self, is_extra: bool) {
        if self.extra() != is_extra {
            self.update_flags(|flags| flags.set(SubtreeFlags::EXTRA, is_extra));
        }
    }

    pub(crate) fn set_parse_state(&mut self, state: StateId) {
        match self {
            Self::Inline(data) => data.parse_state = state,
            Self::Heap(data) => Arc::make_mut(data).parse_state = state,
        }
    }

    /// Change the symbol of a token, as when an identifier turns out to be
    /// a keyword.
    pub fn set_symbol(&mut self, symbol: Symbol, language: &Language) {
        let metadata = language.symbol_metadata(symbol);
        match self {
            Self::Inline(data) if symbol <= Symbol::from(u8::MAX) => {
                data.symbol = symbol as u8;
                data.flags.set(SubtreeFlags::VISIBLE, metadata.visible);
                data.flags.set(SubtreeFlags::NAMED, metadata.named);
            }
            _ => {
                let data = self.heap_mut();
                data.symbol = symbol;
                data.flags.set(SubtreeFlags::VISIBLE, metadata.visible);
                data.flags.set(SubtreeFlags::NAMED, metadata.named);
            }
        }
    }

    /// Exclude a node from reuse, as when it was built while several
    /// versions of the stack were active.
    pub(crate) fn mark_fragile(&mut self) {
        let data = self.heap_mut();
        data.flags
            .insert(SubtreeFlags::FRAGILE_LEFT | SubtreeFlags::FRAGILE_RIGHT);
        data.parse_state = TREE_STATE_NONE;
    }

    pub(crate) fn set_external_scanner_state(&mut self, state: &[u8]) {
        let data = self.heap_mut();
        data.flags.insert(SubtreeFlags::HAS_EXTERNAL_TOKENS);
        data.content = SubtreeContent::Leaf {
            external_scanner_state: ExternalScannerState::from_slice(state),
        };
    }

    pub(crate) fn set_has_external_scanner_state_change(&mut self) {
        self.update_flags(|flags| flags.insert(SubtreeFlags::HAS_EXTERNAL_SCANNER_STATE_CHANGE));
    }

    pub(crate) fn add_dynamic_precedence(&mut self, precedence: i32) {
        if precedence == 0 {
            return;
        }
        if let SubtreeContent::Node(node) = &mut self.heap_mut().content {
            node.dynamic_precedence += precedence;
        }
    }

    /// Mutable access to the children, only if this node is not shared.
    fn children_mut_if_unique(&mut self) -> Option<&mut Vec<Subtree>> {
        match self {
            Self::Heap(data) => match &mut Arc::get_mut(data)?.content {
                SubtreeContent::Node(node) => Some(&mut node.children),
                _ => None,
            },
            Self::Inline(_) => None,
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<Subtree>> {
        match self {
            Self::Heap(data) => match &mut Arc::make_mut(data).content {
                SubtreeContent::Node(node) => Some(&mut node.children),
                _ => None,
            },
            Self::Inline(_) => None,
        }
    }
}

impl SubtreeHeapData {
    /// Recompute every aggregate of an internal node from its children.
    pub(crate) fn summarize_children(&mut self, language: &Language) {
        let symbol = self.symbol;
        let is_error_symbol = symbol == BUILTIN_SYM_ERROR || symbol == BUILTIN_SYM_ERROR_REPEAT;
        let node_flags = self.flags;
        let SubtreeContent::Node(node) = &mut self.content else {
            return;
        };

        let mut padding = Length::ZERO;
        let mut size = Length::ZERO;
        let mut error_cost = 0;
        let mut flags = node_flags
            - (SubtreeFlags::HAS_EXTERNAL_TOKENS
                | SubtreeFlags::DEPENDS_ON_COLUMN
                | SubtreeFlags::HAS_EXTERNAL_SCANNER_STATE_CHANGE);
        let mut parse_state = self.parse_state;
        node.named_child_count = 0;
        node.visible_child_count = 0;
        node.visible_descendant_count = 0;
        node.repeat_depth = 0;
        node.dynamic_precedence = 0;

        let alias_sequence = language.alias_sequence(node.production_id);
        let mut structural_index = 0;
        let mut lookahead_end_byte = 0;

        for (i, child) in node.children.iter().enumerate() {
            if size.extent.row == 0 && child.depends_on_column() {
                flags.insert(SubtreeFlags::DEPENDS_ON_COLUMN);
            }
            if child.has_external_scanner_state_change() {
                flags.insert(SubtreeFlags::HAS_EXTERNAL_SCANNER_STATE_CHANGE);
            }

            if i == 0 {
                padding = child.padding();
                size = child.size();
            } else {
                size += child.total_size();
            }

            let child_lookahead_end_byte = padding.bytes + size.bytes + child.lookahead_bytes();
            lookahead_end_byte = lookahead_end_byte.max(child_lookahead_end_byte);

            if child.symbol() != BUILTIN_SYM_ERROR_REPEAT {
                error_cost += child.error_cost();
            }

            let grandchild_count = child.child_count();
            if is_error_symbol
                && !child.extra()
                && !(child.is_error() && grandchild_count == 0)
            {
                if child.visible() {
                    error_cost += ERROR_COST_PER_SKIPPED_TREE;
                } else if grandchild_count > 0 {
                    error_cost += ERROR_COST_PER_SKIPPED_TREE * child.visible_child_count();
                }
            }

            node.dynamic_precedence += child.dynamic_precedence();
            node.visible_descendant_count += child.visible_descendant_count();

            let alias = alias_sequence
                .and_then(|sequence| sequence.get(structural_index))
                .copied()
                .unwrap_or(0);
            if alias != 0 && !child.extra() {
                node.visible_descendant_count += 1;
                node.visible_child_count += 1;
                if language.symbol_metadata(alias).named {
                    node.named_child_count += 1;
                }
            } else if child.visible() {
                node.visible_descendant_count += 1;
                node.visible_child_count += 1;
                if child.named() {
                    node.named_child_count += 1;
                }
            } else if grandchild_count > 0 {
                node.visible_child_count += child.visible_child_count();
                node.named_child_count += child.named_child_count();
            }

            if child.has_external_tokens() {
                flags.insert(SubtreeFlags::HAS_EXTERNAL_TOKENS);
            }

            if child.is_error() {
                flags.insert(SubtreeFlags::FRAGILE_LEFT | SubtreeFlags::FRAGILE_RIGHT);
                parse_state = TREE_STATE_NONE;
            }

            if !child.extra() {
                structural_index += 1;
            }
        }

        self.lookahead_bytes = lookahead_end_byte.saturating_sub(size.bytes + padding.bytes);

        if is_error_symbol {
            error_cost += ERROR_COST_PER_RECOVERY
                + ERROR_COST_PER_SKIPPED_CHAR * size.bytes
                + ERROR_COST_PER_SKIPPED_LINE * size.extent.row;
        }

        if let (Some(first_child), Some(last_child)) = (node.children.first(), node.children.last()) {
            node.first_leaf_symbol = first_child.leaf_symbol();
            node.first_leaf_parse_state = first_child.leaf_parse_state();

            if first_child.fragile_left() {
                flags.insert(SubtreeFlags::FRAGILE_LEFT);
            }
            if last_child.fragile_right() {
                flags.insert(SubtreeFlags::FRAGILE_RIGHT);
            }

            if node.children.len() >= 2
                && !flags.contains(SubtreeFlags::VISIBLE)
                && !flags.contains(SubtreeFlags::NAMED)
                && first_child.symbol() == symbol
            {
                node.repeat_depth = first_child.repeat_depth().max(last_child.repeat_depth()) + 1;
            }
        }

        self.padding = padding;
        self.size = size;
        self.error_cost = error_cost;
        self.flags = flags;
        self.parse_state = parse_state;
    }
}

// ---------------------------------------------------------------------------
// Editing
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct Edit {
    start: Length,
    old_end: Length,
    new_end: Length,
}

impl Subtree {
    /// Adjust this tree for a change to the text: subtrees after the edit
    /// are shifted, subtrees overlapping it are resized, and every subtree
    /// whose text or lookahead touches it is marked as changed. Shared
    /// nodes are copied so that other owners keep their view.
    pub fn edit(&mut self, input_edit: &InputEdit) {
        let mut stack: Vec<(&mut Subtree, Edit)> = vec![(
            self,
            Edit {
                start: Length::new(input_edit.start_byte, input_edit.start_position),
                old_end: Length::new(input_edit.old_end_byte, input_edit.old_end_position),
                new_end: Length::new(input_edit.new_end_byte, input_edit.new_end_position),
            },
        )];

        while let Some((tree, mut edit)) = stack.pop() {
            let is_noop =
                edit.old_end.bytes == edit.start.bytes && edit.new_end.bytes == edit.start.bytes;
            let mut is_pure_insertion = edit.old_end.bytes == edit.start.bytes;
            let invalidate_first_row = tree.depends_on_column();

            let mut size = tree.size();
            let mut padding = tree.padding();
            let total_size = padding + size;
            let lookahead_bytes = tree.lookahead_bytes();
            let end_byte = total_size.bytes + lookahead_bytes;
            if edit.start.bytes > end_byte || (is_noop && edit.start.bytes == end_byte) {
                continue;
            }

            let mut touches_text = false;
            if edit.old_end.bytes <= padding.bytes {
                // Entirely within the whitespace before this subtree.
                padding = edit.new_end + (padding - edit.old_end);
            } else if edit.start.bytes < padding.bytes {
                // Starts before this subtree and extends into it.
                size = size.saturating_sub(edit.old_end - padding);
                padding = edit.new_end;
                touches_text = true;
            } else if edit.start.bytes < total_size.bytes
                || (edit.start.bytes == total_size.bytes && is_pure_insertion)
            {
                size = (edit.new_end - padding) + total_size.saturating_sub(edit.old_end);
                touches_text = true;
            }

            let is_leaf = tree.child_count() == 0;
            match &mut *tree {
                Subtree::Inline(data)
                    if SubtreeInlineData::can_inline(padding, size, lookahead_bytes) =>
                {
                    data.set_lengths(padding, size);
                }
                _ => {
                    let data = tree.heap_mut();
                    data.padding = padding;
                    data.size = size;
                }
            }
            tree.update_flags(|flags| {
                flags.insert(SubtreeFlags::HAS_CHANGES);
                if touches_text && is_leaf {
                    flags.insert(SubtreeFlags::EDITED);
                }
            });

            let first_row = padding.extent.row;
            let Some(children) = tree.children_mut() else {
                continue;
            };
            let mut child_right = Length::ZERO;
            for (i, child) in children.iter_mut().enumerate() {
                let child_size = child.total_size();
                let child_left = child_right;
                child_right = child_left + child_size;

                // Ends before the edit.
                if child_right.bytes + child.lookahead_bytes() < edit.start.bytes {
                    continue;
                }

                // Stop at the first child that starts after the edit, unless
                // column-sensitive children on the same row must be revisited.
                if (child_left.bytes > edit.old_end.bytes
                    || (child_left.bytes == edit.old_end.bytes && child_size.bytes > 0 && i > 0))
                    && (!invalidate_first_row || child_left.extent.row > first_row)
                {
                    break;
                }

                let child_edit = Edit {
                    start: edit.start.saturating_sub(child_left),
                    old_end: edit.old_end.saturating_sub(child_left),
                    new_end: edit.new_end.saturating_sub(child_left),
                };

                // Inserted text belongs to the first child that touches the
                // edit; later children only shrink.
                if child_right.bytes > edit.start.bytes
                    || (child_right.bytes == edit.start.bytes && is_pure_insertion)
                {
                    edit.new_end = edit.start;
                    is_pure_insertion = false;
                }

                stack.push((child, child_edit));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison and rendering
// ---------------------------------------------------------------------------

impl Subtree {
    /// A total order on tree shapes: by symbol, then child count, then
    /// children from left to right.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        let mut stack = vec![(self, other)];
        while let Some((left, right)) = stack.pop() {
            let ordering = left
                .symbol()
                .cmp(&right.symbol())
                .then(left.child_count().cmp(&right.child_count()));
            if ordering != Ordering::Equal {
                return ordering;
            }
            stack.extend(left.children().iter().zip(right.children()).rev());
        }
        Ordering::Equal
    }

    /// Render this tree as an S-expression. Anonymous nodes are omitted
    /// unless `include_all` is set.
    #[must_use]
    pub fn to_sexp(
        &self,
        alias_symbol: Symbol,
        alias_is_named: bool,
        language: &Language,
        include_all: bool,
    ) -> String {
        enum Frame<'a> {
            Enter {
                tree: &'a Subtree,
                alias_symbol: Symbol,
                alias_is_named: bool,
                field_name: Option<&'static str>,
                is_root: bool,
            },
            Close,
        }

        let mut result = String::new();
        let mut stack = vec![Frame::Enter {
            tree: self,
            alias_symbol,
            alias_is_named,
            field_name: None,
            is_root: true,
        }];

        while let Some(frame) = stack.pop() {
            let Frame::Enter {
                tree,
                alias_symbol,
                alias_is_named,
                field_name,
                is_root,
            } = frame
            else {
                result.push(')');
                continue;
            };

            let is_visible = include_all
                || tree.is_missing()
                || if alias_symbol != 0 {
                    alias_is_named
                } else {
                    tree.visible() && tree.named()
                };
            let symbol = if alias_symbol != 0 {
                alias_symbol
            } else {
                tree.symbol()
            };
            let symbol_name = language.symbol_name(symbol);

            if is_visible {
                if !is_root {
                    result.push(' ');
                    if let Some(field_name) = field_name {
                        let _ = write!(result, "{field_name}: ");
                    }
                }
                if tree.is_error() && tree.child_count() == 0 && tree.size().bytes > 0 {
                    result.push_str("(UNEXPECTED ");
                    match tree.lookahead_char() {
                        Some('\0') | None => result.push_str("EOF"),
                        Some(c) if (' '..='~').contains(&c) => {
                            let _ = write!(result, "'{c}'");
                        }
                        Some(c) => {
                            let _ = write!(result, "'\\u{{{:x}}}'", c as u32);
                        }
                    }
                } else if tree.is_missing() {
                    result.push_str("(MISSING ");
                    if alias_is_named || tree.named() {
                        result.push_str(symbol_name);
                    } else {
                        let _ = write!(result, "\"{symbol_name}\"");
                    }
                } else {
                    let _ = write!(result, "({symbol_name}");
                }
                stack.push(Frame::Close);
            } else if is_root {
                if tree.child_count() > 0 {
                    let _ = write!(result, "({symbol_name}");
                    stack.push(Frame::Close);
                } else if tree.named() {
                    let _ = write!(result, "({symbol_name})");
                } else {
                    let _ = write!(result, "(\"{symbol_name}\")");
                }
            }

            let alias_sequence = language.alias_sequence(tree.production_id());
            let field_map = language.field_map(tree.production_id());
            let mut structural_child_index = 0;
            let mut child_frames = Vec::with_capacity(tree.children().len());
            for child in tree.children() {
                if child.extra() {
                    child_frames.push(Frame::Enter {
                        tree: child,
                        alias_symbol: 0,
                        alias_is_named: false,
                        field_name: None,
                        is_root: false,
                    });
                    continue;
                }
                let child_alias = alias_sequence
                    .and_then(|sequence| sequence.get(structural_child_index))
                    .copied()
                    .unwrap_or(0);
                let child_alias_is_named =
                    child_alias != 0 && language.symbol_metadata(child_alias).named;
                let child_field_name = field_map
                    .iter()
                    .find(|entry| {
                        !entry.inherited && usize::from(entry.child_index) == structural_child_index
                    })
                    .and_then(|entry| language.field_name_for_id(entry.field_id))
                    .or(if is_visible { None } else { field_name });
                child_frames.push(Frame::Enter {
                    tree: child,
                    alias_symbol: child_alias,
                    alias_is_named: child_alias_is_named,
                    field_name: child_field_name,
                    is_root: false,
                });
                structural_child_index += 1;
            }
            stack.extend(child_frames.into_iter().rev());
        }

        result
    }

    /// Write this tree in the Graphviz dot format.
    pub fn print_dot_graph(&self, language: &Language, f: &mut impl Write) -> io::Result<()> {
        writeln!(f, "digraph tree {{")?;
        writeln!(f, "edge [arrowhead=none]")?;

        // (tree, start offset, alias, parent id and child index)
        let mut stack = vec![(self, 0_u32, 0, None)];
        while let Some((tree, start_offset, alias_symbol, parent)) = stack.pop() {
            let symbol = if alias_symbol != 0 {
                alias_symbol
            } else {
                tree.symbol()
            };
            let end_offset = start_offset + tree.total_bytes();
            let id = std::ptr::from_ref(tree) as usize;
            write!(f, "tree_{id:x} [label=\"")?;
            language.write_symbol_as_dot_string(f, symbol)?;
            write!(f, "\"")?;
            if tree.child_count() == 0 {
                write!(f, ", shape=plaintext")?;
            }
            if tree.extra() {
                write!(f, ", fontcolor=gray")?;
            }
            write!(
                f,
                ", tooltip=\"range: {start_offset} - {end_offset}\nstate: {}\nerror-cost: {}\nhas-changes: {}\ndepends-on-column: {}\ndescendant-count: {}\nrepeat-depth: {}\nlookahead-bytes: {}",
                tree.parse_state(),
                tree.error_cost(),
                u8::from(tree.has_changes()),
                u8::from(tree.depends_on_column()),
                tree.visible_descendant_count(),
                tree.repeat_depth(),
                tree.lookahead_bytes(),
            )?;
            if let Some(c) = tree.lookahead_char().filter(|c| *c != '\0') {
                write!(f, "\ncharacter: '{}'", c.escape_default())?;
            }
            writeln!(f, "\"]")?;
            if let Some((parent_id, index)) = parent {
                writeln!(f, "tree_{parent_id:x} -> tree_{id:x} [tooltip={index}]")?;
            }

            let alias_sequence = language.alias_sequence(tree.production_id());
            let mut structural_child_index = 0;
            let mut child_start_offset = start_offset;
            let mut children = Vec::with_capacity(tree.children().len());
            for (index, child) in tree.children().iter().enumerate() {
                let mut child_alias = 0;
                if !child.extra() {
                    child_alias = alias_sequence
                        .and_then(|sequence| sequence.get(structural_child_index))
                        .copied()
                        .unwrap_or(0);
                    structural_child_index += 1;
                }
                children.push((child, child_start_offset, child_alias, Some((id, index))));
                child_start_offset += child.total_bytes();
            }
            stack.extend(children.into_iter().rev());
        }

        writeln!(f, "}}")
    }
}

// ---------------------------------------------------------------------------
// Pool and balancing
// ---------------------------------------------------------------------------

/// Recycles the child vectors of released nodes, keyed by capacity class,
/// and holds the scratch stacks used by iterative tree algorithms.
#[derive(Debug, Default)]
pub struct SubtreePool {
    free_children: Vec<Vec<Vec<Subtree>>>,
    release_stack: Vec<Subtree>,
}

impl SubtreePool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            free_children: vec![Vec::new(); POOL_CLASS_COUNT],
            release_stack: Vec::new(),
        }
    }

    fn class_of(capacity: usize) -> usize {
        (capacity.max(1).next_power_of_two().trailing_zeros() as usize).min(POOL_CLASS_COUNT - 1)
    }

    /// An empty vector able to hold at least `capacity` children.
    pub fn children_vec(&mut self, capacity: usize) -> Vec<Subtree> {
        let class = Self::class_of(capacity);
        if let Some(free) = self.free_children.get_mut(class) {
            if let Some(mut vec) = free.pop() {
                vec.reserve(capacity);
                return vec;
            }
        }
        Vec::with_capacity(capacity)
    }

    /// Return a vector to the pool, releasing anything it still holds.
    pub fn recycle(&mut self, mut vec: Vec<Subtree>) {
        for subtree in vec.drain(..) {
            self.release(subtree);
        }
        self.store(vec);
    }

    fn store(&mut self, vec: Vec<Subtree>) {
        debug_assert!(vec.is_empty());
        if vec.capacity() == 0 {
            return;
        }
        if self.free_children.len() < POOL_CLASS_COUNT {
            self.free_children.resize_with(POOL_CLASS_COUNT, Vec::new);
        }
        let free = &mut self.free_children[Self::class_of(vec.capacity())];
        if free.len() < MAX_TREE_POOL_SIZE {
            free.push(vec);
        }
    }

    /// Release a subtree. Nodes whose last owner this was are freed
    /// iteratively and their child vectors are kept for reuse.
    pub fn release(&mut self, subtree: Subtree) {
        let mut work = mem::take(&mut self.release_stack);
        work.push(subtree);
        while let Some(tree) = work.pop() {
            let Subtree::Heap(data) = tree else {
                continue;
            };
            let Some(mut data) = Arc::into_inner(data) else {
                continue;
            };
            if let SubtreeContent::Node(node) = &mut data.content {
                let mut children = mem::take(&mut node.children);
                work.extend(children.drain(..));
                self.store(children);
            }
        }
        self.release_stack = work;
    }

    /// Rebalance left-leaning repetition chains in the uniquely owned part
    /// of `tree`, so that later traversals stay shallow.
    pub fn balance(&mut self, tree: &mut Subtree, language: &Language) {
        let mut stack: Vec<&mut Subtree> = Vec::new();
        if tree.child_count() > 0 && tree.is_uniquely_owned() {
            stack.push(tree);
        }

        while let Some(tree) = stack.pop() {
            if tree.repeat_depth() > 0 {
                let children = tree.children();
                if let (Some(first), Some(last)) = (children.first(), children.last()) {
                    let repeat_delta =
                        i64::from(first.repeat_depth()) - i64::from(last.repeat_depth());
                    if repeat_delta > 0 {
                        let mut i = repeat_delta as u32 / 2;
                        while i > 0 {
                            compress(tree, i, language);
                            i /= 2;
                        }
                    }
                }
            }

            if let Some(children) = tree.children_mut_if_unique() {
                for child in children.iter_mut() {
                    if child.child_count() > 0 && child.is_uniquely_owned() {
                        stack.push(child);
                    }
                }
            }
        }
    }
}

/// Whether `tree` is a uniquely owned internal node of `symbol` with at
/// least two children.
fn is_rotatable(tree: &Subtree, symbol: Symbol) -> bool {
    matches!(tree, Subtree::Heap(_))
        && tree.is_uniquely_owned()
        && tree.child_count() >= 2
        && tree.symbol() == symbol
}

/// Perform up to `count` right rotations down the left spine of `tree`:
/// `tree(child(grandchild(.., last), ..), ..)` becomes
/// `tree(grandchild(.., child(last, ..)), ..)`.
fn compress(tree: &mut Subtree, count: u32, language: &Language) {
    let symbol = tree.symbol();
    if !tree.is_uniquely_owned() || tree.child_count() < 2 {
        return;
    }

    let mut current = mem::take(tree);
    let mut path = Vec::new();
    for _ in 0..count {
        let Some(children) = current.children_mut_if_unique() else {
            break;
        };
        let child_ok = is_rotatable(&children[0], symbol)
            && is_rotatable(&children[0].children()[0], symbol);
        if !child_ok {
            break;
        }

        let mut child = mem::take(&mut children[0]);
        let Some(child_children) = child.children_mut_if_unique() else {
            children[0] = child;
            break;
        };
        let mut grandchild = mem::take(&mut child_children[0]);
        let Some(grandchild_children) = grandchild.children_mut_if_unique() else {
            child_children[0] = grandchild;
            children[0] = child;
            break;
        };
        if let Some(last) = grandchild_children.last_mut() {
            child_children[0] = mem::take(last);
            *last = child;
        }

        path.push(current);
        current = grandchild;
    }

    // Re-summarize bottom-up: the rotated-down child, its new parent, and
    // the node above.
    while let Some(mut parent) = path.pop() {
        if let Some(grandchildren) = current.children_mut_if_unique() {
            if let Some(rotated) = grandchildren.last_mut() {
                summarize(rotated, language);
            }
        }
        summarize(&mut current, language);
        if let Some(children) = parent.children_mut_if_unique() {
            children[0] = current;
        }
        summarize(&mut parent, language);
        current = parent;
    }
    *tree = current;
}

fn summarize(tree: &mut Subtree, language: &Language) {
    if let Subtree::Heap(data) = tree {
        if let Some(data) = Arc::get_mut(data) {
            data.summarize_children(language);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        language::{LanguageBuilder, SymbolMetadata},
        lexer::Lexer,
    };

    const NUMBER: Symbol = 1;
    const PLUS: Symbol = 2;
    const SUM: Symbol = 3;
    const LIST: Symbol = 4;

    fn lex_nothing(_: &mut Lexer<'_>, _: StateId) -> bool {
        false
    }

    fn language() -> Language {
        LanguageBuilder::new("subtrees", lex_nothing)
            .token("number", SymbolMetadata::NAMED)
            .token("+", SymbolMetadata::ANONYMOUS)
            .non_terminal("sum", SymbolMetadata::NAMED)
            .non_terminal("_list", SymbolMetadata::HIDDEN)
            .state_count(1)
            .build()
            .unwrap()
    }

    fn leaf(symbol: Symbol, padding: u32, size: u32, language: &Language) -> Subtree {
        Subtree::new_leaf(
            LeafParams {
                symbol,
                padding: Length::new(padding, Point::new(0, padding)),
                size: Length::new(size, Point::new(0, size)),
                lookahead_bytes: 1,
                parse_state: 1,
                ..LeafParams::default()
            },
            language,
        )
    }

    fn edit(start: u32, old_end: u32, new_end: u32) -> InputEdit {
        InputEdit {
            start_byte: start,
            old_end_byte: old_end,
            new_end_byte: new_end,
            start_position: Point::new(0, start),
            old_end_position: Point::new(0, old_end),
            new_end_position: Point::new(0, new_end),
        }
    }

    // (sum (number) + (number)) over "1 + 22"
    fn sum(language: &Language) -> Subtree {
        Subtree::new_node(
            SUM,
            vec![
                leaf(NUMBER, 0, 1, language),
                leaf(PLUS, 1, 1, language),
                leaf(NUMBER, 1, 2, language),
            ],
            0,
            language,
        )
    }

    #[test]
    fn small_leaves_are_inline() {
        let language = language();
        assert!(matches!(leaf(NUMBER, 2, 3, &language), Subtree::Inline(_)));
        assert!(matches!(leaf(NUMBER, 2, 300, &language), Subtree::Heap(_)));
        let leaf = leaf(NUMBER, 2, 3, &language);
        assert_eq!(leaf.padding(), Length::new(2, Point::new(0, 2)));
        assert_eq!(leaf.size(), Length::new(3, Point::new(0, 3)));
        assert!(leaf.named());
        assert!(!leaf.has_error());
    }

    #[test]
    fn internal_nodes_summarize_their_children() {
        let language = language();
        let tree = sum(&language);
        assert_eq!(tree.padding(), Length::ZERO);
        assert_eq!(tree.size(), Length::new(6, Point::new(0, 6)));
        assert_eq!(tree.child_count(), 3);
        assert_eq!(tree.visible_child_count(), 3);
        assert_eq!(tree.named_child_count(), 2);
        assert_eq!(tree.visible_descendant_count(), 3);
        assert_eq!(tree.lookahead_bytes(), 1);
        assert_eq!(tree.leaf_symbol(), NUMBER);
        assert_eq!(tree.error_cost(), 0);
        assert!(!tree.has_error());
    }

    #[test]
    fn errors_propagate_to_ancestors() {
        let language = language();
        let error = Subtree::new_error(
            '@',
            Length::ZERO,
            Length::new(1, Point::new(0, 1)),
            1,
            0,
            &language,
        );
        assert!(error.has_error());
        let error_node = Subtree::new_error_node(vec![error], false, &language);
        assert!(error_node.error_cost() >= ERROR_COST_PER_RECOVERY);
        let parent = Subtree::new_node(SUM, vec![leaf(NUMBER, 0, 1, &language), error_node], 0, &language);
        assert!(parent.has_error());
        assert!(parent.is_fragile());
        assert_eq!(parent.parse_state(), TREE_STATE_NONE);

        let missing = Subtree::new_missing_leaf(NUMBER, Length::ZERO, 0, &language);
        assert!(missing.is_missing());
        assert_eq!(
            missing.error_cost(),
            ERROR_COST_PER_MISSING_TREE + ERROR_COST_PER_RECOVERY
        );
    }

    #[test]
    fn edit_shifts_following_subtrees_and_marks_overlapping_ones() {
        let language = language();
        let mut tree = sum(&language);
        // "1 + 22" -> "1 + 2xx2"
        tree.edit(&edit(5, 5, 7));
        assert_eq!(tree.size().bytes, 8);
        assert!(tree.has_changes());
        let children = tree.children();
        assert!(!children[0].has_changes());
        assert!(children[2].has_changes());
        assert!(children[2].is_edited());
        assert_eq!(children[2].size().bytes, 4);

        // Insert before everything.
        let mut tree = sum(&language);
        tree.edit(&edit(0, 0, 3));
        assert_eq!(tree.padding().bytes, 3);
        assert_eq!(tree.size().bytes, 6);
    }

    #[test]
    fn lookahead_overlap_changes_without_editing() {
        let language = language();
        let mut tree = sum(&language);
        // Delete the "+" at byte 2. The first number looked ahead up to
        // that byte but its own text is untouched.
        tree.edit(&edit(2, 3, 2));
        let children = tree.children();
        assert!(children[1].has_changes());
        assert!(children[1].is_edited());
        assert_eq!(children[1].size().bytes, 0);
        assert!(children[0].has_changes());
        assert!(!children[0].is_edited());
        assert!(!children[2].has_changes());
    }

    #[test]
    fn editing_a_shared_tree_copies_on_write() {
        let language = language();
        let original = sum(&language);
        let mut edited = original.clone();
        edited.edit(&edit(4, 5, 7));
        assert!(!original.has_changes());
        assert_eq!(original.size().bytes, 6);
        assert_eq!(edited.size().bytes, 8);
        assert!(!original.ptr_eq(&edited));
        assert!(original.children()[0].ptr_eq(&edited.children()[0]));
    }

    #[test]
    fn sexp_omits_anonymous_nodes() {
        let language = language();
        let tree = sum(&language);
        assert_eq!(tree.to_sexp(0, false, &language, false), "(sum (number) (number))");
        assert_eq!(
            tree.to_sexp(0, false, &language, true),
            "(sum (number) (+) (number))"
        );
        let missing = Subtree::new_missing_leaf(PLUS, Length::ZERO, 0, &language);
        let node = Subtree::new_node(SUM, vec![leaf(NUMBER, 0, 1, &language), missing], 0, &language);
        assert_eq!(
            node.to_sexp(0, false, &language, false),
            "(sum (number) (MISSING \"+\"))"
        );
    }

    #[test]
    fn compare_orders_by_shape() {
        let language = language();
        let a = sum(&language);
        let b = sum(&language);
        assert_eq!(a.compare(&b), Ordering::Equal);
        let c = Subtree::new_node(SUM, vec![leaf(NUMBER, 0, 1, &language)], 0, &language);
        assert_eq!(c.compare(&a), Ordering::Less);
        assert_eq!(a.compare(&leaf(NUMBER, 0, 1, &language)), Ordering::Greater);
    }

    #[test]
    fn deep_trees_drop_without_recursion() {
        let language = language();
        let mut tree = leaf(NUMBER, 0, 1, &language);
        for _ in 0..200_000 {
            tree = Subtree::new_node(SUM, vec![tree], 0, &language);
        }
        drop(tree);
    }

    #[test]
    fn pool_release_recycles_child_vectors() {
        let language = language();
        let mut pool = SubtreePool::new();
        pool.release(sum(&language));
        let vec = pool.children_vec(3);
        assert!(vec.capacity() >= 3);
        assert!(vec.is_empty());
    }

    #[test]
    fn balance_flattens_left_deep_repetitions() {
        let language = language();
        let mut tree = Subtree::new_node(
            LIST,
            vec![leaf(NUMBER, 0, 1, &language), leaf(NUMBER, 0, 1, &language)],
            0,
            &language,
        );
        for _ in 0..62 {
            tree = Subtree::new_node(LIST, vec![tree, leaf(NUMBER, 0, 1, &language)], 0, &language);
        }
        let before = tree.size();
        assert_eq!(tree.repeat_depth(), 62);

        let mut pool = SubtreePool::new();
        pool.balance(&mut tree, &language);

        assert_eq!(tree.size(), before);
        assert!(tree.repeat_depth() < 62);
        let mut leaves = 0;
        let mut stack = vec![&tree];
        while let Some(node) = stack.pop() {
            if node.child_count() == 0 {
                leaves += 1;
            }
            stack.extend(node.children());
        }
        assert_eq!(leaves, 64);
    }
}
