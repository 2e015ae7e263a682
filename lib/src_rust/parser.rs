//! The GLR parse driver.
//!
//! A [`Parser`] owns the configuration and the scratch structures that
//! survive between parses. Each call to [`Parser::parse_with`] runs a
//! [`ParseRun`], which drives every version of the graph-structured stack
//! forward one token at a time, forking on ambiguities, merging versions
//! that reach the same state, and recovering from errors by choosing the
//! cheapest of several strategies.

use std::{
    fmt,
    io::Write,
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    alloc::AllocationBudget,
    error::{IncludedRangesError, LanguageError, ParseError},
    error_costs::{
        ERROR_COST_PER_SKIPPED_CHAR, ERROR_COST_PER_SKIPPED_LINE, ERROR_COST_PER_SKIPPED_TREE,
        ERROR_STATE, MAX_COST_DIFFERENCE, MAX_SUMMARY_DEPTH, MAX_VERSION_COUNT,
        MAX_VERSION_COUNT_OVERFLOW, OP_COUNT_PER_TIMEOUT_CHECK,
    },
    get_changed_ranges::{included_range_differences, ranges_intersect},
    language::{
        Language, ParseAction, StateId, Symbol, TableEntry, BUILTIN_SYM_END,
        BUILTIN_SYM_ERROR, BUILTIN_SYM_ERROR_REPEAT, LEX_STATE_NONE,
    },
    length::Length,
    lexer::{ExternalScanner, Input, Lexer, SERIALIZATION_BUFFER_SIZE},
    point::Range,
    reduce_action::{ReduceAction, ReduceActionSet},
    reusable_node::ReusableNode,
    stack::{Stack, StackSummaryEntry, StackVersion, STACK_VERSION_NONE},
    subtree::{external_scanner_state_eq, LeafParams, Subtree},
    tree::Tree,
    unicode::InputEncoding,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogType {
    Parse,
    Lex,
}

/// A callback that receives the parser's and lexer's debug messages.
pub type Logger = Box<dyn FnMut(LogType, &str) + Send>;

/// Counters describing the most recent parse.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParseStats {
    /// Subtrees taken over from the previous tree without re-lexing.
    pub reused_subtrees: u32,
    /// The number of bytes covered by reused subtrees.
    pub reused_bytes: u32,
    /// Tokens produced by running the lexer.
    pub lexed_tokens: u32,
}

macro_rules! log {
    ($run:ident, $($arg:tt)*) => {
        if $run.lexer.is_logging() {
            $run.lexer.log_parse(format_args!($($arg)*));
        }
    };
}

/// Turns source text into a [`Tree`] using the tables of a [`Language`].
pub struct Parser {
    language: Option<Arc<Language>>,
    logger: Option<Logger>,
    dot_graph_file: Option<Box<dyn Write + Send>>,
    included_ranges: Vec<Range>,
    encoding: InputEncoding,
    timeout: Option<Duration>,
    cancellation_flag: Option<Arc<AtomicBool>>,
    node_budget: Option<usize>,
    stack: Stack,
    reduce_actions: ReduceActionSet,
    stats: ParseStats,
}

impl fmt::Debug for Parser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parser")
            .field("language", &self.language)
            .field("included_ranges", &self.included_ranges)
            .field("encoding", &self.encoding)
            .field("timeout", &self.timeout)
            .field("node_budget", &self.node_budget)
            .finish_non_exhaustive()
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            language: None,
            logger: None,
            dot_graph_file: None,
            included_ranges: vec![Range::ALL],
            encoding: InputEncoding::Utf8,
            timeout: None,
            cancellation_flag: None,
            node_budget: None,
            stack: Stack::new(),
            reduce_actions: ReduceActionSet::default(),
            stats: ParseStats::default(),
        }
    }

    /// Set the language that the parser should use for parsing.
    ///
    /// Returns an error if the language was generated for an incompatible
    /// ABI version.
    pub fn set_language(&mut self, language: Arc<Language>) -> Result<(), LanguageError> {
        language.check_version()?;
        self.language = Some(language);
        Ok(())
    }

    #[must_use]
    pub const fn language(&self) -> Option<&Arc<Language>> {
        self.language.as_ref()
    }

    pub fn set_logger(&mut self, logger: Option<Logger>) {
        self.logger = logger;
    }

    /// Write a graph of the parse stack after every step, in the dot format.
    pub fn print_dot_graphs(&mut self, file: impl Write + Send + 'static) {
        self.dot_graph_file = Some(Box::new(file));
    }

    pub fn stop_printing_dot_graphs(&mut self) {
        self.dot_graph_file = None;
    }

    /// Restrict parsing to the given ranges of the document. An empty slice
    /// means the whole document.
    ///
    /// The ranges must be ordered and must not overlap. On error, the
    /// previous ranges are kept.
    pub fn set_included_ranges(&mut self, ranges: &[Range]) -> Result<(), IncludedRangesError> {
        let mut previous_byte = 0;
        for (index, range) in ranges.iter().enumerate() {
            if range.start_byte < previous_byte || range.end_byte < range.start_byte {
                return Err(IncludedRangesError(index));
            }
            previous_byte = range.end_byte;
        }
        self.included_ranges = if ranges.is_empty() {
            vec![Range::ALL]
        } else {
            ranges.to_vec()
        };
        Ok(())
    }

    #[must_use]
    pub fn included_ranges(&self) -> &[Range] {
        &self.included_ranges
    }

    /// Give up on any parse that takes longer than this. Zero disables the
    /// limit.
    pub fn set_timeout_micros(&mut self, timeout_micros: u64) {
        self.timeout = (timeout_micros > 0).then(|| Duration::from_micros(timeout_micros));
    }

    #[must_use]
    pub fn timeout_micros(&self) -> u64 {
        self.timeout.map_or(0, |timeout| timeout.as_micros() as u64)
    }

    /// Stop parsing as soon as the flag is set, from any thread.
    pub fn set_cancellation_flag(&mut self, flag: Option<Arc<AtomicBool>>) {
        self.cancellation_flag = flag;
    }

    #[must_use]
    pub const fn cancellation_flag(&self) -> Option<&Arc<AtomicBool>> {
        self.cancellation_flag.as_ref()
    }

    /// Bound the number of stack nodes a single parse may allocate.
    pub fn set_node_budget(&mut self, limit: Option<usize>) {
        self.node_budget = limit;
    }

    pub fn set_encoding(&mut self, encoding: InputEncoding) {
        self.encoding = encoding;
    }

    #[must_use]
    pub const fn stats(&self) -> ParseStats {
        self.stats
    }

    /// Drop any state left from a previous parse.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.reduce_actions.clear();
    }

    /// Parse a complete document held in memory.
    pub fn parse(
        &mut self,
        text: impl AsRef<[u8]>,
        old_tree: Option<&Tree>,
    ) -> Result<Tree, ParseError> {
        let mut bytes = text.as_ref();
        self.parse_with(&mut bytes, old_tree)
    }

    /// Parse a document read through `input`.
    ///
    /// If `old_tree` is given, it must describe a previous version of the
    /// same document, with all changes since then applied through
    /// [`Tree::edit`]. Unchanged parts of it are reused.
    pub fn parse_with(
        &mut self,
        input: &mut dyn Input,
        old_tree: Option<&Tree>,
    ) -> Result<Tree, ParseError> {
        let language = self.language.clone().ok_or(ParseError::NoLanguage)?;
        let _span = tracing::debug_span!("parse", language = language.name()).entered();

        if let Some(old_tree) = old_tree {
            if old_tree.is_reusable_as_is(&language, &self.included_ranges) {
                tracing::debug!("old tree has no changes");
                self.stats = ParseStats {
                    reused_subtrees: 1,
                    reused_bytes: old_tree.source_length(),
                    lexed_tokens: 0,
                };
                return Ok(old_tree.clone());
            }
        }

        self.stack.clear();
        self.stack.set_budget(AllocationBudget::new(self.node_budget));
        self.reduce_actions.clear();

        let included_ranges = self.included_ranges.clone();
        let result = {
            let lexer = Lexer::new(
                input,
                self.encoding,
                &included_ranges,
                self.logger.as_mut(),
            );
            let mut run = ParseRun {
                language: &language,
                lexer,
                stack: &mut self.stack,
                reduce_actions: &mut self.reduce_actions,
                dot_graph_file: self.dot_graph_file.as_mut(),
                cancellation_flag: self.cancellation_flag.as_deref(),
                deadline: self.timeout.map(|timeout| Instant::now() + timeout),
                reusable_node: ReusableNode::new(),
                token_cache: TokenCache::default(),
                external_scanner: None,
                scanner_buffer: vec![0; SERIALIZATION_BUFFER_SIZE],
                finished_tree: None,
                trailing_extras: Vec::new(),
                trailing_extras2: Vec::new(),
                included_range_differences: Vec::new(),
                included_range_difference_index: 0,
                accept_count: 0,
                operation_count: 0,
                stats: ParseStats::default(),
            };
            let result = run.run(old_tree);
            self.stats = run.stats;
            result
        };

        self.stack.clear();
        self.reduce_actions.clear();
        match &result {
            Ok(_) => tracing::debug!(stats = ?self.stats, "parse finished"),
            Err(error) => tracing::debug!(%error, "parse failed"),
        }
        let root = result?;
        Ok(Tree::new(root, language, included_ranges.into()))
    }
}

#[derive(Debug, Default)]
struct TokenCache {
    token: Option<Subtree>,
    last_external_token: Option<Subtree>,
    byte_index: u32,
}

#[derive(Clone, Copy, Debug)]
struct ErrorStatus {
    cost: u32,
    node_count: u32,
    dynamic_precedence: i32,
    is_in_error: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ErrorComparison {
    TakeLeft,
    PreferLeft,
    None,
    PreferRight,
    TakeRight,
}

/// Rank two stack versions. A version that is not in the error state beats
/// one that is; otherwise a large enough difference in error cost, scaled by
/// how long the cheaper version has gone without errors, decides outright.
fn compare_versions(a: ErrorStatus, b: ErrorStatus) -> ErrorComparison {
    if !a.is_in_error && b.is_in_error {
        return if a.cost < b.cost {
            ErrorComparison::TakeLeft
        } else {
            ErrorComparison::PreferLeft
        };
    }

    if a.is_in_error && !b.is_in_error {
        return if b.cost < a.cost {
            ErrorComparison::TakeRight
        } else {
            ErrorComparison::PreferRight
        };
    }

    if a.cost < b.cost {
        return if (b.cost - a.cost).saturating_mul(1 + a.node_count) > MAX_COST_DIFFERENCE {
            ErrorComparison::TakeLeft
        } else {
            ErrorComparison::PreferLeft
        };
    }

    if b.cost < a.cost {
        return if (a.cost - b.cost).saturating_mul(1 + b.node_count) > MAX_COST_DIFFERENCE {
            ErrorComparison::TakeRight
        } else {
            ErrorComparison::PreferRight
        };
    }

    match a.dynamic_precedence.cmp(&b.dynamic_precedence) {
        std::cmp::Ordering::Greater => ErrorComparison::PreferLeft,
        std::cmp::Ordering::Less => ErrorComparison::PreferRight,
        std::cmp::Ordering::Equal => ErrorComparison::None,
    }
}

/// Move the extra subtrees at the end of `trees` into `destination`,
/// preserving their order.
fn remove_trailing_extras(trees: &mut Vec<Subtree>, destination: &mut Vec<Subtree>) {
    destination.clear();
    let first_extra = trees
        .iter()
        .rposition(|tree| !tree.extra())
        .map_or(0, |index| index + 1);
    destination.extend(trees.drain(first_extra..));
}

const EMPTY_TABLE_ENTRY: TableEntry<'static> = TableEntry {
    actions: &[],
    is_reusable: false,
};

/// The state of a single call to [`Parser::parse_with`].
struct ParseRun<'a> {
    language: &'a Language,
    lexer: Lexer<'a>,
    stack: &'a mut Stack,
    reduce_actions: &'a mut ReduceActionSet,
    dot_graph_file: Option<&'a mut Box<dyn Write + Send>>,
    cancellation_flag: Option<&'a AtomicBool>,
    deadline: Option<Instant>,
    reusable_node: ReusableNode,
    token_cache: TokenCache,
    external_scanner: Option<Box<dyn ExternalScanner>>,
    scanner_buffer: Vec<u8>,
    finished_tree: Option<Subtree>,
    trailing_extras: Vec<Subtree>,
    trailing_extras2: Vec<Subtree>,
    included_range_differences: Vec<Range>,
    included_range_difference_index: usize,
    accept_count: usize,
    operation_count: u32,
    stats: ParseStats,
}

impl ParseRun<'_> {
    fn run(&mut self, old_tree: Option<&Tree>) -> Result<Subtree, ParseError> {
        self.external_scanner = self
            .language
            .external_scanner
            .as_ref()
            .map(|scanner| (scanner.create)());

        if let Some(old_tree) = old_tree {
            self.included_range_differences =
                included_range_differences(old_tree.included_ranges(), self.lexer.included_ranges());
            self.reusable_node.reset(old_tree.root().clone());
            log!(self, "parse_after_edit");
            self.log_tree(old_tree.root());
            for range in &self.included_range_differences {
                log!(
                    self,
                    "different_included_range {} - {}",
                    range.start_byte,
                    range.end_byte
                );
            }
        } else {
            self.reusable_node.clear();
            log!(self, "new_parse");
        }

        let mut position = 0;
        let mut last_position = 0;
        loop {
            let mut version = 0;
            while version < self.stack.version_count() {
                let allow_node_reuse = self.stack.version_count() == 1;
                while self.stack.is_active(version) {
                    log!(
                        self,
                        "process version:{}, version_count:{}, state:{}, row:{}, col:{}",
                        version,
                        self.stack.version_count(),
                        self.stack.state(version),
                        self.stack.position(version).extent.row,
                        self.stack.position(version).extent.column
                    );

                    self.advance(version, allow_node_reuse)?;
                    self.log_stack();

                    position = self.stack.position(version).bytes;
                    if position > last_position || (version > 0 && position == last_position) {
                        last_position = position;
                        break;
                    }
                }
                version += 1;
            }

            let min_error_cost = self.condense_stack()?;

            // A finished tree that beats every version still in progress
            // ends the parse. Clearing the stack drops the remaining
            // references into it, so balancing can work in place.
            if self
                .finished_tree
                .as_ref()
                .is_some_and(|tree| tree.error_cost() < min_error_cost)
            {
                self.stack.clear();
                break;
            }

            while let Some(range) = self
                .included_range_differences
                .get(self.included_range_difference_index)
            {
                if range.end_byte <= position {
                    self.included_range_difference_index += 1;
                } else {
                    break;
                }
            }

            if self.stack.version_count() == 0 {
                break;
            }
        }

        self.stack.clear();
        self.reusable_node.clear();
        self.token_cache = TokenCache::default();

        let mut root = match self.finished_tree.take() {
            Some(root) => root,
            None => Subtree::new_error_node(Vec::new(), false, self.language),
        };
        self.stack.subtree_pool.balance(&mut root, self.language);
        log!(self, "done");
        self.log_tree(&root);
        Ok(root)
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    fn check_interrupt(&self) -> Result<(), ParseError> {
        if self
            .cancellation_flag
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
        {
            return Err(ParseError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(ParseError::TimedOut);
        }
        Ok(())
    }

    fn check_progress(&mut self) -> Result<(), ParseError> {
        self.operation_count += 1;
        if self.operation_count >= OP_COUNT_PER_TIMEOUT_CHECK {
            self.operation_count = 0;
            self.check_interrupt()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Debug output
    // -----------------------------------------------------------------------

    fn log_stack(&mut self) {
        if let Some(file) = self.dot_graph_file.as_deref_mut() {
            self.stack.print_dot_graph(self.language, file).ok();
            file.write_all(b"\n\n").ok();
        }
    }

    fn log_tree(&mut self, tree: &Subtree) {
        if let Some(file) = self.dot_graph_file.as_deref_mut() {
            tree.print_dot_graph(self.language, file).ok();
            file.write_all(b"\n").ok();
        }
    }

    fn release(&mut self, tree: Subtree) {
        self.stack.subtree_pool.release(tree);
    }

    fn recycle(&mut self, trees: Vec<Subtree>) {
        self.stack.subtree_pool.recycle(trees);
    }

    // -----------------------------------------------------------------------
    // Breaking down subtrees
    // -----------------------------------------------------------------------

    /// Replace reused non-terminals at the top of a version with their
    /// children, until a leaf is on top.
    fn breakdown_top_of_stack(&mut self, version: StackVersion) -> Result<bool, ParseError> {
        let mut did_break_down = false;
        loop {
            let pop = self.stack.pop_pending(version);
            if pop.is_empty() {
                break;
            }

            did_break_down = true;
            let mut pending = false;
            for slice in pop {
                let mut state = self.stack.state(slice.version);
                let mut subtrees = slice.subtrees.into_iter();
                let Some(parent) = subtrees.next() else {
                    continue;
                };

                for child in parent.children() {
                    pending = child.child_count() > 0;
                    if child.is_error() {
                        state = ERROR_STATE;
                    } else if !child.extra() {
                        state = self.language.next_state(state, child.symbol());
                    }
                    self.stack
                        .push(slice.version, Some(child.clone()), pending, state)?;
                }

                for tree in subtrees {
                    self.stack.push(slice.version, Some(tree), false, state)?;
                }

                log!(
                    self,
                    "breakdown_top_of_stack tree:{}",
                    self.language.symbol_name(parent.symbol())
                );
                self.release(parent);
                self.log_stack();
            }

            if !pending {
                break;
            }
        }
        Ok(did_break_down)
    }

    /// Descend from a reused lookahead into its first descendant that was
    /// parsed in `state`.
    fn breakdown_lookahead(&mut self, lookahead: &mut Subtree, state: StateId) {
        let mut did_descend = false;
        let mut tree = self.reusable_node.tree().cloned();
        while let Some(current) = &tree {
            if current.child_count() == 0 || current.parse_state() == state {
                break;
            }
            log!(
                self,
                "state_mismatch sym:{}",
                self.language.symbol_name(current.symbol())
            );
            self.reusable_node.descend();
            tree = self.reusable_node.tree().cloned();
            did_descend = true;
        }

        if did_descend {
            if let Some(tree) = tree {
                let previous = mem::replace(lookahead, tree);
                self.release(previous);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lexing and reuse
    // -----------------------------------------------------------------------

    fn can_reuse_first_leaf(&self, state: StateId, tree: &Subtree, entry: &TableEntry<'_>) -> bool {
        let current_lex_mode = self.language.lex_mode(state);
        let leaf_symbol = tree.leaf_symbol();
        let leaf_lex_mode = self.language.lex_mode(tree.leaf_parse_state());

        // At the end of a non-terminal extra the lexer produces no token, so
        // a reused one would change how the extra ends.
        if current_lex_mode.lex_state == LEX_STATE_NONE {
            return false;
        }

        // A token lexed in a state with the same lexical rules is reusable.
        if !entry.actions.is_empty()
            && leaf_lex_mode == current_lex_mode
            && (leaf_symbol != self.language.keyword_capture_token
                || (!tree.is_keyword() && tree.parse_state() == state))
        {
            return true;
        }

        // Empty tokens depend on the exact set of valid lookaheads.
        if tree.size().bytes == 0 && leaf_symbol != BUILTIN_SYM_END {
            return false;
        }

        current_lex_mode.external_lex_state == 0 && entry.is_reusable
    }

    fn deserialize_external_scanner(&mut self, external_token: Option<&Subtree>) {
        if let Some(scanner) = self.external_scanner.as_mut() {
            scanner.deserialize(external_token.map_or(&[][..], Subtree::external_scanner_state));
        }
    }

    fn serialize_external_scanner(&mut self) -> usize {
        self.external_scanner.as_ref().map_or(0, |scanner| {
            scanner
                .serialize(&mut self.scanner_buffer)
                .min(SERIALIZATION_BUFFER_SIZE)
        })
    }

    fn scan_external(&mut self, external_lex_state: u16) -> bool {
        let Some(valid_tokens) = self.language.enabled_external_tokens(external_lex_state) else {
            return false;
        };
        match self.external_scanner.as_mut() {
            Some(scanner) => scanner.scan(&mut self.lexer, valid_tokens),
            None => false,
        }
    }

    fn lex(
        &mut self,
        version: StackVersion,
        parse_state: StateId,
    ) -> Result<Option<Subtree>, ParseError> {
        let mut lex_mode = self.language.lex_mode(parse_state);
        if lex_mode.lex_state == LEX_STATE_NONE {
            log!(self, "no_lookahead_after_non_terminal_extra");
            return Ok(None);
        }

        self.check_interrupt()?;

        let start_position = self.stack.position(version);
        let external_token = self.stack.last_external_token(version).cloned();

        let mut found_external_token = false;
        let mut error_mode = parse_state == ERROR_STATE;
        let mut skipped_error = false;
        let mut called_get_column = false;
        let mut first_error_character = '\0';
        let mut error_start_position = Length::ZERO;
        let mut error_end_position = Length::ZERO;
        let mut lookahead_end_byte = 0;
        let mut external_scanner_state_len = 0;
        let mut external_scanner_state_changed = false;
        self.lexer.reset(start_position);

        loop {
            let current_position = self.lexer.current_position;

            if lex_mode.external_lex_state != 0 {
                log!(
                    self,
                    "lex_external state:{}, row:{}, column:{}",
                    lex_mode.external_lex_state,
                    current_position.extent.row,
                    current_position.extent.column
                );
                self.lexer.start();
                self.deserialize_external_scanner(external_token.as_ref());
                let mut found_token = self.scan_external(lex_mode.external_lex_state);
                self.lexer.finish(&mut lookahead_end_byte);

                if found_token {
                    external_scanner_state_len = self.serialize_external_scanner();
                    external_scanner_state_changed = external_token
                        .as_ref()
                        .map_or(&[][..], Subtree::external_scanner_state)
                        != &self.scanner_buffer[..external_scanner_state_len];

                    // An empty external token that leaves the scanner's state
                    // unchanged would be produced again forever, unless the
                    // parse state moves on. Ignore it during error recovery,
                    // before any progress since the last error, and when it
                    // is an extra.
                    if self.lexer.token_end_position.bytes <= current_position.bytes
                        && !external_scanner_state_changed
                    {
                        let symbol = self.language.external_symbol(self.lexer.result_symbol());
                        let next_parse_state = self.language.next_state(parse_state, symbol);
                        let token_is_extra = next_parse_state == parse_state;
                        if error_mode
                            || !self.stack.has_advanced_since_error(version)
                            || token_is_extra
                        {
                            log!(
                                self,
                                "ignore_empty_external_token symbol:{}",
                                self.language.symbol_name(symbol)
                            );
                            found_token = false;
                        }
                    }
                }

                if found_token {
                    found_external_token = true;
                    called_get_column = self.lexer.did_get_column;
                    break;
                }

                self.lexer.reset(current_position);
            }

            log!(
                self,
                "lex_internal state:{}, row:{}, column:{}",
                lex_mode.lex_state,
                current_position.extent.row,
                current_position.extent.column
            );
            self.lexer.start();
            let found_token = (self.language.lex_fn)(&mut self.lexer, lex_mode.lex_state);
            self.lexer.finish(&mut lookahead_end_byte);
            if found_token {
                break;
            }

            if !error_mode {
                error_mode = true;
                lex_mode = self.language.lex_mode(ERROR_STATE);
                self.lexer.reset(start_position);
                continue;
            }

            if !skipped_error {
                log!(self, "skip_unrecognized_character");
                skipped_error = true;
                error_start_position = self.lexer.token_start_position;
                error_end_position = self.lexer.token_start_position;
                first_error_character = self.lexer.lookahead();
            }

            if self.lexer.current_position.bytes == error_end_position.bytes {
                if self.lexer.eof() {
                    self.lexer.set_result_symbol(BUILTIN_SYM_ERROR);
                    break;
                }
                self.lexer.advance(false);
            }

            error_end_position = self.lexer.current_position;
        }

        let result = if skipped_error {
            let padding = error_start_position - start_position;
            let size = error_end_position - error_start_position;
            let lookahead_bytes = lookahead_end_byte.saturating_sub(error_end_position.bytes);
            Subtree::new_error(
                first_error_character,
                padding,
                size,
                lookahead_bytes,
                parse_state,
                self.language,
            )
        } else {
            let mut is_keyword = false;
            let mut symbol = self.lexer.result_symbol();
            let padding = self.lexer.token_start_position - start_position;
            let size = self.lexer.token_end_position - self.lexer.token_start_position;
            let lookahead_bytes =
                lookahead_end_byte.saturating_sub(self.lexer.token_end_position.bytes);

            if found_external_token {
                symbol = self.language.external_symbol(symbol);
            } else if symbol == self.language.keyword_capture_token && symbol != 0 {
                if let Some(keyword_lex_fn) = self.language.keyword_lex_fn {
                    let end_byte = self.lexer.token_end_position.bytes;
                    self.lexer.reset(self.lexer.token_start_position);
                    self.lexer.start();

                    is_keyword = keyword_lex_fn(&mut self.lexer, 0);
                    if is_keyword
                        && self.lexer.token_end_position.bytes == end_byte
                        && self
                            .language
                            .has_actions(parse_state, self.lexer.result_symbol())
                    {
                        symbol = self.lexer.result_symbol();
                    }
                }
            }

            let mut leaf = Subtree::new_leaf(
                LeafParams {
                    symbol,
                    padding,
                    size,
                    lookahead_bytes,
                    parse_state,
                    has_external_tokens: found_external_token,
                    depends_on_column: called_get_column,
                    is_keyword,
                },
                self.language,
            );
            if found_external_token {
                leaf.set_external_scanner_state(&self.scanner_buffer[..external_scanner_state_len]);
                if external_scanner_state_changed {
                    leaf.set_has_external_scanner_state_change();
                }
            }
            leaf
        };

        self.stats.lexed_tokens += 1;
        log!(
            self,
            "lexed_lookahead sym:{}, size:{}",
            self.language.symbol_name(result.symbol()),
            result.total_size().bytes
        );
        Ok(Some(result))
    }

    fn cached_token(
        &self,
        state: StateId,
        position: u32,
        last_external_token: Option<&Subtree>,
    ) -> Option<Subtree> {
        let cache = &self.token_cache;
        let token = cache.token.as_ref()?;
        if cache.byte_index != position
            || !external_scanner_state_eq(cache.last_external_token.as_ref(), last_external_token)
        {
            return None;
        }
        let entry = self.language.table_entry(state, token.symbol());
        self.can_reuse_first_leaf(state, token, &entry)
            .then(|| token.clone())
    }

    fn set_cached_token(
        &mut self,
        byte_index: u32,
        last_external_token: Option<Subtree>,
        token: Subtree,
    ) {
        let previous = mem::replace(
            &mut self.token_cache,
            TokenCache {
                token: Some(token),
                last_external_token,
                byte_index,
            },
        );
        if let Some(token) = previous.token {
            self.release(token);
        }
    }

    fn has_included_range_difference(&self, start_byte: u32, end_byte: u32) -> bool {
        ranges_intersect(
            &self.included_range_differences,
            self.included_range_difference_index,
            start_byte,
            end_byte,
        )
    }

    /// Find a subtree of the old tree that can be pushed as-is at
    /// `position`, breaking down the top of the stack when the old tree
    /// cannot be used at this point.
    fn reuse_node(
        &mut self,
        version: StackVersion,
        state: &mut StateId,
        position: u32,
        last_external_token: Option<&Subtree>,
    ) -> Result<Option<Subtree>, ParseError> {
        while let Some(result) = self.reusable_node.tree().cloned() {
            let byte_offset = self.reusable_node.byte_offset();
            let mut end_byte_offset = byte_offset + result.total_bytes();

            // An EOF node is never reused while the included ranges differ
            // further on.
            if result.is_eof() {
                end_byte_offset = u32::MAX;
            }

            if byte_offset > position {
                log!(
                    self,
                    "before_reusable_node symbol:{}",
                    self.language.symbol_name(result.symbol())
                );
                break;
            }

            if byte_offset < position {
                log!(
                    self,
                    "past_reusable_node symbol:{}",
                    self.language.symbol_name(result.symbol())
                );
                if end_byte_offset <= position || !self.reusable_node.descend() {
                    self.reusable_node.advance();
                }
                continue;
            }

            if !external_scanner_state_eq(self.reusable_node.last_external_token(), last_external_token)
            {
                log!(
                    self,
                    "reusable_node_has_different_external_scanner_state symbol:{}",
                    self.language.symbol_name(result.symbol())
                );
                self.reusable_node.advance();
                continue;
            }

            let reason = if result.has_changes() {
                Some("has_changes")
            } else if result.is_error() {
                Some("is_error")
            } else if result.is_missing() {
                Some("is_missing")
            } else if result.is_fragile() {
                Some("is_fragile")
            } else if self.has_included_range_difference(byte_offset, end_byte_offset) {
                Some("contains_different_included_range")
            } else {
                None
            };

            if let Some(reason) = reason {
                log!(
                    self,
                    "cant_reuse_node_{} tree:{}",
                    reason,
                    self.language.symbol_name(result.symbol())
                );
                if !self.reusable_node.descend() {
                    self.reusable_node.advance();
                    self.breakdown_top_of_stack(version)?;
                    *state = self.stack.state(version);
                }
                continue;
            }

            let leaf_symbol = result.leaf_symbol();
            let entry = self.language.table_entry(*state, leaf_symbol);
            if !self.can_reuse_first_leaf(*state, &result, &entry) {
                log!(
                    self,
                    "cant_reuse_node symbol:{}, first_leaf_symbol:{}",
                    self.language.symbol_name(result.symbol()),
                    self.language.symbol_name(leaf_symbol)
                );
                self.reusable_node.advance_past_leaf();
                break;
            }

            log!(
                self,
                "reuse_node symbol:{}",
                self.language.symbol_name(result.symbol())
            );
            return Ok(Some(result));
        }

        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Parse actions
    // -----------------------------------------------------------------------

    fn shift(
        &mut self,
        version: StackVersion,
        state: StateId,
        mut lookahead: Subtree,
        extra: bool,
    ) -> Result<(), ParseError> {
        let is_leaf = lookahead.child_count() == 0;
        if extra != lookahead.extra() && is_leaf {
            lookahead.set_extra(extra);
        }

        let last_external_token = lookahead
            .has_external_tokens()
            .then(|| lookahead.last_external_token().cloned());
        self.stack.push(version, Some(lookahead), !is_leaf, state)?;
        if let Some(token) = last_external_token {
            self.stack.set_last_external_token(version, token);
        }
        Ok(())
    }

    /// Pop `count` subtrees and push a parent node in their place, once for
    /// every distinct path through the stack. Returns the first new version
    /// that the reduction created, if any.
    #[allow(clippy::too_many_arguments)]
    fn reduce(
        &mut self,
        version: StackVersion,
        symbol: Symbol,
        count: u32,
        dynamic_precedence: i32,
        production_id: u16,
        is_fragile: bool,
        end_of_non_terminal_extra: bool,
    ) -> Result<StackVersion, ParseError> {
        let initial_version_count = self.stack.version_count();

        let pop = self.stack.pop_count(version, count);
        let pop_len = pop.len();
        let mut removed_version_count = 0;
        let halted_version_count = self.stack.halted_version_count();
        let mut slices = pop.into_iter().peekable();
        while let Some(slice) = slices.next() {
            let popped_version = slice.version;
            let slice_version = popped_version - removed_version_count;

            // New versions may temporarily exceed the limit by a bounded
            // amount; they are sorted and truncated after this round.
            if slice_version > MAX_VERSION_COUNT + MAX_VERSION_COUNT_OVERFLOW + halted_version_count {
                self.stack.remove_version(slice_version);
                self.recycle(slice.subtrees);
                removed_version_count += 1;
                while let Some(next_slice) = slices.next_if(|next| next.version == popped_version) {
                    log!(self, "aborting reduce with too many versions");
                    self.recycle(next_slice.subtrees);
                }
                continue;
            }

            // Extras on top of the stack stay outside the new node and are
            // pushed again after it.
            let mut children = slice.subtrees;
            remove_trailing_extras(&mut children, &mut self.trailing_extras);
            let mut parent = Subtree::new_node(symbol, children, production_id, self.language);

            // Paths that led to the same version compete for the children of
            // the new node.
            while let Some(next_slice) = slices.next_if(|next| next.version == popped_version) {
                let mut next_children = next_slice.subtrees;
                remove_trailing_extras(&mut next_children, &mut self.trailing_extras2);

                if self.select_children(&parent, &next_children) {
                    self.trailing_extras.clear();
                    self.release(parent);
                    mem::swap(&mut self.trailing_extras, &mut self.trailing_extras2);
                    parent = Subtree::new_node(symbol, next_children, production_id, self.language);
                } else {
                    self.trailing_extras2.clear();
                    self.recycle(next_children);
                }
            }

            let state = self.stack.state(slice_version);
            let next_state = self.language.next_state(state, symbol);
            if end_of_non_terminal_extra && next_state == state {
                parent.set_extra(true);
            }
            if is_fragile || pop_len > 1 || initial_version_count > 1 {
                parent.mark_fragile();
            } else {
                parent.set_parse_state(state);
            }
            parent.add_dynamic_precedence(dynamic_precedence);

            self.stack.push(slice_version, Some(parent), false, next_state)?;
            for extra in self.trailing_extras.drain(..) {
                self.stack.push(slice_version, Some(extra), false, next_state)?;
            }

            for j in 0..slice_version {
                if j == version {
                    continue;
                }
                if self.stack.merge(j, slice_version) {
                    removed_version_count += 1;
                    break;
                }
            }
        }

        Ok(if self.stack.version_count() > initial_version_count {
            initial_version_count
        } else {
            STACK_VERSION_NONE
        })
    }

    fn accept(&mut self, version: StackVersion, lookahead: Subtree) -> Result<(), ParseError> {
        debug_assert!(lookahead.is_eof());
        self.stack.push(version, Some(lookahead), false, 1)?;

        let pop = self.stack.pop_all(version);
        let Some(first_version) = pop.first().map(|slice| slice.version) else {
            self.stack.halt(version);
            return Ok(());
        };

        for slice in pop {
            let mut trees = slice.subtrees;

            // The root is the last non-extra subtree; the extras around it
            // become its children.
            let Some(index) = trees.iter().rposition(|tree| !tree.extra()) else {
                self.recycle(trees);
                continue;
            };
            let tree = trees.remove(index);
            trees.splice(index..index, tree.children().iter().cloned());
            let root = Subtree::new_node(tree.symbol(), trees, tree.production_id(), self.language);
            self.release(tree);
            self.accept_count += 1;

            match self.finished_tree.take() {
                Some(finished_tree) => {
                    if self.select_tree(&finished_tree, &root) {
                        self.release(finished_tree);
                        self.finished_tree = Some(root);
                    } else {
                        self.release(root);
                        self.finished_tree = Some(finished_tree);
                    }
                }
                None => self.finished_tree = Some(root),
            }
        }

        self.stack.remove_version(first_version);
        self.stack.halt(version);
        Ok(())
    }

    /// Whether `right` should replace `left` as the preferred tree.
    fn select_tree(&mut self, left: &Subtree, right: &Subtree) -> bool {
        let language = self.language;
        let left_name = language.symbol_name(left.symbol());
        let right_name = language.symbol_name(right.symbol());

        if right.error_cost() < left.error_cost() {
            log!(self, "select_smaller_error symbol:{right_name}, over_symbol:{left_name}");
            return true;
        }

        if left.error_cost() < right.error_cost() {
            log!(self, "select_smaller_error symbol:{left_name}, over_symbol:{right_name}");
            return false;
        }

        if right.dynamic_precedence() > left.dynamic_precedence() {
            log!(
                self,
                "select_higher_precedence symbol:{right_name}, prec:{}, over_symbol:{left_name}, other_prec:{}",
                right.dynamic_precedence(),
                left.dynamic_precedence()
            );
            return true;
        }

        if left.dynamic_precedence() > right.dynamic_precedence() {
            log!(
                self,
                "select_higher_precedence symbol:{left_name}, prec:{}, over_symbol:{right_name}, other_prec:{}",
                left.dynamic_precedence(),
                right.dynamic_precedence()
            );
            return false;
        }

        if left.error_cost() > 0 {
            return true;
        }

        match left.compare(right) {
            std::cmp::Ordering::Less => {
                log!(self, "select_earlier symbol:{left_name}, over_symbol:{right_name}");
                false
            }
            std::cmp::Ordering::Greater => {
                log!(self, "select_earlier symbol:{right_name}, over_symbol:{left_name}");
                true
            }
            std::cmp::Ordering::Equal => {
                log!(self, "select_existing symbol:{left_name}, over_symbol:{right_name}");
                false
            }
        }
    }

    fn select_children(&mut self, left: &Subtree, children: &[Subtree]) -> bool {
        let candidate = Subtree::new_node(left.symbol(), children.to_vec(), 0, self.language);
        self.select_tree(left, &candidate)
    }

    // -----------------------------------------------------------------------
    // The main step
    // -----------------------------------------------------------------------

    fn advance(&mut self, version: StackVersion, allow_node_reuse: bool) -> Result<(), ParseError> {
        let mut state = self.stack.state(version);
        let position = self.stack.position(version).bytes;
        let last_external_token = self.stack.last_external_token(version).cloned();

        let mut did_reuse = true;
        let mut lookahead = None;
        let mut table_entry = EMPTY_TABLE_ENTRY;

        // Prefer a node from the old tree.
        if allow_node_reuse {
            lookahead =
                self.reuse_node(version, &mut state, position, last_external_token.as_ref())?;
            if let Some(tree) = &lookahead {
                table_entry = self.language.table_entry(state, tree.leaf_symbol());
            }
        }

        // Then the token the lexer last returned at this position.
        if lookahead.is_none() {
            did_reuse = false;
            if let Some(token) = self.cached_token(state, position, last_external_token.as_ref()) {
                table_entry = self.language.table_entry(state, token.symbol());
                lookahead = Some(token);
            }
        }

        let mut needs_lex = lookahead.is_none();
        loop {
            if needs_lex {
                needs_lex = false;
                lookahead = self.lex(version, state)?;
                match &lookahead {
                    Some(token) => {
                        self.set_cached_token(position, last_external_token.clone(), token.clone());
                        table_entry = self.language.table_entry(state, token.symbol());
                    }
                    // At the end of a non-terminal extra there is no
                    // lookahead; the reduction is stored under `end`.
                    None => {
                        table_entry = self.language.table_entry(state, BUILTIN_SYM_END);
                    }
                }
            }

            self.check_progress()?;

            // Shift, accept and recover end this step. Every reduce forks a
            // new version, and processing continues with the same lookahead.
            let mut last_reduction_version = STACK_VERSION_NONE;
            for &action in table_entry.actions {
                match action {
                    ParseAction::Shift {
                        state: shift_state,
                        extra,
                        repetition,
                    } => {
                        if repetition {
                            continue;
                        }
                        let Some(mut token) = lookahead.take() else {
                            continue;
                        };
                        let mut next_state = if extra {
                            log!(self, "shift_extra");
                            state
                        } else {
                            log!(self, "shift state:{shift_state}");
                            shift_state
                        };

                        if token.child_count() > 0 {
                            self.breakdown_lookahead(&mut token, state);
                            next_state = self.language.next_state(state, token.symbol());
                        }

                        if did_reuse {
                            self.stats.reused_subtrees += 1;
                            self.stats.reused_bytes += token.total_bytes();
                        }
                        self.shift(version, next_state, token, extra)?;
                        if did_reuse {
                            self.reusable_node.advance();
                        }
                        return Ok(());
                    }

                    ParseAction::Reduce {
                        symbol,
                        child_count,
                        dynamic_precedence,
                        production_id,
                    } => {
                        let is_fragile = table_entry.actions.len() > 1;
                        let end_of_non_terminal_extra = lookahead.is_none();
                        log!(
                            self,
                            "reduce sym:{}, child_count:{}",
                            self.language.symbol_name(symbol),
                            child_count
                        );
                        let reduction_version = self.reduce(
                            version,
                            symbol,
                            u32::from(child_count),
                            i32::from(dynamic_precedence),
                            production_id,
                            is_fragile,
                            end_of_non_terminal_extra,
                        )?;
                        if reduction_version != STACK_VERSION_NONE {
                            last_reduction_version = reduction_version;
                        }
                    }

                    ParseAction::Accept => {
                        log!(self, "accept");
                        match lookahead.take() {
                            Some(token) => self.accept(version, token)?,
                            None => self.stack.halt(version),
                        }
                        return Ok(());
                    }

                    ParseAction::Recover => {
                        let Some(mut token) = lookahead.take() else {
                            self.stack.halt(version);
                            return Ok(());
                        };
                        if token.child_count() > 0 {
                            self.breakdown_lookahead(&mut token, ERROR_STATE);
                        }
                        self.recover(version, token)?;
                        if did_reuse {
                            self.reusable_node.advance();
                        }
                        return Ok(());
                    }
                }
            }

            // Continue with the version produced by the last reduction, in
            // place of the current one.
            if last_reduction_version != STACK_VERSION_NONE {
                self.stack.renumber_version(last_reduction_version, version);
                self.log_stack();
                state = self.stack.state(version);

                // After a non-terminal extra, lex again in the new state.
                match &lookahead {
                    Some(token) => {
                        table_entry = self.language.table_entry(state, token.leaf_symbol());
                    }
                    None => needs_lex = true,
                }
                continue;
            }

            // A finished non-terminal extra was merged into another version.
            let Some(mut token) = lookahead.take() else {
                self.stack.halt(version);
                return Ok(());
            };

            // A keyword that is not valid here may still be valid as the
            // word token it was captured from.
            let word_token = self.language.keyword_capture_token;
            if token.is_keyword() && token.symbol() != word_token {
                let entry = self.language.table_entry(state, word_token);
                if !entry.actions.is_empty() {
                    log!(
                        self,
                        "switch from_keyword:{}, to_word_token:{}",
                        self.language.symbol_name(token.symbol()),
                        self.language.symbol_name(word_token)
                    );
                    token.set_symbol(word_token, self.language);
                    table_entry = entry;
                    lookahead = Some(token);
                    continue;
                }
            }

            // Already in the error state: start recovering again.
            if state == ERROR_STATE {
                self.recover(version, token)?;
                return Ok(());
            }

            // The lookahead is not valid after a subtree reused from the old
            // tree, so that reuse was wrong. Replace it with its children and
            // try again.
            if self.breakdown_top_of_stack(version)? {
                state = self.stack.state(version);
                self.release(token);
                needs_lex = true;
                continue;
            }

            // This version has an error. Pause it; if no other version can
            // make progress, error recovery resumes it.
            log!(
                self,
                "detect_error lookahead:{}",
                self.language.symbol_name(token.symbol())
            );
            self.stack.pause(version, token);
            return Ok(());
        }
    }

    // -----------------------------------------------------------------------
    // Error handling
    // -----------------------------------------------------------------------

    fn version_status(&mut self, version: StackVersion) -> ErrorStatus {
        let is_paused = self.stack.is_paused(version);
        let mut cost = self.stack.error_cost(version);
        if is_paused {
            cost += ERROR_COST_PER_SKIPPED_TREE;
        }
        ErrorStatus {
            cost,
            node_count: self.stack.node_count_since_error(version),
            dynamic_precedence: self.stack.dynamic_precedence(version),
            is_in_error: is_paused || self.stack.state(version) == ERROR_STATE,
        }
    }

    fn better_version_exists(&mut self, version: StackVersion, is_in_error: bool, cost: u32) -> bool {
        if self
            .finished_tree
            .as_ref()
            .is_some_and(|tree| tree.error_cost() <= cost)
        {
            return true;
        }

        let position = self.stack.position(version);
        let status = ErrorStatus {
            cost,
            is_in_error,
            dynamic_precedence: self.stack.dynamic_precedence(version),
            node_count: self.stack.node_count_since_error(version),
        };

        for i in 0..self.stack.version_count() {
            if i == version
                || !self.stack.is_active(i)
                || self.stack.position(i).bytes < position.bytes
            {
                continue;
            }
            let status_i = self.version_status(i);
            match compare_versions(status, status_i) {
                ErrorComparison::TakeRight => return true,
                ErrorComparison::PreferRight if self.stack.can_merge(i, version) => return true,
                _ => {}
            }
        }

        false
    }

    /// Apply every reduction available in a version's state, for the given
    /// lookahead or, if it is `end`, for any terminal. Returns whether some
    /// resulting version can shift the lookahead.
    fn do_all_potential_reductions(
        &mut self,
        starting_version: StackVersion,
        lookahead_symbol: Symbol,
    ) -> Result<bool, ParseError> {
        let initial_version_count = self.stack.version_count();

        let mut can_shift_lookahead_symbol = false;
        let mut version = starting_version;
        let mut iteration = 0;
        loop {
            let version_count = self.stack.version_count();
            if version >= version_count {
                break;
            }
            let i = iteration;
            iteration += 1;

            let merged = (initial_version_count..version).any(|j| self.stack.merge(j, version));
            if merged {
                continue;
            }

            let state = self.stack.state(version);
            let mut has_shift_action = false;
            self.reduce_actions.clear();

            let (first_symbol, end_symbol) = if lookahead_symbol != 0 {
                (u32::from(lookahead_symbol), u32::from(lookahead_symbol) + 1)
            } else {
                (1, self.language.token_count())
            };

            for symbol in first_symbol..end_symbol {
                for action in self.language.actions(state, symbol as Symbol) {
                    match *action {
                        ParseAction::Shift {
                            extra, repetition, ..
                        } => {
                            if !extra && !repetition {
                                has_shift_action = true;
                            }
                        }
                        ParseAction::Recover => has_shift_action = true,
                        ParseAction::Reduce {
                            symbol,
                            child_count,
                            dynamic_precedence,
                            production_id,
                        } if child_count > 0 => {
                            self.reduce_actions.add(ReduceAction {
                                count: u32::from(child_count),
                                symbol,
                                dynamic_precedence: i32::from(dynamic_precedence),
                                production_id,
                            });
                        }
                        _ => {}
                    }
                }
            }

            let mut reduction_version = STACK_VERSION_NONE;
            for index in 0..self.reduce_actions.len() {
                let Some(action) = self.reduce_actions.get(index) else {
                    break;
                };
                reduction_version = self.reduce(
                    version,
                    action.symbol,
                    action.count,
                    action.dynamic_precedence,
                    action.production_id,
                    true,
                    false,
                )?;
            }

            if has_shift_action {
                can_shift_lookahead_symbol = true;
            } else if reduction_version != STACK_VERSION_NONE && i < MAX_VERSION_COUNT {
                self.stack.renumber_version(reduction_version, version);
                continue;
            } else if lookahead_symbol != 0 {
                self.stack.remove_version(version);
            }

            if version == starting_version {
                version = version_count;
            } else {
                version += 1;
            }
        }

        Ok(can_shift_lookahead_symbol)
    }

    /// Pop back to `goal_state`, wrapping everything popped into an ERROR
    /// node.
    fn recover_to_state(
        &mut self,
        version: StackVersion,
        depth: u32,
        goal_state: StateId,
    ) -> Result<bool, ParseError> {
        let pop = self.stack.pop_count(version, depth);
        let mut previous_version = STACK_VERSION_NONE;

        for slice in pop {
            if slice.version == previous_version {
                self.recycle(slice.subtrees);
                continue;
            }

            if self.stack.state(slice.version) != goal_state {
                self.stack.halt(slice.version);
                self.recycle(slice.subtrees);
                continue;
            }

            let mut subtrees = slice.subtrees;
            if let Some(error_trees) = self.stack.pop_error(slice.version) {
                if let Some(error_tree) = error_trees.first() {
                    subtrees.splice(0..0, error_tree.children().iter().cloned());
                }
                self.recycle(error_trees);
            }

            remove_trailing_extras(&mut subtrees, &mut self.trailing_extras);

            if !subtrees.is_empty() {
                let error = Subtree::new_error_node(subtrees, true, self.language);
                self.stack.push(slice.version, Some(error), false, goal_state)?;
            }

            for tree in self.trailing_extras.drain(..) {
                self.stack.push(slice.version, Some(tree), false, goal_state)?;
            }

            previous_version = slice.version;
        }

        Ok(previous_version != STACK_VERSION_NONE)
    }

    /// Recover from an error with the given lookahead.
    ///
    /// Two strategies are tried. First, find a state recorded in the
    /// version's summary where the lookahead is valid, and fork a version
    /// that pops back to it, wrapping the popped subtrees in an ERROR.
    /// Second, skip the lookahead by wrapping it in an ERROR and stay in the
    /// error state.
    fn recover(&mut self, version: StackVersion, lookahead: Subtree) -> Result<(), ParseError> {
        let mut did_recover = false;
        let previous_version_count = self.stack.version_count();
        let position = self.stack.position(version);
        let summary = self
            .stack
            .get_summary(version)
            .map(<[StackSummaryEntry]>::to_vec);
        let node_count_since_error = self.stack.node_count_since_error(version);
        let current_error_cost = self.stack.error_cost(version);

        if let Some(summary) = summary.filter(|_| !lookahead.is_error()) {
            for entry in summary {
                if entry.state == ERROR_STATE || entry.position.bytes == position.bytes {
                    continue;
                }
                let mut depth = entry.depth;
                if node_count_since_error > 0 {
                    depth += 1;
                }

                // Do not recover in ways that duplicate an existing version.
                let would_merge = (0..previous_version_count).any(|j| {
                    self.stack.state(j) == entry.state
                        && self.stack.position(j).bytes == position.bytes
                });
                if would_merge {
                    continue;
                }

                let new_cost = current_error_cost
                    + entry.depth * ERROR_COST_PER_SKIPPED_TREE
                    + position.bytes.saturating_sub(entry.position.bytes) * ERROR_COST_PER_SKIPPED_CHAR
                    + position.extent.row.saturating_sub(entry.position.extent.row)
                        * ERROR_COST_PER_SKIPPED_LINE;
                if self.better_version_exists(version, false, new_cost) {
                    break;
                }

                if self.language.has_actions(entry.state, lookahead.symbol())
                    && self.recover_to_state(version, depth, entry.state)?
                {
                    did_recover = true;
                    log!(
                        self,
                        "recover_to_previous state:{}, depth:{}",
                        entry.state,
                        depth
                    );
                    self.log_stack();
                    break;
                }
            }
        }

        // Versions created and halted while trying to recover are removed.
        let mut i = previous_version_count;
        while i < self.stack.version_count() {
            if self.stack.is_active(i) {
                i += 1;
            } else {
                log!(self, "removed paused version:{i}");
                self.stack.remove_version(i);
                self.log_stack();
            }
        }

        // Still in the error state at the end of the input: wrap everything
        // in an ERROR node and finish.
        if lookahead.is_eof() {
            log!(self, "recover_eof");
            let parent = Subtree::new_error_node(Vec::new(), false, self.language);
            self.stack.push(version, Some(parent), false, 1)?;
            return self.accept(version, lookahead);
        }

        // The second strategy is skipped when it would add too many versions,
        // and for tokens that changed the external scanner's state.
        if did_recover
            && (self.stack.version_count() > MAX_VERSION_COUNT
                || lookahead.has_external_scanner_state_change())
        {
            self.stack.halt(version);
            self.release(lookahead);
            return Ok(());
        }

        let new_cost = current_error_cost
            + ERROR_COST_PER_SKIPPED_TREE
            + lookahead.total_bytes() * ERROR_COST_PER_SKIPPED_CHAR
            + lookahead.total_size().extent.row * ERROR_COST_PER_SKIPPED_LINE;
        if self.better_version_exists(version, false, new_cost) {
            self.stack.halt(version);
            self.release(lookahead);
            return Ok(());
        }

        // Tokens that are extras in the start state are marked as such so
        // that they do not count towards the error cost.
        let mut lookahead = lookahead;
        if let Some(ParseAction::Shift { extra: true, .. }) =
            self.language.actions(1, lookahead.symbol()).last()
        {
            lookahead.set_extra(true);
        }

        log!(
            self,
            "skip_token symbol:{}",
            self.language.symbol_name(lookahead.symbol())
        );
        let has_external_tokens = lookahead.has_external_tokens();
        let last_external_token = lookahead.last_external_token().cloned();
        let mut error_repeat = Subtree::new_node(
            BUILTIN_SYM_ERROR_REPEAT,
            vec![lookahead],
            0,
            self.language,
        );

        // Tokens skipped earlier are already in an ERROR on top of the
        // stack. Pop it and combine the two.
        if node_count_since_error > 0 {
            let pop = self.stack.pop_count(version, 1);
            let has_multiple_paths = pop.len() > 1;
            let mut slices = pop.into_iter();
            if let Some(slice) = slices.next() {
                // Merged versions may yield several errors here; keep one.
                if has_multiple_paths {
                    for other in slices {
                        self.recycle(other.subtrees);
                    }
                    while self.stack.version_count() > slice.version + 1 {
                        self.stack.remove_version(slice.version + 1);
                    }
                }

                self.stack.renumber_version(slice.version, version);
                let mut subtrees = slice.subtrees;
                subtrees.push(error_repeat);
                error_repeat =
                    Subtree::new_node(BUILTIN_SYM_ERROR_REPEAT, subtrees, 0, self.language);
            }
        }

        self.stack
            .push(version, Some(error_repeat), false, ERROR_STATE)?;
        if has_external_tokens {
            self.stack.set_last_external_token(version, last_external_token);
        }
        Ok(())
    }

    fn handle_error(&mut self, version: StackVersion, mut lookahead: Subtree) -> Result<(), ParseError> {
        let previous_version_count = self.stack.version_count();

        // Skipping invalid tokens may have made some reductions possible
        // regardless of the lookahead.
        self.do_all_potential_reductions(version, 0)?;
        let version_count = self.stack.version_count();
        let position = self.stack.position(version);

        // Push an error marker onto every version created above, trying to
        // insert a single missing token first.
        let mut did_insert_missing_token = false;
        let mut v = version;
        while v < version_count {
            if !did_insert_missing_token {
                let state = self.stack.state(v);
                for missing_symbol in 1..self.language.token_count() as Symbol {
                    let state_after_missing_symbol = self.language.next_state(state, missing_symbol);
                    if state_after_missing_symbol == 0 || state_after_missing_symbol == state {
                        continue;
                    }

                    if self
                        .language
                        .has_reduce_action(state_after_missing_symbol, lookahead.leaf_symbol())
                    {
                        // Outside of the included ranges the lexer snaps to
                        // the next range, which gives the missing token its
                        // padding.
                        self.lexer.reset(position);
                        self.lexer.mark_end();
                        let padding = self.lexer.token_end_position - position;
                        let lookahead_bytes = lookahead.total_bytes() + lookahead.lookahead_bytes();

                        let version_with_missing_tree = self.stack.copy_version(v);
                        let missing_tree = Subtree::new_missing_leaf(
                            missing_symbol,
                            padding,
                            lookahead_bytes,
                            self.language,
                        );
                        self.stack.push(
                            version_with_missing_tree,
                            Some(missing_tree),
                            false,
                            state_after_missing_symbol,
                        )?;

                        if self.do_all_potential_reductions(
                            version_with_missing_tree,
                            lookahead.leaf_symbol(),
                        )? {
                            log!(
                                self,
                                "recover_with_missing symbol:{}, state:{}",
                                self.language.symbol_name(missing_symbol),
                                self.stack.state(version_with_missing_tree)
                            );
                            did_insert_missing_token = true;
                            break;
                        }
                    }
                }
            }

            self.stack.push(v, None, false, ERROR_STATE)?;
            v = if v == version {
                previous_version_count
            } else {
                v + 1
            };
        }

        for _ in previous_version_count..version_count {
            if !self.stack.merge(version, previous_version_count) {
                break;
            }
        }

        self.stack.record_summary(version, MAX_SUMMARY_DEPTH);

        // Recover with this lookahead right away, so the tree accounts for
        // how far the lexer looked ahead to recognize it.
        if lookahead.child_count() > 0 {
            self.breakdown_lookahead(&mut lookahead, ERROR_STATE);
        }
        self.recover(version, lookahead)?;

        self.log_stack();
        Ok(())
    }

    /// Merge, rank and prune stack versions. Returns the lowest error cost of
    /// any version that is not in the error state.
    fn condense_stack(&mut self) -> Result<u32, ParseError> {
        let mut made_changes = false;
        let mut min_error_cost = u32::MAX;

        let mut i = 0;
        while i < self.stack.version_count() {
            if self.stack.is_halted(i) {
                self.stack.remove_version(i);
                continue;
            }

            let status_i = self.version_status(i);
            if !status_i.is_in_error && status_i.cost < min_error_cost {
                min_error_cost = status_i.cost;
            }

            // Compare with every earlier version, dropping versions that are
            // clearly worse and keeping the list ordered by promise.
            let mut removed_i = false;
            let mut j = 0;
            while j < i {
                let status_j = self.version_status(j);
                match compare_versions(status_j, status_i) {
                    ErrorComparison::TakeLeft => {
                        made_changes = true;
                        self.stack.remove_version(i);
                        removed_i = true;
                        break;
                    }
                    ErrorComparison::PreferLeft | ErrorComparison::None => {
                        if self.stack.merge(j, i) {
                            made_changes = true;
                            removed_i = true;
                            break;
                        }
                    }
                    ErrorComparison::PreferRight => {
                        made_changes = true;
                        if self.stack.merge(j, i) {
                            removed_i = true;
                            break;
                        }
                        self.stack.swap_versions(i, j);
                    }
                    ErrorComparison::TakeRight => {
                        made_changes = true;
                        self.stack.remove_version(j);
                        i -= 1;
                        continue;
                    }
                }
                j += 1;
            }

            if !removed_i {
                i += 1;
            }
        }

        while self.stack.version_count() > MAX_VERSION_COUNT {
            self.stack.remove_version(MAX_VERSION_COUNT);
            made_changes = true;
        }

        // If the most promising version is paused, or every version is,
        // resume the best paused version and start error recovery. Other
        // paused versions are dropped.
        if self.stack.version_count() > 0 {
            let mut has_unpaused_version = false;
            let mut i = 0;
            while i < self.stack.version_count() {
                if self.stack.is_paused(i) {
                    if !has_unpaused_version && self.accept_count < MAX_VERSION_COUNT {
                        log!(self, "resume version:{i}");
                        min_error_cost = self.stack.error_cost(i);
                        if let Some(lookahead) = self.stack.resume(i) {
                            self.handle_error(i, lookahead)?;
                        }
                        has_unpaused_version = true;
                    } else {
                        self.stack.remove_version(i);
                        made_changes = true;
                        continue;
                    }
                } else {
                    has_unpaused_version = true;
                }
                i += 1;
            }
        }

        if made_changes {
            log!(self, "condense");
            self.log_stack();
        }

        Ok(min_error_cost)
    }
}
